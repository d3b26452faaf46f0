//! Keyed single-flight primitive.
//!
//! `try_acquire` either hands out a [`FlightGuard`] or reports that the key is
//! already in flight. The key is released when the guard drops, so every exit
//! path of the guarded operation (success, error, cancellation) releases it.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

pub struct SingleFlight<K> {
    in_flight: Mutex<HashSet<K>>,
    idle: Notify,
}

impl<K> Default for SingleFlight<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            idle: Notify::new(),
        }
    }
}

impl<K> SingleFlight<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<K>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns `None` while another holder owns `key`.
    pub fn try_acquire(self: &Arc<Self>, key: K) -> Option<FlightGuard<K>> {
        if !self.keys().insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            owner: Arc::clone(self),
            key,
        })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.keys().contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.keys().len()
    }

    /// Resolves once no key is held.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.keys().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, key: &K) {
        let now_idle = {
            let mut keys = self.keys();
            keys.remove(key);
            keys.is_empty()
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

pub struct FlightGuard<K>
where
    K: Eq + Hash + Clone,
{
    owner: Arc<SingleFlight<K>>,
    key: K,
}

impl<K> FlightGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for FlightGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let flights = SingleFlight::new();
        let guard = flights.try_acquire(7).expect("first acquire");
        assert!(flights.try_acquire(7).is_none());
        assert!(flights.try_acquire(8).is_some());
        drop(guard);
        assert!(flights.try_acquire(7).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_resolves_after_last_guard_drops() {
        let flights = SingleFlight::new();
        let guard = flights.try_acquire("q1").expect("acquire");

        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move { flights.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.expect("waiter task");
        assert_eq!(flights.in_flight_count(), 0);
    }
}
