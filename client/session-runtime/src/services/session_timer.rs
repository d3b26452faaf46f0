//! Session countdown and break manager.
//!
//! The server's remaining time is authoritative; the local tick only keeps
//! the display moving between fetches and is re-anchored on every snapshot.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TimerSettings;
use crate::error::{Result, SessionError};
use crate::models::event::SessionEvent;
use crate::models::session::{SessionSnapshot, SessionStatus};
use crate::models::timer::{BreakStatus, BreakTick, TimeExpired, TimerState, TimerTick};
use crate::utils::time::with_timeout;

use super::remote::SessionApi;
use super::ActiveFlag;

/// Called once when the countdown reaches zero.
#[async_trait]
pub trait ExpiryHook: Send + Sync {
    async fn on_expired(&self);
}

struct Clock {
    state: TimerState,
    /// Sub-second remainder carried between ticks.
    carry_ms: u64,
    break_started_at: Option<Instant>,
}

struct TimerInner {
    token: String,
    api: Arc<dyn SessionApi>,
    settings: TimerSettings,
    request_timeout: Duration,
    active: ActiveFlag,
    clock: Mutex<Clock>,
    expired: AtomicBool,
    halted: AtomicBool,
    hook: Mutex<Option<Weak<dyn ExpiryHook>>>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionTimer {
    inner: Arc<TimerInner>,
}

impl SessionTimer {
    pub fn new(
        token: String,
        api: Arc<dyn SessionApi>,
        settings: TimerSettings,
        request_timeout: Duration,
        active: ActiveFlag,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                token,
                api,
                settings,
                request_timeout,
                active,
                clock: Mutex::new(Clock {
                    state: TimerState::new(0, 0, 1200),
                    carry_ms: 0,
                    break_started_at: None,
                }),
                expired: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                hook: Mutex::new(None),
                events,
            }),
        }
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.inner.clock.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_expiry_hook(&self, hook: Weak<dyn ExpiryHook>) {
        *self.inner.hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    pub fn state(&self) -> TimerState {
        self.clock().state.clone()
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.clock().state.remaining_seconds
    }

    pub fn is_on_break(&self) -> bool {
        self.clock().state.is_on_break
    }

    pub fn has_expired(&self) -> bool {
        self.inner.expired.load(Ordering::SeqCst)
    }

    /// Allows expiry to fire again after a completion attempt failed.
    pub fn rearm_expiry(&self) {
        self.inner.expired.store(false, Ordering::SeqCst);
    }

    /// Stops ticking for good. Used once the session is terminal.
    pub fn halt(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Re-anchors to server truth. Fires expiry if the server reports no
    /// time left on a session that is still running.
    pub async fn anchor(&self, snapshot: &SessionSnapshot) {
        let expired_now = {
            let mut clock = self.clock();
            let state = &mut clock.state;
            if let Some(total) = snapshot.duration_seconds {
                state.total_seconds = total;
            }
            if let Some(remaining) = snapshot.remaining_seconds {
                state.remaining_seconds = remaining;
                if state.total_seconds < remaining {
                    state.total_seconds = remaining;
                }
            }
            state.remaining_break_budget = snapshot.remaining_break_seconds;
            state.max_single_break_seconds = snapshot.max_single_break_seconds;
            state.used_break_seconds = snapshot.used_break_time_seconds;
            state.break_count = snapshot.break_count;

            let was_on_break = state.is_on_break;
            state.is_on_break = snapshot.is_on_break;
            state.break_start = snapshot.current_break_start;

            if snapshot.is_on_break && !was_on_break {
                // Reload during a break: resume the break clock where the server says it began
                let elapsed = snapshot
                    .current_break_start
                    .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                let now = Instant::now();
                clock.break_started_at =
                    Some(now.checked_sub(Duration::from_secs(elapsed)).unwrap_or(now));
            } else if !snapshot.is_on_break {
                clock.break_started_at = None;
            }
            clock.carry_ms = 0;

            snapshot.status == SessionStatus::InProgress
                && !snapshot.is_on_break
                && snapshot.remaining_seconds == Some(0)
        };

        tracing::debug!(
            "Timer anchored: session={}, remaining={:?}, on_break={}",
            self.inner.token,
            snapshot.remaining_seconds,
            snapshot.is_on_break
        );

        if expired_now {
            self.fire_expiry().await;
        }
    }

    /// One tick of the local clock.
    pub async fn tick(&self) {
        if self.is_halted() {
            return;
        }

        let tick_ms = self.inner.settings.tick_ms;
        let event = {
            let mut clock = self.clock();
            if clock.state.is_on_break {
                let elapsed = clock
                    .break_started_at
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(0);
                let cap = clock.state.break_cap_seconds();
                Some(SessionEvent::BreakTick(BreakTick {
                    elapsed_seconds: elapsed,
                    cap_seconds: cap,
                    overtime: elapsed > cap,
                    timestamp: Utc::now(),
                }))
            } else if self.inner.active.is_active() {
                clock.carry_ms += tick_ms;
                let whole = clock.carry_ms / 1000;
                clock.carry_ms %= 1000;
                let state = &mut clock.state;
                state.remaining_seconds = state.remaining_seconds.saturating_sub(whole);
                Some(SessionEvent::TimerTick(TimerTick {
                    remaining_seconds: state.remaining_seconds,
                    elapsed_seconds: state.total_seconds.saturating_sub(state.remaining_seconds),
                    total_seconds: state.total_seconds,
                    timestamp: Utc::now(),
                }))
            } else {
                None
            }
        };

        let Some(event) = event else {
            return;
        };
        let reached_zero = matches!(&event, SessionEvent::TimerTick(t) if t.remaining_seconds == 0);
        let _ = self.inner.events.send(event);

        if reached_zero {
            self.fire_expiry().await;
        }
    }

    async fn fire_expiry(&self) {
        if self.inner.expired.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Session time expired: {}", self.inner.token);
        let _ = self.inner.events.send(SessionEvent::TimeExpired(TimeExpired {
            timestamp: Utc::now(),
            message: "Time is up! Your answers are being submitted.".to_string(),
        }));

        let hook = self
            .inner
            .hook
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        match hook {
            Some(hook) => hook.on_expired().await,
            None => tracing::warn!("Timer expired with no completion hook attached"),
        }
    }

    /// Ticks until halted.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let timer = self.clone();
        let period = self.inner.settings.tick();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if timer.is_halted() {
                    break;
                }
                timer.tick().await;
            }
            tracing::debug!("Timer task stopped for session {}", timer.inner.token);
        })
    }

    /// Starts a break. Returns the cap after which the break runs overtime.
    pub async fn start_break(&self) -> Result<u64> {
        {
            let clock = self.clock();
            if clock.state.is_on_break {
                return Err(SessionError::ConcurrencyConflict("break".into()));
            }
            if clock.state.remaining_break_budget == 0 {
                return Err(SessionError::Validation("no break time remaining".into()));
            }
        }
        if self.is_halted() {
            return Err(SessionError::Validation("session has ended".into()));
        }

        let started = with_timeout(
            "startBreak",
            self.inner.request_timeout,
            self.inner.api.start_break(&self.inner.token),
        )
        .await?;

        let cap = {
            let mut clock = self.clock();
            clock.break_started_at = Some(Instant::now());
            let state = &mut clock.state;
            state.is_on_break = true;
            state.break_start = Some(started.break_start);
            state.remaining_break_budget = started.remaining_break_seconds;
            state.max_single_break_seconds = started.max_single_break_seconds;
            state.break_count += 1;
            state.break_cap_seconds()
        };

        tracing::info!(
            "Break started: session={}, cap={}s",
            self.inner.token,
            cap
        );
        let _ = self
            .inner
            .events
            .send(SessionEvent::BreakStarted { cap_seconds: cap });
        Ok(cap)
    }

    /// Ends the current break. Returns how long it lasted in seconds.
    pub async fn end_break(&self) -> Result<u64> {
        if !self.is_on_break() {
            return Err(SessionError::Validation("not on a break".into()));
        }

        with_timeout(
            "endBreak",
            self.inner.request_timeout,
            self.inner.api.end_break(&self.inner.token),
        )
        .await?;

        let (elapsed, budget) = {
            let mut clock = self.clock();
            let elapsed = clock
                .break_started_at
                .take()
                .map(|at| at.elapsed().as_secs())
                .unwrap_or(0);
            let state = &mut clock.state;
            state.is_on_break = false;
            state.break_start = None;
            state.remaining_break_budget = state.remaining_break_budget.saturating_sub(elapsed);
            state.used_break_seconds += elapsed;
            (elapsed, state.remaining_break_budget)
        };

        tracing::info!(
            "Break ended: session={}, elapsed={}s, budget_left={}s",
            self.inner.token,
            elapsed,
            budget
        );
        let _ = self.inner.events.send(SessionEvent::BreakEnded {
            elapsed_seconds: elapsed,
            remaining_break_budget: budget,
        });

        // Resume from server-confirmed remaining time
        match with_timeout(
            "getSession",
            self.inner.request_timeout,
            self.inner.api.get_session(&self.inner.token),
        )
        .await
        {
            Ok(snapshot) => {
                if let Some(remaining) = snapshot.remaining_seconds {
                    let mut clock = self.clock();
                    clock.state.remaining_seconds = remaining;
                    clock.carry_ms = 0;
                }
            }
            Err(e) => tracing::warn!("Could not refresh remaining time after break: {}", e),
        }

        Ok(elapsed)
    }

    pub fn break_status(&self) -> Option<BreakStatus> {
        let clock = self.clock();
        if !clock.state.is_on_break {
            return None;
        }
        let elapsed = clock
            .break_started_at
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);
        let cap = clock.state.break_cap_seconds();
        Some(BreakStatus {
            elapsed_seconds: elapsed,
            cap_seconds: cap,
            overtime: elapsed > cap,
        })
    }
}
