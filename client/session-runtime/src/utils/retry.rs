use serde::Deserialize;
use std::time::Duration;

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
    pub strategy: BackoffStrategy,
}

impl RetryConfig {
    /// Draft sync schedule: `base * attempt`, no jitter.
    pub fn linear(max_attempts: usize, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff: base_backoff * max_attempts.max(1) as u32,
            jitter_max: None,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Wait before the attempt following `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1) as u32;
        let raw = match self.strategy {
            BackoffStrategy::Linear => self.base_backoff.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_backoff
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        std::cmp::min(raw, self.max_backoff)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        match self.jitter_max {
            Some(jitter_max) => {
                let jitter_ms = jitter_max.as_millis() as u64;
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::random::<u64>() % (jitter_ms + 1)
                };
                delay + Duration::from_millis(extra)
            }
            None => delay,
        }
    }
}

/// Retries `f` while `should_retry` accepts the error and attempts remain.
///
/// `on_retry(attempt, &err, wait)` runs before each sleep, which lets callers
/// surface a "retrying" status.
pub async fn retry_async_when<F, Fut, T, E, P, O>(
    config: RetryConfig,
    should_retry: P,
    mut on_retry: O,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    O: FnMut(usize, &E, Duration),
{
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || !should_retry(&e) {
                    return Err(e);
                }

                let wait = config.jittered(config.delay_for(attempt));
                on_retry(attempt, &e, wait);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_retries() {
        let counter = AtomicUsize::new(0);
        let cfg = RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter_max: None,
            strategy: BackoffStrategy::Exponential,
        };

        let res: Result<usize, &'static str> = retry_async_when(cfg, |_| true, |_, _, _| {}, || async {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("fail")
            } else {
                Ok(n)
            }
        })
        .await;

        assert!(res.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_fails_after_max_attempts() {
        let counter = AtomicUsize::new(0);
        let cfg = RetryConfig::linear(2, Duration::from_millis(1));

        let res: Result<(), &'static str> = retry_async_when(cfg, |_| true, |_, _, _| {}, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("always fail")
        })
        .await;

        assert!(res.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let counter = AtomicUsize::new(0);
        let cfg = RetryConfig::linear(5, Duration::from_millis(1));

        let res: Result<(), &'static str> = retry_async_when(
            cfg,
            |e: &&str| *e != "permanent",
            |_, _, _| {},
            || async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("permanent")
            },
        )
        .await;

        assert_eq!(res, Err("permanent"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_linear_waits() {
        let cfg = RetryConfig::linear(4, Duration::from_millis(100));
        let mut waits = Vec::new();

        let _: Result<(), ()> =
            retry_async_when(cfg, |_| true, |_, _, wait| waits.push(wait), || async {
                Err(())
            })
            .await;

        assert_eq!(
            waits,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[test]
    fn exponential_delay_is_capped() {
        let cfg = RetryConfig {
            max_attempts: 10,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            jitter_max: None,
            strategy: BackoffStrategy::Exponential,
        };
        assert_eq!(cfg.delay_for(1), Duration::from_millis(50));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(8), Duration::from_millis(300));
    }
}
