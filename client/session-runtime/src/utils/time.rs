use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Bounds a remote call. Elapsed time is reported as a transient network
/// failure so it goes through the same retry path.
pub async fn with_timeout<T, F>(endpoint: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::transient(
            endpoint,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

/// Whether a record written at `written_at` is still inside the freshness window.
pub fn is_fresh(written_at: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
    now.signed_duration_since(written_at) <= window
}
