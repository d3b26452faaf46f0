use thiserror::Error;

/// Error taxonomy for the session runtime.
///
/// Only [`SessionError::SessionIdentity`] is fatal. Everything else degrades to
/// a status indicator or is retried; integrity violations are not errors at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Rejected before any network call (e.g. nothing to submit).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Timeout or connection failure. Retried with backoff up to a bound.
    #[error("network failure calling {endpoint}: {message}")]
    TransientNetwork { endpoint: String, message: String },

    /// Non-retryable rejection from the server. Local draft is retained.
    #[error("server rejected {endpoint} with status {status}: {message}")]
    PermanentServer {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Duplicate of an operation that is already in flight.
    #[error("{0} is already in progress")]
    ConcurrencyConflict(String),

    /// Invalid or expired token, or the session no longer exists.
    #[error("session unavailable: {0}")]
    SessionIdentity(String),

    /// Local durable store failure.
    #[error("local storage failure: {0}")]
    Storage(String),
}

impl SessionError {
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        SessionError::TransientNetwork {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn permanent(endpoint: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        SessionError::PermanentServer {
            endpoint: endpoint.into(),
            status,
            message: message.into(),
        }
    }

    /// Whether the retry loops should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::TransientNetwork { .. })
    }

    /// Whether the session can no longer continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::SessionIdentity(_))
    }

    /// Short label used for metrics and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation",
            SessionError::TransientNetwork { .. } => "transient_network",
            SessionError::PermanentServer { .. } => "permanent_server",
            SessionError::ConcurrencyConflict(_) => "concurrency_conflict",
            SessionError::SessionIdentity(_) => "session_identity",
            SessionError::Storage(_) => "storage",
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Storage(format!("serialization failed: {}", err))
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        SessionError::Storage(format!("redis: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
