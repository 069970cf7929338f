use serde::{Deserialize, Serialize};
use sse_platform::StoreError;
use thiserror::Error;

/// Broad error category used for caller-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionErrorCategory {
    /// Invalid options or endpoint configuration.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the server.
    RateLimited,
    /// Caller input rejected before dispatch; never retried.
    Validation,
    /// Persistent storage failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// The session was destroyed before the operation settled.
    Closed,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable session error payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SessionError {
    /// High-level error category.
    pub category: SessionErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SessionError {
    pub fn new(
        category: SessionErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Caller input rejected before it reached the queue.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCategory::Validation, "invalid_argument", message)
    }

    /// The session runtime is gone.
    pub fn closed(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SessionErrorCategory::Closed,
            "session_closed",
            format!("cannot complete '{action}': session was destroyed"),
        )
    }

    /// Non-success HTTP status returned by the server.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(classify_http_status(status), "http_status", message)
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.category,
            SessionErrorCategory::Validation | SessionErrorCategory::Closed
        )
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        Self::new(SessionErrorCategory::Storage, "storage", err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(
            SessionErrorCategory::Serialization,
            "serialization",
            err.to_string(),
        )
    }
}

/// Map HTTP status codes to session error categories.
pub fn classify_http_status(status: u16) -> SessionErrorCategory {
    match status {
        401 | 403 => SessionErrorCategory::Auth,
        408 | 429 => SessionErrorCategory::RateLimited,
        400..=499 => SessionErrorCategory::Config,
        500..=599 => SessionErrorCategory::Network,
        _ => SessionErrorCategory::Internal,
    }
}
