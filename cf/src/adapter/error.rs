//! Adapter error types

use std::time::Duration;
use thiserror::Error;

/// Errors reported by an agent adapter
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Agent aborted the turn: {0}")]
    Aborted(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Provider error {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Adapter not started")]
    NotStarted,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    /// The provider itself aborted the turn
    pub fn is_aborted(&self) -> bool {
        matches!(self, AdapterError::Aborted(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::RateLimited { .. } => true,
            AdapterError::Provider { status, .. } => *status >= 500,
            AdapterError::Timeout(_) => true,
            AdapterError::Aborted(_)
            | AdapterError::SessionNotFound(_)
            | AdapterError::NotStarted
            | AdapterError::InvalidResponse(_)
            | AdapterError::Json(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
