//! Error types for stackrelay operations

use crate::TransportMode;
use std::time::Duration;
use thiserror::Error;

/// Parameter validation errors. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },
}

/// Errors produced by a single physical upstream call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Rate limited on {mode} transport")]
    RateLimited {
        mode: TransportMode,
        /// Server-directed wait, when the response carried one.
        backoff: Option<Duration>,
    },

    #[error("Upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Invalid response from upstream: {reason}")]
    InvalidResponse { reason: String },
}

impl UpstreamError {
    /// Whether this error class is worth another attempt at all.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Network { .. } | Self::Timeout { .. }
        )
    }
}

/// Errors raised by the queue and worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<UpstreamError>,
    },

    #[error("Queue is full (limit: {limit})")]
    QueueSaturated { limit: usize },

    #[error("Dispatch service shut down before the request completed")]
    Shutdown,
}

/// Configuration errors, raised at construction time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all stackrelay errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for stackrelay operations.
pub type RelayResult<T> = Result<T, RelayError>;

// =============================================================================
// TESTS
// =============================================================================
