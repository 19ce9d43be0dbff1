//! Error types for webhook delivery operations.
//!
//! Transport failures (timeouts, refused connections) are routine: the engine
//! turns them into attempt outcomes and retries. Non-2xx responses are not
//! errors at all; the client returns them as responses. The remaining
//! variants describe problems with the engine itself, such as an unreachable
//! store, a bad configuration, or a worker that did not shut down.

use std::{fmt, time::Duration};

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised while delivering tasks.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Task store operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// A guarded state transition matched no row: the task is already
    /// terminal or another attempt got there first.
    #[error("stale task: {message}")]
    StaleTask {
        /// Description from the store
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Payload could not be serialized or signed.
    #[error("signing failed: {message}")]
    SigningError {
        /// Signing error message
        message: String,
    },

    /// A dispatch loop panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the failed worker
        worker_id: usize,
        /// Panic payload rendered as text
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a signing error.
    pub fn signing(message: impl Into<String>) -> Self {
        Self::SigningError { message: message.into() }
    }

    /// Prefixes the message of a store error with `context`, keeping the
    /// variant. Other variants are returned unchanged.
    #[must_use]
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        match self {
            Self::DatabaseError { message } => {
                Self::DatabaseError { message: format!("{context}: {message}") }
            },
            Self::StaleTask { message } => {
                Self::StaleTask { message: format!("{context}: {message}") }
            },
            other => other,
        }
    }

    /// Error category for logs and attempt records.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidState(message) => Self::StaleTask { message },
            other => Self::database(other.to_string()),
        }
    }
}

/// Category of delivery error for logs and attempt records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity issues.
    Network,
    /// Request exceeded its timeout.
    Timeout,
    /// Task store operations.
    Database,
    /// Configuration and signing problems.
    Configuration,
    /// Worker lifecycle failures.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } => Self::Network,
            DeliveryError::Timeout { .. } => Self::Timeout,
            DeliveryError::DatabaseError { .. } | DeliveryError::StaleTask { .. } => {
                Self::Database
            },
            DeliveryError::ConfigurationError { .. } | DeliveryError::SigningError { .. } => {
                Self::Configuration
            },
            DeliveryError::WorkerPanic { .. } | DeliveryError::ShutdownTimeout { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_converted() {
        let stale = DeliveryError::from(CoreError::InvalidState("terminal".into()));
        assert!(matches!(stale, DeliveryError::StaleTask { .. }));

        let db = DeliveryError::from(CoreError::Database("gone".into()));
        assert!(matches!(db, DeliveryError::DatabaseError { .. }));
        assert_eq!(db.category(), ErrorCategory::Database);
    }

    #[test]
    fn context_prefixes_store_errors_only() {
        let db = DeliveryError::database("connection reset")
            .with_context("attempt 2 ended with HTTP 200");
        assert_eq!(
            db.to_string(),
            "database error: attempt 2 ended with HTTP 200: connection reset"
        );

        let stale =
            DeliveryError::StaleTask { message: "no pending row".into() }.with_context("attempt 1");
        assert!(matches!(
            stale,
            DeliveryError::StaleTask { ref message } if message == "attempt 1: no pending row"
        ));

        let timeout = DeliveryError::timeout(50).with_context("ignored");
        assert_eq!(timeout.to_string(), "request timeout after 50ms");
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("test")), ErrorCategory::Network);
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(5)), ErrorCategory::Timeout);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::signing("empty secret")),
            ErrorCategory::Configuration
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::ShutdownTimeout {
                timeout: Duration::from_secs(1)
            }),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(10_000).to_string(), "request timeout after 10000ms");
        assert_eq!(ErrorCategory::Timeout.to_string(), "timeout");

        let panic = DeliveryError::WorkerPanic { worker_id: 2, error: "boom".into() };
        assert_eq!(panic.to_string(), "worker 2 panicked: boom");
    }
}
