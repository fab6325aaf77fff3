//! Error types for migration control operations
//!
//! Parse and validation failures are returned synchronously to the caller.
//! Fatal conditions detected inside a worker travel through
//! [`AbortHandle`](crate::abort::AbortHandle) instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed user input (load lists, replica lists, key JSON)
    Parse,
    /// Out-of-range settings that were rejected
    Validation,
    /// Configuration file and flag errors
    Configuration,
    /// Database errors reported by collaborators
    Database,
    /// Network and timeout errors
    Network,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// The migration was aborted
    Abort,
    /// Other/unknown errors
    Other,
}

/// Errors raised by the migration control plane.
#[derive(Error, Debug)]
pub enum OscError {
    /// Malformed `name=value` load list
    #[error("{0}")]
    LoadMap(String),

    /// Malformed `host[:port]` instance key
    #[error("{0}")]
    InstanceKey(String),

    /// A setting outside its allowed range; the prior value was kept
    #[error("{0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server identity did not match the configured connection
    #[error("{0}")]
    ConnectionValidation(String),

    /// Database error reported by a collaborator
    #[error("Database error: {0}")]
    Database(String),

    /// Lock wait timeout (cut-over lock acquisition, row locks)
    #[error("Lock wait timeout: {0}")]
    LockWaitTimeout(String),

    /// Deadlock detected
    #[error("Deadlock detected: {0}")]
    DeadlockDetected(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The migration has been aborted
    #[error("Migration aborted: {0}")]
    Aborted(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl OscError {
    /// Create a load-map parse error
    pub fn load_map(msg: impl Into<String>) -> Self {
        Self::LoadMap(msg.into())
    }

    /// Create an instance-key parse error
    pub fn instance_key(msg: impl Into<String>) -> Self {
        Self::InstanceKey(msg.into())
    }

    /// Create a range validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection validation error
    pub fn connection_validation(msg: impl Into<String>) -> Self {
        Self::ConnectionValidation(msg.into())
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a lock wait timeout error
    pub fn lock_wait_timeout(msg: impl Into<String>) -> Self {
        Self::LockWaitTimeout(msg.into())
    }

    /// Create a deadlock error
    pub fn deadlock_detected(msg: impl Into<String>) -> Self {
        Self::DeadlockDetected(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an abort error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is transient and the operation may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed
            | Self::Timeout(_)
            | Self::LockWaitTimeout(_)
            | Self::DeadlockDetected(_) => true,

            Self::Database(msg) => {
                msg.contains("Lost connection")
                    || msg.contains("Deadlock")
                    || msg.contains("Lock wait timeout")
                    || msg.contains("try restarting transaction")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::LoadMap(_)
            | Self::InstanceKey(_)
            | Self::Validation(_)
            | Self::Config(_)
            | Self::ConnectionValidation(_)
            | Self::Aborted(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for logging and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LoadMap(_) | Self::InstanceKey(_) => ErrorCategory::Parse,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::ConnectionValidation(_) => ErrorCategory::Database,
            Self::Database(_) => ErrorCategory::Database,
            Self::LockWaitTimeout(_) => ErrorCategory::Database,
            Self::DeadlockDetected(_) => ErrorCategory::Database,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::ConnectionClosed => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::Aborted(_) => ErrorCategory::Abort,
            Self::Json(_) | Self::Yaml(_) => ErrorCategory::Serialization,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a log-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LoadMap(_) => "load_map_error",
            Self::InstanceKey(_) => "instance_key_error",
            Self::Validation(_) => "validation_error",
            Self::Config(_) => "config_error",
            Self::ConnectionValidation(_) => "connection_validation_error",
            Self::Database(_) => "database_error",
            Self::LockWaitTimeout(_) => "lock_wait_timeout",
            Self::DeadlockDetected(_) => "deadlock",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::Aborted(_) => "aborted",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown",
        }
    }
}

impl Clone for OscError {
    /// Wrapped library errors are rebuilt from their message; the variant,
    /// and with it `category()` and `error_code()`, is kept.
    fn clone(&self) -> Self {
        use serde::de::Error as _;
        match self {
            Self::LoadMap(msg) => Self::LoadMap(msg.clone()),
            Self::InstanceKey(msg) => Self::InstanceKey(msg.clone()),
            Self::Validation(msg) => Self::Validation(msg.clone()),
            Self::Config(msg) => Self::Config(msg.clone()),
            Self::ConnectionValidation(msg) => Self::ConnectionValidation(msg.clone()),
            Self::Database(msg) => Self::Database(msg.clone()),
            Self::LockWaitTimeout(msg) => Self::LockWaitTimeout(msg.clone()),
            Self::DeadlockDetected(msg) => Self::DeadlockDetected(msg.clone()),
            Self::Timeout(msg) => Self::Timeout(msg.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Aborted(msg) => Self::Aborted(msg.clone()),
            Self::Json(e) => Self::Json(serde_json::Error::custom(e.to_string())),
            Self::Yaml(e) => Self::Yaml(serde_yaml::Error::custom(e.to_string())),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Other(msg) => Self::Other(msg.clone()),
        }
    }
}

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, OscError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OscError::load_map("Error parsing load condition: x");
        assert_eq!(err.to_string(), "Error parsing load condition: x");

        let err = OscError::config("missing file");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("missing file"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(OscError::ConnectionClosed.is_retriable());
        assert!(OscError::timeout("3s").is_retriable());
        assert!(OscError::lock_wait_timeout("rename").is_retriable());
        assert!(OscError::deadlock_detected("txn").is_retriable());
        assert!(OscError::database("Error 1205: Lock wait timeout exceeded").is_retriable());

        assert!(!OscError::database("Error 1146: Table doesn't exist").is_retriable());
        assert!(!OscError::validation("out of range").is_retriable());
        assert!(!OscError::aborted("panic flag file").is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(OscError::load_map("x").category(), ErrorCategory::Parse);
        assert_eq!(OscError::instance_key("x").category(), ErrorCategory::Parse);
        assert_eq!(
            OscError::validation("x").category(),
            ErrorCategory::Validation
        );
        assert_eq!(OscError::timeout("x").category(), ErrorCategory::Network);
        assert_eq!(OscError::aborted("x").category(), ErrorCategory::Abort);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(OscError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(OscError::validation("x").error_code(), "validation_error");
        assert_eq!(OscError::aborted("x").error_code(), "aborted");
    }

    #[test]
    fn test_clone_keeps_variant() {
        let err = OscError::lock_wait_timeout("rename");
        let copy = err.clone();
        assert_eq!(copy.error_code(), "lock_wait_timeout");
        assert_eq!(copy.to_string(), err.to_string());

        let io = OscError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let copy = io.clone();
        assert_eq!(copy.category(), ErrorCategory::Network);
        assert!(copy.is_retriable());
        assert!(copy.to_string().contains("reset by peer"));

        let yaml = OscError::from(serde_yaml::from_str::<i64>("[").unwrap_err());
        assert_eq!(yaml.clone().error_code(), "yaml_error");
    }
}
