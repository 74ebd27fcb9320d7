/// Unified error handling for cerrojo
///
/// Store failures are split into connection-level errors (the node or the
/// network went away) and data-level errors (the node answered, but with
/// something we cannot use). The retrying executor treats the first kind as
/// a reason to re-run the master election.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::store::resp::RespParseError;

/// Main error type for cerrojo operations
#[derive(Debug, Error)]
pub enum CerrojoError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote store errors that exhausted the retry budget
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// No configured node could be elected master
    #[error("No master node available")]
    NoMaster,

    /// Caller supplied an argument the operation cannot work with
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised while talking to a single store node
#[derive(Debug, Error)]
pub enum StoreError {
    /// The node could not be reached or the connection broke mid-request
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The node sent bytes that are not valid RESP
    #[error("RESP protocol error: {message}")]
    Protocol { message: String },

    /// The node rejected the command with an error reply
    #[error("Command error: {command} - {message}")]
    Command { command: String, message: String },

    /// The node answered with a reply of the wrong shape
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },
}

/// Result type alias for cerrojo operations
pub type CerrojoResult<T> = Result<T, CerrojoError>;

/// Result type alias for single-node store calls
pub type StoreResult<T> = Result<T, StoreError>;

impl CerrojoError {
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        CerrojoError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        CerrojoError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        CerrojoError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            CerrojoError::Store(e) => e.is_connection(),
            CerrojoError::NoMaster => true,
            CerrojoError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CerrojoError::Config(_) => ErrorSeverity::Critical,
            CerrojoError::Internal { .. } => ErrorSeverity::Critical,
            CerrojoError::NoMaster => ErrorSeverity::Critical,
            CerrojoError::Store(StoreError::Connection { .. }) => ErrorSeverity::Warning,
            CerrojoError::Timeout { .. } => ErrorSeverity::Warning,
            CerrojoError::InvalidArgument { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

impl StoreError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        StoreError::Connection {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        StoreError::Protocol {
            message: message.into(),
        }
    }

    pub fn command<C: Into<String>, M: Into<String>>(command: C, message: M) -> Self {
        StoreError::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn unexpected<C: Into<String>, R: fmt::Debug>(command: C, reply: R) -> Self {
        StoreError::UnexpectedReply {
            command: command.into(),
            reply: format!("{:?}", reply),
        }
    }

    /// Connection-level failures are the only ones that trigger failover
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection { .. })
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::connection(e.to_string())
    }
}

impl From<RespParseError> for StoreError {
    fn from(e: RespParseError) -> Self {
        StoreError::protocol(e.to_string())
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = CerrojoError::invalid_argument("order must be positive");
        assert!(matches!(error, CerrojoError::InvalidArgument { .. }));
        assert_eq!(
            error.to_string(),
            "Invalid argument: order must be positive"
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = CerrojoError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error = CerrojoError::Store(StoreError::connection("refused"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_recoverability() {
        let network_error = CerrojoError::Store(StoreError::connection("refused"));
        assert!(network_error.is_recoverable());

        let command_error = CerrojoError::Store(StoreError::command("EVAL", "NOSCRIPT"));
        assert!(!command_error.is_recoverable());

        let config_error = CerrojoError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_io_error_is_connection_level() {
        let err: StoreError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_connection());

        let err: StoreError = RespParseError::InvalidFormat("bad".to_string()).into();
        assert!(!err.is_connection());
    }
}
