//! Error types for the Shellmark library

use shellmark_ssh::TransportError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which wait ran past the call's deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The shell channel never became writable
    ReadyToSend,
    /// The closing sentinel never arrived
    Sentinel,
    /// The remote process did not finish its output or report an exit status
    ProcessExit,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadyToSend => f.write_str("waiting for the channel to accept input"),
            Self::Sentinel => f.write_str("waiting for the command to finish"),
            Self::ProcessExit => f.write_str("waiting for the process to exit"),
        }
    }
}

/// Main error type for Shellmark operations
#[derive(Debug, Error)]
pub enum ShellmarkError {
    /// Connection errors, including use of a closed session
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A command ran past its deadline
    #[error("Command timed out after {timeout:?} {kind}")]
    Timeout {
        /// What the call was waiting for
        kind: TimeoutKind,
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Transport-level errors that are neither connection nor timeout failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote filesystem errors
    #[error("SFTP error: {0}")]
    Sftp(String),

    /// Remote path does not exist
    #[error("No such file: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellmarkError {
    /// Whether a deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the connection or session is unusable
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Auth(_))
    }

    /// The timeout kind, if this is a timeout
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            Self::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn timeout(kind: TimeoutKind, timeout: Duration) -> Self {
        Self::Timeout { kind, timeout }
    }
}

impl From<TransportError> for ShellmarkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(msg) => Self::Connection(msg),
            TransportError::HostKey(msg) => Self::Connection(format!("host key: {}", msg)),
            TransportError::ChannelClosed => Self::Connection("channel closed".to_string()),
            TransportError::Authentication(msg) => Self::Auth(msg),
            TransportError::Io(e) => Self::Io(e),
            TransportError::Timeout => Self::Transport("transport operation timed out".to_string()),
            TransportError::Protocol(msg) => Self::Protocol(msg),
            TransportError::Sftp(msg) => Self::Sftp(msg),
            TransportError::NotFound(path) => Self::NotFound(path),
            TransportError::Configuration(msg) => Self::Config(msg),
            TransportError::Tunnel(msg) => Self::Transport(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_is_inspectable() {
        let err = ShellmarkError::timeout(TimeoutKind::Sentinel, Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(!err.is_connection());
        assert_eq!(err.timeout_kind(), Some(TimeoutKind::Sentinel));
        assert_eq!(
            err.to_string(),
            "Command timed out after 5s waiting for the command to finish"
        );
    }

    #[test]
    fn test_transport_errors_map_to_connection() {
        let err: ShellmarkError = TransportError::ChannelClosed.into();
        assert!(err.is_connection());

        let err: ShellmarkError = TransportError::Authentication("denied".to_string()).into();
        assert!(err.is_connection());
        assert!(matches!(err, ShellmarkError::Auth(msg) if msg == "denied"));

        let err: ShellmarkError = TransportError::NotFound("/tmp/x".to_string()).into();
        assert!(matches!(err, ShellmarkError::NotFound(_)));
    }

    #[test]
    fn test_transport_timeout_is_not_a_command_timeout() {
        let err: ShellmarkError = TransportError::Timeout.into();
        assert!(!err.is_timeout());
        assert_eq!(err.timeout_kind(), None);
    }
}
