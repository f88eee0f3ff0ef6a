//! SSH-specific error types

use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// SSH connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Host key verification error
    #[error("Host key verification failed: {0}")]
    HostKey(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// The channel was closed locally or by the remote side
    #[error("Channel closed")]
    ChannelClosed,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SFTP operation error
    #[error("SFTP error: {0}")]
    Sftp(String),

    /// Remote path does not exist
    #[error("No such file: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Tunnel process error
    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

impl TransportError {
    /// Whether this error means the connection or channel is no longer usable
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Authentication(_) | Self::HostKey(_) | Self::ChannelClosed
        )
    }

    /// Whether this error is a timeout reported by the transport
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether this error reports a missing remote path
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(feature = "ssh2")]
impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        let message = err.message().to_string();
        let io_err: io::Error = err.into();
        match io_err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::NotFound => Self::NotFound(message),
            _ => Self::Connection(message),
        }
    }
}

/// Run a blocking libssh2 task and flatten join failures into transport errors
#[cfg(feature = "ssh2")]
pub(crate) async fn blocking<F, T>(task: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| TransportError::Connection(format!("SSH task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::ChannelClosed.is_connection());
        assert!(TransportError::Connection("reset".to_string()).is_connection());
        assert!(!TransportError::Timeout.is_connection());

        assert!(TransportError::Timeout.is_timeout());
        assert!(TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_timeout());
        assert!(!TransportError::Protocol("bad".to_string()).is_timeout());

        assert!(TransportError::NotFound("/missing".to_string()).is_not_found());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!TransportError::Sftp("denied".to_string()).is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::Authentication("bad password".to_string());
        assert_eq!(err.to_string(), "Authentication failed: bad password");
        assert_eq!(TransportError::ChannelClosed.to_string(), "Channel closed");
    }
}
