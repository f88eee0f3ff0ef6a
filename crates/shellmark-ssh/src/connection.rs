//! SSH connection management

use crate::{Channel, RemoteFilesystem, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// An authenticated connection that channels are opened on
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel for running exactly one remote command
    async fn open_exec_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Open a channel running the remote user's interactive shell
    async fn open_shell_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Open an SFTP subsystem on this connection
    async fn open_sftp(&self) -> Result<Box<dyn RemoteFilesystem>, TransportError>;

    /// Send keepalive messages at `interval` while the connection is idle
    async fn set_keepalive(&self, interval: Duration) -> Result<(), TransportError>;

    /// Disconnect. Closing an already closed connection is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the connection is active
    fn is_connected(&self) -> bool;
}

#[cfg(feature = "ssh2")]
pub use self::libssh2::SshConnection;

#[cfg(feature = "ssh2")]
mod libssh2 {
    use super::*;
    use crate::error::blocking;
    use crate::{SftpFilesystem, Ssh2Channel};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tracing::{debug, trace, warn};

    /// libssh2 session wrapper
    pub struct SshConnection {
        /// Authenticated session
        session: ssh2::Session,
        /// Connection state
        connected: Arc<AtomicBool>,
        /// Timeout applied to channel setup and non-read channel operations
        op_timeout: Duration,
        /// Background keepalive sender
        keepalive_task: Mutex<Option<JoinHandle<()>>>,
    }

    impl std::fmt::Debug for SshConnection {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SshConnection")
                .field("connected", &self.is_connected())
                .field("op_timeout", &self.op_timeout)
                .finish()
        }
    }

    impl SshConnection {
        /// Create a new connection from an authenticated session
        pub fn new(session: ssh2::Session, op_timeout: Duration) -> Self {
            Self {
                session,
                connected: Arc::new(AtomicBool::new(true)),
                op_timeout,
                keepalive_task: Mutex::new(None),
            }
        }

        /// Access the underlying libssh2 session
        pub fn session(&self) -> &ssh2::Session {
            &self.session
        }

        fn ensure_connected(&self) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::Connection("connection is closed".to_string()));
            }
            Ok(())
        }

        fn stop_keepalive(&self) {
            if let Ok(mut task) = self.keepalive_task.lock() {
                if let Some(handle) = task.take() {
                    handle.abort();
                }
            }
        }

        async fn open_channel(&self, shell: bool) -> Result<Arc<dyn Channel>, TransportError> {
            self.ensure_connected()?;
            let session = self.session.clone();
            let op_timeout = self.op_timeout;
            let channel = blocking(move || {
                session.set_timeout(op_timeout.as_millis().clamp(1, u32::MAX as u128) as u32);
                let mut channel = session.channel_session()?;
                if shell {
                    channel.shell()?;
                }
                Ok(channel)
            })
            .await?;
            debug!("Opened {} channel", if shell { "shell" } else { "exec" });
            Ok(Arc::new(Ssh2Channel::new(self.session.clone(), channel, op_timeout)))
        }
    }

    #[async_trait]
    impl Connection for SshConnection {
        async fn open_exec_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
            self.open_channel(false).await
        }

        async fn open_shell_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
            self.open_channel(true).await
        }

        async fn open_sftp(&self) -> Result<Box<dyn RemoteFilesystem>, TransportError> {
            self.ensure_connected()?;
            let session = self.session.clone();
            let sftp = blocking(move || session.sftp().map_err(TransportError::from)).await?;
            let fs = SftpFilesystem::open(sftp).await?;
            Ok(Box::new(fs))
        }

        async fn set_keepalive(&self, interval: Duration) -> Result<(), TransportError> {
            self.ensure_connected()?;
            let secs = interval.as_secs().clamp(1, u32::MAX as u64) as u32;
            self.session.set_keepalive(true, secs);

            // libssh2 only sends keepalives when asked to
            let session = self.session.clone();
            let connected = Arc::clone(&self.connected);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs as u64));
                loop {
                    ticker.tick().await;
                    if !connected.load(Ordering::SeqCst) {
                        break;
                    }
                    let session = session.clone();
                    match blocking(move || session.keepalive_send().map_err(TransportError::from)).await {
                        Ok(next) => trace!("Keepalive sent, next due in {}s", next),
                        Err(e) => {
                            warn!("Keepalive failed: {}", e);
                            break;
                        }
                    }
                }
            });

            let mut task = self
                .keepalive_task
                .lock()
                .map_err(|_| TransportError::Protocol("keepalive lock poisoned".to_string()))?;
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
            debug!("Keepalive interval set to {}s", secs);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            if !self.connected.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            debug!("Closing SSH connection");
            self.stop_keepalive();
            let session = self.session.clone();
            blocking(move || {
                session
                    .disconnect(None, "closed by client", None)
                    .map_err(TransportError::from)
            })
            .await
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    impl Drop for SshConnection {
        fn drop(&mut self) {
            self.stop_keepalive();
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}
