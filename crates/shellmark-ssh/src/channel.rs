//! Byte-stream channels opened on an authenticated connection

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Pause before retrying a write the channel did not accept
pub const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Output stream selector for [`Channel::recv`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output of the remote process or shell
    Stdout,
    /// Standard error of the remote process or shell
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Outcome of a single bounded read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// Bytes that arrived within the read timeout
    Data(Bytes),
    /// Nothing arrived before the read timeout; not an error
    Empty,
    /// The remote side closed this stream
    Eof,
}

/// A bidirectional byte stream over an authenticated transport.
///
/// All methods take `&self` so a channel can be shared between the tasks
/// that drain its two output streams. Implementations serialise access to
/// the underlying handle internally.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Request execution of `command` on an exec channel
    async fn exec(&self, command: &str) -> Result<(), TransportError>;

    /// Write bytes to the remote input, returning how many were accepted
    async fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Signal end of input
    async fn send_eof(&self) -> Result<(), TransportError>;

    /// Read up to `max_bytes` from `stream`, waiting at most `timeout`
    async fn recv(
        &self,
        stream: StreamKind,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Recv, TransportError>;

    /// Whether the channel can accept writes right now
    async fn ready_to_send(&self) -> Result<bool, TransportError>;

    /// Whether the remote process has finished and its exit status can be read
    async fn exit_status_ready(&self) -> Result<bool, TransportError>;

    /// Exit status of the remote process, waiting for the channel to close
    async fn exit_status(&self) -> Result<i32, TransportError>;

    /// Close the channel. Closing an already closed channel is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether [`Channel::close`] has run or the remote side went away
    fn is_closed(&self) -> bool;

    /// Write all of `data`, retrying partial writes.
    ///
    /// A write that accepts nothing is retried after [`SEND_RETRY_INTERVAL`].
    /// Bound the call with a timeout when the remote side may stop reading.
    async fn send_all(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut offset = 0;
        while offset < data.len() {
            let written = self.send(&data[offset..]).await?;
            if written == 0 {
                tokio::time::sleep(SEND_RETRY_INTERVAL).await;
                continue;
            }
            offset += written;
        }
        Ok(())
    }
}

#[cfg(feature = "ssh2")]
pub use self::libssh2::Ssh2Channel;

#[cfg(feature = "ssh2")]
mod libssh2 {
    use super::*;
    use crate::error::blocking;
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tracing::{debug, trace};

    /// [`Channel`] backed by a libssh2 channel.
    ///
    /// Every operation runs on the blocking pool. The session timeout is set
    /// per operation, so reads wait no longer than the caller's poll interval.
    pub struct Ssh2Channel {
        session: ssh2::Session,
        channel: Arc<Mutex<ssh2::Channel>>,
        closed: Arc<AtomicBool>,
        op_timeout: Duration,
    }

    impl Ssh2Channel {
        /// Wrap an opened libssh2 channel
        pub fn new(session: ssh2::Session, channel: ssh2::Channel, op_timeout: Duration) -> Self {
            Self {
                session,
                channel: Arc::new(Mutex::new(channel)),
                closed: Arc::new(AtomicBool::new(false)),
                op_timeout,
            }
        }

        fn ensure_open(&self) -> Result<(), TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ChannelClosed);
            }
            Ok(())
        }

        /// Run `op` against the locked channel with the session timeout set to `timeout`
        async fn with_channel<F, T>(&self, timeout: Duration, op: F) -> Result<T, TransportError>
        where
            F: FnOnce(&mut ssh2::Channel) -> Result<T, TransportError> + Send + 'static,
            T: Send + 'static,
        {
            self.ensure_open()?;
            let session = self.session.clone();
            let channel = Arc::clone(&self.channel);
            blocking(move || {
                let mut guard = lock(&channel)?;
                session.set_timeout(timeout_ms(timeout));
                op(&mut guard)
            })
            .await
        }
    }

    fn lock(channel: &Mutex<ssh2::Channel>) -> Result<MutexGuard<'_, ssh2::Channel>, TransportError> {
        channel
            .lock()
            .map_err(|_| TransportError::Protocol("channel lock poisoned".to_string()))
    }

    /// libssh2 treats a zero timeout as "wait forever"
    fn timeout_ms(timeout: Duration) -> u32 {
        timeout.as_millis().clamp(1, u32::MAX as u128) as u32
    }

    /// Longest a single write blocks on a full window
    const WRITE_WAIT: Duration = Duration::from_millis(100);

    fn is_transient(e: &io::Error) -> bool {
        matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
    }

    #[async_trait]
    impl Channel for Ssh2Channel {
        async fn exec(&self, command: &str) -> Result<(), TransportError> {
            debug!("Requesting remote execution: {}", command);
            let command = command.to_string();
            self.with_channel(self.op_timeout, move |channel| {
                channel.exec(&command).map_err(TransportError::from)
            })
            .await
        }

        async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
            let data = data.to_vec();
            let wait = self.op_timeout.min(WRITE_WAIT);
            self.with_channel(wait, move |channel| match channel.write(&data) {
                Ok(n) => Ok(n),
                Err(e) if is_transient(&e) => Ok(0),
                Err(e) => Err(e.into()),
            })
            .await
        }

        async fn send_eof(&self) -> Result<(), TransportError> {
            self.with_channel(self.op_timeout, |channel| {
                channel.send_eof().map_err(TransportError::from)
            })
            .await
        }

        async fn recv(
            &self,
            stream: StreamKind,
            max_bytes: usize,
            timeout: Duration,
        ) -> Result<Recv, TransportError> {
            self.with_channel(timeout, move |channel| {
                let mut buf = vec![0u8; max_bytes];
                let mut reader = match stream {
                    StreamKind::Stdout => channel.stream(0),
                    StreamKind::Stderr => channel.stderr(),
                };
                match reader.read(&mut buf) {
                    Ok(0) if channel.eof() => Ok(Recv::Eof),
                    Ok(0) => Ok(Recv::Empty),
                    Ok(n) => {
                        buf.truncate(n);
                        trace!("Read {} bytes from {}", n, stream);
                        Ok(Recv::Data(Bytes::from(buf)))
                    }
                    Err(e) if is_transient(&e) => Ok(Recv::Empty),
                    Err(e) => Err(e.into()),
                }
            })
            .await
        }

        async fn ready_to_send(&self) -> Result<bool, TransportError> {
            self.with_channel(self.op_timeout, |channel| {
                Ok(!channel.eof() && channel.write_window().remaining > 0)
            })
            .await
        }

        async fn exit_status_ready(&self) -> Result<bool, TransportError> {
            self.with_channel(self.op_timeout, |channel| Ok(channel.eof())).await
        }

        async fn exit_status(&self) -> Result<i32, TransportError> {
            self.with_channel(self.op_timeout, |channel| {
                channel.wait_close()?;
                channel.exit_status().map_err(TransportError::from)
            })
            .await
        }

        async fn close(&self) -> Result<(), TransportError> {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            debug!("Closing SSH channel");
            let session = self.session.clone();
            let channel = Arc::clone(&self.channel);
            let op_timeout = self.op_timeout;
            blocking(move || {
                let mut guard = lock(&channel)?;
                session.set_timeout(timeout_ms(op_timeout));
                guard.close().map_err(TransportError::from)
            })
            .await
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
