//! One-shot command execution over exec channels

use crate::{CommandResult, Deadline, ExecConfig, Instrumentation, Result, ShellmarkError, TimeoutKind};
use bytes::{Bytes, BytesMut};
use shellmark_ssh::{Channel, Connection, Recv, StreamKind, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Input for a one-shot command
pub enum Stdin {
    /// Bytes written as-is
    Bytes(Bytes),
    /// A stream read to its end before the command starts
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl Stdin {
    /// No input
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    /// Read input from `reader`
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    async fn into_bytes(self) -> std::io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl Default for Stdin {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Stdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Bytes> for Stdin {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Stdin {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Stdin {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for Stdin {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Stdin {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

/// Runs each command on its own exec channel.
///
/// No shell state carries over between calls.
pub struct CommandExecutor {
    connection: Arc<dyn Connection>,
    config: ExecConfig,
    instrumentation: Instrumentation,
}

impl CommandExecutor {
    /// Executor over an authenticated connection
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            config: ExecConfig::default(),
            instrumentation: Instrumentation::default(),
        }
    }

    /// Use `config` for timeouts and polling
    pub fn with_config(mut self, config: ExecConfig) -> Self {
        self.config = config;
        self
    }

    /// Log through `instrumentation`
    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Current settings
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// The underlying connection
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Run `command` with the default timeout and no input
    pub async fn run(&self, command: &str) -> Result<CommandResult> {
        self.execute(command, None, Stdin::empty()).await
    }

    /// Run `command`, feeding it `stdin`, within `timeout` (or the configured default)
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        stdin: impl Into<Stdin>,
    ) -> Result<CommandResult> {
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        if timeout.is_zero() {
            return Err(ShellmarkError::Config("command timeout must be positive".to_string()));
        }
        let call = self.execute_inner(command, Deadline::after(timeout), stdin.into());
        self.instrumentation.command("execute", command, timeout, call).await
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await?;
        Ok(())
    }

    async fn execute_inner(&self, command: &str, deadline: Deadline, stdin: Stdin) -> Result<CommandResult> {
        self.config.validate()?;
        if !self.connection.is_connected() {
            return Err(ShellmarkError::Connection("no active session".to_string()));
        }

        let input = timeout_at(deadline.instant(), stdin.into_bytes())
            .await
            .map_err(|_| ShellmarkError::timeout(TimeoutKind::ProcessExit, deadline.timeout()))??;

        let channel = self.connection.open_exec_channel().await?;
        let outcome = self.run_channel(&channel, command, input, deadline).await;
        if let Err(e) = channel.close().await {
            warn!("Failed to close exec channel: {}", e);
        }
        outcome
    }

    async fn run_channel(
        &self,
        channel: &Arc<dyn Channel>,
        command: &str,
        input: Bytes,
        deadline: Deadline,
    ) -> Result<CommandResult> {
        let start = async {
            channel.exec(command).await?;
            if !input.is_empty() {
                channel.send_all(&input).await?;
            }
            channel.send_eof().await
        };
        timeout_at(deadline.instant(), start).await.map_err(|_| {
            debug!("Deadline passed before the command accepted its input");
            ShellmarkError::timeout(TimeoutKind::ProcessExit, deadline.timeout())
        })??;

        let cancel = CancellationToken::new();
        let mut stdout = self.spawn_drain(channel, StreamKind::Stdout, &cancel);
        let mut stderr = self.spawn_drain(channel, StreamKind::Stderr, &cancel);

        let drained = timeout_at(deadline.instant(), async {
            let out = (&mut stdout).await;
            let err = (&mut stderr).await;
            (out, err)
        })
        .await;

        let (out, err) = match drained {
            Ok(pair) => pair,
            Err(_) => {
                debug!("Deadline passed while draining output, stopping drains");
                cancel.cancel();
                for handle in [stdout, stderr] {
                    // A handle that already returned must not be polled again
                    if !handle.is_finished() {
                        let _ = handle.await;
                    }
                }
                return Err(ShellmarkError::timeout(TimeoutKind::ProcessExit, deadline.timeout()));
            }
        };
        let stdout = joined(out)?;
        let stderr = joined(err)?;

        let exit_status = self.wait_exit_status(channel, deadline).await?;
        Ok(CommandResult::new(Some(input), stdout, stderr, Some(exit_status)))
    }

    fn spawn_drain(
        &self,
        channel: &Arc<dyn Channel>,
        stream: StreamKind,
        cancel: &CancellationToken,
    ) -> JoinHandle<std::result::Result<Bytes, TransportError>> {
        tokio::spawn(drain(
            Arc::clone(channel),
            stream,
            self.config.read_chunk_size,
            self.config.poll_interval,
            cancel.clone(),
        ))
    }

    async fn wait_exit_status(&self, channel: &Arc<dyn Channel>, deadline: Deadline) -> Result<i32> {
        for _ in 0..self.config.exit_status_polls {
            if channel.exit_status_ready().await? {
                break;
            }
            tokio::time::sleep(deadline.poll_timeout(self.config.poll_interval)).await;
        }

        let status = timeout_at(deadline.instant(), channel.exit_status())
            .await
            .map_err(|_| ShellmarkError::timeout(TimeoutKind::ProcessExit, deadline.timeout()))??;
        Ok(status)
    }
}

/// Read `stream` until end of stream or cancellation
async fn drain(
    channel: Arc<dyn Channel>,
    stream: StreamKind,
    chunk: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> std::result::Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!("{} drain cancelled after {} bytes", stream, buf.len());
                return Ok(buf.freeze());
            }
            read = channel.recv(stream, chunk, poll_interval) => match read? {
                Recv::Data(data) => buf.extend_from_slice(&data),
                Recv::Empty => {}
                Recv::Eof => {
                    trace!("{} reached end of stream after {} bytes", stream, buf.len());
                    return Ok(buf.freeze());
                }
            },
        }
    }
}

fn joined(
    outcome: std::result::Result<std::result::Result<Bytes, TransportError>, tokio::task::JoinError>,
) -> Result<Bytes> {
    match outcome {
        Ok(drained) => Ok(drained?),
        Err(e) => Err(ShellmarkError::Protocol(format!("drain task failed: {}", e))),
    }
}

#[cfg(test)]
mod tests;
