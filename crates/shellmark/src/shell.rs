//! Persistent interactive shell sessions

use crate::sentinel::Sentinel;
use crate::{
    CommandResult, Deadline, ExecConfig, Instrumentation, Result, ShellmarkError, TimeoutAction,
    TimeoutKind,
};
use bytes::BytesMut;
use shellmark_ssh::{Channel, Connection, Recv, StreamKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Where a shell session is in its command cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// Ready for the next command
    Idle,
    /// Waiting to write the framed command
    Sending,
    /// Command sent, reading until the closing sentinel
    AwaitingSentinel,
    /// The last command ran past its deadline
    TimedOut,
    /// Channel and connection are closed; every call fails
    Closed,
}

/// A long-lived shell channel running one command at a time.
///
/// Working directory and environment changes made by one command are seen
/// by the next. Concurrent calls to [`ShellSession::run`] queue behind each
/// other.
pub struct ShellSession {
    id: Uuid,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    config: ExecConfig,
    instrumentation: Instrumentation,
    state: Arc<RwLock<ShellState>>,
    in_flight: Mutex<()>,
}

impl ShellSession {
    /// Open a shell channel on `connection`
    pub async fn open(connection: Arc<dyn Connection>, config: ExecConfig) -> Result<Self> {
        config.validate()?;
        if !connection.is_connected() {
            return Err(ShellmarkError::Connection("no active session".to_string()));
        }

        connection.set_keepalive(config.keepalive).await?;
        let channel = connection.open_shell_channel().await?;
        let id = Uuid::new_v4();
        info!("Opened shell session {}", id);

        Ok(Self {
            id,
            connection,
            channel,
            config,
            instrumentation: Instrumentation::default(),
            state: Arc::new(RwLock::new(ShellState::Idle)),
            in_flight: Mutex::new(()),
        })
    }

    /// Log through `instrumentation`
    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current settings
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Current state
    pub async fn state(&self) -> ShellState {
        *self.state.read().await
    }

    /// Whether the session has been closed
    pub async fn is_closed(&self) -> bool {
        self.state().await == ShellState::Closed
    }

    /// Run `command` with the session's default timeout and timeout action
    pub async fn run(&self, command: &str) -> Result<CommandResult> {
        self.run_with(command, None, None).await
    }

    /// Run `command`, overriding the timeout and the timeout action
    pub async fn run_with(
        &self,
        command: &str,
        timeout: Option<Duration>,
        timeout_action: Option<TimeoutAction>,
    ) -> Result<CommandResult> {
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        if timeout.is_zero() {
            return Err(ShellmarkError::Config("command timeout must be positive".to_string()));
        }
        let action = timeout_action.unwrap_or(self.config.timeout_action);
        let call = self.run_exclusive(command, timeout, action);
        self.instrumentation.command("run", command, timeout, call).await
    }

    /// Close the shell channel and its connection
    pub async fn close(&self) -> Result<()> {
        let was = std::mem::replace(&mut *self.state.write().await, ShellState::Closed);
        if was != ShellState::Closed {
            info!("Closing shell session {}", self.id);
        }
        if let Err(e) = self.channel.close().await {
            warn!("Failed to close shell channel: {}", e);
        }
        self.connection.close().await?;
        Ok(())
    }

    async fn set_state(&self, state: ShellState) {
        let mut current = self.state.write().await;
        if *current != ShellState::Closed {
            trace!("Shell {} {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    async fn run_exclusive(
        &self,
        command: &str,
        timeout: Duration,
        action: TimeoutAction,
    ) -> Result<CommandResult> {
        let _guard = self.in_flight.lock().await;
        let deadline = Deadline::after(timeout);

        if self.state().await == ShellState::Closed || self.channel.is_closed() {
            return Err(ShellmarkError::Connection("shell session is closed".to_string()));
        }

        let sentinel = Sentinel::new();
        match self.exchange(command, &sentinel, deadline).await {
            Ok(result) => {
                self.set_state(ShellState::Idle).await;
                Ok(result)
            }
            Err(e) if e.is_timeout() => {
                self.set_state(ShellState::TimedOut).await;
                self.after_timeout(action).await;
                Err(e)
            }
            Err(e) if e.is_connection() => {
                if let Err(close_err) = self.close().await {
                    debug!("Error closing failed shell session: {}", close_err);
                }
                Err(e)
            }
            Err(e) => {
                self.set_state(ShellState::Idle).await;
                Err(e)
            }
        }
    }

    async fn after_timeout(&self, action: TimeoutAction) {
        match action {
            TimeoutAction::RaiseAndDisconnect => {
                info!("Command timed out, disconnecting shell session {}", self.id);
                if let Err(e) = self.close().await {
                    warn!("Failed to disconnect after timeout: {}", e);
                }
            }
            TimeoutAction::Raise => {
                debug!("Command timed out, keeping shell session {} open", self.id);
                self.set_state(ShellState::Idle).await;
            }
        }
    }

    async fn exchange(
        &self,
        command: &str,
        sentinel: &Sentinel,
        deadline: Deadline,
    ) -> Result<CommandResult> {
        self.clear(deadline).await?;

        self.set_state(ShellState::Sending).await;
        self.wait_ready(deadline).await?;
        if deadline.expired() {
            return Err(ShellmarkError::timeout(TimeoutKind::ReadyToSend, deadline.timeout()));
        }
        let framed = sentinel.frame(command, &self.config.exit_status_variable);
        self.channel.send_all(&framed).await?;

        self.set_state(ShellState::AwaitingSentinel).await;
        let chunk = self.config.read_chunk_size;
        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();

        loop {
            if let Some(framed) = sentinel.parse(&stdout) {
                if framed.exit_status.is_none() {
                    warn!(raw_status = %framed.raw_status, "Could not parse exit status");
                }
                return Ok(CommandResult::new(None, framed.output, stderr.freeze(), framed.exit_status));
            }
            if deadline.expired() {
                return Err(ShellmarkError::timeout(TimeoutKind::Sentinel, deadline.timeout()));
            }

            let wait = deadline.poll_timeout(self.config.poll_interval);
            let stdout_eof = match self.channel.recv(StreamKind::Stdout, chunk, wait).await? {
                Recv::Data(data) => {
                    stdout.extend_from_slice(&data);
                    false
                }
                Recv::Empty => false,
                Recv::Eof => true,
            };
            if let Recv::Data(data) = self.channel.recv(StreamKind::Stderr, chunk, Duration::ZERO).await? {
                stderr.extend_from_slice(&data);
            }

            if stdout_eof && sentinel.parse(&stdout).is_none() {
                return self.shell_exited(sentinel, &stdout, stderr, deadline).await;
            }
        }
    }

    /// The shell closed its output before the trailing sentinel, as `exit` does
    async fn shell_exited(
        &self,
        sentinel: &Sentinel,
        stdout: &[u8],
        mut stderr: BytesMut,
        deadline: Deadline,
    ) -> Result<CommandResult> {
        let Some(output) = sentinel.output_after_leader(stdout) else {
            return Err(ShellmarkError::Connection("shell exited before running the command".to_string()));
        };

        let chunk = self.config.read_chunk_size;
        while let Ok(Recv::Data(data)) = self.channel.recv(StreamKind::Stderr, chunk, Duration::ZERO).await {
            stderr.extend_from_slice(&data);
        }
        let exit_status = match tokio::time::timeout_at(deadline.instant(), self.channel.exit_status()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Shell exited without an exit status: {}", e);
                None
            }
            Err(_) => {
                warn!("Timed out waiting for the shell's exit status");
                None
            }
        };

        info!("Shell session {} exited with status {:?}", self.id, exit_status);
        if let Err(e) = self.close().await {
            debug!("Error closing exited shell session: {}", e);
        }
        Ok(CommandResult::new(None, output, stderr.freeze(), exit_status))
    }

    /// Discard anything already buffered on the channel
    async fn clear(&self, deadline: Deadline) -> Result<()> {
        let chunk = self.config.read_chunk_size;
        let mut discarded = 0;
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            while !deadline.expired() {
                match self.channel.recv(stream, chunk, Duration::ZERO).await? {
                    Recv::Data(data) => discarded += data.len(),
                    Recv::Empty => break,
                    Recv::Eof => {
                        return Err(ShellmarkError::Connection("shell has exited".to_string()));
                    }
                }
            }
        }
        if discarded > 0 {
            debug!("Discarded {} stale bytes before sending", discarded);
        }
        Ok(())
    }

    async fn wait_ready(&self, deadline: Deadline) -> Result<()> {
        loop {
            if deadline.expired() {
                return Err(ShellmarkError::timeout(TimeoutKind::ReadyToSend, deadline.timeout()));
            }
            if self.channel.ready_to_send().await? {
                return Ok(());
            }
            tokio::time::sleep(deadline.poll_timeout(self.config.poll_interval)).await;
        }
    }
}

#[cfg(test)]
mod tests;
