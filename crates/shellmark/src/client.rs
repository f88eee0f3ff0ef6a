//! Client facade: connect, run, open shells and SFTP sessions

use crate::{
    CommandExecutor, CommandResult, ExecConfig, Instrumentation, Result, SftpSession, ShellSession,
    Stdin, TimeoutAction,
};
use shellmark_ssh::{ConnectionInfo, SshConfig, Transport, TunnelBuilder};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builder for [`SshClient`]
#[derive(Debug, Clone)]
pub struct SshClientBuilder {
    /// Target connection string
    target: String,
    /// SSH configuration
    ssh_config: SshConfig,
    /// Command execution settings
    exec_config: ExecConfig,
    /// Logging context handed to everything the client creates
    instrumentation: Instrumentation,
}

impl SshClientBuilder {
    /// Create a builder for `[user@]host[:port]`
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let (username, host, port) = Self::parse_target(&target);

        let ssh_config = SshConfig {
            host,
            port,
            username,
            ..Default::default()
        };

        Self {
            instrumentation: Instrumentation::new(target.clone()),
            target,
            ssh_config,
            exec_config: ExecConfig::default(),
        }
    }

    /// Parse target string into components
    fn parse_target(target: &str) -> (String, String, u16) {
        // Format: [user@]host[:port]
        let mut username = SshConfig::default().username;
        let mut host = target.to_string();
        let mut port = 22;

        if let Some(at_pos) = target.rfind('@') {
            username = target[..at_pos].to_string();
            host = target[at_pos + 1..].to_string();
        }

        // A bare IPv6 address has more than one colon and no port
        if host.matches(':').count() == 1 {
            if let Some(colon_pos) = host.rfind(':') {
                if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
                    port = parsed_port;
                    host.truncate(colon_pos);
                }
            }
        }

        (username, host, port)
    }

    /// Target string the builder was created with
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.ssh_config.password = Some(password.into());
        self
    }

    /// Authenticate with a private key file
    pub fn with_key(mut self, key_path: PathBuf) -> Self {
        self.ssh_config.key_path = Some(key_path);
        self
    }

    /// Passphrase for the key file
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.ssh_config.passphrase = Some(passphrase.into());
        self
    }

    /// Try keys from a running ssh-agent
    pub fn with_agent(mut self, allow: bool) -> Self {
        self.ssh_config.allow_agent = allow;
        self
    }

    /// Try the default key files under `~/.ssh`
    pub fn with_default_keys(mut self, look: bool) -> Self {
        self.ssh_config.look_for_keys = look;
        self
    }

    /// Enable or disable compression
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.ssh_config.compress = compress;
        self
    }

    /// Accept hosts missing from `known_hosts`
    pub fn with_accept_missing_host_key(mut self, accept: bool) -> Self {
        self.ssh_config.accept_missing_host_key = accept;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.ssh_config.connect_timeout = timeout.as_secs().max(1);
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.exec_config.command_timeout = timeout;
        self
    }

    /// Set the keepalive interval for connections and shells
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.ssh_config.keepalive_interval = keepalive.as_secs().max(1);
        self.exec_config.keepalive = keepalive;
        self
    }

    /// Set what shells do on timeout
    pub fn with_timeout_action(mut self, action: TimeoutAction) -> Self {
        self.exec_config.timeout_action = action;
        self
    }

    /// Set SSH options for tunnel processes
    pub fn with_ssh_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ssh_config.options.insert(key.into(), value.into());
        self
    }

    /// Replace the execution settings
    pub fn with_exec_config(mut self, config: ExecConfig) -> Self {
        self.exec_config = config;
        self
    }

    /// Log through `instrumentation`
    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// SSH configuration built so far
    pub fn ssh_config(&self) -> &SshConfig {
        &self.ssh_config
    }

    /// Execution settings built so far
    pub fn exec_config(&self) -> &ExecConfig {
        &self.exec_config
    }

    /// Tunnel helper for the same host and credentials
    pub fn tunnels(&self) -> TunnelBuilder {
        TunnelBuilder::new(self.ssh_config.clone())
    }

    /// Build a client over any transport constructed from the SSH configuration
    pub fn build_with<T, F>(self, transport: F) -> Result<SshClient<T>>
    where
        T: Transport,
        F: FnOnce(SshConfig) -> T,
    {
        self.exec_config.validate()?;
        debug!("Building client for {}", self.target);
        Ok(SshClient::new(transport(self.ssh_config), self.exec_config)
            .with_instrumentation(self.instrumentation))
    }

    /// Build a libssh2-backed client
    #[cfg(feature = "ssh2")]
    pub fn build(self) -> Result<SshClient<shellmark_ssh::Ssh2Transport>> {
        self.build_with(shellmark_ssh::Ssh2Transport::new)
    }
}

/// Entry point for running commands on one host
pub struct SshClient<T: Transport> {
    transport: T,
    config: ExecConfig,
    instrumentation: Instrumentation,
}

impl<T: Transport> SshClient<T> {
    /// Client over `transport`
    pub fn new(transport: T, config: ExecConfig) -> Self {
        Self {
            transport,
            config,
            instrumentation: Instrumentation::default(),
        }
    }

    /// Log through `instrumentation`
    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// The transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Execution settings
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Who and where this client connects to
    pub fn connection_info(&self) -> ConnectionInfo {
        self.transport.connection_info()
    }

    /// Open a connection and return an executor that reuses it
    pub async fn connect(&self) -> Result<CommandExecutor> {
        let connection = self.transport.connect().await?;
        Ok(CommandExecutor::new(connection)
            .with_config(self.config.clone())
            .with_instrumentation(self.instrumentation.child("exec")))
    }

    /// Run one command on a connection opened for it
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
        stdin: impl Into<Stdin>,
    ) -> Result<CommandResult> {
        let executor = self.connect().await?;
        let outcome = executor.execute(command, timeout, stdin).await;
        if let Err(e) = executor.close().await {
            warn!("Failed to close connection: {}", e);
        }
        outcome
    }

    /// Open an interactive shell with the client's settings
    pub async fn create_shell(&self) -> Result<ShellSession> {
        self.create_shell_with(None, None).await
    }

    /// Open an interactive shell, overriding keepalive and default timeout
    pub async fn create_shell_with(
        &self,
        keepalive: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<ShellSession> {
        let mut config = self.config.clone();
        if let Some(keepalive) = keepalive {
            config.keepalive = keepalive;
        }
        if let Some(timeout) = timeout {
            config.command_timeout = timeout;
        }

        let info = self.transport.connection_info();
        let connection = self.transport.connect().await?;
        match ShellSession::open(connection.clone(), config).await {
            Ok(shell) => {
                info!("Shell ready on {}@{}", info.username, info.host);
                Ok(shell.with_instrumentation(self.instrumentation.child("shell")))
            }
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    /// Open an SFTP session on a new connection
    pub async fn create_sftp(&self) -> Result<SftpSession> {
        let connection = self.transport.connect().await?;
        match SftpSession::open(connection.clone()).await {
            Ok(sftp) => Ok(sftp.with_instrumentation(self.instrumentation.child("sftp"))),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }
}
