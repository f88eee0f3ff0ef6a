//! Port forwards and SOCKS proxies backed by the system `ssh` binary

use crate::{SshConfig, TransportError};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default bind address for forwarded ports
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Kind of tunnel held open by an `ssh` process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// `-L`: a local port forwarded to an address reachable from the remote host
    LocalForward,
    /// `-R`: a remote port forwarded to an address reachable from this host
    RemoteForward,
    /// `-D`: a dynamic SOCKS proxy listening locally
    Socks,
}

/// A port forward request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Port to listen on
    pub port: u16,
    /// Destination host, resolved on the far side of the tunnel
    pub forward_host: String,
    /// Destination port
    pub forward_port: u16,
    /// Listen address (default: [`DEFAULT_BIND_ADDRESS`])
    pub bind_address: Option<String>,
    /// Listen on the remote host instead of locally
    pub remote: bool,
}

impl ForwardSpec {
    /// Forward local `port` to `forward_host:forward_port` as seen from the remote host
    pub fn local(port: u16, forward_host: impl Into<String>, forward_port: u16) -> Self {
        Self {
            port,
            forward_host: forward_host.into(),
            forward_port,
            bind_address: None,
            remote: false,
        }
    }

    /// Forward remote `port` to `forward_host:forward_port` as seen from this host
    pub fn remote(port: u16, forward_host: impl Into<String>, forward_port: u16) -> Self {
        Self {
            remote: true,
            ..Self::local(port, forward_host, forward_port)
        }
    }

    /// Listen on `address` instead of the loopback interface
    pub fn bind(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    fn flag(&self) -> String {
        format!(
            "-{}{}:{}:{}:{}",
            if self.remote { "R" } else { "L" },
            self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS),
            self.port,
            self.forward_host,
            self.forward_port
        )
    }
}

/// Builds `ssh` invocations that hold tunnels open
#[derive(Debug, Clone)]
pub struct TunnelBuilder {
    /// SSH configuration
    config: SshConfig,
    /// Program to run (default: `ssh`)
    program: String,
}

impl TunnelBuilder {
    /// Create a new tunnel builder
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            program: "ssh".to_string(),
        }
    }

    /// Use a different `ssh` executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Build SSH command arguments shared by every tunnel kind
    fn build_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(), "BatchMode=yes".to_string(),
            "-o".to_string(), "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(), format!("ConnectTimeout={}", self.config.connect_timeout),
            "-o".to_string(), format!("ServerAliveInterval={}", self.config.keepalive_interval),
            "-p".to_string(), self.config.port.to_string(),
        ];

        if self.config.accept_missing_host_key {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=accept-new".to_string());
        }

        if self.config.compress {
            args.push("-C".to_string());
        }

        // Add SSH key if specified
        if let Some(key_path) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key_path.to_string_lossy().to_string());
        }

        // Add custom options
        for (key, value) in &self.config.options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.username, self.config.host)
    }

    /// Arguments for a port forward
    pub fn forward_args(&self, spec: &ForwardSpec) -> Vec<String> {
        let mut args = self.build_ssh_args();
        args.push(spec.flag());
        args.push(self.target());
        args
    }

    /// Arguments for a SOCKS proxy on `port`
    pub fn socks_args(&self, port: u16, bind_address: Option<&str>) -> Vec<String> {
        let mut args = self.build_ssh_args();
        args.push(format!("-D{}:{}", bind_address.unwrap_or(DEFAULT_BIND_ADDRESS), port));
        args.push(self.target());
        args
    }

    /// Start a port forward
    pub fn forward_port(&self, spec: &ForwardSpec) -> Result<Tunnel, TransportError> {
        let kind = if spec.remote { TunnelKind::RemoteForward } else { TunnelKind::LocalForward };
        let address = if spec.remote {
            spec.bind_address.clone().unwrap_or_else(|| self.config.host.clone())
        } else {
            spec.bind_address.clone().unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
        };
        let child = self.spawn(self.forward_args(spec))?;
        info!("Forwarding {}:{} -> {}:{}", address, spec.port, spec.forward_host, spec.forward_port);
        Ok(Tunnel::new(kind, address, spec.port, child))
    }

    /// Start a SOCKS proxy listening on `port`
    pub fn socks_proxy(&self, port: u16, bind_address: Option<&str>) -> Result<Tunnel, TransportError> {
        let address = bind_address.unwrap_or(DEFAULT_BIND_ADDRESS).to_string();
        let child = self.spawn(self.socks_args(port, bind_address))?;
        info!("SOCKS proxy on {}:{} via {}", address, port, self.config.host);
        Ok(Tunnel::new(TunnelKind::Socks, address, port, child))
    }

    fn spawn(&self, args: Vec<String>) -> Result<Child, TransportError> {
        debug!("Starting tunnel: {} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Tunnel(format!("Failed to start {}: {}", self.program, e)))
    }
}

/// A running tunnel process
#[derive(Debug)]
pub struct Tunnel {
    id: Uuid,
    kind: TunnelKind,
    address: String,
    port: u16,
    name: Option<String>,
    process: Option<Child>,
}

impl Tunnel {
    fn new(kind: TunnelKind, address: String, port: u16, process: Child) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            address,
            port,
            name: None,
            process: Some(process),
        }
    }

    /// Unique tunnel id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Tunnel kind
    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    /// Address the tunnel listens on
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Port the tunnel listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Optional label
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Attach a label
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// OS process id of the `ssh` process, while it is running
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|child| child.id())
    }

    /// Whether the `ssh` process is still running
    pub fn is_running(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the tunnel
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut child) = self.process.take() {
            debug!("Closing tunnel {}", self.id);

            if let Err(e) = child.kill().await {
                warn!("Failed to kill tunnel process: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
        }
    }
}
