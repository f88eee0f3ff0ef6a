//! Transport abstraction and implementations

use async_trait::async_trait;
use crate::{Connection, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Transport abstraction for different connection types
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new authenticated connection to the remote host
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;

    /// Test connectivity to the remote host
    async fn test_connection(&self) -> Result<(), TransportError> {
        let connection = self.connect().await?;
        connection.close().await
    }
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Connection type
    pub transport_type: TransportType,
}

/// Transport type enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with libssh2
    SshLibssh2,
    /// In-memory transport (for testing)
    Local,
}

/// SSH configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Password for password authentication
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// SSH key path
    pub key_path: Option<PathBuf>,
    /// Passphrase for the key at `key_path`
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    /// Try the default key files under `~/.ssh`
    pub look_for_keys: bool,
    /// Try keys offered by a running ssh-agent
    pub allow_agent: bool,
    /// Request compression
    pub compress: bool,
    /// Accept hosts missing from `~/.ssh/known_hosts`
    pub accept_missing_host_key: bool,
    /// Extra `-o` options for the `ssh` command line used by tunnels
    pub options: HashMap<String, String>,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Keepalive interval in seconds
    pub keepalive_interval: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            password: None,
            key_path: None,
            passphrase: None,
            look_for_keys: false,
            allow_agent: false,
            compress: true,
            accept_missing_host_key: true,
            options: HashMap::new(),
            connect_timeout: 60,
            keepalive_interval: 45,
        }
    }
}

impl SshConfig {
    /// `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(feature = "ssh2")]
pub use self::libssh2::Ssh2Transport;

#[cfg(feature = "ssh2")]
mod libssh2 {
    use super::*;
    use crate::error::blocking;
    use crate::SshConnection;
    use ssh2::{CheckResult, KnownHostFileKind, Session};
    use std::net::{TcpStream, ToSocketAddrs};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    /// Transport that opens libssh2 sessions over TCP
    pub struct Ssh2Transport {
        /// SSH configuration
        config: SshConfig,
        /// Pre-connected socket for the next `connect`
        stream: Mutex<Option<TcpStream>>,
    }

    impl Ssh2Transport {
        /// Create a new libssh2 transport
        pub fn new(config: SshConfig) -> Self {
            Self {
                config,
                stream: Mutex::new(None),
            }
        }

        /// Use an already connected socket (for example one opened through a
        /// proxy) for the next connection instead of dialing the host directly
        pub fn with_stream(self, stream: TcpStream) -> Self {
            if let Ok(mut slot) = self.stream.lock() {
                *slot = Some(stream);
            }
            self
        }

        /// SSH configuration
        pub fn config(&self) -> &SshConfig {
            &self.config
        }

        fn take_stream(&self) -> Option<TcpStream> {
            self.stream.lock().ok().and_then(|mut slot| slot.take())
        }
    }

    #[async_trait]
    impl Transport for Ssh2Transport {
        async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
            info!("Connecting to {}@{}:{}", self.config.username, self.config.host, self.config.port);

            let config = self.config.clone();
            let stream = self.take_stream();
            let session = blocking(move || connect_session(&config, stream)).await?;

            info!("Successfully connected to {}@{}", self.config.username, self.config.host);
            let op_timeout = Duration::from_secs(self.config.connect_timeout);
            Ok(Arc::new(SshConnection::new(session, op_timeout)))
        }

        fn connection_info(&self) -> ConnectionInfo {
            ConnectionInfo {
                host: self.config.host.clone(),
                port: self.config.port,
                username: self.config.username.clone(),
                transport_type: TransportType::SshLibssh2,
            }
        }
    }

    fn connect_session(config: &SshConfig, stream: Option<TcpStream>) -> Result<Session, TransportError> {
        let timeout = Duration::from_secs(config.connect_timeout);
        let tcp = match stream {
            Some(stream) => stream,
            None => dial(config, timeout)?,
        };
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();

        let mut session = Session::new()
            .map_err(|e| TransportError::Connection(format!("Failed to create SSH session: {}", e)))?;
        session.set_compress(config.compress);
        session.set_timeout(timeout.as_millis().clamp(1, u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| TransportError::Connection(format!("Handshake failed: {}", e)))?;

        verify_host_key(&session, config)?;
        authenticate(&session, config)?;
        Ok(session)
    }

    fn dial(config: &SshConfig, timeout: Duration) -> Result<TcpStream, TransportError> {
        let addrs = config
            .address()
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("Failed to resolve {}: {}", config.host, e)))?;

        let mut last_error = None;
        for addr in addrs {
            debug!("Dialing {}", addr);
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(TransportError::Connection(match last_error {
            Some(e) => format!("Failed to connect to {}: {}", config.address(), e),
            None => format!("No addresses found for {}", config.host),
        }))
    }

    fn verify_host_key(session: &Session, config: &SshConfig) -> Result<(), TransportError> {
        let (key, _) = session
            .host_key()
            .ok_or_else(|| TransportError::HostKey("server offered no host key".to_string()))?;

        let mut known_hosts = session.known_hosts()?;
        if let Some(path) = home_dir().map(|home| home.join(".ssh").join("known_hosts")) {
            if path.exists() {
                known_hosts.read_file(&path, KnownHostFileKind::OpenSSH)?;
            }
        }

        match known_hosts.check_port(&config.host, config.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound if config.accept_missing_host_key => {
                warn!("Host {} not in known_hosts, accepting", config.host);
                Ok(())
            }
            CheckResult::NotFound => Err(TransportError::HostKey(format!(
                "{} is not a known host",
                config.host
            ))),
            CheckResult::Mismatch => Err(TransportError::HostKey(format!(
                "host key for {} does not match known_hosts",
                config.host
            ))),
            CheckResult::Failure => Err(TransportError::HostKey(format!(
                "could not check host key for {}",
                config.host
            ))),
        }
    }

    fn authenticate(session: &Session, config: &SshConfig) -> Result<(), TransportError> {
        let user = config.username.as_str();

        if let Some(key_path) = &config.key_path {
            try_auth("key file", session.userauth_pubkey_file(user, None, key_path, config.passphrase.as_deref()));
        }
        if !session.authenticated() && config.look_for_keys {
            for key in default_key_files() {
                if try_auth("default key", session.userauth_pubkey_file(user, None, &key, None)) {
                    break;
                }
            }
        }
        if !session.authenticated() && config.allow_agent {
            try_auth("agent", session.userauth_agent(user));
        }
        if !session.authenticated() {
            if let Some(password) = &config.password {
                session
                    .userauth_password(user, password)
                    .map_err(|e| TransportError::Authentication(e.to_string()))?;
            }
        }

        if !session.authenticated() {
            return Err(TransportError::Authentication(format!(
                "no accepted credentials for {}",
                user
            )));
        }
        Ok(())
    }

    fn try_auth(method: &str, result: Result<(), ssh2::Error>) -> bool {
        match result {
            Ok(()) => {
                debug!("Authenticated with {}", method);
                true
            }
            Err(e) => {
                debug!("Authentication with {} failed: {}", method, e);
                false
            }
        }
    }

    fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(PathBuf::from)
    }

    fn default_key_files() -> Vec<PathBuf> {
        let Some(home) = home_dir() else {
            return Vec::new();
        };
        ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .filter(|path| Path::exists(path))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config_default() {
        let config = SshConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 22);
        assert_eq!(config.username, "root");
        assert_eq!(config.connect_timeout, 60);
        assert_eq!(config.keepalive_interval, 45);
        assert!(config.compress);
        assert!(config.accept_missing_host_key);
        assert!(config.password.is_none());
    }

    #[test]
    fn test_ssh_config_address() {
        let config = SshConfig {
            host: "example.com".to_string(),
            port: 2222,
            ..Default::default()
        };
        assert_eq!(config.address(), "example.com:2222");
    }

    #[test]
    fn test_ssh_config_secrets_not_serialized() {
        let config = SshConfig {
            password: Some("hunter2".to_string()),
            passphrase: Some("open sesame".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("open sesame"));
        assert!(json.contains("\"port\":22"));
    }

    #[test]
    fn test_ssh_config_partial_deserialize() {
        let config: SshConfig =
            serde_json::from_str(r#"{"host": "build01", "username": "ci"}"#).unwrap();
        assert_eq!(config.host, "build01");
        assert_eq!(config.username, "ci");
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout, 60);
    }
}
