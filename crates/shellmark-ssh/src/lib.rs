//! # Shellmark SSH Transport
//!
//! Connection, channel and SFTP plumbing underneath Shellmark. The traits in
//! this crate are the seam between command execution and the wire: the
//! libssh2-backed implementations live behind the `ssh2` feature and the
//! [`mock`] module provides an in-memory stand-in for tests.

#![warn(missing_docs)]

/// Transport abstraction and implementations
pub mod transport;

/// SSH connection management
pub mod connection;

/// Exec and shell channels
pub mod channel;

/// Remote filesystem access over SFTP
pub mod sftp;

/// Port forwarding and SOCKS tunnels
pub mod tunnel;

/// SSH-specific error types
pub mod error;

/// In-memory transport for tests
pub mod mock;

pub use channel::{Channel, Recv, StreamKind, SEND_RETRY_INTERVAL};
pub use connection::Connection;
pub use error::TransportError;
pub use sftp::{resolve_path, DirEntry, RemoteFilesystem, RemoteMetadata};
pub use transport::{ConnectionInfo, SshConfig, Transport, TransportType};
pub use tunnel::{ForwardSpec, Tunnel, TunnelBuilder, TunnelKind, DEFAULT_BIND_ADDRESS};

#[cfg(feature = "ssh2")]
pub use channel::Ssh2Channel;
#[cfg(feature = "ssh2")]
pub use connection::SshConnection;
#[cfg(feature = "ssh2")]
pub use sftp::SftpFilesystem;
#[cfg(feature = "ssh2")]
pub use transport::Ssh2Transport;
