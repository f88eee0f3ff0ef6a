//! # Shellmark
//!
//! Run commands on remote hosts over SSH and get structured results back.
//!
//! Two strategies are provided. [`CommandExecutor`] opens a fresh exec
//! channel per command and drains standard output and standard error
//! concurrently under a deadline. [`ShellSession`] keeps one interactive
//! shell open and frames each command between two sentinel echoes, so that
//! output boundaries and exit status can be recovered from an otherwise
//! undelimited byte stream.
//!
//! ```no_run
//! # async fn demo() -> shellmark::Result<()> {
//! use shellmark::SshClientBuilder;
//!
//! let client = SshClientBuilder::new("deploy@build01").with_agent(true).build()?;
//! let shell = client.create_shell().await?;
//! let result = shell.run("uname -a").await?;
//! println!("{} (exit {:?})", result.stdout_lossy(), result.exit_status);
//! shell.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use shellmark_ssh as ssh;

/// Error types for the Shellmark library
pub mod error;

/// Command results
pub mod result;

/// Execution settings
pub mod config;

/// Absolute deadlines
pub mod deadline;

/// Sentinel framing for interactive shells
pub mod sentinel;

/// Per-call logging context
pub mod instrument;

/// One-shot command execution
pub mod executor;

/// Persistent shell sessions
pub mod shell;

/// SFTP sessions
pub mod sftp;

/// Client facade
pub mod client;

pub use client::{SshClient, SshClientBuilder};
pub use config::{ExecConfig, TimeoutAction};
pub use deadline::Deadline;
pub use error::{ShellmarkError, TimeoutKind};
pub use executor::{CommandExecutor, Stdin};
pub use instrument::Instrumentation;
pub use result::CommandResult;
pub use sentinel::Sentinel;
pub use sftp::SftpSession;
pub use shell::{ShellSession, ShellState};

/// Result type alias for Shellmark operations
pub type Result<T> = std::result::Result<T, ShellmarkError>;
