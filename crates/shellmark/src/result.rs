//! The record returned by every command

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Output of a finished remote command.
///
/// Two results are equal when all four fields are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Bytes sent to the command; `None` for shell sessions
    pub stdin: Option<Bytes>,
    /// Standard output
    pub stdout: Bytes,
    /// Standard error
    pub stderr: Bytes,
    /// Exit status, `None` when it could not be determined
    pub exit_status: Option<i32>,
}

impl CommandResult {
    /// Create a result
    pub fn new(
        stdin: Option<Bytes>,
        stdout: impl Into<Bytes>,
        stderr: impl Into<Bytes>,
        exit_status: Option<i32>,
    ) -> Self {
        Self {
            stdin,
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status,
        }
    }

    /// Whether the command reported exit status 0.
    ///
    /// An unknown exit status is not success.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Standard output decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Standard error decoded lossily as UTF-8
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}
