//! Execution settings shared by the executor and shell sessions

use crate::{Result, ShellmarkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What a shell session does when a command times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutAction {
    /// Report the timeout and keep the channel for later calls
    Raise,
    /// Report the timeout and close the channel and its connection
    #[default]
    RaiseAndDisconnect,
}

impl TimeoutAction {
    /// Whether this action tears the session down
    pub fn disconnects(self) -> bool {
        matches!(self, Self::RaiseAndDisconnect)
    }
}

impl fmt::Display for TimeoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise => f.write_str("RAISE"),
            Self::RaiseAndDisconnect => f.write_str("RAISE_AND_DISCONNECT"),
        }
    }
}

impl FromStr for TimeoutAction {
    type Err = ShellmarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "RAISE" => Ok(Self::Raise),
            "RAISE_AND_DISCONNECT" | "RAISE_DISCONNECT" => Ok(Self::RaiseAndDisconnect),
            other => Err(ShellmarkError::Config(format!("unknown timeout action: {}", other))),
        }
    }
}

/// Settings for running commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Default per-call deadline
    pub command_timeout: Duration,
    /// Keepalive interval requested on shell connections
    pub keepalive: Duration,
    /// Longest single blocking read while polling
    pub poll_interval: Duration,
    /// Shell session policy on timeout
    pub timeout_action: TimeoutAction,
    /// Shell expression that expands to the last exit status
    pub exit_status_variable: String,
    /// Largest read requested from a channel
    pub read_chunk_size: usize,
    /// How many times to check for an exit status before blocking on it
    pub exit_status_polls: u32,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            keepalive: Duration::from_secs(45),
            poll_interval: Duration::from_millis(10),
            timeout_action: TimeoutAction::RaiseAndDisconnect,
            exit_status_variable: "$?".to_string(),
            read_chunk_size: 1024,
            exit_status_polls: 2,
        }
    }
}

impl ExecConfig {
    /// Set the default command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the keepalive interval
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the polling granularity
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the timeout action
    pub fn with_timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// Set the exit status expression (`$status` for fish, for example)
    pub fn with_exit_status_variable(mut self, variable: impl Into<String>) -> Self {
        self.exit_status_variable = variable.into();
        self
    }

    /// Set the read chunk size
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Check that the settings can drive a polling loop
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout.is_zero() {
            return Err(ShellmarkError::Config("command timeout must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ShellmarkError::Config("poll interval must be positive".to_string()));
        }
        if self.read_chunk_size == 0 {
            return Err(ShellmarkError::Config("read chunk size must be positive".to_string()));
        }
        if self.exit_status_variable.trim().is_empty() {
            return Err(ShellmarkError::Config("exit status variable is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_config_default() {
        let config = ExecConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(60));
        assert_eq!(config.keepalive, Duration::from_secs(45));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.timeout_action, TimeoutAction::RaiseAndDisconnect);
        assert_eq!(config.exit_status_variable, "$?");
        assert_eq!(config.read_chunk_size, 1024);
        assert_eq!(config.exit_status_polls, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exec_config_validate() {
        let config = ExecConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ShellmarkError::Config(_))));

        let config = ExecConfig::default().with_read_chunk_size(0);
        assert!(config.validate().is_err());

        let config = ExecConfig::default().with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ExecConfig::default().with_exit_status_variable(" ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_action_parse() {
        assert_eq!("RAISE".parse::<TimeoutAction>().unwrap(), TimeoutAction::Raise);
        assert_eq!(
            "raise-and-disconnect".parse::<TimeoutAction>().unwrap(),
            TimeoutAction::RaiseAndDisconnect
        );
        assert!("ignore".parse::<TimeoutAction>().is_err());
        assert_eq!(TimeoutAction::Raise.to_string(), "RAISE");
        assert!(TimeoutAction::default().disconnects());
    }

    #[test]
    fn test_timeout_action_serde_names() {
        let json = serde_json::to_string(&TimeoutAction::RaiseAndDisconnect).unwrap();
        assert_eq!(json, "\"RAISE_AND_DISCONNECT\"");
        let action: TimeoutAction = serde_json::from_str("\"RAISE\"").unwrap();
        assert_eq!(action, TimeoutAction::Raise);
    }

    #[test]
    fn test_exec_config_partial_deserialize() {
        let config: ExecConfig =
            serde_json::from_str(r#"{"timeout_action": "RAISE", "read_chunk_size": 4096}"#).unwrap();
        assert_eq!(config.timeout_action, TimeoutAction::Raise);
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }
}
