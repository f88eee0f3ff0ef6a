//! Shared helpers for integration tests

#![allow(dead_code)]

use anyhow::{Context, Result};
use shellmark::ssh::mock::{MockOutput, MockTransport};
use shellmark::{ExecConfig, SshClient, SshClientBuilder};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Commands the mock host knows besides the shell builtins
pub fn host_commands(command: &str) -> MockOutput {
    match command {
        "printf A; printf B >&2" => MockOutput::stdout("A").with_stderr("B"),
        "ls -l" => MockOutput::stdout("total 4\n-rw-r--r-- 1 mock mock 5 a.txt\n"),
        "ls -la" => MockOutput::stdout(
            "total 8\ndrwxr-xr-x 2 mock mock 4096 .\ndrwxr-xr-x 3 mock mock 4096 ..\n-rw-r--r-- 1 mock mock 5 a.txt\n",
        ),
        "uname" => MockOutput::stdout("Linux\n"),
        "slow-stdout" => MockOutput::stdout("finally\n").stdout_after(Duration::from_millis(400)),
        _ => MockOutput::stderr(format!("sh: {}: not found\n", command)).with_status(127),
    }
}

/// Client over a mock host
pub fn mock_client(config: ExecConfig) -> Result<SshClient<MockTransport>> {
    SshClientBuilder::new("tester@mock.example.com")
        .with_exec_config(config)
        .build_with(|_| MockTransport::new().with_handler(host_commands))
        .context("Failed to build mock client")
}

/// Create a temporary file with `content`
pub fn local_file(name: &str, content: &[u8]) -> Result<(TempDir, PathBuf)> {
    let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
    let path = temp_dir.path().join(name);
    std::fs::write(&path, content).context("Failed to write test file")?;
    Ok((temp_dir, path))
}
