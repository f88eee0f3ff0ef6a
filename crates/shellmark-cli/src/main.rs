//! Shellmark command-line client
//!
//! Runs a command on a remote host over an exec channel, or on a
//! sentinel-framed shell with `--shell`, and exits with the remote status.

use anyhow::{Context, Result};
use clap::Parser;
use shellmark::ssh::Ssh2Transport;
use shellmark::{CommandResult, SshClient, SshClientBuilder, Stdin, TimeoutAction};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code when the remote side reported no status
const NO_STATUS: i32 = 255;

#[derive(Parser, Debug)]
#[command(name = "shellmark")]
#[command(version)]
#[command(about = "Run commands over SSH and report their exit status", long_about = None)]
struct Cli {
    /// Remote host as [user@]host[:port]
    target: String,

    /// Command to run; with --shell and no command, commands are read from stdin
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,

    /// Run through a persistent interactive shell instead of an exec channel
    #[arg(long)]
    shell: bool,

    /// Command timeout in seconds
    #[arg(long, default_value_t = 60.0)]
    timeout: f64,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 60)]
    connect_timeout: u64,

    /// Read the password from this environment variable
    #[arg(long, value_name = "VAR")]
    password_env: Option<String>,

    /// Private key file
    #[arg(short = 'i', long)]
    identity: Option<PathBuf>,

    /// Try keys from a running ssh-agent
    #[arg(long)]
    agent: bool,

    /// Keep the shell connected after a command times out
    #[arg(long)]
    no_disconnect: bool,

    /// Forward local stdin to the remote command (exec mode)
    #[arg(long)]
    stdin: bool,
}

impl Cli {
    fn command_line(&self) -> Option<String> {
        if self.command.is_empty() {
            None
        } else {
            Some(self.command.join(" "))
        }
    }

    fn command_timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .with_context(|| format!("Invalid timeout: {}", self.timeout))
    }

    fn builder(&self) -> Result<SshClientBuilder> {
        let mut builder = SshClientBuilder::new(self.target.clone())
            .with_agent(self.agent)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_command_timeout(self.command_timeout()?);

        if self.no_disconnect {
            builder = builder.with_timeout_action(TimeoutAction::Raise);
        }
        if let Some(identity) = &self.identity {
            builder = builder.with_key(identity.clone());
        }
        if let Some(var) = &self.password_env {
            let password = std::env::var(var)
                .with_context(|| format!("Password variable {} is not set", var))?;
            builder = builder.with_password(password);
        }
        Ok(builder)
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let client = cli.builder()?.build().context("Failed to configure client")?;

    let code = if cli.shell {
        run_shell(&client, cli.command_line()).await?
    } else {
        let command = cli
            .command_line()
            .context("A command is required unless --shell is given")?;
        run_exec(&client, &command, cli.stdin).await?
    };

    debug!("Exiting with {}", code);
    std::process::exit(code);
}

async fn run_exec(client: &SshClient<Ssh2Transport>, command: &str, forward_stdin: bool) -> Result<i32> {
    let stdin = if forward_stdin {
        Stdin::reader(tokio::io::stdin())
    } else {
        Stdin::empty()
    };

    let result = client.execute_command(command, None, stdin).await?;
    print_result(&result, false).await?;
    Ok(exit_code(&result))
}

async fn run_shell(client: &SshClient<Ssh2Transport>, command: Option<String>) -> Result<i32> {
    let shell = client.create_shell().await?;
    info!("Shell session {} open", shell.id());

    let mut code = 0;
    match command {
        Some(command) => {
            let result = shell.run(&command).await?;
            print_result(&result, true).await?;
            code = exit_code(&result);
        }
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match shell.run(&line).await {
                    Ok(result) => {
                        print_result(&result, true).await?;
                        code = exit_code(&result);
                    }
                    Err(e) if e.is_timeout() && !shell.is_closed().await => {
                        warn!("{}", e);
                        code = NO_STATUS;
                    }
                    Err(e) => return Err(e.into()),
                }
                if shell.is_closed().await {
                    break;
                }
            }
        }
    }

    shell.close().await?;
    Ok(code)
}

/// Write a result's streams to the local stdout and stderr
///
/// Shell output arrives trimmed, so a line ending is restored for it.
async fn print_result(result: &CommandResult, restore_newline: bool) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&result.stdout).await?;
    if restore_newline && !result.stdout.is_empty() {
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;

    let mut stderr = tokio::io::stderr();
    stderr.write_all(&result.stderr).await?;
    stderr.flush().await?;
    Ok(())
}

fn exit_code(result: &CommandResult) -> i32 {
    result.exit_status.unwrap_or(NO_STATUS)
}
