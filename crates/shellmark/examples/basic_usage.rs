//! Basic usage example for Shellmark
//!
//! Runs a few commands over exec channels and a persistent shell, then
//! round-trips a file over SFTP. Set `SHELLMARK_HOST` to `user@host[:port]`.

use shellmark::{SshClientBuilder, Stdin, TimeoutAction};
use std::error::Error;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("🚀 Shellmark Basic Usage Example");
    println!("================================");

    let target = std::env::var("SHELLMARK_HOST").unwrap_or_else(|_| "user@remote-host".to_string());
    let client = SshClientBuilder::new(target)
        .with_agent(true)
        .with_default_keys(true)
        .with_command_timeout(Duration::from_secs(30))
        .build()?;

    // One connection per call
    println!("\n🔧 Executing remote command...");
    let result = client.execute_command("uname -a", None, Stdin::empty()).await?;
    if result.success() {
        println!("✅ {}", result.stdout_lossy().trim());
    } else {
        println!("❌ Exit status {:?}: {}", result.exit_status, result.stderr_lossy());
    }

    // Several commands on one connection, each on its own channel
    println!("\n⚡ Reusing one connection...");
    let executor = client.connect().await?;
    for command in ["whoami", "date", "uptime"] {
        let result = executor.run(command).await?;
        println!("✅ {}: {}", command, result.stdout_lossy().trim());
    }
    let piped = executor.execute("wc -c", None, "counted remotely").await?;
    println!("✅ wc -c: {}", piped.stdout_lossy().trim());
    executor.close().await?;

    // Shell state survives between commands
    println!("\n🐚 Persistent shell...");
    let shell = client.create_shell().await?;
    shell.run("cd /tmp").await?;
    println!("✅ pwd: {}", shell.run("pwd").await?.stdout_lossy());

    match shell
        .run_with("sleep 5", Some(Duration::from_secs(1)), Some(TimeoutAction::Raise))
        .await
    {
        Ok(_) => println!("❌ Expected a timeout"),
        Err(e) => println!("✅ Timed out as expected: {}", e),
    }
    shell.close().await?;

    // File transfer
    println!("\n📁 Testing file operations...");
    let sftp = client.create_sftp().await?;
    sftp.write("/tmp/shellmark_test.txt", b"Hello from Shellmark!").await?;
    let content = sftp.read("/tmp/shellmark_test.txt").await?;
    println!("✅ Read back: {}", String::from_utf8_lossy(&content));
    sftp.remove("/tmp/shellmark_test.txt").await?;
    sftp.close().await?;

    println!("\n🎉 Example completed successfully!");
    Ok(())
}
