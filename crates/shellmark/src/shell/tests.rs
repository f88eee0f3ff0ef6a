//! Unit tests for shell sessions

use super::*;
use bytes::Bytes;
use shellmark_ssh::mock::{MockConnection, MockOutput, MockTransport};
use shellmark_ssh::Transport;
use tokio::time::Instant;

fn ls_handler(command: &str) -> MockOutput {
    match command {
        "ls -l" => MockOutput::stdout("total 8\n-rw-r--r-- 1 mock mock 12 notes.txt\n"),
        "ls -la" => MockOutput::stdout("total 12\ndrwxr-xr-x 2 mock mock 4096 .\n-rw-r--r-- 1 mock mock 12 notes.txt\n"),
        "warn" => MockOutput::stdout("  done  \n").with_stderr("  careful\n"),
        "slow" => MockOutput::stdout("one\n").after(Duration::from_millis(100)),
        "fast" => MockOutput::stdout("two\n"),
        _ => MockOutput::stderr("sh: not found\n").with_status(127),
    }
}

async fn open_shell(transport: &MockTransport, config: ExecConfig) -> (ShellSession, Arc<MockConnection>) {
    let connection = transport.connect().await.unwrap();
    let mock = transport.connections().pop().unwrap();
    let shell = ShellSession::open(connection, config).await.unwrap();
    (shell, mock)
}

async fn shell() -> (ShellSession, Arc<MockConnection>) {
    open_shell(&MockTransport::new().with_handler(ls_handler), ExecConfig::default()).await
}

#[tokio::test]
async fn test_run_echo() {
    let (shell, _) = shell().await;

    let result = shell.run("echo hello").await.unwrap();
    assert_eq!(result, CommandResult::new(None, "hello", "", Some(0)));
    assert_eq!(shell.state().await, ShellState::Idle);
}

#[tokio::test]
async fn test_run_reports_exit_status() {
    let (shell, _) = shell().await;

    assert_eq!(shell.run("false").await.unwrap().exit_status, Some(1));
    assert_eq!(shell.run("true").await.unwrap().exit_status, Some(0));
    let missing = shell.run("missing-tool").await.unwrap();
    assert_eq!(missing.exit_status, Some(127));
    assert_eq!(missing.stderr, Bytes::from_static(b"sh: not found\n"));
}

#[tokio::test]
async fn test_stdout_trimmed_stderr_raw() {
    let (shell, _) = shell().await;

    let result = shell.run("warn").await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"done"));
    assert_eq!(result.stderr, Bytes::from_static(b"  careful\n"));
}

#[tokio::test]
async fn test_frame_written_to_channel() {
    let (shell, mock) = shell().await;

    shell.run("  echo hi  ").await.unwrap();
    let sent = String::from_utf8(mock.last_channel().unwrap().sent().to_vec()).unwrap();
    let lines: Vec<&str> = sent.lines().collect();

    assert_eq!(lines.len(), 3);
    let token = lines[0].strip_prefix("echo ").unwrap();
    assert_eq!(token.len(), 32);
    assert_eq!(lines[1], "echo hi");
    assert_eq!(lines[2], format!("echo {} $?", token));
}

#[tokio::test]
async fn test_exit_closes_session() {
    let (shell, mock) = shell().await;

    let result = shell.run("exit 42").await.unwrap();
    assert_eq!(result.exit_status, Some(42));
    assert_eq!(result.stdout, Bytes::new());
    assert!(shell.is_closed().await);
    assert_eq!(mock.close_count(), 1);

    let err = shell.run("echo again").await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
async fn test_banner_is_discarded() {
    let transport = MockTransport::new().with_banner("Welcome to mockhost\nLast login: never\n");
    let (shell, _) = open_shell(&transport, ExecConfig::default()).await;

    let result = shell.run("echo clean").await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"clean"));
}

#[tokio::test]
async fn test_sequential_commands_do_not_share_output() {
    let (shell, mock) = shell().await;

    let first = shell.run("ls -l").await.unwrap();
    assert!(first.stdout.starts_with(b"total 8"));

    mock.last_channel()
        .unwrap()
        .inject(StreamKind::Stdout, "trailing noise\n");

    let second = shell.run("ls -la").await.unwrap();
    assert!(second.stdout.starts_with(b"total 12"));
    assert!(!second.stdout.windows(5).any(|w| w == b"noise"));

    let third = shell.run("true").await.unwrap();
    assert_eq!(third.stdout, Bytes::new());
}

#[tokio::test]
async fn test_repeated_command_same_shape() {
    let (shell, _) = shell().await;

    let a = shell.run("echo same").await.unwrap();
    let b = shell.run("echo same").await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_disconnects_by_default() {
    let (shell, mock) = shell().await;
    let timeout = Duration::from_secs(1);

    let started = Instant::now();
    let err = shell.run_with("sleep 5", Some(timeout), None).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Sentinel));
    assert!(elapsed >= timeout);
    assert!(elapsed <= timeout + shell.config().poll_interval);

    assert_eq!(shell.state().await, ShellState::Closed);
    assert_eq!(mock.close_count(), 1);
    assert_eq!(mock.last_channel().unwrap().close_count(), 1);

    let err = shell.run("echo hi").await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_raise_keeps_session() {
    let (shell, mock) = shell().await;

    let err = shell
        .run_with("sleep 0.3", Some(Duration::from_millis(100)), Some(TimeoutAction::Raise))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(shell.state().await, ShellState::Idle);
    assert_eq!(mock.close_count(), 0);

    let result = shell.run_with("echo hi", Some(Duration::from_secs(2)), None).await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"hi"));
    assert_eq!(result.exit_status, Some(0));
}

#[tokio::test]
async fn test_zero_timeout_is_rejected_before_sending() {
    let (shell, mock) = shell().await;

    let err = shell
        .run_with("echo side-effect", Some(Duration::ZERO), Some(TimeoutAction::Raise))
        .await
        .unwrap_err();
    assert!(matches!(err, ShellmarkError::Config(_)));
    assert!(mock.last_channel().unwrap().sent().is_empty());
    assert_eq!(shell.state().await, ShellState::Idle);
}

#[tokio::test]
async fn test_expired_deadline_sends_nothing() {
    let (shell, mock) = shell().await;

    let err = shell
        .run_with("echo side-effect", Some(Duration::from_nanos(1)), Some(TimeoutAction::Raise))
        .await
        .unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::ReadyToSend));
    assert!(mock.last_channel().unwrap().sent().is_empty());

    let result = shell.run("echo after").await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"after"));
}

#[tokio::test(start_paused = true)]
async fn test_channel_never_ready() {
    let transport = MockTransport::new().never_ready();
    let config = ExecConfig::default().with_timeout_action(TimeoutAction::Raise);
    let (shell, mock) = open_shell(&transport, config).await;

    let err = shell.run_with("echo hi", Some(Duration::from_millis(50)), None).await.unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::ReadyToSend));
    assert!(mock.last_channel().unwrap().sent().is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_are_serialised() {
    let (shell, _) = shell().await;

    let (slow, fast) = tokio::join!(shell.run("slow"), shell.run("fast"));
    assert_eq!(slow.unwrap().stdout, Bytes::from_static(b"one"));
    assert_eq!(fast.unwrap().stdout, Bytes::from_static(b"two"));
}

#[tokio::test]
async fn test_custom_exit_status_variable() {
    let transport = MockTransport::new();
    let config = ExecConfig::default().with_exit_status_variable("$status");
    let (shell, mock) = open_shell(&transport, config).await;

    let result = shell.run("true").await.unwrap();
    assert_eq!(result.exit_status, None);
    let sent = mock.last_channel().unwrap().sent();
    assert!(String::from_utf8_lossy(&sent).ends_with(" $status\n"));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (shell, mock) = shell().await;

    shell.close().await.unwrap();
    shell.close().await.unwrap();
    assert_eq!(mock.close_count(), 1);
    assert!(shell.run("true").await.unwrap_err().is_connection());
}

#[tokio::test]
async fn test_open_sets_keepalive() {
    let transport = MockTransport::new();
    let config = ExecConfig::default().with_keepalive(Duration::from_secs(15));
    let (_shell, mock) = open_shell(&transport, config).await;
    assert_eq!(mock.keepalive(), Some(Duration::from_secs(15)));
}

#[tokio::test]
async fn test_open_on_closed_connection_fails() {
    let transport = MockTransport::new();
    let connection = transport.connect().await.unwrap();
    connection.close().await.unwrap();

    let err = ShellSession::open(connection, ExecConfig::default()).await.err().unwrap();
    assert!(err.is_connection());
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

    #[test]
    fn test_run_recovers_any_handler_output(
        lines in proptest::collection::vec("[a-z0-9 =/.-]{0,24}", 0..6),
        status in 0i32..256,
    ) {
        let printed = format!("{}\n", lines.join("\n"));
        let expected = Bytes::copy_from_slice(printed.as_bytes().trim_ascii());

        let result = tokio_test::block_on(async move {
            let transport = MockTransport::new()
                .with_handler(move |_| MockOutput::stdout(printed.clone()).with_status(status));
            let (shell, _) = open_shell(&transport, ExecConfig::default()).await;
            shell.run("generate").await.unwrap()
        });

        proptest::prop_assert_eq!(result.stdout, expected);
        proptest::prop_assert_eq!(result.exit_status, Some(status));
    }
}
