//! Unit tests for one-shot execution

use super::*;
use shellmark_ssh::mock::{MockOutput, MockTransport};
use shellmark_ssh::Transport;
use std::io::Cursor;
use tokio::time::Instant;

async fn executor_with<F>(handler: F) -> (CommandExecutor, Arc<dyn Connection>, MockTransport)
where
    F: Fn(&str) -> MockOutput + Send + Sync + 'static,
{
    let transport = MockTransport::new().with_handler(handler);
    let connection = transport.connect().await.unwrap();
    let executor = CommandExecutor::new(Arc::clone(&connection));
    (executor, connection, transport)
}

fn printf_handler(command: &str) -> MockOutput {
    match command {
        "printf A; printf B >&2" => MockOutput::stdout("A").with_stderr("B"),
        "late-stderr" => MockOutput::stdout("early")
            .with_stderr("late")
            .stderr_after(Duration::from_millis(300)),
        "exit-3" => MockOutput::default().with_status(3),
        _ => MockOutput::stderr("not found\n").with_status(127),
    }
}

#[tokio::test]
async fn test_execute_splits_streams() {
    let (executor, _, _) = executor_with(printf_handler).await;

    let result = executor.run("printf A; printf B >&2").await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"A"));
    assert_eq!(result.stderr, Bytes::from_static(b"B"));
    assert_eq!(result.exit_status, Some(0));
    assert_eq!(result.stdin, Some(Bytes::new()));
}

#[tokio::test(start_paused = true)]
async fn test_execute_waits_for_slower_stream() {
    let (executor, _, _) = executor_with(printf_handler).await;

    let started = Instant::now();
    let result = executor
        .execute("late-stderr", Some(Duration::from_secs(5)), Stdin::empty())
        .await
        .unwrap();

    assert_eq!(result.stdout, Bytes::from_static(b"early"));
    assert_eq!(result.stderr, Bytes::from_static(b"late"));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_execute_reports_exit_status() {
    let (executor, _, _) = executor_with(printf_handler).await;

    assert_eq!(executor.run("exit-3").await.unwrap().exit_status, Some(3));
    assert_eq!(executor.run("false").await.unwrap().exit_status, Some(1));
    let missing = executor.run("nope").await.unwrap();
    assert_eq!(missing.exit_status, Some(127));
    assert!(!missing.success());
}

#[tokio::test]
async fn test_execute_feeds_stdin_bytes() {
    let (executor, _, transport) = executor_with(printf_handler).await;

    let result = executor.execute("cat", None, "hello remote").await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"hello remote"));
    assert_eq!(result.stdin, Some(Bytes::from_static(b"hello remote")));

    let channel = transport.connections()[0].last_channel().unwrap();
    assert_eq!(channel.command().as_deref(), Some("cat"));
    assert_eq!(channel.stdin(), Bytes::from_static(b"hello remote"));
}

#[tokio::test]
async fn test_execute_reads_stdin_stream() {
    let (executor, _, _) = executor_with(printf_handler).await;

    let reader = Cursor::new(b"line one\nline two\n".to_vec());
    let result = executor.execute("cat", None, Stdin::reader(reader)).await.unwrap();
    assert_eq!(result.stdout, Bytes::from_static(b"line one\nline two\n"));
    assert_eq!(result.stdin, Some(Bytes::from_static(b"line one\nline two\n")));
}

#[tokio::test]
async fn test_each_call_uses_a_fresh_channel() {
    let (executor, _, transport) = executor_with(printf_handler).await;

    executor.run("true").await.unwrap();
    executor.run("true").await.unwrap();

    let channels = transport.connections()[0].channels();
    assert_eq!(channels.len(), 2);
    for channel in channels {
        assert_eq!(channel.close_count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_execute_timeout_stops_drains() {
    let (executor, _, transport) = executor_with(printf_handler).await;
    let timeout = Duration::from_millis(200);

    let started = Instant::now();
    let err = executor
        .execute("sleep 5", Some(timeout), Stdin::empty())
        .await
        .unwrap_err();

    assert_eq!(err.timeout_kind(), Some(TimeoutKind::ProcessExit));
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed <= timeout + executor.config().poll_interval);

    let channel = transport.connections()[0].last_channel().unwrap();
    assert_eq!(channel.active_reads(), 0);
    assert_eq!(channel.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_timeout_while_input_is_refused() {
    let transport = MockTransport::new().stall_writes();
    let executor = CommandExecutor::new(transport.connect().await.unwrap());
    let timeout = Duration::from_millis(150);

    let started = Instant::now();
    let err = executor
        .execute("cat", Some(timeout), vec![b'x'; 64 * 1024])
        .await
        .unwrap_err();

    assert_eq!(err.timeout_kind(), Some(TimeoutKind::ProcessExit));
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed <= timeout + shellmark_ssh::SEND_RETRY_INTERVAL);

    let channel = transport.connections()[0].last_channel().unwrap();
    assert!(channel.stdin().is_empty());
    assert_eq!(channel.close_count(), 1);
}

#[tokio::test]
async fn test_execute_without_session_is_connection_error() {
    let (executor, connection, _) = executor_with(printf_handler).await;
    connection.close().await.unwrap();

    let err = executor.run("true").await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
async fn test_execute_rejects_invalid_config() {
    let (executor, _, _) = executor_with(printf_handler).await;
    let executor = executor.with_config(ExecConfig::default().with_read_chunk_size(0));

    let err = executor.run("true").await.unwrap_err();
    assert!(matches!(err, ShellmarkError::Config(_)));
}

#[tokio::test]
async fn test_execute_rejects_zero_timeout() {
    let (executor, connection, transport) = executor_with(printf_handler).await;

    let err = executor
        .execute("true", Some(Duration::ZERO), Stdin::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, ShellmarkError::Config(_)));
    assert!(connection.is_connected());
    assert!(transport.connections()[0].channels().is_empty());
}

#[test]
fn test_stdin_conversions() {
    assert!(matches!(Stdin::from("abc"), Stdin::Bytes(b) if b == "abc"));
    assert!(matches!(Stdin::from(vec![1u8, 2]), Stdin::Bytes(b) if b.len() == 2));
    assert!(matches!(Stdin::default(), Stdin::Bytes(b) if b.is_empty()));
    assert_eq!(format!("{:?}", Stdin::reader(Cursor::new(Vec::<u8>::new()))), "Reader(..)");
}
