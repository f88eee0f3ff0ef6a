//! Per-call logging context
//!
//! Executors, shell sessions and SFTP sessions each carry an
//! [`Instrumentation`] chosen by their caller. Every protocol call runs
//! inside a `tracing` span tagged with the caller's scope, and its
//! arguments, result or failure are logged there.

use crate::{CommandResult, Result};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument, Span};

/// Logging context injected into protocol calls
#[derive(Debug, Clone)]
pub struct Instrumentation {
    scope: Arc<str>,
    log_calls: bool,
    log_responses: bool,
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new("shellmark")
    }
}

impl Instrumentation {
    /// Context labelled `scope`, logging calls and responses
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: Arc::from(scope.into()),
            log_calls: true,
            log_responses: true,
        }
    }

    /// Context that only opens spans and reports failures
    pub fn quiet(scope: impl Into<String>) -> Self {
        Self::new(scope).with_call_logging(false).with_response_logging(false)
    }

    /// Toggle logging of call arguments
    pub fn with_call_logging(mut self, enabled: bool) -> Self {
        self.log_calls = enabled;
        self
    }

    /// Toggle logging of results
    pub fn with_response_logging(mut self, enabled: bool) -> Self {
        self.log_responses = enabled;
        self
    }

    /// Scope label
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Derive a context for a narrower scope, keeping the toggles
    pub fn child(&self, name: &str) -> Self {
        Self {
            scope: Arc::from(format!("{}::{}", self.scope, name)),
            ..self.clone()
        }
    }

    fn span(&self, operation: &'static str) -> Span {
        info_span!("shellmark", scope = %self.scope, operation)
    }

    /// Run one command call under a span, logging the command and its result
    pub async fn command<F>(
        &self,
        operation: &'static str,
        command: &str,
        timeout: Duration,
        call: F,
    ) -> Result<CommandResult>
    where
        F: Future<Output = Result<CommandResult>>,
    {
        let span = self.span(operation);
        async move {
            if self.log_calls {
                debug!(command, ?timeout, "call");
            }
            let started = Instant::now();
            let outcome = call.await;
            let elapsed = started.elapsed();
            match &outcome {
                Ok(result) if self.log_responses => debug!(
                    stdout = %result.stdout_lossy(),
                    stderr = %result.stderr_lossy(),
                    exit_status = ?result.exit_status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "response"
                ),
                Ok(_) => {}
                Err(e) => warn!(command, elapsed_ms = elapsed.as_millis() as u64, "failed: {}", e),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Run any other operation under a span
    pub async fn operation<F, T>(
        &self,
        operation: &'static str,
        subject: &(dyn Debug + Sync),
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        T: Debug,
    {
        let span = self.span(operation);
        async move {
            if self.log_calls {
                debug!(?subject, "call");
            }
            let outcome = call.await;
            match &outcome {
                Ok(value) if self.log_responses => debug!(?value, "response"),
                Ok(_) => {}
                Err(e) => warn!(?subject, "failed: {}", e),
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShellmarkError;

    #[test]
    fn test_scope_and_toggles() {
        let base = Instrumentation::new("deploy").with_response_logging(false);
        assert_eq!(base.scope(), "deploy");

        let child = base.child("web01");
        assert_eq!(child.scope(), "deploy::web01");
        assert!(child.log_calls);
        assert!(!child.log_responses);

        let quiet = Instrumentation::quiet("q");
        assert!(!quiet.log_calls && !quiet.log_responses);
    }

    #[tokio::test]
    async fn test_command_passes_outcome_through() {
        let instrumentation = Instrumentation::default();

        let ok = instrumentation
            .command("run", "true", Duration::from_secs(1), async {
                Ok::<_, ShellmarkError>(CommandResult::new(None, "", "", Some(0)))
            })
            .await
            .unwrap();
        assert!(ok.success());

        let err = instrumentation
            .command("run", "false", Duration::from_secs(1), async {
                Err::<CommandResult, _>(ShellmarkError::Protocol("boom".to_string()))
            })
            .await;
        assert!(matches!(err, Err(ShellmarkError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_operation_passes_value_through() {
        let value = Instrumentation::default()
            .operation("stat", &"/etc/hosts", async { Ok::<_, ShellmarkError>(42u64) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}
