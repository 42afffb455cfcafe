//! Process runner backed by `tokio::process`.
//!
//! Streams stdout/stderr line-by-line into the caller's sink while
//! watching the cancellation signal and the request deadline. On either,
//! the child receives SIGTERM and, after a grace period, SIGKILL.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::models::context::CancelSignal;
use crate::domain::ports::process_runner::{
    OutputLine, OutputSink, OutputStream, ProcessOutput, ProcessRequest, ProcessRunner,
};

/// Default grace between SIGTERM and SIGKILL.
const DEFAULT_GRACE_MS: u64 = 2_000;

/// Spawns child processes with streamed output and graceful termination.
pub struct TokioProcessRunner {
    grace_ms: u64,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self {
            grace_ms: DEFAULT_GRACE_MS,
        }
    }

    pub fn with_grace_ms(mut self, grace_ms: u64) -> Self {
        self.grace_ms = grace_ms;
        self
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to signal child");
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    #[instrument(skip_all, fields(command = %request.command, correlation = %request.correlation_id))]
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancelSignal,
        sink: &dyn OutputSink,
    ) -> EngineResult<ProcessOutput> {
        let started = std::time::Instant::now();

        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::ToolInvocation(format!("failed to spawn {}: {e}", request.command))
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        // A far-future sleep stands in when no deadline is set; the guard
        // keeps the arm disabled in that case.
        let has_deadline = request.deadline.is_some();
        let deadline_wait = tokio::time::sleep(match request.deadline {
            Some(deadline) => (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
            None => std::time::Duration::from_secs(86_400),
        });
        tokio::pin!(deadline_wait);

        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut terminated = false;
        let mut cancelled = false;

        let emit = |stream: OutputStream, line: String| {
            sink.accept(OutputLine {
                stream,
                line,
                timestamp: Utc::now(),
                correlation_id: request.correlation_id.clone(),
            });
        };

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => emit(OutputStream::Stdout, line),
                        _ => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => emit(OutputStream::Stderr, line),
                        _ => stderr_done = true,
                    }
                }
                _ = cancel.cancelled(), if !terminated => {
                    debug!("cancellation requested, terminating child");
                    send_sigterm(&child);
                    terminated = true;
                    cancelled = true;
                }
                _ = deadline_wait.as_mut(), if has_deadline && !terminated => {
                    debug!("deadline expired, terminating child");
                    send_sigterm(&child);
                    terminated = true;
                }
            }
        }

        let status = match tokio::time::timeout(
            std::time::Duration::from_millis(self.grace_ms.max(1)),
            child.wait(),
        )
        .await
        {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to reap child");
                None
            }
            Err(_) => {
                warn!("child ignored SIGTERM, killing");
                let _ = child.kill().await;
                child.wait().await.ok()
            }
        };

        if terminated && !cancelled {
            // Deadline expiry surfaces as an error after cleanup.
            return Err(EngineError::Deadline);
        }

        let exit_code = if cancelled {
            1
        } else {
            status.and_then(|s| s.code()).unwrap_or(1)
        };

        Ok(ProcessOutput {
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::process_runner::BoundedLineBuffer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_streams_stdout_lines() {
        let runner = TokioProcessRunner::new();
        let sink = BoundedLineBuffer::new(100);
        let request = ProcessRequest::new("sh")
            .with_args(["-c", "echo one; echo two; echo err >&2"])
            .with_correlation_id("run-1");

        let output = runner
            .run(request, &CancelSignal::new(), &sink)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(!output.cancelled);

        let lines = sink.lines();
        let stdout: Vec<&str> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(lines.iter().all(|l| l.correlation_id == "run-1"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.line == "err"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_passes_through() {
        let runner = TokioProcessRunner::new();
        let sink = BoundedLineBuffer::new(10);
        let request = ProcessRequest::new("sh").with_args(["-c", "exit 3"]);

        let output = runner
            .run(request, &CancelSignal::new(), &sink)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_cancellation_terminates_child() {
        let runner = TokioProcessRunner::new().with_grace_ms(500);
        let sink = Arc::new(BoundedLineBuffer::new(10));
        let cancel = CancelSignal::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let request = ProcessRequest::new("sleep").with_args(["30"]);
        let output = runner.run(request, &cancel, sink.as_ref()).await.unwrap();

        assert!(output.cancelled);
        assert_eq!(output.exit_code, 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_deadline_terminates_child() {
        let runner = TokioProcessRunner::new().with_grace_ms(500);
        let sink = BoundedLineBuffer::new(10);
        let request = ProcessRequest::new("sleep")
            .with_args(["30"])
            .with_deadline(Utc::now() + chrono::Duration::milliseconds(100));

        let err = runner
            .run(request, &CancelSignal::new(), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Deadline));
    }

    #[tokio::test]
    async fn test_missing_binary_is_invocation_error() {
        let runner = TokioProcessRunner::new();
        let sink = BoundedLineBuffer::new(10);
        let request = ProcessRequest::new("definitely-not-a-real-binary-name");

        let err = runner
            .run(request, &CancelSignal::new(), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolInvocation(_)));
    }
}
