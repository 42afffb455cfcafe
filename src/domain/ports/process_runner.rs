//! Child-process port.
//!
//! External executors shell out through this contract. Output is streamed
//! line-by-line into a sink (never accumulated into unbounded buffers) and
//! each line carries the invocation's correlation id for the analysis
//! layer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::EngineResult;
use crate::domain::models::context::CancelSignal;

/// A command to run.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Correlation id stamped onto every output line.
    pub correlation_id: String,
    /// Absolute deadline; the child is terminated when it passes.
    pub deadline: Option<DateTime<Utc>>,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child output, tagged for correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

/// Receives output lines as they are produced.
pub trait OutputSink: Send + Sync {
    fn accept(&self, line: OutputLine);
}

/// Terminal result of a process invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// 0 on success; 1 on failure including cancellation; otherwise the
    /// underlying tool's code.
    pub exit_code: i32,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process runner contract.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn the command, streaming output into `sink` until exit,
    /// cancellation, or deadline expiry.
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancelSignal,
        sink: &dyn OutputSink,
    ) -> EngineResult<ProcessOutput>;
}

/// Sink that retains at most `capacity` lines, dropping the oldest.
pub struct BoundedLineBuffer {
    capacity: usize,
    lines: Mutex<std::collections::VecDeque<OutputLine>>,
}

impl BoundedLineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Drain the retained lines.
    pub fn take(&self) -> Vec<OutputLine> {
        self.lines.lock().expect("line buffer lock").drain(..).collect()
    }

    /// Snapshot of the retained lines.
    pub fn lines(&self) -> Vec<OutputLine> {
        self.lines.lock().expect("line buffer lock").iter().cloned().collect()
    }
}

impl OutputSink for BoundedLineBuffer {
    fn accept(&self, line: OutputLine) {
        let mut lines = self.lines.lock().expect("line buffer lock");
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}
