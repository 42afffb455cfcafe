//! External tool executors.
//!
//! Drivers that shell out to linters and test runners through the process
//! runner port, stream their output into the log analyzer with a
//! per-invocation correlation id, and parse structured (JSON) output with
//! a plain-text fallback.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::error::EngineResult;
use crate::domain::models::context::ExecutionContext;
use crate::domain::ports::process_runner::{
    OutputLine, OutputSink, OutputStream, ProcessRequest, ProcessRunner,
};
use crate::services::log_analysis::{InvocationRecord, LogAnalyzer};

/// Command configuration for an external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCommand {
    pub command: String,
    #[serde(default)]
    pub base_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            base_args: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// One finding reported by a linter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintFinding {
    pub file: String,
    pub line: u32,
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

/// Parsed result of a lint invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintReport {
    pub findings: Vec<LintFinding>,
    pub errors: usize,
    pub warnings: usize,
    pub exit_code: i32,
    pub correlation_id: String,
    pub duration_ms: u64,
}

/// One test case outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parsed result of a test-runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub cases: Vec<TestCase>,
    pub exit_code: i32,
    pub correlation_id: String,
    pub duration_ms: u64,
}

/// Sink that forwards to the analyzer while retaining a bounded copy for
/// parsing.
struct TeeSink {
    analyzer: Arc<LogAnalyzer>,
    retained: std::sync::Mutex<Vec<OutputLine>>,
    capacity: usize,
}

impl TeeSink {
    fn new(analyzer: Arc<LogAnalyzer>, capacity: usize) -> Self {
        Self {
            analyzer,
            retained: std::sync::Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn stdout_text(&self) -> String {
        let retained = self.retained.lock().expect("tee lock");
        retained
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn lines(&self) -> Vec<OutputLine> {
        self.retained.lock().expect("tee lock").clone()
    }
}

impl OutputSink for TeeSink {
    fn accept(&self, line: OutputLine) {
        self.analyzer.accept(line.clone());
        let mut retained = self.retained.lock().expect("tee lock");
        if retained.len() >= self.capacity {
            retained.remove(0);
        }
        retained.push(line);
    }
}

const RETAINED_PARSE_LINES: usize = 4_096;

/// Runs a linter and parses its findings.
pub struct LintExecutor {
    runner: Arc<dyn ProcessRunner>,
    analyzer: Arc<LogAnalyzer>,
    command: ToolCommand,
}

impl LintExecutor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        analyzer: Arc<LogAnalyzer>,
        command: ToolCommand,
    ) -> Self {
        Self {
            runner,
            analyzer,
            command,
        }
    }

    /// Lint the given paths under the context's deadline and cancellation.
    #[instrument(skip_all, fields(tool = %self.command.command))]
    pub async fn run(
        &self,
        paths: &[String],
        ctx: &Arc<ExecutionContext>,
    ) -> EngineResult<LintReport> {
        let correlation_id = format!("{}:{}", ctx.correlation_id(), Uuid::new_v4());
        let mut request = ProcessRequest::new(&self.command.command)
            .with_correlation_id(correlation_id.clone());
        request.args = self
            .command
            .base_args
            .iter()
            .cloned()
            .chain(paths.iter().cloned())
            .collect();
        request.cwd = self.command.cwd.clone();
        request.deadline = ctx.deadline();

        let sink = TeeSink::new(Arc::clone(&self.analyzer), RETAINED_PARSE_LINES);
        let output = self.runner.run(request, ctx.cancel_signal(), &sink).await?;

        let findings = parse_lint_output(&sink.stdout_text(), &sink.lines());
        let errors = findings.iter().filter(|f| f.severity == "error").count();
        let warnings = findings.iter().filter(|f| f.severity == "warning").count();

        self.analyzer.record_invocation(InvocationRecord {
            correlation_id: correlation_id.clone(),
            tool: self.command.command.clone(),
            duration_ms: output.duration_ms,
            success: output.success(),
            finished_at: chrono::Utc::now(),
        });

        debug!(findings = findings.len(), exit = output.exit_code, "lint finished");
        Ok(LintReport {
            findings,
            errors,
            warnings,
            exit_code: output.exit_code,
            correlation_id,
            duration_ms: output.duration_ms,
        })
    }
}

/// Runs a test command and parses its summary.
pub struct TestExecutor {
    runner: Arc<dyn ProcessRunner>,
    analyzer: Arc<LogAnalyzer>,
    command: ToolCommand,
}

impl TestExecutor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        analyzer: Arc<LogAnalyzer>,
        command: ToolCommand,
    ) -> Self {
        Self {
            runner,
            analyzer,
            command,
        }
    }

    /// Run the test command with optional extra arguments.
    #[instrument(skip_all, fields(tool = %self.command.command))]
    pub async fn run(
        &self,
        extra_args: &[String],
        ctx: &Arc<ExecutionContext>,
    ) -> EngineResult<TestReport> {
        let correlation_id = format!("{}:{}", ctx.correlation_id(), Uuid::new_v4());
        let mut request = ProcessRequest::new(&self.command.command)
            .with_correlation_id(correlation_id.clone());
        request.args = self
            .command
            .base_args
            .iter()
            .cloned()
            .chain(extra_args.iter().cloned())
            .collect();
        request.cwd = self.command.cwd.clone();
        request.deadline = ctx.deadline();

        let sink = TeeSink::new(Arc::clone(&self.analyzer), RETAINED_PARSE_LINES);
        let output = self.runner.run(request, ctx.cancel_signal(), &sink).await?;

        let mut report = parse_test_output(&sink.stdout_text());
        report.exit_code = output.exit_code;
        report.correlation_id = correlation_id.clone();
        report.duration_ms = output.duration_ms;

        self.analyzer.record_invocation(InvocationRecord {
            correlation_id,
            tool: self.command.command.clone(),
            duration_ms: output.duration_ms,
            success: output.success(),
            finished_at: chrono::Utc::now(),
        });

        Ok(report)
    }
}

/// Parse lint output: a JSON findings array first, `file:line: severity:
/// message` text as the fallback.
fn parse_lint_output(stdout: &str, lines: &[OutputLine]) -> Vec<LintFinding> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(stdout.trim()) {
        let mut findings = Vec::new();
        for item in items {
            let file = item["file"]
                .as_str()
                .or_else(|| item["filePath"].as_str())
                .unwrap_or("")
                .to_string();
            if let Some(messages) = item["messages"].as_array() {
                for message in messages {
                    findings.push(LintFinding {
                        file: file.clone(),
                        line: message["line"].as_u64().unwrap_or(0) as u32,
                        severity: match message["severity"].as_u64() {
                            Some(2) => "error".to_string(),
                            Some(_) => "warning".to_string(),
                            None => message["severity"]
                                .as_str()
                                .unwrap_or("warning")
                                .to_string(),
                        },
                        message: message["message"].as_str().unwrap_or("").to_string(),
                        rule: message["ruleId"].as_str().map(String::from),
                    });
                }
            } else if !file.is_empty() {
                findings.push(LintFinding {
                    file,
                    line: item["line"].as_u64().unwrap_or(0) as u32,
                    severity: item["severity"].as_str().unwrap_or("warning").to_string(),
                    message: item["message"].as_str().unwrap_or("").to_string(),
                    rule: item["rule"].as_str().map(String::from),
                });
            }
        }
        return findings;
    }

    // Fallback: "path/to/file.rs:12: error: something broke"
    let pattern = regex::Regex::new(r"^(?P<file>[^\s:]+):(?P<line>\d+)(?::\d+)?:?\s*(?P<sev>error|warning)[:\s]+(?P<msg>.+)$")
        .expect("lint line regex");
    lines
        .iter()
        .filter_map(|l| {
            let caps = pattern.captures(&l.line)?;
            Some(LintFinding {
                file: caps["file"].to_string(),
                line: caps["line"].parse().unwrap_or(0),
                severity: caps["sev"].to_string(),
                message: caps["msg"].trim().to_string(),
                rule: None,
            })
        })
        .collect()
}

/// Parse test output: a JSON summary object first, `PASS`/`FAIL` lines and
/// a `X passed; Y failed` summary as the fallback.
fn parse_test_output(stdout: &str) -> TestReport {
    let mut report = TestReport {
        total: 0,
        passed: 0,
        failed: 0,
        cases: Vec::new(),
        exit_code: 0,
        correlation_id: String::new(),
        duration_ms: 0,
    };

    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) {
        if value.is_object() {
            report.total = value["total"].as_u64().unwrap_or(0) as usize;
            report.passed = value["passed"].as_u64().unwrap_or(0) as usize;
            report.failed = value["failed"].as_u64().unwrap_or(0) as usize;
            if let Some(cases) = value["cases"].as_array() {
                for case in cases {
                    report.cases.push(TestCase {
                        name: case["name"].as_str().unwrap_or("").to_string(),
                        passed: case["passed"].as_bool().unwrap_or(false),
                        message: case["message"].as_str().map(String::from),
                    });
                }
            }
            if report.total == 0 {
                report.total = report.passed + report.failed;
            }
            return report;
        }
    }

    let summary = regex::Regex::new(r"(\d+) passed[;,]?\s*(\d+) failed").expect("summary regex");
    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("PASS ") {
            report.cases.push(TestCase {
                name: name.to_string(),
                passed: true,
                message: None,
            });
        } else if let Some(name) = trimmed.strip_prefix("FAIL ") {
            report.cases.push(TestCase {
                name: name.to_string(),
                passed: false,
                message: None,
            });
        } else if let Some(caps) = summary.captures(trimmed) {
            report.passed = caps[1].parse().unwrap_or(0);
            report.failed = caps[2].parse().unwrap_or(0);
        }
    }

    if report.passed == 0 && report.failed == 0 {
        report.passed = report.cases.iter().filter(|c| c.passed).count();
        report.failed = report.cases.iter().filter(|c| !c.passed).count();
    }
    report.total = report.passed + report.failed;
    report
}
