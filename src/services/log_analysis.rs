//! Log correlation and analysis.
//!
//! Consumes correlated output lines from external tool invocations:
//! clusters error lines by normalised message shape, reconstructs causal
//! chains per correlation id, and watches invocation durations for
//! sustained performance regressions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::domain::ports::process_runner::{OutputLine, OutputSink};

static ERROR_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(error|failed|failure|panic|fatal)\b").expect("error regex"));
static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("number regex"));
static HEX_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{8,}\b").expect("hex regex"));
static PATHLIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/[\w.-]+)+").expect("path regex"));

/// A group of error lines sharing a normalised shape.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorCluster {
    /// The normalised message template.
    pub template: String,
    pub count: usize,
    /// Up to three raw examples.
    pub examples: Vec<String>,
}

/// All output for one invocation, ordered by time.
#[derive(Debug, Clone, Serialize)]
pub struct CausalChain {
    pub correlation_id: String,
    /// Lines in time order; the failure tail is what callers inspect.
    pub lines: Vec<String>,
    pub has_errors: bool,
}

/// One finished invocation, for trend tracking.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub correlation_id: String,
    pub tool: String,
    pub duration_ms: u64,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
}

/// Duration trend for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTrend {
    pub tool: String,
    pub samples: usize,
    pub mean_ms: f64,
    /// Mean over the most recent window.
    pub recent_mean_ms: f64,
    /// True when the recent window is meaningfully slower than the
    /// long-run mean.
    pub regressing: bool,
}

const MAX_RETAINED_LINES: usize = 10_000;
const RECENT_WINDOW: usize = 5;
const REGRESSION_FACTOR: f64 = 1.5;

/// Collector and analyser for correlated tool output.
#[derive(Default)]
pub struct LogAnalyzer {
    lines: Mutex<Vec<OutputLine>>,
    invocations: Mutex<Vec<InvocationRecord>>,
}

impl LogAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished invocation for performance tracking.
    pub fn record_invocation(&self, record: InvocationRecord) {
        self.invocations.lock().expect("analyzer lock").push(record);
    }

    /// Cluster retained error lines by normalised template.
    pub fn error_clusters(&self) -> Vec<ErrorCluster> {
        let lines = self.lines.lock().expect("analyzer lock");
        let mut clusters: HashMap<String, ErrorCluster> = HashMap::new();

        for line in lines.iter() {
            if !ERROR_MARKER.is_match(&line.line) {
                continue;
            }
            let template = normalise(&line.line);
            let cluster = clusters
                .entry(template.clone())
                .or_insert_with(|| ErrorCluster {
                    template,
                    count: 0,
                    examples: Vec::new(),
                });
            cluster.count += 1;
            if cluster.examples.len() < 3 {
                cluster.examples.push(line.line.clone());
            }
        }

        let mut out: Vec<ErrorCluster> = clusters.into_values().collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }

    /// Group lines into per-invocation chains, time-ordered.
    pub fn causal_chains(&self) -> Vec<CausalChain> {
        let lines = self.lines.lock().expect("analyzer lock");
        let mut by_correlation: HashMap<String, Vec<&OutputLine>> = HashMap::new();
        for line in lines.iter() {
            by_correlation
                .entry(line.correlation_id.clone())
                .or_default()
                .push(line);
        }

        let mut chains: Vec<CausalChain> = by_correlation
            .into_iter()
            .map(|(correlation_id, mut lines)| {
                lines.sort_by_key(|l| l.timestamp);
                CausalChain {
                    correlation_id,
                    has_errors: lines.iter().any(|l| ERROR_MARKER.is_match(&l.line)),
                    lines: lines.into_iter().map(|l| l.line.clone()).collect(),
                }
            })
            .collect();
        chains.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        chains
    }

    /// The chain for one correlation id, if any lines were seen.
    pub fn chain_for(&self, correlation_id: &str) -> Option<CausalChain> {
        self.causal_chains()
            .into_iter()
            .find(|c| c.correlation_id == correlation_id)
    }

    /// Duration trends per tool; flags sustained regressions.
    pub fn performance_trends(&self) -> Vec<PerformanceTrend> {
        let invocations = self.invocations.lock().expect("analyzer lock");
        let mut by_tool: HashMap<&str, Vec<&InvocationRecord>> = HashMap::new();
        for record in invocations.iter() {
            by_tool.entry(record.tool.as_str()).or_default().push(record);
        }

        let mut trends: Vec<PerformanceTrend> = by_tool
            .into_iter()
            .map(|(tool, mut records)| {
                records.sort_by_key(|r| r.finished_at);
                let durations: Vec<f64> =
                    records.iter().map(|r| r.duration_ms as f64).collect();
                let mean = durations.iter().sum::<f64>() / durations.len() as f64;
                let recent: Vec<f64> = durations
                    .iter()
                    .rev()
                    .take(RECENT_WINDOW)
                    .copied()
                    .collect();
                let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;

                PerformanceTrend {
                    tool: tool.to_string(),
                    samples: durations.len(),
                    mean_ms: mean,
                    recent_mean_ms: recent_mean,
                    regressing: durations.len() > RECENT_WINDOW
                        && recent_mean > mean * REGRESSION_FACTOR,
                }
            })
            .collect();
        trends.sort_by(|a, b| a.tool.cmp(&b.tool));
        trends
    }

    /// Retained line count (bounded).
    pub fn line_count(&self) -> usize {
        self.lines.lock().expect("analyzer lock").len()
    }
}

impl OutputSink for LogAnalyzer {
    fn accept(&self, line: OutputLine) {
        let mut lines = self.lines.lock().expect("analyzer lock");
        if lines.len() >= MAX_RETAINED_LINES {
            lines.remove(0);
        }
        lines.push(line);
    }
}

/// Collapse volatile fragments so similar messages share a template.
fn normalise(line: &str) -> String {
    let line = PATHLIKE.replace_all(line, "<path>");
    let line = HEX_ID.replace_all(&line, "<id>");
    NUMBERS.replace_all(&line, "<n>").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::process_runner::OutputStream;

    fn line(correlation: &str, text: &str) -> OutputLine {
        OutputLine {
            stream: OutputStream::Stdout,
            line: text.to_string(),
            timestamp: Utc::now(),
            correlation_id: correlation.to_string(),
        }
    }

    #[test]
    fn test_error_clustering_normalises() {
        let analyzer = LogAnalyzer::new();
        analyzer.accept(line("c1", "error: connection to 10.0.0.1 failed after 30s"));
        analyzer.accept(line("c2", "error: connection to 10.0.0.2 failed after 45s"));
        analyzer.accept(line("c3", "warning: slow response"));

        let clusters = analyzer.error_clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 2);
        assert!(clusters[0].template.contains("<n>"));
    }

    #[test]
    fn test_causal_chains_group_by_correlation() {
        let analyzer = LogAnalyzer::new();
        analyzer.accept(line("run-1", "compiling"));
        analyzer.accept(line("run-2", "linting"));
        analyzer.accept(line("run-1", "error: build failed"));

        let chain = analyzer.chain_for("run-1").unwrap();
        assert_eq!(chain.lines.len(), 2);
        assert!(chain.has_errors);

        let other = analyzer.chain_for("run-2").unwrap();
        assert!(!other.has_errors);
    }

    #[test]
    fn test_performance_regression_detection() {
        let analyzer = LogAnalyzer::new();
        let mut at = Utc::now();
        // Ten fast runs, then five slow ones.
        for i in 0..15u64 {
            at += chrono::Duration::seconds(1);
            analyzer.record_invocation(InvocationRecord {
                correlation_id: format!("c{i}"),
                tool: "pytest".to_string(),
                duration_ms: if i < 10 { 100 } else { 1_000 },
                success: true,
                finished_at: at,
            });
        }

        let trends = analyzer.performance_trends();
        assert_eq!(trends.len(), 1);
        let trend = &trends[0];
        assert_eq!(trend.samples, 15);
        assert!(trend.regressing, "recent {} vs mean {}", trend.recent_mean_ms, trend.mean_ms);
    }

    #[test]
    fn test_no_regression_on_stable_durations() {
        let analyzer = LogAnalyzer::new();
        for i in 0..10u64 {
            analyzer.record_invocation(InvocationRecord {
                correlation_id: format!("c{i}"),
                tool: "eslint".to_string(),
                duration_ms: 200,
                success: true,
                finished_at: Utc::now(),
            });
        }
        assert!(!analyzer.performance_trends()[0].regressing);
    }
}
