use serde::{Deserialize, Serialize};

use crate::domain::models::audit::{ComplianceLevel, ComplianceStandard};

/// Main configuration structure for the Taskforge engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Execution-context defaults inherited by root contexts.
    #[serde(default)]
    pub context: ContextDefaults,

    /// Event-sourced task log configuration.
    #[serde(default)]
    pub log: TaskLogConfig,

    /// Bounded history manager configuration.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Error handler and retry configuration.
    #[serde(default)]
    pub errors: ErrorHandlerConfig,

    /// Transaction manager configuration.
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// Audit and compliance configuration.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-context execution defaults, frozen into every root context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ContextDefaults {
    /// Maximum decomposition depth for the context tree.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Per-operation timeout in milliseconds. 0 disables the timeout.
    #[serde(default)]
    pub timeout_ms: u64,

    /// Retries for individual operations within a task.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Upper bound on concurrently scheduled workflows/contexts.
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,

    /// Whether step results may be cached.
    #[serde(default = "default_true")]
    pub cache_results: bool,

    /// Verbose per-step logging.
    #[serde(default)]
    pub verbose_logging: bool,
}

const fn default_max_depth() -> u32 {
    3
}

const fn default_retry_count() -> u32 {
    2
}

const fn default_parallel_limit() -> usize {
    5
}

const fn default_true() -> bool {
    true
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            timeout_ms: 0,
            retry_count: default_retry_count(),
            parallel_limit: default_parallel_limit(),
            cache_results: default_true(),
            verbose_logging: false,
        }
    }
}

/// Event-sourced task log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskLogConfig {
    /// A projection snapshot is stored every `snapshot_interval` appends.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
}

const fn default_snapshot_interval() -> u64 {
    100
}

impl Default for TaskLogConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
        }
    }
}

/// Bounded history manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HistoryConfig {
    /// Events older than this many milliseconds are pruned.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Per-task bound; the oldest entry is evicted beyond this.
    #[serde(default = "default_max_history_per_task")]
    pub max_history_per_task: usize,

    /// Auto-prune tick interval in milliseconds.
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
}

const fn default_retention_ms() -> u64 {
    3_600_000
}

const fn default_max_history_per_task() -> usize {
    100
}

const fn default_prune_interval_ms() -> u64 {
    60_000
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
            max_history_per_task: default_max_history_per_task(),
            prune_interval_ms: default_prune_interval_ms(),
        }
    }
}

/// Error handler and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorHandlerConfig {
    /// Maximum retry attempts for recoverable errors.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Initial retry delay; doubles with each attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Consecutive failures before a service circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Cooldown before an open circuit admits a half-open probe.
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
}

const fn default_max_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1_000
}

const fn default_circuit_failure_threshold() -> u32 {
    5
}

const fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
        }
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransactionConfig {
    /// Wall-clock budget for a transaction before forced rollback.
    #[serde(default = "default_max_transaction_time_ms")]
    pub max_transaction_time_ms: u64,

    /// Roll back automatically when an operation inside a transaction fails.
    #[serde(default = "default_true")]
    pub auto_rollback_on_failure: bool,

    /// Terminal transactions retained for querying.
    #[serde(default = "default_transaction_history_limit")]
    pub history_limit: usize,
}

const fn default_max_transaction_time_ms() -> u64 {
    300_000
}

const fn default_transaction_history_limit() -> usize {
    100
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_transaction_time_ms: default_max_transaction_time_ms(),
            auto_rollback_on_failure: default_true(),
            history_limit: default_transaction_history_limit(),
        }
    }
}

/// Audit and compliance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AuditConfig {
    /// Entries older than this many days are removed by cleanup.
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u32,

    /// Strictness applied when recording operations.
    #[serde(default)]
    pub compliance_level: ComplianceLevel,

    /// Standards the trail must be able to report against.
    #[serde(default = "default_compliance_standards")]
    pub compliance_standards: Vec<ComplianceStandard>,
}

const fn default_audit_retention_days() -> u32 {
    90
}

fn default_compliance_standards() -> Vec<ComplianceStandard> {
    vec![ComplianceStandard::Soc2]
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            audit_retention_days: default_audit_retention_days(),
            compliance_level: ComplianceLevel::default(),
            compliance_standards: default_compliance_standards(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file path; stdout when unset.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.context.max_depth, 3);
        assert_eq!(config.context.timeout_ms, 0);
        assert_eq!(config.context.retry_count, 2);
        assert_eq!(config.context.parallel_limit, 5);
        assert!(config.context.cache_results);
        assert!(!config.context.verbose_logging);
        assert_eq!(config.log.snapshot_interval, 100);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "context:\n  max_depth: 5\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.context.max_depth, 5);
        assert_eq!(config.context.retry_count, 2);
        assert_eq!(config.audit.audit_retention_days, 90);
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.context, config.context);
    }
}
