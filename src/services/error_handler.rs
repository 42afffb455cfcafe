//! Error classification and recovery.
//!
//! Incoming failures are matched against a regex taxonomy, graded for
//! severity and recoverability, and driven through a class-specific
//! recovery strategy: credential refresh, retry with exponential backoff,
//! auto-merge, rate-limit wait, LLM-assisted suggestions. A per-service
//! circuit breaker guards repeatedly failing collaborators.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::domain::error::EngineResult;
use crate::domain::models::config::ErrorHandlerConfig;
use crate::domain::ports::llm_client::{LlmClient, PromptOptions};
use crate::services::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitStats,
};

/// Error classes in the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Authentication,
    Network,
    Conflict,
    Repository,
    RateLimit,
    Syntax,
    Reference,
    Type,
    Filesystem,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::Conflict => "conflict",
            Self::Repository => "repository",
            Self::RateLimit => "rate_limit",
            Self::Syntax => "syntax",
            Self::Reference => "reference",
            Self::Type => "type",
            Self::Filesystem => "filesystem",
            Self::Unknown => "unknown",
        }
    }
}

/// Severity grading per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Error,
    Unknown,
}

/// A classified error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub classification: ErrorClass,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub original_error: String,
    /// Free-form context supplied by the caller.
    pub context: HashMap<String, Value>,
    /// Default strategy the recovery path will attempt first.
    pub strategy: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Result of a recovery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    /// Strategy that produced the outcome.
    pub strategy: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Async side-effect hook used by class strategies (credential refresh,
/// auto-merge, repository reinitialisation).
pub type RecoveryHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = EngineResult<()>> + Send>> + Send + Sync>;

/// Optional hooks a caller can provide to enable class strategies.
#[derive(Default, Clone)]
pub struct RecoveryHooks {
    pub refresh_credentials: Option<RecoveryHook>,
    pub auto_merge: Option<RecoveryHook>,
    pub reinitialize_repository: Option<RecoveryHook>,
}

/// Per-class counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorMetrics {
    pub classified: u64,
    pub by_class: HashMap<String, u64>,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
}

static CLASS_PATTERNS: Lazy<Vec<(Regex, ErrorClass)>> = Lazy::new(|| {
    // Order matters: the first match wins.
    vec![
        (
            Regex::new(r"(?i)rate limit|too many requests|\b429\b|reset in").unwrap(),
            ErrorClass::RateLimit,
        ),
        (
            Regex::new(r"(?i)auth|credential|unauthorized|permission denied|\b401\b|\b403\b")
                .unwrap(),
            ErrorClass::Authentication,
        ),
        (
            Regex::new(r"(?i)merge conflict|\bconflict\b").unwrap(),
            ErrorClass::Conflict,
        ),
        (
            Regex::new(r"(?i)not a git repository|bad object|corrupt|\brepository\b").unwrap(),
            ErrorClass::Repository,
        ),
        (
            Regex::new(r"(?i)ENOENT|EACCES|EPERM|no such file|file not found|is a directory")
                .unwrap(),
            ErrorClass::Filesystem,
        ),
        (
            Regex::new(r"(?i)syntax error|unexpected token|parse error").unwrap(),
            ErrorClass::Syntax,
        ),
        (
            Regex::new(r"(?i)is not defined|ReferenceError|cannot find (value|name|symbol)")
                .unwrap(),
            ErrorClass::Reference,
        ),
        (
            Regex::new(r"(?i)TypeError|type mismatch|mismatched types|expected .* found").unwrap(),
            ErrorClass::Type,
        ),
        (
            Regex::new(r"(?i)network|connection|ECONNREFUSED|ENOTFOUND|timed? ?out|socket|dns")
                .unwrap(),
            ErrorClass::Network,
        ),
    ]
});

static RESET_INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:reset|retry)(?:\s+\w+)?\s+in\s+(\d+)\s*(s|sec|secs|second|seconds|m|min|mins|minute|minutes|h|hr|hrs|hour|hours)?")
        .expect("reset interval regex")
});

/// Classifies failures and drives recovery strategies.
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    llm: Option<Arc<dyn LlmClient>>,
    breakers: CircuitBreakerRegistry,
    metrics: Mutex<ErrorMetrics>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            cooldown: chrono::Duration::milliseconds(config.circuit_cooldown_ms as i64),
        });
        Self {
            config,
            llm: None,
            breakers,
            metrics: Mutex::new(ErrorMetrics::default()),
        }
    }

    /// Attach an LLM used for fix suggestions on code-shaped errors.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Classify an error message (optionally with a code or type name).
    pub fn classify(&self, message: &str, code: Option<&str>) -> ErrorInfo {
        let haystack = match code {
            Some(code) => format!("{code}: {message}"),
            None => message.to_string(),
        };

        let classification = CLASS_PATTERNS
            .iter()
            .find(|(pattern, _)| pattern.is_match(&haystack))
            .map(|(_, class)| *class)
            .unwrap_or(ErrorClass::Unknown);

        let (severity, recoverable, strategy) = match classification {
            ErrorClass::Authentication => (ErrorSeverity::High, true, "refresh-credentials"),
            ErrorClass::Network => (ErrorSeverity::Medium, true, "retry-with-backoff"),
            ErrorClass::Conflict => (ErrorSeverity::Medium, true, "auto-merge"),
            ErrorClass::Repository => (ErrorSeverity::High, true, "reinitialize"),
            ErrorClass::RateLimit => (ErrorSeverity::Low, true, "wait-and-retry"),
            ErrorClass::Syntax | ErrorClass::Reference | ErrorClass::Type => {
                (ErrorSeverity::Error, true, "llm-suggestions")
            }
            ErrorClass::Filesystem => (ErrorSeverity::Error, true, "path-suggestions"),
            ErrorClass::Unknown => (ErrorSeverity::Unknown, false, "surface"),
        };

        let mut metrics = self.metrics.lock().expect("metrics lock");
        metrics.classified += 1;
        *metrics
            .by_class
            .entry(classification.as_str().to_string())
            .or_insert(0) += 1;

        ErrorInfo {
            classification,
            severity,
            recoverable,
            original_error: message.to_string(),
            context: HashMap::new(),
            strategy,
            timestamp: Utc::now(),
        }
    }

    /// Drive the class strategy for a classified error. `retry` re-runs the
    /// failed operation; hooks enable credential/merge/repository repairs.
    #[instrument(skip_all, fields(class = info.classification.as_str()))]
    pub async fn recover<F, Fut>(
        &self,
        info: &ErrorInfo,
        hooks: &RecoveryHooks,
        mut retry: F,
    ) -> RecoveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock");
            metrics.recoveries_attempted += 1;
        }

        let outcome = match info.classification {
            ErrorClass::RateLimit => {
                let wait = parse_reset_interval(&info.original_error)
                    .unwrap_or(std::time::Duration::from_millis(self.config.retry_delay_ms));
                info!(wait_ms = wait.as_millis() as u64, "waiting out rate limit");
                tokio::time::sleep(wait).await;
                match retry().await {
                    Ok(result) => RecoveryOutcome {
                        success: true,
                        strategy: "wait-and-retry".to_string(),
                        attempts: 1,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => RecoveryOutcome {
                        success: false,
                        strategy: "wait-and-retry".to_string(),
                        attempts: 1,
                        result: None,
                        error: Some(e.to_string()),
                    },
                }
            }
            ErrorClass::Network => self.retry_with_backoff(&mut retry).await,
            ErrorClass::Authentication => {
                self.hook_then_retry(
                    "refresh-credentials",
                    hooks.refresh_credentials.clone(),
                    &mut retry,
                )
                .await
            }
            ErrorClass::Conflict => {
                self.hook_then_retry("auto-merge", hooks.auto_merge.clone(), &mut retry)
                    .await
            }
            ErrorClass::Repository => {
                self.hook_then_retry(
                    "reinitialize",
                    hooks.reinitialize_repository.clone(),
                    &mut retry,
                )
                .await
            }
            ErrorClass::Syntax | ErrorClass::Reference | ErrorClass::Type => {
                self.suggest_fix("llm-suggestions", info).await
            }
            ErrorClass::Filesystem => self.suggest_fix("path-suggestions", info).await,
            ErrorClass::Unknown => RecoveryOutcome {
                success: false,
                strategy: "surface".to_string(),
                attempts: 0,
                result: None,
                error: Some(info.original_error.clone()),
            },
        };

        if outcome.success {
            let mut metrics = self.metrics.lock().expect("metrics lock");
            metrics.recoveries_succeeded += 1;
        }
        outcome
    }

    async fn retry_with_backoff<F, Fut>(&self, retry: &mut F) -> RecoveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        let mut last_error = None;
        for attempt in 0..self.config.max_retry_attempts {
            let delay = self.config.retry_delay_ms.saturating_mul(1 << attempt);
            debug!(attempt, delay_ms = delay, "backing off before retry");
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

            match retry().await {
                Ok(result) => {
                    return RecoveryOutcome {
                        success: true,
                        strategy: "retry-with-backoff".to_string(),
                        attempts: attempt + 1,
                        result: Some(result),
                        error: None,
                    };
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        RecoveryOutcome {
            success: false,
            strategy: "test-connectivity".to_string(),
            attempts: self.config.max_retry_attempts,
            result: None,
            error: last_error,
        }
    }

    async fn hook_then_retry<F, Fut>(
        &self,
        strategy: &str,
        hook: Option<RecoveryHook>,
        retry: &mut F,
    ) -> RecoveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        let Some(hook) = hook else {
            return RecoveryOutcome {
                success: false,
                strategy: strategy.to_string(),
                attempts: 0,
                result: None,
                error: Some(format!("no {strategy} hook available")),
            };
        };

        if let Err(e) = hook().await {
            return RecoveryOutcome {
                success: false,
                strategy: strategy.to_string(),
                attempts: 1,
                result: None,
                error: Some(e.to_string()),
            };
        }

        match retry().await {
            Ok(result) => RecoveryOutcome {
                success: true,
                strategy: strategy.to_string(),
                attempts: 1,
                result: Some(result),
                error: None,
            },
            Err(e) => RecoveryOutcome {
                success: false,
                strategy: strategy.to_string(),
                attempts: 1,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn suggest_fix(&self, strategy: &str, info: &ErrorInfo) -> RecoveryOutcome {
        let Some(llm) = &self.llm else {
            return RecoveryOutcome {
                success: false,
                strategy: strategy.to_string(),
                attempts: 0,
                result: None,
                error: Some(info.original_error.clone()),
            };
        };

        let prompt = format!(
            "The following {} error occurred:\n{}\nSuggest up to three concrete fixes as a JSON array of strings.",
            info.classification.as_str(),
            info.original_error
        );
        match llm
            .send_message(&prompt, PromptOptions { response_format: Some("json".into()), ..Default::default() })
            .await
        {
            Ok(reply) => {
                let suggestions =
                    serde_json::from_str::<Value>(&reply).unwrap_or(Value::String(reply));
                RecoveryOutcome {
                    success: false,
                    strategy: strategy.to_string(),
                    attempts: 1,
                    result: Some(serde_json::json!({ "suggestions": suggestions })),
                    error: Some(info.original_error.clone()),
                }
            }
            Err(e) => {
                warn!(error = %e, "fix suggestions unavailable");
                RecoveryOutcome {
                    success: false,
                    strategy: strategy.to_string(),
                    attempts: 1,
                    result: None,
                    error: Some(info.original_error.clone()),
                }
            }
        }
    }

    /// Run `operation` behind the named service's circuit breaker.
    pub async fn guard<T, F, Fut>(&self, service: &str, operation: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.breakers.check(service)?;
        match operation().await {
            Ok(value) => {
                self.breakers.record_success(service);
                Ok(value)
            }
            Err(e) => {
                self.breakers.record_failure(service);
                Err(e)
            }
        }
    }

    /// Circuit state snapshots.
    pub fn circuit_stats(&self) -> Vec<CircuitStats> {
        self.breakers.stats()
    }

    /// Classification and recovery counters.
    pub fn metrics(&self) -> ErrorMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }
}

/// Extract a rate-limit reset interval from an error message.
///
/// Supports seconds, minutes, and hours; a bare number means seconds.
pub fn parse_reset_interval(message: &str) -> Option<std::time::Duration> {
    let caps = RESET_INTERVAL.captures(message)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_lowercase());

    let seconds = match unit.as_deref() {
        Some(u) if u.starts_with('m') => amount * 60,
        Some(u) if u.starts_with('h') => amount * 3600,
        _ => amount,
    };
    Some(std::time::Duration::from_secs(seconds))
}
