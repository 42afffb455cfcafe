//! Circuit breaker per logical service.
//!
//! Opens after a threshold of consecutive failures, fails fast while open,
//! and admits a half-open probe after the cooldown. Any failure in
//! half-open reopens the circuit.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::error::{EngineError, EngineResult};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::seconds(30),
        }
    }
}

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests fail fast without touching the service.
    Open,
    /// One probe request is admitted.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// One service's breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_count: u32,
    pub state_changed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    open_count: u32,
    opened_at: Option<DateTime<Utc>>,
    state_changed_at: DateTime<Utc>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_count: 0,
            opened_at: None,
            state_changed_at: Utc::now(),
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.state_changed_at = Utc::now();
    }
}

/// Registry of circuits keyed by logical service name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a call: `Ok` admits it (closed, or half-open probe), `Err`
    /// fails fast while the circuit is open.
    pub fn check(&self, service: &str) -> EngineResult<()> {
        let mut circuits = self.circuits.lock().expect("circuit lock");
        let circuit = circuits
            .entry(service.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .is_some_and(|at| Utc::now() - at >= self.config.cooldown);
                if cooled {
                    info!(service, "circuit half-open, admitting probe");
                    circuit.transition(CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(EngineError::Unknown(format!(
                        "circuit open for service {service}"
                    )))
                }
            }
        }
    }

    /// Record a successful call: closes half-open circuits and resets the
    /// failure streak.
    pub fn record_success(&self, service: &str) {
        let mut circuits = self.circuits.lock().expect("circuit lock");
        if let Some(circuit) = circuits.get_mut(service) {
            if circuit.state == CircuitState::HalfOpen {
                info!(service, "probe succeeded, circuit closed");
                circuit.transition(CircuitState::Closed);
                circuit.opened_at = None;
            }
            circuit.consecutive_failures = 0;
        }
    }

    /// Record a failed call: opens the circuit at the threshold, and
    /// immediately on any half-open failure.
    pub fn record_failure(&self, service: &str) {
        let mut circuits = self.circuits.lock().expect("circuit lock");
        let circuit = circuits
            .entry(service.to_string())
            .or_insert_with(Circuit::new);
        circuit.consecutive_failures += 1;

        let should_open = match circuit.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => circuit.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                service,
                failures = circuit.consecutive_failures,
                "circuit opened"
            );
            circuit.transition(CircuitState::Open);
            circuit.opened_at = Some(Utc::now());
            circuit.open_count += 1;
        }
    }

    /// Current state of one service's circuit.
    pub fn state(&self, service: &str) -> CircuitState {
        let circuits = self.circuits.lock().expect("circuit lock");
        circuits
            .get(service)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every circuit.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let circuits = self.circuits.lock().expect("circuit lock");
        circuits
            .iter()
            .map(|(service, c)| CircuitStats {
                service: service.clone(),
                state: c.state,
                consecutive_failures: c.consecutive_failures,
                open_count: c.open_count,
                state_changed_at: c.state_changed_at,
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, cooldown_ms: i64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::milliseconds(cooldown_ms),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let registry = registry(3, 60_000);
        for _ in 0..2 {
            registry.record_failure("svc");
        }
        assert_eq!(registry.state("svc"), CircuitState::Closed);

        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Open);
        assert!(registry.check("svc").is_err());
    }

    #[test]
    fn test_success_resets_streak() {
        let registry = registry(3, 60_000);
        registry.record_failure("svc");
        registry.record_failure("svc");
        registry.record_success("svc");
        registry.record_failure("svc");
        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let registry = registry(1, 0);
        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Open);

        // Cooldown of zero: the next check admits a probe.
        assert!(registry.check("svc").is_ok());
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);

        registry.record_success("svc");
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let registry = registry(1, 0);
        registry.record_failure("svc");
        assert!(registry.check("svc").is_ok());
        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Open);

        let stats = registry.stats();
        assert_eq!(stats[0].open_count, 2);
    }

    #[test]
    fn test_independent_services() {
        let registry = registry(1, 60_000);
        registry.record_failure("a");
        assert_eq!(registry.state("a"), CircuitState::Open);
        assert_eq!(registry.state("b"), CircuitState::Closed);
        assert!(registry.check("b").is_ok());
    }
}
