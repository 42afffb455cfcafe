//! Tamper-evident audit trail with compliance reporting.
//!
//! Entries chain through SHA-256 hashes: each record's hash covers its
//! canonical form plus the previous record's hash, so any edit of a past
//! entry is detectable by recomputation. Retention cleanup may trim the
//! head of the chain; verification anchors at the first retained entry.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::error::{ComplianceError, EngineError, EngineResult};
use crate::domain::models::audit::{
    AuditFilter, AuditOperation, AuditRecord, AuditStats, ComplianceLevel, ComplianceReport,
    ComplianceStandard, IntegrityReport, GENESIS_HASH,
};
use crate::domain::models::config::AuditConfig;

/// Append-only audit recorder.
pub struct AuditTrail {
    config: AuditConfig,
    entries: Mutex<Vec<AuditRecord>>,
}

impl AuditTrail {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record an auditable operation. Requires `type`, `user`, and (except
    /// at the relaxed level, which defaults it) `timestamp`.
    pub fn record_operation(&self, op: AuditOperation) -> EngineResult<AuditRecord> {
        self.record(op, false)
    }

    /// Record a compliance violation; tracked separately in queries,
    /// stats, and reports.
    pub fn record_violation(&self, op: AuditOperation) -> EngineResult<AuditRecord> {
        self.record(op, true)
    }

    fn record(&self, op: AuditOperation, violation: bool) -> EngineResult<AuditRecord> {
        if op.operation_type.is_empty() {
            return Err(EngineError::invalid_input("audit operation requires a type"));
        }
        if op.user.is_empty() {
            return Err(EngineError::invalid_input("audit operation requires a user"));
        }
        let timestamp = match op.timestamp {
            Some(timestamp) => timestamp,
            None if self.config.compliance_level == ComplianceLevel::Relaxed => Utc::now(),
            None => {
                return Err(EngineError::invalid_input(
                    "audit operation requires a timestamp",
                ));
            }
        };

        let mut entries = self.entries.lock().expect("audit lock");
        let prev_hash = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut record = AuditRecord {
            id: Uuid::new_v4(),
            operation_type: op.operation_type,
            user: op.user,
            timestamp,
            details: op.details,
            entity_id: op.entity_id,
            compliance_level: self.config.compliance_level,
            violation,
            prev_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash();

        if violation {
            warn!(user = %record.user, operation = %record.operation_type, "compliance violation recorded");
        } else {
            debug!(user = %record.user, operation = %record.operation_type, "audit entry recorded");
        }

        entries.push(record.clone());
        Ok(record)
    }

    /// Entries matching the filter, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        let entries = self.entries.lock().expect("audit lock");
        let mut matched: Vec<AuditRecord> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }

    /// Aggregate statistics over the trail.
    pub fn stats(&self) -> AuditStats {
        let entries = self.entries.lock().expect("audit lock");
        let mut stats = AuditStats {
            total_entries: entries.len(),
            oldest_entry: entries.first().map(|e| e.timestamp),
            newest_entry: entries.last().map(|e| e.timestamp),
            ..AuditStats::default()
        };
        for entry in entries.iter() {
            if entry.violation {
                stats.violations += 1;
            }
            *stats
                .entries_by_type
                .entry(entry.operation_type.clone())
                .or_insert(0) += 1;
            *stats.entries_by_user.entry(entry.user.clone()).or_insert(0) += 1;
        }
        stats
    }

    /// Recompute the chain and report validity.
    pub fn verify_audit_integrity(&self) -> IntegrityReport {
        let entries = self.entries.lock().expect("audit lock");
        verify_chain(&entries)
    }

    /// Project the trail into a standard-specific report shape.
    pub fn generate_compliance_report(&self, standard: &str) -> EngineResult<ComplianceReport> {
        let standard = ComplianceStandard::parse_str(standard).ok_or_else(|| {
            EngineError::from(ComplianceError::UnsupportedStandard(standard.to_string()))
        })?;

        let entries = self.entries.lock().expect("audit lock");
        let integrity = verify_chain(&entries);

        let mut sections: HashMap<String, Vec<Value>> = HashMap::new();
        let mut push = |section: &str, entry: &AuditRecord| {
            sections
                .entry(section.to_string())
                .or_default()
                .push(entry_summary(entry));
        };

        for entry in entries.iter() {
            if entry.violation {
                push("violations", entry);
                continue;
            }
            match standard {
                ComplianceStandard::Sox => {
                    if is_change_operation(&entry.operation_type) {
                        push("change_management", entry);
                    } else if is_access_operation(&entry.operation_type) {
                        push("access_control", entry);
                    } else {
                        push("operations", entry);
                    }
                }
                ComplianceStandard::Gdpr => {
                    if is_data_operation(&entry.operation_type) {
                        push("data_processing", entry);
                    } else if is_access_operation(&entry.operation_type) {
                        push("data_access", entry);
                    } else {
                        push("operations", entry);
                    }
                }
                ComplianceStandard::Soc2 => {
                    if is_access_operation(&entry.operation_type) {
                        push("security_events", entry);
                    } else if is_change_operation(&entry.operation_type) {
                        push("change_management", entry);
                    } else {
                        push("availability_events", entry);
                    }
                }
                ComplianceStandard::Iso27001 => {
                    if is_access_operation(&entry.operation_type) {
                        push("access_events", entry);
                    } else {
                        push("operational_events", entry);
                    }
                }
                ComplianceStandard::Nist => {
                    if is_access_operation(&entry.operation_type) {
                        push("protect", entry);
                    } else if entry.operation_type.contains("error")
                        || entry.operation_type.contains("failure")
                    {
                        push("detect", entry);
                    } else {
                        push("identify", entry);
                    }
                }
            }
        }

        let violations = entries.iter().filter(|e| e.violation).count();
        info!(standard = %standard, entries = entries.len(), "compliance report generated");

        Ok(ComplianceReport {
            standard,
            generated_at: Utc::now(),
            period_start: entries.first().map(|e| e.timestamp),
            period_end: entries.last().map(|e| e.timestamp),
            total_operations: entries.len(),
            violations,
            sections,
            integrity_verified: integrity.valid,
        })
    }

    /// Remove entries older than the retention window. The chain re-anchors
    /// at the first retained entry.
    pub fn cleanup_expired_records(&self) -> usize {
        let cutoff = Utc::now() - Duration::days(self.config.audit_retention_days as i64);
        let mut entries = self.entries.lock().expect("audit lock");
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "expired audit entries removed");
        }
        removed
    }

    /// Serialize the chain.
    pub fn export(&self) -> Vec<AuditRecord> {
        self.entries.lock().expect("audit lock").clone()
    }

    /// Load a chain, verifying integrity first.
    pub fn import(&self, records: Vec<AuditRecord>) -> EngineResult<()> {
        let report = verify_chain(&records);
        if !report.valid {
            return Err(ComplianceError::IntegrityFailure(format!(
                "imported chain invalid at entry {}",
                report.first_invalid_entry.unwrap_or(0)
            ))
            .into());
        }
        *self.entries.lock().expect("audit lock") = records;
        Ok(())
    }
}

fn verify_chain(entries: &[AuditRecord]) -> IntegrityReport {
    let mut checksum_valid = true;
    let mut first_invalid = None;

    for (index, entry) in entries.iter().enumerate() {
        let recomputed = entry.compute_hash();
        let hash_ok = recomputed == entry.hash;
        // The first retained entry's prev_hash is the trusted anchor.
        let link_ok = index == 0 || entries[index - 1].hash == entry.prev_hash;

        if !hash_ok {
            checksum_valid = false;
        }
        if (!hash_ok || !link_ok) && first_invalid.is_none() {
            first_invalid = Some(index);
        }
    }

    IntegrityReport {
        valid: first_invalid.is_none(),
        entry_count: entries.len(),
        checksum_valid,
        first_invalid_entry: first_invalid,
    }
}

fn entry_summary(entry: &AuditRecord) -> Value {
    json!({
        "id": entry.id,
        "type": entry.operation_type,
        "user": entry.user,
        "timestamp": entry.timestamp,
        "entity_id": entry.entity_id,
    })
}

fn is_access_operation(operation_type: &str) -> bool {
    const ACCESS: &[&str] = &["auth", "login", "access", "permission", "credential"];
    ACCESS.iter().any(|k| operation_type.contains(k))
}

fn is_change_operation(operation_type: &str) -> bool {
    const CHANGE: &[&str] = &["commit", "merge", "push", "branch", "transaction", "update", "state"];
    CHANGE.iter().any(|k| operation_type.contains(k))
}

fn is_data_operation(operation_type: &str) -> bool {
    const DATA: &[&str] = &["data", "export", "import", "delete", "read"];
    DATA.iter().any(|k| operation_type.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trail() -> AuditTrail {
        AuditTrail::new(AuditConfig::default())
    }

    fn op(kind: &str, user: &str) -> AuditOperation {
        AuditOperation {
            operation_type: kind.to_string(),
            user: user.to_string(),
            timestamp: Some(Utc::now()),
            details: HashMap::new(),
            entity_id: None,
        }
    }

    #[test]
    fn test_chain_links_and_verifies() {
        let trail = trail();
        trail.record_operation(op("tool_invocation", "agent-1")).unwrap();
        trail.record_operation(op("state_update", "agent-1")).unwrap();
        trail.record_operation(op("commit", "agent-2")).unwrap();

        let entries = trail.export();
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);

        let report = trail.verify_audit_integrity();
        assert!(report.valid);
        assert!(report.checksum_valid);
        assert_eq!(report.entry_count, 3);
    }

    #[test]
    fn test_tampering_is_detected() {
        let trail = trail();
        trail.record_operation(op("commit", "agent-1")).unwrap();
        trail.record_operation(op("push", "agent-1")).unwrap();

        let mut tampered = trail.export();
        tampered[0].user = "intruder".to_string();

        let report = verify_chain(&tampered);
        assert!(!report.valid);
        assert!(!report.checksum_valid);
        assert_eq!(report.first_invalid_entry, Some(0));

        assert!(matches!(
            trail.import(tampered),
            Err(EngineError::Compliance(ComplianceError::IntegrityFailure(_)))
        ));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let trail = trail();
        let mut missing_type = op("", "agent-1");
        missing_type.operation_type = String::new();
        assert!(trail.record_operation(missing_type).is_err());

        let missing_user = op("commit", "");
        assert!(trail.record_operation(missing_user).is_err());

        let mut missing_timestamp = op("commit", "agent-1");
        missing_timestamp.timestamp = None;
        assert!(trail.record_operation(missing_timestamp).is_err());
    }

    #[test]
    fn test_relaxed_level_defaults_timestamp() {
        let trail = AuditTrail::new(AuditConfig {
            compliance_level: ComplianceLevel::Relaxed,
            ..AuditConfig::default()
        });
        let mut no_timestamp = op("commit", "agent-1");
        no_timestamp.timestamp = None;
        assert!(trail.record_operation(no_timestamp).is_ok());
    }

    #[test]
    fn test_violations_tracked_separately() {
        let trail = trail();
        trail.record_operation(op("commit", "agent-1")).unwrap();
        trail.record_violation(op("access", "agent-2")).unwrap();

        let violations = trail.query(&AuditFilter::new().violations_only());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].user, "agent-2");

        let stats = trail.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.violations, 1);
    }

    #[test]
    fn test_compliance_reports_by_standard() {
        let trail = trail();
        trail.record_operation(op("commit", "agent-1")).unwrap();
        trail.record_operation(op("auth_check", "agent-1")).unwrap();
        trail.record_violation(op("data_export", "agent-2")).unwrap();

        let sox = trail.generate_compliance_report("SOX").unwrap();
        assert!(sox.sections.contains_key("change_management"));
        assert_eq!(sox.violations, 1);
        assert!(sox.integrity_verified);

        let gdpr = trail.generate_compliance_report("gdpr").unwrap();
        assert_eq!(gdpr.standard, ComplianceStandard::Gdpr);

        let err = trail.generate_compliance_report("PCI-DSS").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Compliance(ComplianceError::UnsupportedStandard(_))
        ));
    }

    #[test]
    fn test_retention_cleanup_reanchors_chain() {
        let trail = trail();
        let mut old = op("commit", "agent-1");
        old.timestamp = Some(Utc::now() - Duration::days(400));
        trail.record_operation(old).unwrap();
        trail.record_operation(op("push", "agent-1")).unwrap();

        let removed = trail.cleanup_expired_records();
        assert_eq!(removed, 1);

        // The surviving entry anchors the chain.
        let report = trail.verify_audit_integrity();
        assert!(report.valid);
        assert_eq!(report.entry_count, 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let trail = trail();
        trail.record_operation(op("commit", "agent-1")).unwrap();
        trail.record_operation(op("push", "agent-1")).unwrap();

        let fresh = AuditTrail::new(AuditConfig::default());
        fresh.import(trail.export()).unwrap();
        assert!(fresh.verify_audit_integrity().valid);
        assert_eq!(fresh.stats().total_entries, 2);
    }
}
