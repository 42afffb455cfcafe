//! Audit trail records and compliance types.
//!
//! Entries form a tamper-evident chain: every record's hash covers its
//! canonical JSON form plus the previous record's hash.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Strictness applied when recording operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceLevel {
    Relaxed,
    #[default]
    Standard,
    Strict,
}

impl ComplianceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relaxed => "relaxed",
            Self::Standard => "standard",
            Self::Strict => "strict",
        }
    }
}

/// Compliance standards the trail can report against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplianceStandard {
    #[serde(rename = "SOX")]
    Sox,
    #[serde(rename = "GDPR")]
    Gdpr,
    #[serde(rename = "SOC2")]
    Soc2,
    #[serde(rename = "ISO27001")]
    Iso27001,
    #[serde(rename = "NIST")]
    Nist,
}

impl ComplianceStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sox => "SOX",
            Self::Gdpr => "GDPR",
            Self::Soc2 => "SOC2",
            Self::Iso27001 => "ISO27001",
            Self::Nist => "NIST",
        }
    }

    /// Parse a standard name as supplied by callers.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SOX" => Some(Self::Sox),
            "GDPR" => Some(Self::Gdpr),
            "SOC2" => Some(Self::Soc2),
            "ISO27001" => Some(Self::Iso27001),
            "NIST" => Some(Self::Nist),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComplianceStandard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The auditable operation handed to `record_operation`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditOperation {
    /// Operation type tag (required).
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Acting principal (required).
    pub user: String,
    /// When the operation happened (required).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form details.
    #[serde(default)]
    pub details: HashMap<String, Value>,
    /// Entity the operation touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// One entry in the append-only audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub operation_type: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub compliance_level: ComplianceLevel,
    /// Whether this entry records a compliance violation.
    #[serde(default)]
    pub violation: bool,
    /// Hash of the previous entry; all-zero for the first entry.
    pub prev_hash: String,
    /// SHA-256 over the canonical form of this entry plus `prev_hash`.
    pub hash: String,
}

impl AuditRecord {
    /// Compute this record's hash from its canonical form.
    ///
    /// The canonical form excludes the `hash` field itself and serializes
    /// fields in declaration order, so recomputation is deterministic.
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::json!({
            "id": self.id,
            "type": self.operation_type,
            "user": self.user,
            "timestamp": self.timestamp.to_rfc3339(),
            "details": self.details,
            "entity_id": self.entity_id,
            "compliance_level": self.compliance_level,
            "violation": self.violation,
            "prev_hash": self.prev_hash,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The hash chained before any entry exists.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Filter for querying the audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub operation_type: Option<String>,
    pub user: Option<String>,
    pub entity_id: Option<String>,
    pub violations_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_type(mut self, t: impl Into<String>) -> Self {
        self.operation_type = Some(t.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn violations_only(mut self) -> Self {
        self.violations_only = true;
        self
    }

    pub fn since(mut self, time: DateTime<Utc>) -> Self {
        self.since = Some(time);
        self
    }

    pub fn until(mut self, time: DateTime<Utc>) -> Self {
        self.until = Some(time);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref t) = self.operation_type {
            if record.operation_type != *t {
                return false;
            }
        }
        if let Some(ref user) = self.user {
            if record.user != *user {
                return false;
            }
        }
        if let Some(ref entity) = self.entity_id {
            if record.entity_id.as_deref() != Some(entity.as_str()) {
                return false;
            }
        }
        if self.violations_only && !record.violation {
            return false;
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Aggregate statistics over the audit trail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total_entries: usize,
    pub violations: usize,
    pub entries_by_type: HashMap<String, usize>,
    pub entries_by_user: HashMap<String, usize>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Result of recomputing the hash chain.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub entry_count: usize,
    pub checksum_valid: bool,
    /// First entry where verification failed, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_invalid_entry: Option<usize>,
}

/// A compliance report projected from the trail.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub standard: ComplianceStandard,
    pub generated_at: DateTime<Utc>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub total_operations: usize,
    pub violations: usize,
    /// Standard-specific sections keyed by section name.
    pub sections: HashMap<String, Vec<Value>>,
    /// Whether the underlying chain verified during generation.
    pub integrity_verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            operation_type: "tool_invocation".to_string(),
            user: "agent-1".to_string(),
            timestamp: Utc::now(),
            details: HashMap::new(),
            entity_id: Some("task-1".to_string()),
            compliance_level: ComplianceLevel::Standard,
            violation: false,
            prev_hash: GENESIS_HASH.to_string(),
            hash: String::new(),
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let r = record();
        assert_eq!(r.compute_hash(), r.compute_hash());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let r1 = record();
        let mut r2 = r1.clone();
        r2.user = "agent-2".to_string();
        assert_ne!(r1.compute_hash(), r2.compute_hash());
    }

    #[test]
    fn test_standard_parsing() {
        assert_eq!(ComplianceStandard::parse_str("soc2"), Some(ComplianceStandard::Soc2));
        assert_eq!(ComplianceStandard::parse_str("ISO27001"), Some(ComplianceStandard::Iso27001));
        assert_eq!(ComplianceStandard::parse_str("PCI"), None);
    }

    #[test]
    fn test_filter_matches() {
        let mut r = record();
        r.violation = true;

        assert!(AuditFilter::new().user("agent-1").matches(&r));
        assert!(!AuditFilter::new().user("agent-9").matches(&r));
        assert!(AuditFilter::new().violations_only().matches(&r));
        assert!(AuditFilter::new().entity("task-1").matches(&r));
    }
}
