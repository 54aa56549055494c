//! Append-only audit trail.

use super::partitions::encode_audit_key;
use super::{Result, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// e.g. `job_submitted`, `script_rejected`, `release_blocked`.
    pub action: String,
    pub subject_job_id: Option<Uuid>,
    pub node_id: String,
    #[serde(default)]
    pub actor: Value,
    #[serde(default)]
    pub details: Value,
    pub ip: Option<String>,
}

impl AuditEntry {
    pub fn new(action: &str, node_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            subject_job_id: None,
            node_id: node_id.to_string(),
            actor: Value::Null,
            details: Value::Null,
            ip: None,
        }
    }

    pub fn job(mut self, job_id: Uuid) -> Self {
        self.subject_job_id = Some(job_id);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl Store {
    /// Append one audit row. Rows are never updated or deleted.
    pub fn append_audit(&self, entry: AuditEntry) -> Result<u64> {
        let seq = self.next_audit_seq()?;
        self.audit
            .insert(encode_audit_key(seq), serde_json::to_vec(&entry)?)?;
        debug!(seq, action = %entry.action, "audit row appended");
        Ok(seq)
    }

    /// All audit rows for one job, in append order.
    pub fn audit_for_job(&self, job_id: &Uuid) -> Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for item in self.audit.iter() {
            let (_, value) = item?;
            let entry: AuditEntry = serde_json::from_slice(&value)?;
            if entry.subject_job_id.as_ref() == Some(job_id) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
