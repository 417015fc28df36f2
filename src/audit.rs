use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome recorded with an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// One append-only audit record. Entries are never mutated after
/// insertion; the storage layer exposes append and read only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub election_id: Option<Uuid>,
    pub operation: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        election_id: Option<Uuid>,
        operation: impl Into<String>,
        actor: impl Into<String>,
        details: serde_json::Value,
        status: AuditStatus,
    ) -> Self {
        AuditEntry {
            id: Uuid::new_v4(),
            election_id,
            operation: operation.into(),
            actor: actor.into(),
            details,
            status,
            timestamp: Utc::now(),
        }
    }
}
