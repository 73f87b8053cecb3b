use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One append-only audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor_id: i64,
    pub action: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor_id: i64, action: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            actor_id,
            action: action.into(),
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}
