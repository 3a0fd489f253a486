//! Audit entries and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded control-plane action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// User or system principal that performed the action.
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub project_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// An operator-visible condition raised by the reconcilers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub resource_type: String,
    pub resource_id: String,
    pub message: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
