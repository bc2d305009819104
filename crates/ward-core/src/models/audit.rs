//! Audit entry model

use serde::{Deserialize, Serialize};

/// One describable action taken by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Event family, e.g. `resource.write`
    pub event: String,
    /// Concrete action, e.g. `create`
    pub action: String,
    /// Affected record, usually `Type/id`
    pub target_id: String,
    pub allowed: bool,
    /// Unix ms
    pub timestamp: i64,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        event: impl Into<String>,
        action: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            event: event.into(),
            action: action.into(),
            target_id: target_id.into(),
            allowed: true,
            timestamp: chrono::Utc::now().timestamp_millis(),
            meta: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub const fn denied(mut self) -> Self {
        self.allowed = false;
        self
    }
}
