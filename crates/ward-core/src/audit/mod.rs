//! Append-only audit log.
//!
//! The pipeline describes every applied write and every conflict tag as an
//! [`AuditEntry`]. Where entries end up is the caller's choice: a libSQL
//! table next to the resource store, or an in-memory log for tests and
//! embedded use.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::{LibSqlAuditRepository, SharedDatabase};
use crate::error::Result;
use crate::models::AuditEntry;

/// Default number of entries returned by a query
pub const DEFAULT_AUDIT_LIMIT: usize = 50;

/// Filter for audit retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    /// Restrict to one record id (`Type/id`)
    pub target_id: Option<String>,
    /// Maximum number of entries, newest first
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            target_id: None,
            limit: DEFAULT_AUDIT_LIMIT,
        }
    }
}

impl AuditQuery {
    pub fn for_target(target_id: impl Into<String>) -> Self {
        Self {
            target_id: Some(target_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Append-only audit sink with filtered retrieval
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;

    /// Newest-first entries matching the query
    async fn recent(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>>;
}

/// Shared handle to an audit sink
pub type SharedAuditLog = Arc<dyn AuditLog>;

/// Audit log stored in the `audit_log` table
#[derive(Clone)]
pub struct LibSqlAuditLog {
    db: SharedDatabase,
}

impl LibSqlAuditLog {
    pub const fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditLog for LibSqlAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlAuditRepository::new(db.connection())
            .append(&entry)
            .await
    }

    async fn recent(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let db = self.db.lock().await;
        LibSqlAuditRepository::new(db.connection())
            .recent(query.target_id.as_deref(), query.limit)
            .await
    }
}

/// Audit log kept in process memory
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn recent(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|entry| {
                query
                    .target_id
                    .as_deref()
                    .is_none_or(|target| entry.target_id == target)
            })
            .take(query.limit)
            .cloned()
            .collect())
    }
}

/// Append to an optional sink, logging instead of failing the caller
pub(crate) async fn record(audit: Option<&SharedAuditLog>, entry: AuditEntry) {
    let Some(audit) = audit else {
        return;
    };
    if let Err(error) = audit.append(entry).await {
        tracing::warn!(%error, "Failed to append audit entry");
    }
}
