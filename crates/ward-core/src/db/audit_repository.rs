//! Audit log storage

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::AuditEntry;

/// Append-only audit table access
pub struct LibSqlAuditRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlAuditRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append one entry
    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let meta = serde_json::to_string(&entry.meta)?;
        self.conn
            .execute(
                "INSERT INTO audit_log (event, action, target_id, allowed, timestamp, meta)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    entry.event.as_str(),
                    entry.action.as_str(),
                    entry.target_id.as_str(),
                    i64::from(entry.allowed),
                    entry.timestamp,
                    meta
                ],
            )
            .await?;
        Ok(())
    }

    /// Newest-first entries, optionally restricted to one target
    pub async fn recent(&self, target_id: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = match target_id {
            Some(target_id) => {
                self.conn
                    .query(
                        "SELECT event, action, target_id, allowed, timestamp, meta FROM audit_log
                         WHERE target_id = ? ORDER BY seq DESC LIMIT ?",
                        params![target_id, limit],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        "SELECT event, action, target_id, allowed, timestamp, meta FROM audit_log
                         ORDER BY seq DESC LIMIT ?",
                        [limit],
                    )
                    .await?
            }
        };

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let meta: String = row.get(5)?;
            entries.push(AuditEntry {
                event: row.get(0)?,
                action: row.get(1)?,
                target_id: row.get(2)?,
                allowed: row.get::<i64>(3)? != 0,
                timestamp: row.get(4)?,
                meta: serde_json::from_str(&meta)?,
            });
        }
        Ok(entries)
    }
}
