//! Versioned resource storage: head documents, revisions, and the change log

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{ChangeEntry, ChangeKind, DocumentKey, Revision, RevisionId, VersionedResource};

/// libSQL repository backing the resource version store.
///
/// Callers are responsible for transactions; every method here is a single
/// statement or query.
pub struct LibSqlResourceRepository<'a> {
    conn: &'a Connection,
}

const REVISION_COLUMNS: &str = "r.resource_type, r.id, r.version_id, r.last_updated, r.revision_id, r.body, r.parent_version, r.conflict_flag";

impl<'a> LibSqlResourceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_resource(row: &libsql::Row, offset: i32) -> Result<VersionedResource> {
        let revision_id: String = row.get(offset + 4)?;
        let body: String = row.get(offset + 5)?;
        Ok(VersionedResource {
            resource_type: row.get(offset)?,
            id: row.get(offset + 1)?,
            version_id: row.get(offset + 2)?,
            last_updated: row.get(offset + 3)?,
            revision_id: RevisionId::from(revision_id),
            body: serde_json::from_str(&body)?,
        })
    }

    fn parse_revision(row: &libsql::Row) -> Result<Revision> {
        Ok(Revision {
            resource: Self::parse_resource(row, 0)?,
            parent_version: row.get::<Option<i64>>(6)?,
            conflict_flag: row.get::<Option<String>>(7)?,
        })
    }

    async fn collect_revisions(mut rows: libsql::Rows) -> Result<Vec<Revision>> {
        let mut revisions = Vec::new();
        while let Some(row) = rows.next().await? {
            revisions.push(Self::parse_revision(&row)?);
        }
        Ok(revisions)
    }

    /// Current head (latest accepted write) of a document
    pub async fn head(&self, key: &DocumentKey) -> Result<Option<VersionedResource>> {
        let mut rows = self
            .conn
            .query(
                "SELECT resource_type, id, version_id, last_updated, revision_id, body
                 FROM resources WHERE resource_type = ? AND id = ?",
                [key.resource_type.as_str(), key.id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_resource(&row, 0)?)),
            None => Ok(None),
        }
    }

    /// Whether the document has a revision with this version number
    pub async fn has_version(&self, key: &DocumentKey, version_id: i64) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM revisions WHERE resource_type = ? AND id = ? AND version_id = ?)",
                params![key.resource_type.as_str(), key.id.as_str(), version_id],
            )
            .await?;

        Ok(match rows.next().await? {
            Some(row) => row.get::<i32>(0)? != 0,
            None => false,
        })
    }

    /// Insert a revision row
    pub async fn insert_revision(&self, revision: &Revision) -> Result<()> {
        let resource = &revision.resource;
        let body = serde_json::to_string(&resource.body)?;
        self.conn
            .execute(
                "INSERT INTO revisions
                    (revision_id, resource_type, id, version_id, parent_version, last_updated, body, conflict_flag)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    resource.revision_id.as_str(),
                    resource.resource_type.as_str(),
                    resource.id.as_str(),
                    resource.version_id,
                    revision.parent_version,
                    resource.last_updated,
                    body,
                    revision.conflict_flag.clone()
                ],
            )
            .await?;
        Ok(())
    }

    /// Point the document head at the given resource state
    pub async fn upsert_head(&self, resource: &VersionedResource) -> Result<()> {
        let body = serde_json::to_string(&resource.body)?;
        self.conn
            .execute(
                "INSERT INTO resources (resource_type, id, version_id, last_updated, revision_id, body)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(resource_type, id) DO UPDATE SET
                    version_id = excluded.version_id,
                    last_updated = excluded.last_updated,
                    revision_id = excluded.revision_id,
                    body = excluded.body",
                params![
                    resource.resource_type.as_str(),
                    resource.id.as_str(),
                    resource.version_id,
                    resource.last_updated,
                    resource.revision_id.as_str(),
                    body
                ],
            )
            .await?;
        Ok(())
    }

    /// Remember which revision an idempotency key produced
    pub async fn record_idempotency_key(
        &self,
        key: &str,
        revision_id: &RevisionId,
        created_at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO idempotency_keys (key, revision_id, created_at) VALUES (?, ?, ?)",
                params![key, revision_id.as_str(), created_at],
            )
            .await?;
        Ok(())
    }

    /// Revision previously produced by an idempotency key
    pub async fn revision_for_idempotency_key(&self, key: &str) -> Result<Option<Revision>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {REVISION_COLUMNS} FROM idempotency_keys k
                     JOIN revisions r ON r.revision_id = k.revision_id
                     WHERE k.key = ?"
                ),
                [key],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_revision(&row)?)),
            None => Ok(None),
        }
    }

    /// Append a change-log entry; returns its sequence number
    pub async fn append_change(
        &self,
        kind: ChangeKind,
        revision_id: &RevisionId,
        recorded_at: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO change_log (kind, revision_id, recorded_at) VALUES (?, ?, ?)",
                params![kind.as_str(), revision_id.as_str(), recorded_at],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Change-log entries after `after_seq`, oldest first
    pub async fn changes_since(&self, after_seq: i64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT r.resource_type, r.id, r.version_id, r.last_updated, r.revision_id, r.body, c.seq, c.kind
                 FROM change_log c
                 JOIN revisions r ON r.revision_id = c.revision_id
                 WHERE c.seq > ?
                 ORDER BY c.seq ASC
                 LIMIT ?",
                params![after_seq, limit],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let kind: String = row.get(7)?;
            entries.push(ChangeEntry {
                seq: row.get(6)?,
                kind: ChangeKind::parse(&kind),
                resource: Self::parse_resource(&row, 0)?,
            });
        }
        Ok(entries)
    }

    /// Look up a single revision
    pub async fn revision(&self, revision_id: &RevisionId) -> Result<Option<Revision>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {REVISION_COLUMNS} FROM revisions r WHERE r.revision_id = ?"),
                [revision_id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_revision(&row)?)),
            None => Ok(None),
        }
    }

    /// Every revision of a document, oldest version first
    pub async fn history(&self, key: &DocumentKey) -> Result<Vec<Revision>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {REVISION_COLUMNS} FROM revisions r
                     WHERE r.resource_type = ? AND r.id = ?
                     ORDER BY r.version_id ASC"
                ),
                [key.resource_type.as_str(), key.id.as_str()],
            )
            .await?;
        Self::collect_revisions(rows).await
    }

    /// Revisions no other revision was derived from, excluding stale ones
    pub async fn leaves(&self, key: &DocumentKey) -> Result<Vec<Revision>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {REVISION_COLUMNS} FROM revisions r
                     WHERE r.resource_type = ? AND r.id = ?
                       AND r.conflict_flag IS NULL
                       AND NOT EXISTS (
                           SELECT 1 FROM revisions child
                           WHERE child.resource_type = r.resource_type
                             AND child.id = r.id
                             AND child.parent_version = r.version_id
                       )
                     ORDER BY r.version_id ASC"
                ),
                [key.resource_type.as_str(), key.id.as_str()],
            )
            .await?;
        Self::collect_revisions(rows).await
    }

    /// Flag a revision; returns false if it was missing or already flagged
    pub async fn set_conflict_flag(&self, revision_id: &RevisionId, flag: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE revisions SET conflict_flag = ? WHERE revision_id = ? AND conflict_flag IS NULL",
                [flag, revision_id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }
}
