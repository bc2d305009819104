//! Durable mutation queue storage

use libsql::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{MutationId, MutationRecord, MutationStatus, QueuedMutation};

/// Trait for durable queue storage (async)
///
/// Items are keyed by their own id; `get_all` and `next_pending` return them
/// in creation order.
#[allow(async_fn_in_trait)]
pub trait MutationStore {
    /// Persist a record as pending
    async fn put(&self, record: &MutationRecord) -> Result<()>;

    /// Fetch one item by id
    async fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>>;

    /// All items, oldest first
    async fn get_all(&self) -> Result<Vec<QueuedMutation>>;

    /// Oldest pending item
    async fn next_pending(&self) -> Result<Option<QueuedMutation>>;

    /// Items in the given status, oldest first
    async fn list_by_status(&self, status: MutationStatus) -> Result<Vec<QueuedMutation>>;

    /// Remove one item; returns whether it existed
    async fn delete(&self, id: &MutationId) -> Result<bool>;

    /// Number of pending items
    async fn count(&self) -> Result<usize>;

    /// Remove every item; returns how many were removed
    async fn clear(&self) -> Result<usize>;

    /// Record the outcome of a failed replay attempt
    async fn record_failure(
        &self,
        id: &MutationId,
        attempts: u32,
        status: MutationStatus,
        error: &str,
    ) -> Result<()>;

    /// Move a failed item back to pending with a fresh attempt budget
    async fn reset(&self, id: &MutationId) -> Result<bool>;
}

/// libSQL implementation of `MutationStore`
pub struct LibSqlMutationStore<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str =
    "SELECT id, url, method, body, headers, created_at, attempts, status, last_error FROM mutation_queue";

impl<'a> LibSqlMutationStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a queued mutation from a database row
    fn parse_row(row: &libsql::Row) -> Result<QueuedMutation> {
        let id: String = row.get(0)?;
        let method: String = row.get(2)?;
        let body: String = row.get(3)?;
        let headers: String = row.get(4)?;
        let attempts: i64 = row.get(6)?;
        let status: String = row.get(7)?;

        Ok(QueuedMutation {
            record: MutationRecord {
                id: id
                    .parse()
                    .map_err(|_| Error::Database(format!("invalid mutation id in queue: {id}")))?,
                url: row.get(1)?,
                method: method.parse()?,
                body: serde_json::from_str(&body)?,
                headers: serde_json::from_str(&headers)?,
                created_at: row.get(5)?,
            },
            status: MutationStatus::parse(&status),
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            last_error: row.get::<Option<String>>(8)?,
        })
    }

    async fn collect(&self, mut rows: libsql::Rows) -> Result<Vec<QueuedMutation>> {
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(Self::parse_row(&row)?);
        }
        Ok(items)
    }
}

impl MutationStore for LibSqlMutationStore<'_> {
    async fn put(&self, record: &MutationRecord) -> Result<()> {
        let body = serde_json::to_string(&record.body)?;
        let headers = serde_json::to_string(&record.headers)?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO mutation_queue (id, url, method, body, headers, created_at, attempts, status)
                 VALUES (?, ?, ?, ?, ?, ?, 0, 'pending')",
                params![
                    record.id.as_str(),
                    record.url.as_str(),
                    record.method.as_str(),
                    body,
                    headers,
                    record.created_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        let mut rows = self
            .conn
            .query(&format!("{SELECT_COLUMNS} WHERE id = ?"), [id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<QueuedMutation>> {
        let rows = self
            .conn
            .query(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC, rowid ASC"), ())
            .await?;
        self.collect(rows).await
    }

    async fn next_pending(&self) -> Result<Option<QueuedMutation>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_by_status(&self, status: MutationStatus) -> Result<Vec<QueuedMutation>> {
        let rows = self
            .conn
            .query(
                &format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY created_at ASC, rowid ASC"),
                [status.as_str()],
            )
            .await?;
        self.collect(rows).await
    }

    async fn delete(&self, id: &MutationId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM mutation_queue WHERE id = ?", [id.as_str()])
            .await?;
        Ok(rows > 0)
    }

    async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM mutation_queue WHERE status = 'pending'",
                (),
            )
            .await?;

        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn clear(&self) -> Result<usize> {
        let rows = self.conn.execute("DELETE FROM mutation_queue", ()).await?;
        Ok(usize::try_from(rows).unwrap_or(usize::MAX))
    }

    async fn record_failure(
        &self,
        id: &MutationId,
        attempts: u32,
        status: MutationStatus,
        error: &str,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE mutation_queue SET attempts = ?, status = ?, last_error = ? WHERE id = ?",
                params![
                    i64::from(attempts),
                    status.as_str(),
                    error,
                    id.as_str()
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn reset(&self, id: &MutationId) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE mutation_queue SET attempts = 0, status = 'pending', last_error = NULL
                 WHERE id = ? AND status = 'failed'",
                [id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{HttpMethod, NewMutation};
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn record(url: &str, created_at: i64) -> MutationRecord {
        let mut record = MutationRecord::from_new(NewMutation::new(
            HttpMethod::Post,
            url,
            serde_json::json!({"resourceType": "Observation"}),
        ));
        record.created_at = created_at;
        record
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_and_get_all_in_creation_order() {
        let db = setup().await;
        let store = LibSqlMutationStore::new(db.connection());

        let later = record("/fhir/Observation", 2_000);
        let earlier = record("/fhir/Patient", 1_000);
        store.put(&later).await.unwrap();
        store.put(&earlier).await.unwrap();

        let all = store.get_all().await.unwrap();
        let urls: Vec<&str> = all.iter().map(|item| item.record.url.as_str()).collect();
        assert_eq!(urls, vec!["/fhir/Patient", "/fhir/Observation"]);
        assert_eq!(all[0].record, earlier);
        assert_eq!(all[0].status, MutationStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_is_idempotent_per_id() {
        let db = setup().await;
        let store = LibSqlMutationStore::new(db.connection());

        let item = record("/fhir/Observation", 1_000);
        store.put(&item).await.unwrap();
        store.put(&item).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_items_leave_pending_count() {
        let db = setup().await;
        let store = LibSqlMutationStore::new(db.connection());

        let first = record("/fhir/Observation", 1_000);
        let second = record("/fhir/Observation", 2_000);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        store
            .record_failure(&first.id, 3, MutationStatus::Failed, "HTTP 422")
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let next = store.next_pending().await.unwrap().unwrap();
        assert_eq!(next.record.id, second.id);

        let failed = store.list_by_status(MutationStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("HTTP 422"));

        assert!(store.reset(&first.id).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 2);
        let reset = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(reset.attempts, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_and_clear() {
        let db = setup().await;
        let store = LibSqlMutationStore::new(db.connection());

        let first = record("/fhir/Observation", 1_000);
        store.put(&first).await.unwrap();
        store.put(&record("/fhir/Observation", 2_000)).await.unwrap();

        assert!(store.delete(&first.id).await.unwrap());
        assert!(!store.delete(&first.id).await.unwrap());
        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_failure_on_missing_item() {
        let db = setup().await;
        let store = LibSqlMutationStore::new(db.connection());

        let result = store
            .record_failure(&MutationId::new(), 1, MutationStatus::Pending, "timeout")
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
