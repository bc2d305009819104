//! libSQL connection setup

use std::path::Path;
use std::sync::Arc;

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use tokio::sync::Mutex;

use super::migrations;
use crate::error::Result;

/// Database handle shared between components that live in one process.
///
/// Writers hold the lock for the whole of a logical write so that
/// read-check-write sequences are atomic with respect to each other.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Owns the libSQL handle and its single connection
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

const MEMORY_PATH: &str = ":memory:";

impl Database {
    /// Open (or create) the pipeline database at `path` and migrate it
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let database = Self::build(&path.to_string_lossy()).await?;
        tracing::debug!(path = %path.display(), "Pipeline database ready");
        Ok(database)
    }

    /// Throwaway database, gone when dropped
    pub async fn open_in_memory() -> Result<Self> {
        Self::build(MEMORY_PATH).await
    }

    async fn build(location: &str) -> Result<Self> {
        let db = Builder::new_local(location).build().await?;
        let conn = db.connect()?;
        let database = Self { _db: db, conn };
        database.apply_pragmas(location == MEMORY_PATH).await?;
        migrations::run(&database.conn).await?;
        Ok(database)
    }

    pub fn shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Queue durability needs every commit on disk before `enqueue` returns
    async fn apply_pragmas(&self, in_memory: bool) -> Result<()> {
        if !in_memory {
            self.conn.query("PRAGMA journal_mode = WAL", ()).await?;
        }
        self.conn.execute("PRAGMA synchronous = FULL", ()).await?;
        self.conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        Ok(())
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    async fn pragma_row(db: &Database, name: &str) -> libsql::Row {
        let mut rows = db
            .connection()
            .query(&format!("PRAGMA {name}"), ())
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_database_enforces_foreign_keys() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(pragma_row(&db, "foreign_keys").await.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_database_uses_wal_in_nested_directory() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("device").join("ward.db");
        let db = Database::open(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(
            pragma_row(&db, "journal_mode").await.get::<String>(0).unwrap(),
            "wal"
        );
    }
}
