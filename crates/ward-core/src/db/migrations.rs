//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// One schema step; `statements` run in a single transaction
struct Migration {
    version: i32,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "mutation queue",
        statements: &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS mutation_queue (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                method TEXT NOT NULL,
                body TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_mutation_queue_order
                ON mutation_queue(status, created_at)",
        ],
    },
    Migration {
        version: 2,
        name: "versioned resources",
        statements: &[
            "CREATE TABLE IF NOT EXISTS resources (
                resource_type TEXT NOT NULL,
                id TEXT NOT NULL,
                version_id INTEGER NOT NULL,
                last_updated INTEGER NOT NULL,
                revision_id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (resource_type, id)
            )",
            "CREATE TABLE IF NOT EXISTS revisions (
                revision_id TEXT PRIMARY KEY,
                resource_type TEXT NOT NULL,
                id TEXT NOT NULL,
                version_id INTEGER NOT NULL,
                parent_version INTEGER,
                last_updated INTEGER NOT NULL,
                body TEXT NOT NULL,
                conflict_flag TEXT,
                UNIQUE (resource_type, id, version_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_revisions_parent
                ON revisions(resource_type, id, parent_version)",
            "CREATE TABLE IF NOT EXISTS change_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                revision_id TEXT NOT NULL REFERENCES revisions(revision_id),
                recorded_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                revision_id TEXT NOT NULL REFERENCES revisions(revision_id),
                created_at INTEGER NOT NULL
            )",
        ],
    },
    Migration {
        version: 3,
        name: "audit log",
        statements: &[
            "CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                action TEXT NOT NULL,
                target_id TEXT NOT NULL,
                allowed INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                meta TEXT NOT NULL DEFAULT 'null'
            )",
            "CREATE INDEX IF NOT EXISTS idx_audit_log_target ON audit_log(target_id, seq DESC)",
        ],
    },
];

/// Highest version in [`MIGRATIONS`]
fn latest_version() -> i32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Bring the schema up to [`latest_version`]
pub async fn run(conn: &Connection) -> Result<()> {
    let applied = schema_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        apply(conn, migration).await?;
    }
    Ok(())
}

async fn schema_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            (),
        )
        .await?;
    let has_table = match rows.next().await? {
        Some(row) => row.get::<i64>(0)? > 0,
        None => false,
    };
    if !has_table {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM schema_version", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    let outcome = apply_statements(conn, migration).await;
    match outcome {
        Ok(()) => conn.execute("COMMIT", ()).await.map(|_| ())?,
        Err(error) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(error);
        }
    }
    tracing::info!(
        version = migration.version,
        "Applied schema migration: {}",
        migration.name
    );
    Ok(())
}

async fn apply_statements(conn: &Connection, migration: &Migration) -> Result<()> {
    for statement in migration.statements {
        conn.execute(statement, ()).await?;
    }
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [migration.version],
    )
    .await?;
    Ok(())
}
