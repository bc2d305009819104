use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use ward_core::audit::{LibSqlAuditLog, SharedAuditLog};
use ward_core::config::SyncSettings;
use ward_core::db::{Database, SharedDatabase};
use ward_core::models::{AuditEntry, MutationId, QueuedMutation};
use ward_core::queue::{HttpWriteEndpoint, LocalWriteEndpoint, MutationQueue, WriteEndpoint};
use ward_core::store::VersionStore;
use ward_core::util::{clip, MAX_ERROR_CHARS};

use crate::error::CliError;

/// Where `ward flush` sends writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushTarget {
    Remote(String),
    Local,
}

impl FlushTarget {
    pub fn resolve(endpoint: Option<String>, local: bool) -> Result<Self, CliError> {
        if local {
            return Ok(Self::Local);
        }
        endpoint
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .map(Self::Remote)
            .ok_or(CliError::EndpointNotConfigured)
    }
}

/// Local database and the components built on it
pub struct Workspace {
    pub db: SharedDatabase,
    pub settings: SyncSettings,
}

impl Workspace {
    pub async fn open(db_path: &Path) -> Result<Self, CliError> {
        let settings = SyncSettings::from_env()?;
        let db = Database::open(db_path).await?.shared();
        Ok(Self { db, settings })
    }

    pub fn audit_log(&self) -> SharedAuditLog {
        Arc::new(LibSqlAuditLog::new(self.db.clone()))
    }

    pub fn local_store(&self) -> VersionStore {
        VersionStore::new(self.db.clone(), self.settings.channel_capacity)
            .with_audit(self.audit_log())
    }

    pub fn queue(&self, target: &FlushTarget) -> Result<MutationQueue, CliError> {
        let endpoint: Arc<dyn WriteEndpoint> = match target {
            FlushTarget::Remote(url) => Arc::new(HttpWriteEndpoint::new(url.clone())?),
            FlushTarget::Local => Arc::new(LocalWriteEndpoint::new(self.local_store())),
        };
        Ok(MutationQueue::new(
            self.db.clone(),
            endpoint,
            self.settings.clone(),
        ))
    }

    /// Queue handle for commands that never replay
    pub fn inspect_queue(&self) -> Result<MutationQueue, CliError> {
        self.queue(&FlushTarget::Local)
    }
}

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub method: String,
    pub url: String,
    pub status: String,
    pub attempts: u32,
    pub created_at: i64,
    pub relative_time: String,
    pub last_error: Option<String>,
    pub body: Value,
}

pub fn queue_item(item: &QueuedMutation, now_ms: i64) -> QueueItem {
    QueueItem {
        id: item.record.id.to_string(),
        method: item.record.method.as_str().to_string(),
        url: item.record.url.clone(),
        status: item.status.as_str().to_string(),
        attempts: item.attempts,
        created_at: item.record.created_at,
        relative_time: format_relative_time(item.record.created_at, now_ms),
        last_error: item.last_error.clone(),
        body: item.record.body.clone(),
    }
}

pub fn format_queue_lines(items: &[QueuedMutation], now_ms: i64) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let mut line = format!(
                "{}  {:<5} {}  ({}, {} attempt{})",
                item.record.id,
                item.record.method.as_str(),
                item.record.url,
                format_relative_time(item.record.created_at, now_ms),
                item.attempts,
                if item.attempts == 1 { "" } else { "s" },
            );
            if let Some(error) = &item.last_error {
                line.push_str("\n    last error: ");
                line.push_str(&clip(error, MAX_ERROR_CHARS));
            }
            line
        })
        .collect()
}

pub fn format_audit_lines(entries: &[AuditEntry], now_ms: i64) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let outcome = if entry.allowed { "" } else { " (denied)" };
            format!(
                "{:>8}  {} {} {}{}",
                format_relative_time(entry.timestamp, now_ms),
                entry.event,
                entry.action,
                entry.target_id,
                outcome
            )
        })
        .collect()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

/// Split `NAME:VALUE`
pub fn parse_header(raw: &str) -> Result<(String, String), CliError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| CliError::InvalidHeader(raw.to_string()))?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(CliError::InvalidHeader(raw.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub fn parse_mutation_id(raw: &str) -> Result<MutationId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidMutationId(raw.to_string()))
}

/// Body from `--body`, `--file`, or piped stdin, in that order
pub fn resolve_body(body: Option<String>, file: Option<&Path>) -> Result<Value, CliError> {
    let raw = if let Some(body) = body {
        Some(body)
    } else if let Some(path) = file {
        Some(std::fs::read_to_string(path)?)
    } else {
        read_piped_stdin()?
    };
    let raw = raw
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or(CliError::EmptyBody)?;
    Ok(serde_json::from_str(&raw)?)
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut buffer = String::new();
    stdin.read_to_string(&mut buffer)?;
    Ok(Some(buffer))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("WARD_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ward")
        .join("ward.db")
}
