use std::path::Path;

use serde::Serialize;
use ward_core::models::ConnectivityState;
use ward_core::state::SyncState;

use crate::commands::common::Workspace;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct StatusReport {
    db_path: String,
    pending: usize,
    failed: usize,
    state: String,
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let workspace = Workspace::open(db_path).await?;
    let queue = workspace.inspect_queue()?;
    let pending = queue.count().await?;
    let failed = queue.list_failed().await?.len();
    // The CLI has no connectivity signal of its own; report queue health
    let state = SyncState::derive(&ConnectivityState::online(), pending, failed);

    let report = StatusReport {
        db_path: db_path.display().to_string(),
        pending,
        failed,
        state: format!("{state:?}").to_lowercase(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Database: {}", report.db_path);
        println!("Pending:  {}", report.pending);
        println!("Failed:   {}", report.failed);
        println!("State:    {}", report.state);
    }
    Ok(())
}
