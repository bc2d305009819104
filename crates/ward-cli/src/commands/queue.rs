use std::path::Path;

use crate::commands::common::{parse_mutation_id, Workspace};
use crate::error::CliError;

pub async fn run_retry(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id = parse_mutation_id(id)?;
    let workspace = Workspace::open(db_path).await?;
    workspace.inspect_queue()?.retry_failed(&id).await?;
    println!("Requeued {id}");
    Ok(())
}

pub async fn run_discard(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id = parse_mutation_id(id)?;
    let workspace = Workspace::open(db_path).await?;
    workspace.inspect_queue()?.discard(&id).await?;
    println!("Discarded {id}");
    Ok(())
}

pub async fn run_clear(confirmed: bool, db_path: &Path) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ClearNotConfirmed);
    }
    let workspace = Workspace::open(db_path).await?;
    let removed = workspace.inspect_queue()?.clear().await?;
    println!("Removed {removed} queued write(s)");
    Ok(())
}
