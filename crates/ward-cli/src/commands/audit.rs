use std::path::Path;

use ward_core::audit::AuditQuery;
use ward_core::util::unix_millis_now;

use crate::commands::common::{format_audit_lines, Workspace};
use crate::error::CliError;

pub async fn run_audit(
    target: Option<String>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let workspace = Workspace::open(db_path).await?;
    let query = AuditQuery {
        target_id: target,
        limit: limit.max(1),
    };
    let entries = workspace.audit_log().recent(&query).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No audit entries recorded.");
        return Ok(());
    }
    for line in format_audit_lines(&entries, unix_millis_now()) {
        println!("{line}");
    }
    Ok(())
}
