use std::path::Path;

use serde::Serialize;
use ward_core::queue::FlushReport;

use crate::commands::common::{FlushTarget, Workspace};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct FlushSummary {
    replayed: usize,
    failed: usize,
    remaining: usize,
    halted_on: Option<String>,
    reason: Option<String>,
    retry_after_ms: Option<u128>,
}

fn summarize(report: &FlushReport, remaining: usize) -> FlushSummary {
    FlushSummary {
        replayed: report.replayed,
        failed: report.failed,
        remaining,
        halted_on: report.halted.as_ref().map(|halt| halt.id.to_string()),
        reason: report.halted.as_ref().map(|halt| halt.reason.clone()),
        retry_after_ms: report
            .halted
            .as_ref()
            .map(|halt| halt.retry_after.as_millis()),
    }
}

pub async fn run_flush(target: FlushTarget, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let workspace = Workspace::open(db_path).await?;
    let queue = workspace.queue(&target)?;
    tracing::debug!(?target, "Flushing queue");

    let report = queue.flush().await?;
    let summary = summarize(&report, queue.count().await?);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "Replayed {}, failed {}, {} still pending",
        summary.replayed, summary.failed, summary.remaining
    );
    if let (Some(id), Some(reason), Some(retry_after_ms)) =
        (&summary.halted_on, &summary.reason, summary.retry_after_ms)
    {
        println!("Halted on {id}: {reason}");
        println!("Retry in {retry_after_ms}ms");
    }
    Ok(())
}
