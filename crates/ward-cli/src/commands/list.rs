use std::path::Path;

use ward_core::util::unix_millis_now;

use crate::commands::common::{format_queue_lines, queue_item, QueueItem, Workspace};
use crate::error::CliError;

pub async fn run_list(
    failed: bool,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let workspace = Workspace::open(db_path).await?;
    let queue = workspace.inspect_queue()?;
    let mut items = if failed {
        queue.list_failed().await?
    } else {
        queue.list_pending().await?
    };
    items.truncate(limit);

    let now = unix_millis_now();
    if as_json {
        let json_items = items
            .iter()
            .map(|item| queue_item(item, now))
            .collect::<Vec<QueueItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!(
            "No {} writes.",
            if failed { "failed" } else { "pending" }
        );
        return Ok(());
    }

    for line in format_queue_lines(&items, now) {
        println!("{line}");
    }
    Ok(())
}
