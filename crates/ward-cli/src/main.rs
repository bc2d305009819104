//! Ward CLI - inspect and replay the offline clinical write queue
//!
//! Operates on the same local database a client uses, so queued writes can
//! be examined, requeued, discarded or flushed by hand.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::audit::run_audit;
use crate::commands::common::{resolve_db_path, FlushTarget};
use crate::commands::completions::run_completions;
use crate::commands::enqueue::{run_enqueue, EnqueueArgs};
use crate::commands::flush::run_flush;
use crate::commands::list::run_list;
use crate::commands::probe::run_probe;
use crate::commands::queue::{run_clear, run_discard, run_retry};
use crate::commands::status::run_status;
use crate::error::CliError;

/// Exit code for `ward probe` when the server is unreachable
const EXIT_OFFLINE: i32 = 2;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("Error: {error}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32, CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "ward=info"
                    .parse()
                    .map_err(|error| CliError::Config(format!("{error}")))?,
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Enqueue {
            method,
            url,
            body,
            file,
            headers,
            if_match,
        } => {
            let args = EnqueueArgs {
                method,
                url,
                body,
                file,
                headers,
                if_match,
            };
            run_enqueue(args, &db_path).await?;
        }
        Commands::Status { json } => run_status(json, &db_path).await?,
        Commands::List {
            failed,
            limit,
            json,
        } => run_list(failed, limit, json, &db_path).await?,
        Commands::Flush {
            endpoint,
            local,
            json,
        } => {
            let target = FlushTarget::resolve(endpoint, local)?;
            run_flush(target, json, &db_path).await?;
        }
        Commands::Retry { id } => run_retry(&id, &db_path).await?,
        Commands::Discard { id } => run_discard(&id, &db_path).await?,
        Commands::Clear { yes } => run_clear(yes, &db_path).await?,
        Commands::Probe { endpoint } => {
            if !run_probe(&endpoint).await? {
                return Ok(EXIT_OFFLINE);
            }
        }
        Commands::Audit {
            target,
            limit,
            json,
        } => run_audit(target, limit, json, &db_path).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(0)
}
