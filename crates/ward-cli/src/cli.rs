use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ward_core::models::HttpMethod;

#[derive(Parser)]
#[command(name = "ward")]
#[command(about = "Inspect and replay the offline clinical write queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue a write for later replay
    Enqueue {
        /// HTTP method of the write
        #[arg(value_enum)]
        method: MethodArg,
        /// Target URL, e.g. /fhir/Observation
        url: String,
        /// JSON body (stdin when omitted and piped)
        #[arg(long, value_name = "JSON", conflicts_with = "file")]
        body: Option<String>,
        /// Read the JSON body from a file
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
        /// Extra header as NAME:VALUE (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,
        /// Version the write is based on (sent as If-Match)
        #[arg(long, value_name = "VERSION")]
        if_match: Option<i64>,
    },
    /// Show queue depth and sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued writes
    List {
        /// Show dead-lettered items instead of pending ones
        #[arg(long)]
        failed: bool,
        /// Number of items to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay pending writes now
    Flush {
        /// Base URL of a ward-api server
        #[arg(long, env = "WARD_API_URL", value_name = "URL", conflicts_with = "local")]
        endpoint: Option<String>,
        /// Apply writes to the version store in the local database
        #[arg(long)]
        local: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a dead-lettered write back into the queue
    Retry {
        /// Mutation ID
        id: String,
    },
    /// Drop one queued write
    Discard {
        /// Mutation ID
        id: String,
    },
    /// Drop every queued write, pending or failed
    Clear {
        /// Confirm the operation
        #[arg(long)]
        yes: bool,
    },
    /// Check whether a ward-api server is reachable
    Probe {
        /// Base URL of a ward-api server
        #[arg(long, env = "WARD_API_URL", value_name = "URL")]
        endpoint: String,
    },
    /// Show recent audit entries from the local store
    Audit {
        /// Only entries for this record, e.g. Patient/42
        #[arg(long, value_name = "TYPE/ID")]
        target: Option<String>,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum MethodArg {
    Post,
    Put,
    Patch,
}

impl From<MethodArg> for HttpMethod {
    fn from(method: MethodArg) -> Self {
        match method {
            MethodArg::Post => Self::Post,
            MethodArg::Put => Self::Put,
            MethodArg::Patch => Self::Patch,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
