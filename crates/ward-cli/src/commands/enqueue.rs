use std::path::Path;

use ward_core::models::NewMutation;
use ward_core::store::route::IF_MATCH_HEADER;

use crate::cli::MethodArg;
use crate::commands::common::{parse_header, resolve_body, Workspace};
use crate::error::CliError;

pub struct EnqueueArgs {
    pub method: MethodArg,
    pub url: String,
    pub body: Option<String>,
    pub file: Option<std::path::PathBuf>,
    pub headers: Vec<String>,
    pub if_match: Option<i64>,
}

pub fn build_mutation(args: EnqueueArgs) -> Result<NewMutation, CliError> {
    let body = resolve_body(args.body, args.file.as_deref())?;
    let mut mutation = NewMutation::new(args.method.into(), args.url.trim(), body);
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        mutation = mutation.with_header(name, value);
    }
    if let Some(version) = args.if_match {
        mutation = mutation.with_header(IF_MATCH_HEADER, format!("W/\"{version}\""));
    }
    Ok(mutation)
}

pub async fn run_enqueue(args: EnqueueArgs, db_path: &Path) -> Result<(), CliError> {
    let mutation = build_mutation(args)?;
    let workspace = Workspace::open(db_path).await?;
    let record = workspace.inspect_queue()?.enqueue(mutation).await?;
    println!("{}", record.id);
    Ok(())
}
