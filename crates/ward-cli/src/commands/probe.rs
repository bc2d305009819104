use ward_core::network::{ConnectivityProbe, HttpProbe};

use crate::error::CliError;

pub async fn run_probe(endpoint: &str) -> Result<bool, CliError> {
    let probe = HttpProbe::for_api(endpoint)?;
    let online = probe.probe().await;
    println!("{}", if online { "online" } else { "offline" });
    Ok(online)
}
