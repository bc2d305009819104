//! Connectivity probes for platforms without push notifications

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::util::parse_base_url;

const PROBE_HTTP_TIMEOUT_SECS: u64 = 4;

/// Explicit boolean connectivity check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `true` when the write endpoint is reachable
    async fn probe(&self) -> bool;
}

/// Probe that GETs a health URL and treats any 2xx as online
#[derive(Clone)]
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = parse_base_url(&url.into(), "probe URL")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROBE_HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { url, client })
    }

    /// Probe the API server's health route under `base_url`
    pub fn for_api(base_url: &str) -> Result<Self> {
        Self::new(format!("{}/healthz", parse_base_url(base_url, "API URL")?))
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!(url = %self.url, %error, "Connectivity probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_probe_requires_scheme() {
        assert!(HttpProbe::new("  ").is_err());
        assert!(HttpProbe::new("ward.example.com/healthz").is_err());
        assert!(HttpProbe::for_api("https://ward.example.com/").is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_host_reports_offline() {
        let probe = HttpProbe::new("http://127.0.0.1:9/healthz").unwrap();
        assert!(!probe.probe().await);
    }
}
