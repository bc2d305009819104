//! Write endpoints a queued mutation can be replayed against

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::{Error, Result};
use crate::models::{HttpMethod, MutationRecord};
use crate::store::route::{self, IDEMPOTENCY_KEY_HEADER};
use crate::store::VersionStore;
use crate::util::{clip, is_absolute_url, parse_base_url, MAX_ERROR_CHARS};

const ENDPOINT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Raw outcome of one replay attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResponse {
    pub status: u16,
    pub body: String,
}

impl EndpointResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// How the queue treats an endpoint status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The write is on the server (2xx, or an idempotent-conflict signal)
    Applied,
    /// Worth retrying later
    Transient,
    /// Will never succeed as written
    Permanent,
}

/// Classify an HTTP status for replay purposes.
///
/// 409 and 412 mean the server already holds this write.
pub const fn classify(status: u16) -> ReplayOutcome {
    match status {
        200..=299 | 409 | 412 => ReplayOutcome::Applied,
        408 | 429 => ReplayOutcome::Transient,
        400..=499 => ReplayOutcome::Permanent,
        _ => ReplayOutcome::Transient,
    }
}

/// Something that accepts replayed writes.
///
/// Transport failures are returned as `Err`; every HTTP answer, including
/// error statuses, is an `Ok(EndpointResponse)`.
#[async_trait]
pub trait WriteEndpoint: Send + Sync {
    async fn send(&self, record: &MutationRecord) -> Result<EndpointResponse>;
}

/// Replays writes to a remote ward-api over HTTP
#[derive(Clone)]
pub struct HttpWriteEndpoint {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWriteEndpoint {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = parse_base_url(&base_url.into(), "endpoint URL")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ENDPOINT_HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url,
            client,
        })
    }

    /// Absolute URL for a record; relative URLs resolve against the base
    pub fn resolve(&self, url: &str) -> String {
        if is_absolute_url(url) {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

const fn reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
    }
}

#[async_trait]
impl WriteEndpoint for HttpWriteEndpoint {
    async fn send(&self, record: &MutationRecord) -> Result<EndpointResponse> {
        let url = self.resolve(&record.url);
        let mut request = self
            .client
            .request(reqwest_method(record.method), &url)
            .header("Accept", "application/json");
        for (name, value) in &record.headers {
            if !name.eq_ignore_ascii_case(IDEMPOTENCY_KEY_HEADER) {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        let request = request
            .header(IDEMPOTENCY_KEY_HEADER, record.id.to_string())
            .json(&record.body);

        let response = request
            .send()
            .await
            .map_err(|error| Error::NetworkTransient(format!("{url}: {error}")))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(EndpointResponse::new(status, clip(&body, MAX_ERROR_CHARS)))
    }
}

/// Applies writes directly to an in-process version store
#[derive(Clone)]
pub struct LocalWriteEndpoint {
    store: VersionStore,
}

impl LocalWriteEndpoint {
    pub const fn new(store: VersionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WriteEndpoint for LocalWriteEndpoint {
    async fn send(&self, record: &MutationRecord) -> Result<EndpointResponse> {
        match route::apply_write(&self.store, route::WriteRequest::from_record(record)).await {
            Ok(result) => {
                let status = if result.created { 201 } else { 200 };
                let body = serde_json::to_string(&result.resource.to_document())?;
                Ok(EndpointResponse::new(status, body))
            }
            Err(error) => Ok(EndpointResponse::new(
                route::error_status(&error),
                route::error_body(&error).to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMutation;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn classify_statuses() {
        assert_eq!(classify(200), ReplayOutcome::Applied);
        assert_eq!(classify(201), ReplayOutcome::Applied);
        assert_eq!(classify(409), ReplayOutcome::Applied);
        assert_eq!(classify(412), ReplayOutcome::Applied);
        assert_eq!(classify(408), ReplayOutcome::Transient);
        assert_eq!(classify(429), ReplayOutcome::Transient);
        assert_eq!(classify(500), ReplayOutcome::Transient);
        assert_eq!(classify(503), ReplayOutcome::Transient);
        assert_eq!(classify(400), ReplayOutcome::Permanent);
        assert_eq!(classify(404), ReplayOutcome::Permanent);
        assert_eq!(classify(422), ReplayOutcome::Permanent);
    }

    #[test]
    fn http_endpoint_validates_and_resolves_urls() {
        assert!(HttpWriteEndpoint::new("").is_err());
        assert!(HttpWriteEndpoint::new("localhost:8080").is_err());

        let endpoint = HttpWriteEndpoint::new("http://localhost:8080/").unwrap();
        assert_eq!(
            endpoint.resolve("/fhir/Observation"),
            "http://localhost:8080/fhir/Observation"
        );
        assert_eq!(
            endpoint.resolve("https://ehr.example/fhir/Patient/1"),
            "https://ehr.example/fhir/Patient/1"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_endpoint_applies_and_maps_errors() {
        let store = VersionStore::open_in_memory().await.unwrap();
        let endpoint = LocalWriteEndpoint::new(store.clone());

        let create = MutationRecord::from_new(NewMutation::new(
            HttpMethod::Post,
            "/fhir/Observation",
            json!({"resourceType": "Observation", "status": "final"}),
        ));
        let response = endpoint.send(&create).await.unwrap();
        assert_eq!(response.status, 201);

        let replay = endpoint.send(&create).await.unwrap();
        assert_eq!(classify(replay.status), ReplayOutcome::Applied);

        let missing = MutationRecord::from_new(NewMutation::new(
            HttpMethod::Put,
            "/fhir/Patient/does-not-exist",
            json!({"resourceType": "Patient"}),
        ));
        let response = endpoint.send(&missing).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(classify(response.status), ReplayOutcome::Permanent);

        let mismatched = MutationRecord::from_new(NewMutation::new(
            HttpMethod::Post,
            "/fhir/Observation",
            json!({"resourceType": "Patient"}),
        ));
        assert_eq!(endpoint.send(&mismatched).await.unwrap().status, 400);
    }
}
