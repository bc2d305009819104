//! Write-endpoint routing shared by the HTTP server and in-process replay.

use serde_json::Value;

use super::{UpdateBody, VersionStore, WriteOptions};
use crate::error::{Error, Result};
use crate::models::{HttpMethod, MutationRecord, VersionedResource};

/// Header carrying the idempotency token on replayed writes
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
/// Header carrying the version the writer last observed
pub const IF_MATCH_HEADER: &str = "If-Match";

/// A write as received by the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Value,
    pub idempotency_key: Option<String>,
    pub observed_version: Option<i64>,
}

impl WriteRequest {
    /// Build the request a queued mutation replays as.
    ///
    /// The record id is always the idempotency key.
    pub fn from_record(record: &MutationRecord) -> Self {
        Self {
            method: record.method,
            url: record.url.clone(),
            body: record.body.clone(),
            idempotency_key: Some(record.id.to_string()),
            observed_version: record.header(IF_MATCH_HEADER).and_then(parse_version_tag),
        }
    }
}

/// Outcome of an applied write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub resource: VersionedResource,
    /// Whether the write produced the document's first version
    pub created: bool,
}

/// Resource type and optional id addressed by a write URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub resource_type: String,
    pub id: Option<String>,
}

/// Parse `/fhir/{type}` or `/fhir/{type}/{id}`; absolute URLs and a
/// missing `fhir` prefix are accepted.
pub fn parse_target(url: &str) -> Result<WriteTarget> {
    let without_scheme = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest.find('/').map_or("", |index| &rest[index..]));
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let mut segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    if segments.first() == Some(&"fhir") {
        segments.remove(0);
    }

    match segments.as_slice() {
        [resource_type] => Ok(WriteTarget {
            resource_type: (*resource_type).to_string(),
            id: None,
        }),
        [resource_type, id] => Ok(WriteTarget {
            resource_type: (*resource_type).to_string(),
            id: Some((*id).to_string()),
        }),
        _ => Err(Error::InvalidInput(format!("unsupported write target: {url}"))),
    }
}

/// Parse an `If-Match` style version tag: `W/"3"`, `"3"` or `3`
pub fn parse_version_tag(value: &str) -> Option<i64> {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    value.trim_matches('"').parse().ok()
}

/// Apply a write request to the store
pub async fn apply_write(store: &VersionStore, request: WriteRequest) -> Result<WriteResult> {
    let target = parse_target(&request.url)?;
    let options = WriteOptions {
        idempotency_key: request.idempotency_key,
        observed_version: request.observed_version,
    };

    let resource = match (request.method, target.id) {
        (HttpMethod::Post, None) => {
            store
                .create(&target.resource_type, request.body, options)
                .await?
        }
        (HttpMethod::Put, Some(id)) => {
            store
                .update(
                    &target.resource_type,
                    &id,
                    UpdateBody::Replace(request.body),
                    options,
                )
                .await?
        }
        (HttpMethod::Patch, Some(id)) => {
            store
                .update(
                    &target.resource_type,
                    &id,
                    UpdateBody::MergePatch(request.body),
                    options,
                )
                .await?
        }
        (method, _) => {
            return Err(Error::InvalidInput(format!(
                "{method} is not supported for {}",
                request.url
            )))
        }
    };

    Ok(WriteResult {
        created: resource.version_id == 1,
        resource,
    })
}

/// HTTP status a store error maps to
pub const fn error_status(error: &Error) -> u16 {
    match error {
        Error::InvalidResource(_) | Error::InvalidInput(_) => 400,
        Error::NotFound(_) => 404,
        _ => 503,
    }
}

/// `{error, details}` body for a store error
pub fn error_body(error: &Error) -> Value {
    let kind = match error {
        Error::InvalidResource(_) => "invalid_resource",
        Error::InvalidInput(_) => "invalid_request",
        Error::NotFound(_) => "not_found",
        _ => "storage_unavailable",
    };
    serde_json::json!({
        "error": kind,
        "details": error.to_string(),
    })
}
