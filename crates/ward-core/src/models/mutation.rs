//! Queued mutation model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// A unique identifier for a queued mutation, using UUID v7 (time-sortable).
///
/// The id doubles as the idempotency key sent with every replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Create a new unique mutation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Write verbs a mutation can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Create a resource
    Post,
    /// Replace a resource body
    Put,
    /// Merge-patch a resource body
    Patch,
}

impl HttpMethod {
    /// Canonical upper-case verb
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            other => Err(Error::InvalidInput(format!(
                "unsupported mutation method: {other}"
            ))),
        }
    }
}

/// Caller-supplied part of a mutation; the queue assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMutation {
    pub method: HttpMethod,
    pub url: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl NewMutation {
    pub fn new(method: HttpMethod, url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method,
            url: url.into(),
            body,
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A write captured for later replay. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Unique identifier, also the idempotency key
    pub id: MutationId,
    /// Target resource path, e.g. `/fhir/Observation`
    pub url: String,
    /// Write verb
    pub method: HttpMethod,
    /// JSON payload
    pub body: serde_json::Value,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl MutationRecord {
    /// Stamp a caller-supplied mutation with a fresh id and creation time
    #[must_use]
    pub fn from_new(mutation: NewMutation) -> Self {
        Self {
            id: MutationId::new(),
            url: mutation.url,
            method: mutation.method,
            body: mutation.body,
            headers: mutation.headers,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Queue lifecycle of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Waiting for replay
    Pending,
    /// Terminal; needs manual intervention
    Failed,
}

impl MutationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("failed") {
            Self::Failed
        } else {
            Self::Pending
        }
    }
}

/// A mutation together with its queue bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub record: MutationRecord,
    pub status: MutationStatus,
    /// Replay attempts that ended in a transient failure
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_id_parse() {
        let id = MutationId::new();
        let parsed: MutationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_mutation_ids_sort_by_creation() {
        let first = MutationId::new();
        let second = MutationId::new();
        assert!(first < second);
    }

    #[test]
    fn test_method_parse_is_case_insensitive() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!(" Patch ".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("DELETE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_from_new_assigns_id_and_timestamp() {
        let record = MutationRecord::from_new(
            NewMutation::new(
                HttpMethod::Post,
                "/fhir/Observation",
                serde_json::json!({"resourceType": "Observation"}),
            )
            .with_header("Content-Type", "application/fhir+json"),
        );
        assert!(record.created_at > 0);
        assert_eq!(record.header("content-type"), Some("application/fhir+json"));
    }
}
