//! Versioned resource and change-stream models

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(resourceType, id)` pair addressing one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub resource_type: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// Identifier of one stored revision, `"{versionId}-{uuid}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Mint a revision id for the given version number
    #[must_use]
    pub fn mint(version_id: i64) -> Self {
        Self(format!("{version_id}-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RevisionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RevisionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored document at a specific version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedResource {
    pub resource_type: String,
    pub id: String,
    /// Starts at 1, strictly increasing per document
    pub version_id: i64,
    /// Last update timestamp (Unix ms)
    pub last_updated: i64,
    pub revision_id: RevisionId,
    /// Full document body, `resourceType` and `id` included
    pub body: serde_json::Value,
}

impl VersionedResource {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.resource_type.clone(), self.id.clone())
    }

    /// Body with a FHIR-style `meta` block reflecting the stored version
    #[must_use]
    pub fn to_document(&self) -> serde_json::Value {
        let mut document = self.body.clone();
        if let Some(object) = document.as_object_mut() {
            let last_updated = chrono::DateTime::from_timestamp_millis(self.last_updated)
                .map(|timestamp| timestamp.to_rfc3339())
                .unwrap_or_default();
            object.insert(
                "meta".to_string(),
                serde_json::json!({
                    "versionId": self.version_id.to_string(),
                    "lastUpdated": last_updated,
                }),
            );
        }
        document
    }
}

/// One retained write of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    #[serde(flatten)]
    pub resource: VersionedResource,
    /// Version the writer derived this revision from
    pub parent_version: Option<i64>,
    /// Set on revisions that lost a concurrent edit
    #[serde(rename = "_conflictFlag", skip_serializing_if = "Option::is_none")]
    pub conflict_flag: Option<String>,
}

impl Revision {
    pub const fn is_stale(&self) -> bool {
        self.conflict_flag.is_some()
    }
}

/// What produced a change-stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A create or update applied to the document
    Write,
    /// A metadata-only stale tag on an existing revision
    ConflictTag,
}

impl ChangeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::ConflictTag => "conflict_tag",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "conflict_tag" {
            Self::ConflictTag
        } else {
            Self::Write
        }
    }
}

/// Entry of the append-only change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Position in the change log, assigned in acceptance order
    pub seq: i64,
    pub kind: ChangeKind,
    pub resource: VersionedResource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_display() {
        assert_eq!(DocumentKey::new("Patient", "42").to_string(), "Patient/42");
    }

    #[test]
    fn test_revision_id_carries_version_prefix() {
        let revision = RevisionId::mint(7);
        assert!(revision.as_str().starts_with("7-"));
        assert_ne!(revision, RevisionId::mint(7));
    }

    #[test]
    fn test_to_document_adds_meta() {
        let resource = VersionedResource {
            resource_type: "Patient".to_string(),
            id: "42".to_string(),
            version_id: 3,
            last_updated: 0,
            revision_id: RevisionId::from("3-abc"),
            body: serde_json::json!({"resourceType": "Patient", "id": "42"}),
        };
        let document = resource.to_document();
        assert_eq!(document["meta"]["versionId"], "3");
        assert_eq!(document["resourceType"], "Patient");
    }
}
