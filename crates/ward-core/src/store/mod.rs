//! Resource version store.
//!
//! The authoritative record store every replayed mutation lands in. Each
//! accepted write becomes a new retained revision with the next `versionId`
//! for its document, the document head moves to that revision, and one entry
//! is appended to the change stream.
//!
//! Writers may say which version they last observed. A mismatch is *not*
//! rejected: the store applies last-writer-wins and records the observed
//! version as the revision's parent, which is what lets the conflict watcher
//! find concurrent leaves afterwards and flag them for review.

mod patch;
pub mod route;

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::audit::{self, SharedAuditLog};
use crate::db::{Database, LibSqlResourceRepository, SharedDatabase};
use crate::error::{Error, Result};
use crate::models::{
    AuditEntry, ChangeEntry, ChangeKind, DocumentKey, Revision, RevisionId, VersionedResource,
    CONFLICT_FLAG_UPDATED_ON_DEVICE,
};
use crate::util::unix_millis_now;

pub use patch::merge_patch;
pub use route::{apply_write, WriteRequest, WriteResult};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// New body for an existing document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateBody {
    /// Replace the whole body
    Replace(Value),
    /// RFC 7386 merge patch against the current head
    MergePatch(Value),
}

/// Per-write options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Token identifying the logical write; repeats return the first result
    pub idempotency_key: Option<String>,
    /// `versionId` the writer based this change on
    pub observed_version: Option<i64>,
}

impl WriteOptions {
    pub fn idempotent(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            observed_version: None,
        }
    }

    #[must_use]
    pub const fn observed(mut self, version_id: i64) -> Self {
        self.observed_version = Some(version_id);
        self
    }
}

enum WriteOp {
    Create(Value),
    Update(UpdateBody),
}

/// Versioned document store with an append-only change stream
#[derive(Clone)]
pub struct VersionStore {
    db: SharedDatabase,
    changes: broadcast::Sender<ChangeEntry>,
    audit: Option<SharedAuditLog>,
}

impl VersionStore {
    /// Create a store over a shared database
    pub fn new(db: SharedDatabase, channel_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            db,
            changes,
            audit: None,
        }
    }

    /// Open a store over a fresh in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::new(db.shared(), DEFAULT_CHANNEL_CAPACITY))
    }

    /// Attach an audit sink for writes and conflict tags
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Live change stream; entries arrive in acceptance order
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEntry> {
        self.changes.subscribe()
    }

    /// Create a document. A body `id` is honoured; otherwise one is assigned.
    ///
    /// Creating an id that already exists behaves as a full replacement of
    /// the current head.
    pub async fn create(
        &self,
        resource_type: &str,
        body: Value,
        options: WriteOptions,
    ) -> Result<VersionedResource> {
        validate_resource_type(resource_type)?;
        let id = match body.get("id") {
            None | Some(Value::Null) => Uuid::now_v7().to_string(),
            Some(Value::String(id)) if is_valid_id(id) => id.clone(),
            Some(_) => {
                return Err(Error::InvalidResource(
                    "id must be a non-empty string of [A-Za-z0-9-.]".to_string(),
                ))
            }
        };
        let key = DocumentKey::new(resource_type, id);
        self.write(key, WriteOp::Create(body), options).await
    }

    /// Update an existing document; `NotFound` if it was never created
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        body: UpdateBody,
        options: WriteOptions,
    ) -> Result<VersionedResource> {
        validate_resource_type(resource_type)?;
        if !is_valid_id(id) {
            return Err(Error::InvalidResource(format!("invalid resource id: {id}")));
        }
        let key = DocumentKey::new(resource_type, id);
        self.write(key, WriteOp::Update(body), options).await
    }

    /// Current head of a document
    pub async fn get(&self, resource_type: &str, id: &str) -> Result<VersionedResource> {
        let key = DocumentKey::new(resource_type, id);
        let db = self.db.lock().await;
        LibSqlResourceRepository::new(db.connection())
            .head(&key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Every retained revision of a document, oldest first
    pub async fn history(&self, key: &DocumentKey) -> Result<Vec<Revision>> {
        let db = self.db.lock().await;
        let history = LibSqlResourceRepository::new(db.connection())
            .history(key)
            .await?;
        if history.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(history)
    }

    /// Concurrent leaf revisions that are not yet tagged stale
    pub async fn leaf_revisions(&self, key: &DocumentKey) -> Result<Vec<Revision>> {
        let db = self.db.lock().await;
        LibSqlResourceRepository::new(db.connection())
            .leaves(key)
            .await
    }

    /// Persisted change-log entries after `after_seq`
    pub async fn changes_since(&self, after_seq: i64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let db = self.db.lock().await;
        LibSqlResourceRepository::new(db.connection())
            .changes_since(after_seq, limit)
            .await
    }

    /// Mark a revision as having lost a concurrent edit.
    ///
    /// Metadata only: `versionId` is untouched and the change-stream entry
    /// is of kind [`ChangeKind::ConflictTag`]. Returns `false` when the
    /// revision was already tagged.
    pub async fn tag_stale(&self, key: &DocumentKey, revision_id: &RevisionId) -> Result<bool> {
        let tagged = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let repo = LibSqlResourceRepository::new(conn);

            let revision = repo
                .revision(revision_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("revision {revision_id}")))?;
            if revision.resource.key() != *key {
                return Err(Error::InvalidInput(format!(
                    "revision {revision_id} does not belong to {key}"
                )));
            }

            conn.execute("BEGIN IMMEDIATE", ()).await?;
            let seq = match Self::persist_tag(&repo, revision_id).await {
                Ok(seq) => seq,
                Err(error) => {
                    conn.execute("ROLLBACK", ()).await.ok();
                    return Err(error);
                }
            };
            if let Err(error) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(error.into());
            }

            if let Some(seq) = seq {
                let _ = self.changes.send(ChangeEntry {
                    seq,
                    kind: ChangeKind::ConflictTag,
                    resource: revision.resource.clone(),
                });
                Some(revision.resource)
            } else {
                None
            }
        };

        let Some(resource) = tagged else {
            return Ok(false);
        };
        tracing::info!(
            document = %key,
            revision = %revision_id,
            version_id = resource.version_id,
            "Tagged revision as stale"
        );
        audit::record(
            self.audit.as_ref(),
            AuditEntry::new("conflict.tag", "mark_stale", key.to_string()).with_meta(
                serde_json::json!({
                    "revisionId": revision_id,
                    "versionId": resource.version_id,
                    "flag": CONFLICT_FLAG_UPDATED_ON_DEVICE,
                }),
            ),
        )
        .await;
        Ok(true)
    }

    async fn persist_tag(
        repo: &LibSqlResourceRepository<'_>,
        revision_id: &RevisionId,
    ) -> Result<Option<i64>> {
        if !repo
            .set_conflict_flag(revision_id, CONFLICT_FLAG_UPDATED_ON_DEVICE)
            .await?
        {
            return Ok(None);
        }
        let seq = repo
            .append_change(ChangeKind::ConflictTag, revision_id, unix_millis_now())
            .await?;
        Ok(Some(seq))
    }

    /// Apply a write; rejections of a well-formed key are audited as denied
    async fn write(
        &self,
        key: DocumentKey,
        op: WriteOp,
        options: WriteOptions,
    ) -> Result<VersionedResource> {
        let action = match op {
            WriteOp::Create(_) => "create",
            WriteOp::Update(_) => "update",
        };
        let result = self.commit_write(key.clone(), op, options).await;
        if let Err(error) = &result {
            if error.is_permanent() {
                tracing::debug!(document = %key, "Rejected write: {error}");
                audit::record(
                    self.audit.as_ref(),
                    AuditEntry::new("resource.write", action, key.to_string())
                        .denied()
                        .with_meta(serde_json::json!({ "reason": error.to_string() })),
                )
                .await;
            }
        }
        result
    }

    async fn commit_write(
        &self,
        key: DocumentKey,
        op: WriteOp,
        options: WriteOptions,
    ) -> Result<VersionedResource> {
        let (resource, parent_version, created) = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let repo = LibSqlResourceRepository::new(conn);

            if let Some(token) = options.idempotency_key.as_deref() {
                if let Some(previous) = repo.revision_for_idempotency_key(token).await? {
                    tracing::debug!(
                        document = %previous.resource.key(),
                        idempotency_key = token,
                        version_id = previous.resource.version_id,
                        "Idempotent replay; returning previously applied revision"
                    );
                    return Ok(previous.resource);
                }
            }

            let head = repo.head(&key).await?;
            let body = match (op, head.as_ref()) {
                (WriteOp::Create(body) | WriteOp::Update(UpdateBody::Replace(body)), Some(_))
                | (WriteOp::Create(body), None) => prepare_body(&key, body)?,
                (WriteOp::Update(UpdateBody::MergePatch(patch)), Some(head)) => {
                    let mut body = head.body.clone();
                    merge_patch(&mut body, &patch);
                    prepare_body(&key, body)?
                }
                (WriteOp::Update(_), None) => return Err(Error::NotFound(key.to_string())),
            };

            let now = unix_millis_now();
            let (version_id, parent_version, last_updated) = match head.as_ref() {
                None => (1, None, now),
                Some(head) => {
                    let parent =
                        Self::resolve_parent(&repo, &key, head, options.observed_version).await?;
                    (head.version_id + 1, Some(parent), now.max(head.last_updated))
                }
            };

            let revision = Revision {
                resource: VersionedResource {
                    resource_type: key.resource_type.clone(),
                    id: key.id.clone(),
                    version_id,
                    last_updated,
                    revision_id: RevisionId::mint(version_id),
                    body,
                },
                parent_version,
                conflict_flag: None,
            };

            conn.execute("BEGIN IMMEDIATE", ()).await?;
            let seq = match Self::persist_write(&repo, &revision, options.idempotency_key.as_deref())
                .await
            {
                Ok(seq) => seq,
                Err(error) => {
                    conn.execute("ROLLBACK", ()).await.ok();
                    return Err(error);
                }
            };
            if let Err(error) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(error.into());
            }

            let _ = self.changes.send(ChangeEntry {
                seq,
                kind: ChangeKind::Write,
                resource: revision.resource.clone(),
            });
            (revision.resource, parent_version, head.is_none())
        };

        tracing::debug!(
            document = %key,
            version_id = resource.version_id,
            parent_version,
            "Applied write"
        );
        audit::record(
            self.audit.as_ref(),
            AuditEntry::new(
                "resource.write",
                if created { "create" } else { "update" },
                key.to_string(),
            )
            .with_meta(serde_json::json!({
                "versionId": resource.version_id,
                "revisionId": resource.revision_id,
                "parentVersion": parent_version,
                "idempotencyKey": options.idempotency_key,
            })),
        )
        .await;
        Ok(resource)
    }

    async fn persist_write(
        repo: &LibSqlResourceRepository<'_>,
        revision: &Revision,
        idempotency_key: Option<&str>,
    ) -> Result<i64> {
        let resource = &revision.resource;
        repo.insert_revision(revision).await?;
        repo.upsert_head(resource).await?;
        if let Some(token) = idempotency_key {
            repo.record_idempotency_key(token, &resource.revision_id, resource.last_updated)
                .await?;
        }
        repo.append_change(ChangeKind::Write, &resource.revision_id, resource.last_updated)
            .await
    }

    /// Version the new revision descends from
    async fn resolve_parent(
        repo: &LibSqlResourceRepository<'_>,
        key: &DocumentKey,
        head: &VersionedResource,
        observed_version: Option<i64>,
    ) -> Result<i64> {
        let Some(observed) = observed_version else {
            return Ok(head.version_id);
        };
        if observed == head.version_id {
            return Ok(observed);
        }
        if repo.has_version(key, observed).await? {
            tracing::info!(
                document = %key,
                observed_version = observed,
                current_version = head.version_id,
                "Accepting write based on an older version; divergence left for review"
            );
            Ok(observed)
        } else {
            tracing::warn!(
                document = %key,
                observed_version = observed,
                current_version = head.version_id,
                "Observed version unknown; treating write as based on current head"
            );
            Ok(head.version_id)
        }
    }
}

/// Resource type names are FHIR-style identifiers, e.g. `Observation`
fn validate_resource_type(resource_type: &str) -> Result<()> {
    let valid = resource_type
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_uppercase())
        && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidResource(format!(
            "invalid resource type: {resource_type:?}"
        )))
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Check the body against its key and normalise server-managed members
fn prepare_body(key: &DocumentKey, mut body: Value) -> Result<Value> {
    let Some(object) = body.as_object_mut() else {
        return Err(Error::InvalidResource(
            "resource body must be a JSON object".to_string(),
        ));
    };

    match object.get("resourceType").and_then(Value::as_str) {
        Some(declared) if declared == key.resource_type => {}
        Some(declared) => {
            return Err(Error::InvalidResource(format!(
                "resourceType {declared} does not match {}",
                key.resource_type
            )))
        }
        None => {
            return Err(Error::InvalidResource(
                "resource body is missing resourceType".to_string(),
            ))
        }
    }

    if let Some(id) = object.get("id").and_then(Value::as_str) {
        if id != key.id {
            return Err(Error::InvalidResource(format!(
                "body id {id} does not match {key}"
            )));
        }
    }

    object.insert("id".to_string(), Value::String(key.id.clone()));
    object.remove("meta");
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AuditQuery, MemoryAuditLog};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    async fn setup() -> VersionStore {
        VersionStore::open_in_memory().await.unwrap()
    }

    fn patient(family: &str) -> Value {
        json!({"resourceType": "Patient", "id": "42", "name": [{"family": family}]})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_starts_at_version_one() {
        let store = setup().await;
        let created = store
            .create(
                "Observation",
                json!({"resourceType": "Observation", "status": "final"}),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(created.version_id, 1);
        assert_eq!(created.body["id"], json!(created.id));
        let fetched = store.get("Observation", &created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_write_bumps_the_version() {
        let store = setup().await;
        store
            .create("Patient", patient("A"), WriteOptions::default())
            .await
            .unwrap();

        let mut last = 1;
        for family in ["B", "C", "D"] {
            let updated = store
                .update(
                    "Patient",
                    "42",
                    UpdateBody::Replace(patient(family)),
                    WriteOptions::default(),
                )
                .await
                .unwrap();
            assert!(updated.version_id > last);
            last = updated.version_id;
        }
        assert_eq!(last, 4);

        let versions: Vec<i64> = store
            .history(&DocumentKey::new("Patient", "42"))
            .await
            .unwrap()
            .iter()
            .map(|revision| revision.resource.version_id)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_resource_type_is_rejected() {
        let store = setup().await;
        let result = store
            .create(
                "Observation",
                json!({"resourceType": "Patient"}),
                WriteOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidResource(_))));

        let result = store
            .create("Observation", json!(["not", "an", "object"]), WriteOptions::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidResource(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_missing_document_is_not_found() {
        let store = setup().await;
        let result = store
            .update(
                "Patient",
                "missing",
                UpdateBody::Replace(json!({"resourceType": "Patient"})),
                WriteOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(matches!(
            store.get("Patient", "missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idempotency_key_applies_once() {
        let store = setup().await;
        let mut changes = store.subscribe();

        let first = store
            .create(
                "Observation",
                json!({"resourceType": "Observation"}),
                WriteOptions::idempotent("mutation-1"),
            )
            .await
            .unwrap();
        let second = store
            .create(
                "Observation",
                json!({"resourceType": "Observation"}),
                WriteOptions::idempotent("mutation-1"),
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.changes_since(0, 10).await.unwrap().len(), 1);
        assert_eq!(changes.recv().await.unwrap().resource, first);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_patch_updates_fields() {
        let store = setup().await;
        store
            .create("Patient", patient("Old"), WriteOptions::default())
            .await
            .unwrap();

        let patched = store
            .update(
                "Patient",
                "42",
                UpdateBody::MergePatch(json!({"gender": "female", "meta": {"versionId": "9"}})),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(patched.body["gender"], "female");
        assert_eq!(patched.body["name"][0]["family"], "Old");
        assert!(patched.body.get("meta").is_none());
        assert_eq!(patched.version_id, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_writer_is_accepted_and_leaves_two_leaves() {
        let store = setup().await;
        store
            .create("Patient", patient("A"), WriteOptions::default())
            .await
            .unwrap();
        store
            .update(
                "Patient",
                "42",
                UpdateBody::Replace(patient("B")),
                WriteOptions::default().observed(1),
            )
            .await
            .unwrap();
        let late = store
            .update(
                "Patient",
                "42",
                UpdateBody::Replace(patient("C")),
                WriteOptions::default().observed(1),
            )
            .await
            .unwrap();

        assert_eq!(late.version_id, 3);
        assert_eq!(store.get("Patient", "42").await.unwrap(), late);

        let key = DocumentKey::new("Patient", "42");
        let leaves: Vec<i64> = store
            .leaf_revisions(&key)
            .await
            .unwrap()
            .iter()
            .map(|revision| revision.resource.version_id)
            .collect();
        assert_eq!(leaves, vec![2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_observed_version_supersedes_head() {
        let store = setup().await;
        store
            .create("Patient", patient("A"), WriteOptions::default())
            .await
            .unwrap();
        store
            .update(
                "Patient",
                "42",
                UpdateBody::Replace(patient("B")),
                WriteOptions::default().observed(99),
            )
            .await
            .unwrap();

        let leaves = store
            .leaf_revisions(&DocumentKey::new("Patient", "42"))
            .await
            .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].parent_version, Some(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tag_stale_is_metadata_only_and_idempotent() {
        let audit = Arc::new(MemoryAuditLog::new());
        let store = setup().await.with_audit(audit.clone());
        store
            .create("Patient", patient("A"), WriteOptions::default())
            .await
            .unwrap();
        let loser = store
            .update(
                "Patient",
                "42",
                UpdateBody::Replace(patient("B")),
                WriteOptions::default().observed(1),
            )
            .await
            .unwrap();
        store
            .update(
                "Patient",
                "42",
                UpdateBody::Replace(patient("C")),
                WriteOptions::default().observed(1),
            )
            .await
            .unwrap();

        let key = DocumentKey::new("Patient", "42");
        let mut changes = store.subscribe();
        assert!(store.tag_stale(&key, &loser.revision_id).await.unwrap());
        assert!(!store.tag_stale(&key, &loser.revision_id).await.unwrap());

        let entry = changes.recv().await.unwrap();
        assert_eq!(entry.kind, ChangeKind::ConflictTag);
        assert!(changes.try_recv().is_err());

        let history = store.history(&key).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history[1].conflict_flag.as_deref(),
            Some(CONFLICT_FLAG_UPDATED_ON_DEVICE)
        );
        assert_eq!(store.get("Patient", "42").await.unwrap().version_id, 3);
        assert_eq!(store.leaf_revisions(&key).await.unwrap().len(), 1);

        let entries = audit
            .recent(&AuditQuery::for_target("Patient/42"))
            .await
            .unwrap();
        let actions: Vec<&str> = entries.iter().map(|entry| entry.action.as_str()).collect();
        assert_eq!(actions, vec!["mark_stale", "update", "update", "create"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_writes_are_audited_as_denied() {
        let audit = Arc::new(MemoryAuditLog::new());
        let store = setup().await.with_audit(audit.clone());

        let error = store
            .update(
                "Patient",
                "missing",
                UpdateBody::Replace(json!({"resourceType": "Patient"})),
                WriteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));

        let entries = audit
            .recent(&AuditQuery::for_target("Patient/missing"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "update");
        assert!(!entries[0].allowed);
        assert!(entries[0].meta["reason"]
            .as_str()
            .unwrap()
            .contains("Patient/missing"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tag_stale_rejects_foreign_revision() {
        let store = setup().await;
        let other = store
            .create(
                "Observation",
                json!({"resourceType": "Observation"}),
                WriteOptions::default(),
            )
            .await
            .unwrap();
        store
            .create("Patient", patient("A"), WriteOptions::default())
            .await
            .unwrap();

        let result = store
            .tag_stale(&DocumentKey::new("Patient", "42"), &other.revision_id)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn resource_type_validation() {
        assert!(validate_resource_type("Observation").is_ok());
        assert!(validate_resource_type("observation").is_err());
        assert!(validate_resource_type("").is_err());
        assert!(validate_resource_type("Patient/1").is_err());
    }
}
