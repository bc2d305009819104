//! Conflict models

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{DocumentKey, Revision, RevisionId};

/// Flag value stored on revisions that lost a concurrent edit
pub const CONFLICT_FLAG_UPDATED_ON_DEVICE: &str = "updated_on_device";

/// Concurrent leaf revisions of one document, split into winner and losers.
///
/// Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionConflictSet {
    pub document: DocumentKey,
    pub winner: Revision,
    pub losers: Vec<Revision>,
}

impl RevisionConflictSet {
    /// Build a conflict set from the non-stale leaves of a document.
    ///
    /// Returns `None` when fewer than two leaves are present.
    pub fn from_leaves(document: DocumentKey, mut leaves: Vec<Revision>) -> Option<Self> {
        if leaves.len() < 2 {
            return None;
        }
        leaves.sort_by(|a, b| compare_precedence(b, a));
        let winner = leaves.remove(0);
        Some(Self {
            document,
            winner,
            losers: leaves,
        })
    }

    /// Every revision id in the set, winner first
    pub fn revision_ids(&self) -> Vec<RevisionId> {
        std::iter::once(&self.winner)
            .chain(self.losers.iter())
            .map(|revision| revision.resource.revision_id.clone())
            .collect()
    }
}

/// Total order used to pick a winner: `versionId`, then `lastUpdated`,
/// then revision id. `Greater` means `a` wins over `b`.
pub fn compare_precedence(a: &Revision, b: &Revision) -> Ordering {
    a.resource
        .version_id
        .cmp(&b.resource.version_id)
        .then_with(|| a.resource.last_updated.cmp(&b.resource.last_updated))
        .then_with(|| a.resource.revision_id.cmp(&b.resource.revision_id))
}

/// Published once per detected conflict instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNotification {
    /// `Type/id`
    pub document_id: String,
    pub conflicting_revision_ids: Vec<RevisionId>,
}
