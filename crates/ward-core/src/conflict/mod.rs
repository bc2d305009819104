//! Conflict watcher.
//!
//! Follows the version store's change stream and looks for documents with
//! more than one live leaf revision. One leaf is chosen as the winner by a
//! deterministic total order; every other leaf is tagged
//! `_conflictFlag = "updated_on_device"` and a [`ConflictNotification`] is
//! published for clinician review. Nothing is merged.

use std::collections::BTreeSet;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::{
    ChangeEntry, ChangeKind, ConflictNotification, DocumentKey, RevisionConflictSet,
};
use crate::store::VersionStore;

const NOTIFICATION_CAPACITY: usize = 64;
const REPLAY_BATCH: usize = 256;

/// Single-document detection and tagging, shared by the watcher task
#[derive(Clone)]
pub struct ConflictDetector {
    store: VersionStore,
    notifications: broadcast::Sender<ConflictNotification>,
}

impl ConflictDetector {
    pub fn new(store: VersionStore) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            store,
            notifications,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictNotification> {
        self.notifications.subscribe()
    }

    /// Inspect one document and tag its losing leaves.
    ///
    /// Returns the conflict set that was resolved, or `None` when the
    /// document has a single live leaf. Running it again after a successful
    /// pass finds nothing.
    pub async fn resolve_document(&self, key: &DocumentKey) -> Result<Option<RevisionConflictSet>> {
        let leaves = self.store.leaf_revisions(key).await?;
        let Some(set) = RevisionConflictSet::from_leaves(key.clone(), leaves) else {
            return Ok(None);
        };

        for loser in &set.losers {
            self.store
                .tag_stale(key, &loser.resource.revision_id)
                .await?;
        }

        let notification = ConflictNotification {
            document_id: key.to_string(),
            conflicting_revision_ids: set.revision_ids(),
        };
        tracing::warn!(
            document = %key,
            winner = %set.winner.resource.revision_id,
            losers = set.losers.len(),
            "Concurrent edits detected"
        );
        let _ = self.notifications.send(notification);
        Ok(Some(set))
    }
}

/// Background task that runs [`ConflictDetector`] for every written document
pub struct ConflictWatcher {
    detector: ConflictDetector,
    handle: JoinHandle<()>,
}

impl ConflictWatcher {
    /// Subscribe to `store` and start watching.
    ///
    /// Writes accepted before this call are not inspected unless the
    /// subscriber later lags and replays the change log.
    pub fn spawn(store: VersionStore) -> Self {
        let detector = ConflictDetector::new(store);
        let changes = detector.store.subscribe();
        let handle = tokio::spawn(run(detector.clone(), changes));
        tracing::debug!("Conflict watcher started");
        Self { detector, handle }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictNotification> {
        self.detector.subscribe()
    }

    /// One detection pass over `key`, outside the change stream
    pub async fn resolve_once(&self, key: &DocumentKey) -> Result<Option<RevisionConflictSet>> {
        self.detector.resolve_document(key).await
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ConflictWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(detector: ConflictDetector, mut changes: broadcast::Receiver<ChangeEntry>) {
    let mut last_seq = 0;
    let mut pending = BTreeSet::new();

    loop {
        match changes.recv().await {
            Ok(entry) => {
                last_seq = last_seq.max(entry.seq);
                // Our own tags come back as ConflictTag; they only nudge retries
                if entry.kind == ChangeKind::Write {
                    pending.insert(entry.resource.key());
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, last_seq, "Conflict watcher lagged; replaying change log");
                if let Err(error) = replay(&detector, &mut last_seq, &mut pending).await {
                    tracing::warn!("Change log replay failed: {error}");
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }

        resolve_pending(&detector, &mut pending).await;
    }
    tracing::debug!("Conflict watcher stopped");
}

async fn replay(
    detector: &ConflictDetector,
    last_seq: &mut i64,
    pending: &mut BTreeSet<DocumentKey>,
) -> Result<()> {
    loop {
        let batch = detector.store.changes_since(*last_seq, REPLAY_BATCH).await?;
        let Some(last) = batch.last() else {
            return Ok(());
        };
        *last_seq = last.seq;
        pending.extend(
            batch
                .iter()
                .filter(|entry| entry.kind == ChangeKind::Write)
                .map(|entry| entry.resource.key()),
        );
    }
}

async fn resolve_pending(detector: &ConflictDetector, pending: &mut BTreeSet<DocumentKey>) {
    let keys: Vec<DocumentKey> = pending.iter().cloned().collect();
    for key in keys {
        match detector.resolve_document(&key).await {
            Ok(_) => {
                pending.remove(&key);
            }
            Err(error) => {
                tracing::warn!(document = %key, "Conflict tagging failed; will retry: {error}");
            }
        }
    }
}
