//! Durable mutation queue.
//!
//! Writes issued while offline (or that fail in transit) are persisted to the
//! `mutation_queue` table and replayed in creation order once connectivity
//! returns. Every replay carries the record id as its idempotency key, so a
//! write that reached the server before the acknowledgement was lost is
//! applied once.

pub mod endpoint;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncSettings;
use crate::db::{LibSqlMutationStore, MutationStore, SharedDatabase};
use crate::error::{Error, Result};
use crate::models::{
    ConnectivityState, ConnectivityTransition, HttpMethod, MutationId, MutationRecord,
    MutationStatus, NewMutation, QueuedMutation,
};
use crate::network::NetworkMonitor;

pub use endpoint::{
    classify, EndpointResponse, HttpWriteEndpoint, LocalWriteEndpoint, ReplayOutcome,
    WriteEndpoint,
};

/// Published when an item leaves the pending line for good
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: MutationId,
    pub url: String,
    pub method: HttpMethod,
    pub attempts: u32,
    pub reason: String,
}

/// Why a flush stopped before draining the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushHalt {
    pub id: MutationId,
    pub reason: String,
    /// Delay before the next attempt
    pub retry_after: Duration,
}

/// Summary of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub replayed: usize,
    pub failed: usize,
    pub halted: Option<FlushHalt>,
}

impl FlushReport {
    pub const fn is_drained(&self) -> bool {
        self.halted.is_none()
    }
}

enum Attempt {
    Applied,
    Transient(String),
    Permanent(String),
}

/// Durable FIFO of pending writes
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    db: SharedDatabase,
    endpoint: Arc<dyn WriteEndpoint>,
    settings: SyncSettings,
    flush_lock: Mutex<()>,
    dead_letters: broadcast::Sender<DeadLetter>,
}

fn storage_unavailable(error: Error) -> Error {
    match error {
        Error::StorageUnavailable(_) => error,
        other => Error::StorageUnavailable(other.to_string()),
    }
}

impl MutationQueue {
    pub fn new(db: SharedDatabase, endpoint: Arc<dyn WriteEndpoint>, settings: SyncSettings) -> Self {
        let (dead_letters, _) = broadcast::channel(settings.channel_capacity.max(1));
        Self {
            inner: Arc::new(QueueInner {
                db,
                endpoint,
                settings,
                flush_lock: Mutex::new(()),
                dead_letters,
            }),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Persist a write. The record is durable once this returns.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationRecord> {
        let record = MutationRecord::from_new(mutation);
        {
            let db = self.inner.db.lock().await;
            LibSqlMutationStore::new(db.connection())
                .put(&record)
                .await
                .map_err(storage_unavailable)?;
        }
        tracing::info!(
            id = %record.id,
            method = record.method.as_str(),
            url = %record.url,
            "Queued mutation"
        );
        Ok(record)
    }

    /// Number of pending items
    pub async fn count(&self) -> Result<usize> {
        let db = self.inner.db.lock().await;
        LibSqlMutationStore::new(db.connection())
            .count()
            .await
            .map_err(storage_unavailable)
    }

    pub async fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        let db = self.inner.db.lock().await;
        LibSqlMutationStore::new(db.connection())
            .get(id)
            .await
            .map_err(storage_unavailable)
    }

    pub async fn list_all(&self) -> Result<Vec<QueuedMutation>> {
        let db = self.inner.db.lock().await;
        LibSqlMutationStore::new(db.connection())
            .get_all()
            .await
            .map_err(storage_unavailable)
    }

    pub async fn list_pending(&self) -> Result<Vec<QueuedMutation>> {
        self.list_status(MutationStatus::Pending).await
    }

    /// Dead-lettered items awaiting operator action
    pub async fn list_failed(&self) -> Result<Vec<QueuedMutation>> {
        self.list_status(MutationStatus::Failed).await
    }

    async fn list_status(&self, status: MutationStatus) -> Result<Vec<QueuedMutation>> {
        let db = self.inner.db.lock().await;
        LibSqlMutationStore::new(db.connection())
            .list_by_status(status)
            .await
            .map_err(storage_unavailable)
    }

    /// Discard every item, pending or failed
    pub async fn clear(&self) -> Result<usize> {
        let _flush = self.inner.flush_lock.lock().await;
        let db = self.inner.db.lock().await;
        let removed = LibSqlMutationStore::new(db.connection())
            .clear()
            .await
            .map_err(storage_unavailable)?;
        tracing::warn!(removed, "Cleared mutation queue");
        Ok(removed)
    }

    /// Put a failed item back in line with a fresh attempt budget
    pub async fn retry_failed(&self, id: &MutationId) -> Result<()> {
        let db = self.inner.db.lock().await;
        let reset = LibSqlMutationStore::new(db.connection())
            .reset(id)
            .await
            .map_err(storage_unavailable)?;
        if !reset {
            return Err(Error::NotFound(format!("failed mutation {id}")));
        }
        tracing::info!(%id, "Failed mutation requeued");
        Ok(())
    }

    /// Drop one item regardless of status
    pub async fn discard(&self, id: &MutationId) -> Result<()> {
        let _flush = self.inner.flush_lock.lock().await;
        let db = self.inner.db.lock().await;
        let removed = LibSqlMutationStore::new(db.connection())
            .delete(id)
            .await
            .map_err(storage_unavailable)?;
        if !removed {
            return Err(Error::NotFound(format!("mutation {id}")));
        }
        tracing::info!(%id, "Discarded mutation");
        Ok(())
    }

    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.inner.dead_letters.subscribe()
    }

    /// Replay pending items oldest first, one at a time.
    ///
    /// Stops at the first transient failure and reports the backoff delay.
    /// Permanent failures are dead-lettered and the flush moves on.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _flush = self.inner.flush_lock.lock().await;
        let mut report = FlushReport::default();

        loop {
            let next = {
                let db = self.inner.db.lock().await;
                LibSqlMutationStore::new(db.connection())
                    .next_pending()
                    .await
                    .map_err(storage_unavailable)?
            };
            let Some(item) = next else {
                break;
            };

            match self.replay(&item.record).await {
                Attempt::Applied => {
                    self.remove_applied(&item.record.id).await?;
                    report.replayed += 1;
                    tracing::debug!(id = %item.record.id, "Replayed mutation");
                }
                Attempt::Permanent(reason) => {
                    let attempts = item.attempts.saturating_add(1);
                    self.dead_letter(&item.record, attempts, reason).await?;
                    report.failed += 1;
                }
                Attempt::Transient(reason) => {
                    let attempts = item.attempts.saturating_add(1);
                    let retry_after = self.inner.settings.backoff_delay(attempts);
                    if attempts >= self.inner.settings.max_retries {
                        let exhausted = Error::RetryExhausted {
                            id: item.record.id.to_string(),
                            attempts,
                        };
                        self.dead_letter(&item.record, attempts, format!("{exhausted}: {reason}"))
                            .await?;
                        report.failed += 1;
                    } else {
                        self.record_transient(&item.record.id, attempts, &reason)
                            .await?;
                    }
                    tracing::warn!(
                        id = %item.record.id,
                        attempts,
                        retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "Replay failed; halting flush"
                    );
                    report.halted = Some(FlushHalt {
                        id: item.record.id,
                        reason,
                        retry_after,
                    });
                    break;
                }
            }
        }

        if report.replayed > 0 || report.failed > 0 {
            tracing::info!(
                replayed = report.replayed,
                failed = report.failed,
                halted = report.halted.is_some(),
                "Flushed mutation queue"
            );
        }
        Ok(report)
    }

    async fn replay(&self, record: &MutationRecord) -> Attempt {
        let timeout = self.inner.settings.replay_timeout;
        match tokio::time::timeout(timeout, self.inner.endpoint.send(record)).await {
            Err(_) => Attempt::Transient(format!(
                "replay timed out after {}ms",
                timeout.as_millis()
            )),
            Ok(Err(error)) if error.is_permanent() => Attempt::Permanent(error.to_string()),
            Ok(Err(error)) => Attempt::Transient(error.to_string()),
            Ok(Ok(response)) => match classify(response.status) {
                ReplayOutcome::Applied => Attempt::Applied,
                ReplayOutcome::Transient => {
                    Attempt::Transient(format!("HTTP {}: {}", response.status, response.body))
                }
                ReplayOutcome::Permanent => {
                    Attempt::Permanent(format!("HTTP {}: {}", response.status, response.body))
                }
            },
        }
    }

    async fn remove_applied(&self, id: &MutationId) -> Result<()> {
        let db = self.inner.db.lock().await;
        LibSqlMutationStore::new(db.connection())
            .delete(id)
            .await
            .map_err(storage_unavailable)?;
        Ok(())
    }

    async fn record_transient(&self, id: &MutationId, attempts: u32, reason: &str) -> Result<()> {
        let db = self.inner.db.lock().await;
        LibSqlMutationStore::new(db.connection())
            .record_failure(id, attempts, MutationStatus::Pending, reason)
            .await
            .map_err(storage_unavailable)
    }

    async fn dead_letter(&self, record: &MutationRecord, attempts: u32, reason: String) -> Result<()> {
        {
            let db = self.inner.db.lock().await;
            LibSqlMutationStore::new(db.connection())
                .record_failure(&record.id, attempts, MutationStatus::Failed, &reason)
                .await
                .map_err(storage_unavailable)?;
        }
        tracing::error!(
            id = %record.id,
            url = %record.url,
            attempts,
            reason = %reason,
            "Mutation moved to dead letters"
        );
        let _ = self.inner.dead_letters.send(DeadLetter {
            id: record.id,
            url: record.url.clone(),
            method: record.method,
            attempts,
            reason,
        });
        Ok(())
    }

    /// Flush on every online transition and retry after backoff while online
    pub fn spawn_driver(&self, monitor: &NetworkMonitor) -> QueueDriver {
        let queue = self.clone();
        let transitions = monitor.subscribe();
        let state = monitor.watch();
        let handle = tokio::spawn(queue.drive(transitions, state));
        QueueDriver { handle }
    }

    async fn drive(
        self,
        mut transitions: broadcast::Receiver<ConnectivityTransition>,
        state: watch::Receiver<ConnectivityState>,
    ) {
        let online = state.borrow().is_online;
        let mut retry_at = if online {
            self.flush_for_driver().await
        } else {
            None
        };

        loop {
            tokio::select! {
                received = transitions.recv() => match received {
                    Ok(ConnectivityTransition::WentOnline { offline_duration_ms }) => {
                        tracing::info!(offline_duration_ms, "Back online; flushing queue");
                        retry_at = self.flush_for_driver().await;
                    }
                    Ok(ConnectivityTransition::WentOffline) => {
                        retry_at = None;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let online = state.borrow().is_online;
                        retry_at = if online {
                            self.flush_for_driver().await
                        } else {
                            None
                        };
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = wait_until(retry_at) => {
                    retry_at = self.flush_for_driver().await;
                }
            }
        }
    }

    async fn flush_for_driver(&self) -> Option<Instant> {
        match self.flush().await {
            Ok(report) => report
                .halted
                .map(|halt| Instant::now() + halt.retry_after),
            Err(error) => {
                tracing::warn!("Queue flush failed: {error}");
                Some(Instant::now() + self.inner.settings.backoff_base)
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to the automatic replay task
pub struct QueueDriver {
    handle: JoinHandle<()>,
}

impl QueueDriver {
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for QueueDriver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
