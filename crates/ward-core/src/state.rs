//! Shared client-facing state types.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ConflictNotification, ConnectivityState, ConnectivityTransition, RevisionId};

/// Unified sync state shown by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    /// Summarize connectivity and queue depth
    pub const fn derive(connectivity: &ConnectivityState, pending: usize, failed: usize) -> Self {
        if !connectivity.is_online {
            Self::Offline
        } else if failed > 0 {
            Self::Error
        } else if pending > 0 {
            Self::Syncing
        } else {
            Self::Synced
        }
    }
}

/// Banner shown while disconnected.
///
/// Dismissal lasts until the next offline period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OfflineBanner {
    offline: bool,
    dismissed: bool,
}

impl OfflineBanner {
    pub const fn from_state(state: &ConnectivityState) -> Self {
        Self {
            offline: !state.is_online,
            dismissed: false,
        }
    }

    pub fn observe(&mut self, transition: ConnectivityTransition) {
        match transition {
            ConnectivityTransition::WentOffline => {
                self.offline = true;
                self.dismissed = false;
            }
            ConnectivityTransition::WentOnline { .. } => self.offline = false,
        }
    }

    pub fn dismiss(&mut self) {
        self.dismissed = true;
    }

    pub const fn is_visible(&self) -> bool {
        self.offline && !self.dismissed
    }
}

/// Conflict banners keyed by document id.
///
/// Repeated notifications for a shown document are merged, never stacked.
/// A dismissed conflict only comes back when a notification names a
/// revision that was not on screen when it was dismissed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictBanner {
    shown: BTreeMap<String, BTreeSet<RevisionId>>,
    dismissed: BTreeMap<String, BTreeSet<RevisionId>>,
}

impl ConflictBanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a notification; returns whether the banner for it is visible
    pub fn observe(&mut self, notification: &ConflictNotification) -> bool {
        let revisions: BTreeSet<RevisionId> =
            notification.conflicting_revision_ids.iter().cloned().collect();

        if let Some(shown) = self.shown.get_mut(&notification.document_id) {
            shown.extend(revisions);
            return true;
        }
        let already_dismissed = self
            .dismissed
            .get(&notification.document_id)
            .is_some_and(|dismissed| revisions.is_subset(dismissed));
        if already_dismissed {
            return false;
        }
        self.shown.insert(notification.document_id.clone(), revisions);
        true
    }

    /// Explicit dismissal is the only way a banner goes away
    pub fn dismiss(&mut self, document_id: &str) -> bool {
        let Some(revisions) = self.shown.remove(document_id) else {
            return false;
        };
        self.dismissed
            .entry(document_id.to_string())
            .or_default()
            .extend(revisions);
        true
    }

    pub fn is_shown(&self, document_id: &str) -> bool {
        self.shown.contains_key(document_id)
    }

    /// Document ids with a visible banner, sorted
    pub fn visible(&self) -> Vec<&str> {
        self.shown.keys().map(String::as_str).collect()
    }
}
