//! Connectivity state model

use serde::{Deserialize, Serialize};

/// Connectivity as observed by the network monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,
    /// Sticky: true once any offline period has occurred this session
    pub was_offline: bool,
    /// Elapsed ms of the current or most recent offline period
    pub offline_duration_ms: u64,
}

impl ConnectivityState {
    pub const fn online() -> Self {
        Self {
            is_online: true,
            was_offline: false,
            offline_duration_ms: 0,
        }
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::online()
    }
}

/// Edge published on every connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectivityTransition {
    WentOffline,
    WentOnline { offline_duration_ms: u64 },
}
