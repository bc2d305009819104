//! ward-core - Core library for Ward
//!
//! This crate contains the offline-first write pipeline shared by the Ward
//! API server and CLI: the network monitor, the durable mutation queue, the
//! versioned resource store, and the conflict watcher that flags concurrent
//! edits for clinician review.

pub mod audit;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod queue;
pub mod state;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use models::{
    ConflictNotification, ConnectivityState, MutationId, MutationRecord, RevisionId,
    VersionedResource,
};
