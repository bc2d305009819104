//! Data models for Ward

mod audit;
mod conflict;
mod connectivity;
mod mutation;
mod resource;

pub use audit::AuditEntry;
pub use conflict::{ConflictNotification, RevisionConflictSet, CONFLICT_FLAG_UPDATED_ON_DEVICE};
pub use connectivity::{ConnectivityState, ConnectivityTransition};
pub use mutation::{
    HttpMethod, MutationId, MutationRecord, MutationStatus, NewMutation, QueuedMutation,
};
pub use resource::{ChangeEntry, ChangeKind, DocumentKey, Revision, RevisionId, VersionedResource};
