//! Database layer for Ward

mod audit_repository;
mod connection;
mod migrations;
mod queue_repository;
mod resource_repository;

pub use audit_repository::LibSqlAuditRepository;
pub use connection::{Database, SharedDatabase};
pub use queue_repository::{LibSqlMutationStore, MutationStore};
pub use resource_repository::LibSqlResourceRepository;
