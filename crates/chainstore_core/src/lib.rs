//! Entity lifecycle consistency engine.
//! Version chains with single-publication enforcement and cache
//! invalidation propagation over a SQLite entity store.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

#[doc(hidden)]
pub use serde_json;

pub use config::{CacheConfig, ConfigError, EngineConfig, LoggingConfig, VersioningConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::clock::{Clock, ManualClock, SystemClock};
pub use model::dependency::DependencyList;
pub use model::entity::{
    ContractViolation, Entity, EntityId, EntityMeta, EntityRef, Stage, Versionable,
};
pub use model::field::{FieldDescriptor, FieldError, FieldValue};
pub use repo::lifecycle::LifecycleListener;
pub use repo::record::{Assignment, Predicate, StoredRecord};
pub use repo::store::{EntityStore, RepoError, RepoResult, SqliteEntityStore};
pub use service::chain::VersionChain;
pub use service::dependency_graph::{DependencyGraph, TypeDependencies};
pub use service::error::{EngineError, EngineResult};
pub use service::invalidation::{
    InvalidationBus, InvalidationCause, InvalidationEvent, InvalidationPropagator,
    InvalidationReport,
};
pub use service::publication_guard::PublicationGuard;
pub use service::versioning_service::{VersionPolicy, VersioningService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
