//! Version chain head resolution and read-time chain view.
//!
//! A chain is `{head} ∪ head.versions`. It is not persisted on its own; it
//! is reassembled from rows whose `head_id` points at the head.

use crate::model::entity::{ContractViolation, EntityId, EntityRef, Versionable};
use crate::repo::mapping::from_record;
use crate::repo::record::StoredRecord;
use crate::repo::store::{EntityStore, RepoError};
use crate::service::error::{EngineError, EngineResult};

/// Returns the id of the head of `revision`'s chain.
pub fn chain_head_id<T: Versionable>(revision: &T) -> EngineResult<EntityId> {
    let meta = revision.meta();
    match meta.head_id() {
        Some(head_id) => Ok(head_id),
        None => meta.id().ok_or_else(|| {
            ContractViolation::UnsavedEntity {
                entity_type: T::ENTITY_TYPE,
            }
            .into()
        }),
    }
}

/// Returns `revision` itself when it is the head, otherwise loads the head.
pub fn get_head<T: Versionable>(store: &dyn EntityStore, revision: &T) -> EngineResult<T> {
    let meta = revision.meta();
    match (meta.head_id(), meta.id()) {
        (None, _) => Ok(revision.clone()),
        (Some(head_id), id) => {
            let record =
                load_head_record(store, T::ENTITY_TYPE, id.unwrap_or_default(), head_id)?;
            Ok(from_record(record)?)
        }
    }
}

/// Version ids of `revision`'s chain, oldest first.
pub fn get_versions<T: Versionable>(
    store: &dyn EntityStore,
    revision: &T,
) -> EngineResult<Vec<EntityId>> {
    if revision.meta().is_head() {
        return Ok(revision.meta().versions().to_vec());
    }
    Ok(get_head(store, revision)?.meta().versions().to_vec())
}

/// Loads the head row `revision_id` points at through `head_id`.
///
/// # Errors
/// - `EngineError::InconsistentChain` when the head row is missing or is
///   itself a version.
pub(crate) fn load_head_record(
    store: &dyn EntityStore,
    entity_type: &str,
    revision_id: EntityId,
    head_id: EntityId,
) -> EngineResult<StoredRecord> {
    let head = store.load_record(entity_type, head_id)?.ok_or_else(|| {
        EngineError::inconsistent(entity_type, revision_id, head_id, "head row missing")
    })?;
    if !head.is_head() {
        return Err(EngineError::inconsistent(
            entity_type,
            revision_id,
            head_id,
            "head pointer references a version",
        ));
    }
    Ok(head)
}

/// Read-time view over one chain: its head and its versions in creation order.
#[derive(Debug, Clone)]
pub struct VersionChain<T> {
    head: T,
    versions: Vec<T>,
}

impl<T: Versionable> VersionChain<T> {
    /// Loads the chain `revision` belongs to, fresh from the store.
    pub fn load(store: &dyn EntityStore, revision: &T) -> EngineResult<Self> {
        let head_id = chain_head_id(revision)?;
        let head_record = if revision.meta().is_head() {
            store
                .load_record(T::ENTITY_TYPE, head_id)?
                .ok_or_else(|| RepoError::NotFound(EntityRef::new(T::ENTITY_TYPE, head_id)))?
        } else {
            let revision_id = revision.meta().id().unwrap_or_default();
            load_head_record(store, T::ENTITY_TYPE, revision_id, head_id)?
        };

        let mut versions = Vec::with_capacity(head_record.versions.len());
        for version_id in &head_record.versions {
            let record = store.load_record(T::ENTITY_TYPE, *version_id)?.ok_or_else(|| {
                EngineError::inconsistent(T::ENTITY_TYPE, *version_id, head_id, "version row missing")
            })?;
            versions.push(from_record(record)?);
        }

        Ok(Self {
            head: from_record(head_record)?,
            versions,
        })
    }

    pub fn head(&self) -> &T {
        &self.head
    }

    pub fn versions(&self) -> &[T] {
        &self.versions
    }

    /// Head first, then versions oldest first.
    pub fn revisions(&self) -> impl Iterator<Item = &T> {
        std::iter::once(&self.head).chain(self.versions.iter())
    }

    /// Number of revisions including the head.
    pub fn len(&self) -> usize {
        1 + self.versions.len()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.revisions()
            .any(|revision| revision.meta().id() == Some(id))
    }

    pub fn published_count(&self) -> usize {
        self.revisions()
            .filter(|revision| revision.meta().is_published())
            .count()
    }

    pub fn published(&self) -> Option<&T> {
        self.revisions()
            .find(|revision| revision.meta().is_published())
    }

    pub fn head_count(&self) -> usize {
        self.revisions()
            .filter(|revision| revision.meta().is_head())
            .count()
    }
}
