//! Versioning use-case service.
//!
//! # Responsibility
//! - Snapshot revisions into new versions and decide when a snapshot is due.
//! - Promote a version to head and purge chain history.
//! - Run the publication guard after every row write.
//!
//! # Invariants
//! - Every top-level operation commits exactly once on success and rolls the
//!   open transaction back on failure. `*_deferred` variants never commit.
//! - Operations work on a copy of the caller's entity; the caller's value is
//!   replaced only on success, so a failed call leaves it untouched.
//! - Head promotion swaps fillable fields, stage and `updated_at` only; ids,
//!   head pointers and version collections stay where they are.
//! - Chain pointer mismatches fail with `EngineError::InconsistentChain`.

use crate::config::VersioningConfig;
use crate::model::entity::{ContractViolation, Entity, EntityId, EntityRef, Stage, Versionable};
use crate::model::field::{copy_fields, swap_fields, FieldError};
use crate::repo::mapping::{field_mismatch, from_record, sync_after_write, to_record};
use crate::repo::record::{Assignment, Predicate, StoredRecord};
use crate::repo::store::{EntityStore, RepoError};
use crate::service::chain::{self, load_head_record, VersionChain};
use crate::service::error::{EngineError, EngineResult};
use crate::service::publication_guard::PublicationGuard;
use log::{error, info};
use std::time::Duration;

/// Whether `persist` snapshots the entity before writing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Snapshot when `needs_new_version` says so.
    #[default]
    Guess,
    AlwaysNew,
    NeverNew,
}

/// Version chain facade over an `EntityStore`.
pub struct VersioningService<S: EntityStore> {
    store: S,
    guard: PublicationGuard,
    new_version_after: Duration,
}

impl<S: EntityStore> VersioningService<S> {
    pub fn new(store: S, config: &VersioningConfig) -> Self {
        Self {
            store,
            guard: PublicationGuard::new(),
            new_version_after: config.new_version_after(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Age after which the newest version is considered stale.
    pub fn new_version_after(&self) -> Duration {
        self.new_version_after
    }

    pub fn find<T: Entity>(&self, id: EntityId) -> EngineResult<Option<T>> {
        match self.store.load_record(T::ENTITY_TYPE, id)? {
            Some(record) => Ok(Some(from_record(record)?)),
            None => Ok(None),
        }
    }

    pub fn find_required<T: Entity>(&self, id: EntityId) -> EngineResult<T> {
        self.find(id)?
            .ok_or_else(|| RepoError::NotFound(EntityRef::new(T::ENTITY_TYPE, id)).into())
    }

    pub fn is_head<T: Versionable>(&self, revision: &T) -> bool {
        revision.meta().is_head()
    }

    pub fn get_head<T: Versionable>(&self, revision: &T) -> EngineResult<T> {
        chain::get_head(&self.store, revision)
    }

    pub fn get_versions<T: Versionable>(&self, revision: &T) -> EngineResult<Vec<EntityId>> {
        chain::get_versions(&self.store, revision)
    }

    pub fn load_chain<T: Versionable>(&self, revision: &T) -> EngineResult<VersionChain<T>> {
        VersionChain::load(&self.store, revision)
    }

    /// True for a head without versions, or whose newest version was last
    /// updated at least `new_version_after` ago. Always false for versions.
    pub fn needs_new_version<T: Versionable>(&self, revision: &T) -> EngineResult<bool> {
        let meta = revision.meta();
        if !meta.is_head() {
            return Ok(false);
        }
        let Some(head_id) = meta.id() else {
            return Ok(true);
        };
        let Some(newest_id) = self
            .store
            .version_ids(T::ENTITY_TYPE, head_id)?
            .into_iter()
            .max()
        else {
            return Ok(true);
        };

        let newest = self
            .store
            .load_record(T::ENTITY_TYPE, newest_id)?
            .ok_or_else(|| {
                EngineError::inconsistent(T::ENTITY_TYPE, newest_id, head_id, "version row missing")
            })?;
        let age_ms = self
            .store
            .now_ms()
            .saturating_sub(newest.updated_at.unwrap_or_default());
        Ok(age_ms >= self.threshold_ms())
    }

    /// Copies `revision`'s fillable fields into a new draft version of its
    /// chain and commits. A head records the new id in its `versions`.
    pub fn make_new_version<T: Versionable>(&self, revision: &mut T) -> EngineResult<T> {
        let version = self.committing_on("make_new_version", revision, |working| {
            self.snapshot_deferred(working, Stage::Draft)
        })?;
        info!(
            "event=make_new_version module=service status=ok entity_type={} version_id={}",
            T::ENTITY_TYPE,
            version.meta().id().unwrap_or_default()
        );
        Ok(version)
    }

    /// Writes `entity`, snapshotting it first when `policy` asks for it, and
    /// commits. Returns whether a new version was created.
    pub fn persist<T: Versionable>(&self, entity: &mut T, policy: VersionPolicy) -> EngineResult<bool> {
        let created = self.committing_on("persist", entity, |working| {
            self.persist_in_place(working, policy)
        })?;
        info!(
            "event=persist module=service status=ok entity_type={} entity_id={} new_version={created}",
            T::ENTITY_TYPE,
            entity.meta().id().unwrap_or_default()
        );
        Ok(created)
    }

    /// Same as `persist` but leaves the transaction open for the caller.
    /// On error `entity` is unchanged and rolling back is up to the caller.
    pub fn persist_deferred<T: Versionable>(
        &self,
        entity: &mut T,
        policy: VersionPolicy,
    ) -> EngineResult<bool> {
        let mut working = entity.clone();
        let created = self.persist_in_place(&mut working, policy)?;
        *entity = working;
        Ok(created)
    }

    fn persist_in_place<T: Versionable>(
        &self,
        entity: &mut T,
        policy: VersionPolicy,
    ) -> EngineResult<bool> {
        let create_version = match policy {
            VersionPolicy::AlwaysNew => true,
            VersionPolicy::NeverNew => false,
            VersionPolicy::Guess => self.needs_new_version(entity)?,
        };
        if create_version {
            // A version needs a persisted head to point at.
            if entity.meta().id().is_none() {
                self.write(entity)?;
            }
            self.snapshot_deferred(entity, Stage::Draft)?;
        }
        self.write(entity)?;
        Ok(create_version)
    }

    /// Writes any entity without versioning and commits.
    pub fn save<T: Entity>(&self, entity: &mut T) -> EngineResult<()> {
        self.committing_on("save", entity, |working| self.write(working).map(|_| ()))
    }

    /// Commits whatever the deferred variants left open.
    pub fn flush(&self) -> EngineResult<()> {
        Ok(self.store.commit()?)
    }

    /// Promotes `entity` to hold the head's content.
    ///
    /// Fillable fields, stage and `updated_at` are exchanged between `entity`
    /// and its head, then both rows are written and committed once. Returns
    /// `false` without writing when `entity` already is the head.
    pub fn make_head_version<T: Versionable>(&self, entity: &mut T) -> EngineResult<bool> {
        if entity.meta().is_head() {
            return Ok(false);
        }
        let (id, head_id) = self.committing_on("make_head_version", entity, |entity| {
            let id = persisted_id(entity)?;
            let head_id = chain::chain_head_id(entity)?;
            let mut head: T = from_record(load_head_record(&self.store, T::ENTITY_TYPE, id, head_id)?)?;

            swap_fields(&T::fillable_fields(), entity, &mut head).map_err(field_error::<T>)?;
            let entity_stage = entity.meta().stage();
            entity.meta_mut().set_stage(head.meta().stage());
            head.meta_mut().set_stage(entity_stage);
            let entity_updated_at = entity.meta().updated_at();
            entity.meta_mut().pin_updated_at(head.meta().updated_at());
            head.meta_mut().pin_updated_at(entity_updated_at);

            self.write(entity)?;
            self.write(&mut head)?;
            Ok((id, head_id))
        })?;
        info!(
            "event=make_head_version module=service status=ok entity_type={} entity_id={id} head_id={head_id}",
            T::ENTITY_TYPE
        );
        Ok(true)
    }

    /// Deletes every version of `entity`'s chain, writes the head with an
    /// empty `versions` collection and commits. Returns the head.
    ///
    /// When `entity` is the head it is updated in place.
    pub fn clear_versions<T: Versionable>(&self, entity: &mut T) -> EngineResult<T> {
        let (head, removed) = self.committing_on("clear_versions", entity, |entity| {
            if entity.meta().is_head() {
                let removed = self.clear_versions_deferred(entity)?;
                Ok((entity.clone(), removed))
            } else {
                let mut head = chain::get_head(&self.store, entity)?;
                let removed = self.clear_versions_deferred(&mut head)?;
                Ok((head, removed))
            }
        })?;
        info!(
            "event=clear_versions module=service status=ok entity_type={} head_id={} removed={removed}",
            T::ENTITY_TYPE,
            head.meta().id().unwrap_or_default()
        );
        Ok(head)
    }

    /// Snapshots a published `entity` as a new version that keeps its stage,
    /// then turns `entity` back into a draft. Commits once and returns the
    /// new version.
    pub fn make_draft_of_version<T: Versionable>(&self, entity: &mut T) -> EngineResult<T> {
        let version = self.committing_on("make_draft_of_version", entity, |entity| {
            let stage = entity.meta().stage();
            let version = self.snapshot_deferred(entity, stage)?;
            entity.meta_mut().unpublish();
            self.write(entity)?;
            Ok(version)
        })?;
        info!(
            "event=make_draft_of_version module=service status=ok entity_type={} version_id={}",
            T::ENTITY_TYPE,
            version.meta().id().unwrap_or_default()
        );
        Ok(version)
    }

    /// Deletes `entity`. Deleting a head deletes its versions first.
    pub fn delete<T: Entity>(&self, entity: &T) -> EngineResult<()> {
        let id = persisted_id(entity)?;
        let removed = self.committing("delete", || {
            let mut removed = 0;
            if entity.meta().is_head() {
                for version_id in self.store.version_ids(T::ENTITY_TYPE, id)? {
                    self.store.remove_record(T::ENTITY_TYPE, version_id)?;
                    removed += 1;
                }
            }
            self.store.remove_record(T::ENTITY_TYPE, id)?;
            Ok(removed + 1)
        })?;
        info!(
            "event=delete module=service status=ok entity_type={} entity_id={id} removed={removed}",
            T::ENTITY_TYPE
        );
        Ok(())
    }

    /// Unpublishes every revision of `entity`'s chain in one bulk update and
    /// commits. Returns the number of rows changed. `entity` is refreshed
    /// from its row afterwards.
    pub fn unpublish_chain<T: Versionable>(&self, entity: &mut T) -> EngineResult<usize> {
        let head_id = chain::chain_head_id(entity)?;
        let changed = self.committing_on("unpublish_chain", entity, |entity| {
            if let (Some(id), false) = (entity.meta().id(), entity.meta().is_head()) {
                load_head_record(&self.store, T::ENTITY_TYPE, id, head_id)?;
            }
            let changed = self.store.bulk_update_where(
                T::ENTITY_TYPE,
                &Predicate::And(vec![
                    Predicate::ChainOf(head_id),
                    Predicate::Stage(Stage::Published),
                ]),
                &[Assignment::Stage(Stage::Draft)],
            )?;
            let id = persisted_id(entity)?;
            let record = self
                .store
                .load_record(T::ENTITY_TYPE, id)?
                .ok_or_else(|| RepoError::NotFound(EntityRef::new(T::ENTITY_TYPE, id)))?;
            entity.meta_mut().set_stage(record.stage);
            sync_after_write(entity, &record);
            Ok(changed)
        })?;
        info!(
            "event=unpublish_chain module=service status=ok entity_type={} head_id={head_id} changed={changed}",
            T::ENTITY_TYPE
        );
        Ok(changed)
    }

    /// Soft-deletes `entity` as of now and commits. The row stays in place and
    /// fires `before_update`; use `restore` to bring it back.
    pub fn soft_delete<T: Entity>(&self, entity: &mut T) -> EngineResult<()> {
        let id = persisted_id(entity)?;
        let deleted_at = self.store.now_ms();
        self.committing_on("soft_delete", entity, |working| {
            working.meta_mut().set_deleted_at(Some(deleted_at));
            self.write(working).map(|_| ())
        })?;
        info!(
            "event=soft_delete module=service status=ok entity_type={} entity_id={id} deleted_at={deleted_at}",
            T::ENTITY_TYPE
        );
        Ok(())
    }

    /// Clears a soft delete (past or scheduled) and commits.
    pub fn restore<T: Entity>(&self, entity: &mut T) -> EngineResult<()> {
        let id = persisted_id(entity)?;
        self.committing_on("restore", entity, |working| {
            working.meta_mut().set_deleted_at(None);
            self.write(working).map(|_| ())
        })?;
        info!(
            "event=restore module=service status=ok entity_type={} entity_id={id}",
            T::ENTITY_TYPE
        );
        Ok(())
    }

    /// Whether `entity`'s soft-delete timestamp has been reached.
    pub fn is_deleted<T: Entity>(&self, entity: &T) -> bool {
        entity.meta().is_deleted_at(self.store.now_ms())
    }

    /// Every revision of type `T` that is soft-deleted now, ordered by id.
    pub fn list_trashed<T: Entity>(&self) -> EngineResult<Vec<T>> {
        self.list(&Predicate::OnlyTrashed(self.store.now_ms()))
    }

    /// Heads of type `T` that are not soft-deleted now, ordered by id.
    pub fn list_live_heads<T: Entity>(&self) -> EngineResult<Vec<T>> {
        self.list(&Predicate::And(vec![
            Predicate::HeadsOnly,
            Predicate::ExcludeTrashed(self.store.now_ms()),
        ]))
    }

    /// Every head of type `T`, ordered by id.
    pub fn list_heads<T: Entity>(&self) -> EngineResult<Vec<T>> {
        self.list(&Predicate::HeadsOnly)
    }

    /// Every non-head revision of type `T`, ordered by id.
    pub fn list_versions_only<T: Entity>(&self) -> EngineResult<Vec<T>> {
        self.list(&Predicate::VersionsOnly)
    }

    fn list<T: Entity>(&self, predicate: &Predicate) -> EngineResult<Vec<T>> {
        self.store
            .list_records(T::ENTITY_TYPE, predicate)?
            .into_iter()
            .map(|record| from_record(record).map_err(EngineError::from))
            .collect()
    }

    fn snapshot_deferred<T: Versionable>(&self, revision: &mut T, stage: Stage) -> EngineResult<T> {
        let head_id = chain::chain_head_id(revision)?;
        if let (Some(id), false) = (revision.meta().id(), revision.meta().is_head()) {
            load_head_record(&self.store, T::ENTITY_TYPE, id, head_id)?;
        }

        let mut version = T::default();
        copy_fields(&T::fillable_fields(), revision, &mut version).map_err(field_error::<T>)?;
        version.meta_mut().set_head(T::ENTITY_TYPE, Some(head_id))?;
        version.meta_mut().set_stage(stage);
        let record = self.write(&mut version)?;

        if let (true, Some(version_id)) = (revision.meta().is_head(), record.id) {
            revision.meta_mut().push_version(version_id);
        }
        Ok(version)
    }

    fn clear_versions_deferred<T: Versionable>(&self, head: &mut T) -> EngineResult<usize> {
        let head_id = persisted_id(head)?;
        let version_ids = self.store.version_ids(T::ENTITY_TYPE, head_id)?;
        for version_id in &version_ids {
            self.store.remove_record(T::ENTITY_TYPE, *version_id)?;
        }
        head.meta_mut().set_versions(Vec::new());
        self.write(head)?;
        Ok(version_ids.len())
    }

    /// One row write plus the publication guard, inside the open transaction.
    fn write<T: Entity>(&self, entity: &mut T) -> EngineResult<StoredRecord> {
        let mut record = to_record(entity)?;
        self.store.persist_record(&mut record)?;
        sync_after_write(entity, &record);
        self.guard.on_entity_persisted(&self.store, &record)?;
        Ok(record)
    }

    /// `committing` over a copy of `entity`, written back only after commit.
    fn committing_on<T: Entity, R>(
        &self,
        operation: &'static str,
        entity: &mut T,
        run: impl FnOnce(&mut T) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut working = entity.clone();
        let value = self.committing(operation, || run(&mut working))?;
        *entity = working;
        Ok(value)
    }

    fn committing<R>(
        &self,
        operation: &'static str,
        run: impl FnOnce() -> EngineResult<R>,
    ) -> EngineResult<R> {
        let result = run().and_then(|value| {
            self.store.commit()?;
            Ok(value)
        });
        if let Err(err) = &result {
            if let Err(rollback_err) = self.store.rollback() {
                error!(
                    "event={operation} module=service status=error stage=rollback error={rollback_err}"
                );
            }
            error!("event={operation} module=service status=error error={err}");
        }
        result
    }

    fn threshold_ms(&self) -> i64 {
        i64::try_from(self.new_version_after.as_millis()).unwrap_or(i64::MAX)
    }
}

fn persisted_id<T: Entity>(entity: &T) -> Result<EntityId, ContractViolation> {
    entity.meta().id().ok_or(ContractViolation::UnsavedEntity {
        entity_type: T::ENTITY_TYPE,
    })
}

fn field_error<T: Entity>((field, err): (&'static str, FieldError)) -> EngineError {
    field_mismatch::<T>(field, &err).into()
}
