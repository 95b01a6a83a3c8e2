//! Lifecycle hooks fired by the store around row writes.
//!
//! # Invariants
//! - `after_create` runs after the INSERT, so the record carries its new id.
//! - `before_update` and `before_remove` run before the statement executes,
//!   inside the same open transaction.
//! - A listener error aborts the write and propagates to the caller.

use crate::repo::record::StoredRecord;
use crate::repo::store::{EntityStore, RepoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleHook {
    AfterCreate,
    BeforeUpdate,
    BeforeRemove,
}

/// Receives lifecycle notifications from an `EntityStore`.
///
/// `store` is the handle of the open transaction; listeners may read through
/// it but must not commit.
pub trait LifecycleListener {
    fn after_create(&self, _store: &dyn EntityStore, _record: &StoredRecord) -> RepoResult<()> {
        Ok(())
    }

    fn before_update(&self, _store: &dyn EntityStore, _record: &StoredRecord) -> RepoResult<()> {
        Ok(())
    }

    fn before_remove(&self, _store: &dyn EntityStore, _record: &StoredRecord) -> RepoResult<()> {
        Ok(())
    }
}

pub(crate) fn dispatch(
    listener: &dyn LifecycleListener,
    hook: LifecycleHook,
    store: &dyn EntityStore,
    record: &StoredRecord,
) -> RepoResult<()> {
    match hook {
        LifecycleHook::AfterCreate => listener.after_create(store, record),
        LifecycleHook::BeforeUpdate => listener.before_update(store, record),
        LifecycleHook::BeforeRemove => listener.before_remove(store, record),
    }
}
