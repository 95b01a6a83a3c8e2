//! At most one published revision per chain.
//!
//! # Invariants
//! - Runs after every versioning-service row write, inside the caller's open
//!   transaction. It never commits; the outer operation commits once.
//! - Other revisions are unpublished through ordinary row writes, so their
//!   lifecycle hooks (and cache invalidation) fire as well.

use crate::model::entity::Stage;
use crate::repo::record::{Predicate, StoredRecord};
use crate::repo::store::EntityStore;
use crate::service::chain::load_head_record;
use crate::service::error::EngineResult;
use log::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct PublicationGuard;

impl PublicationGuard {
    pub fn new() -> Self {
        Self
    }

    /// Unpublishes every other revision in the chain when `record` was just
    /// persisted as published. Returns how many revisions were unpublished.
    pub fn on_entity_persisted(
        &self,
        store: &dyn EntityStore,
        record: &StoredRecord,
    ) -> EngineResult<usize> {
        let Some(id) = record.id else {
            return Ok(0);
        };
        if !record.stage.is_published() {
            return Ok(0);
        }

        let mut unpublished = 0;
        let head_id = match record.head_id {
            Some(head_id) => {
                let mut head = load_head_record(store, &record.entity_type, id, head_id)?;
                if head.stage.is_published() {
                    head.stage = Stage::Draft;
                    store.persist_record(&mut head)?;
                    unpublished += 1;
                }
                head_id
            }
            None => id,
        };

        let published_versions = store.list_records(
            &record.entity_type,
            &Predicate::And(vec![
                Predicate::ChainOf(head_id),
                Predicate::VersionsOnly,
                Predicate::Stage(Stage::Published),
            ]),
        )?;
        for mut version in published_versions {
            if version.id == Some(id) {
                continue;
            }
            version.stage = Stage::Draft;
            store.persist_record(&mut version)?;
            unpublished += 1;
        }

        if unpublished > 0 {
            info!(
                "event=publication_guard module=service status=ok entity_type={} entity_id={id} unpublished={unpublished}",
                record.entity_type
            );
        }
        Ok(unpublished)
    }
}
