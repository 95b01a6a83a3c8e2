//! Cache invalidation propagation.
//!
//! # Responsibility
//! - Turn one entity mutation into invalidation events for the entity and
//!   everything that transitively depends on it.
//! - Publish events to subscribers without blocking on them.
//!
//! # Invariants
//! - One propagation emits at most one event per `(type, id)`, so cyclic
//!   dependency data terminates.
//! - A missing target is a warning, never an abort; it is reported once per
//!   propagation.
//! - Publishing is a side channel: no store writes, no nested transaction.

use crate::config::CacheConfig;
use crate::model::entity::{EntityId, EntityRef};
use crate::repo::lifecycle::LifecycleListener;
use crate::repo::record::StoredRecord;
use crate::repo::store::{EntityStore, RepoResult};
use crate::service::dependency_graph::DependencyGraph;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// Mutation that triggered a propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationCause {
    Created,
    Updated,
    Deleted,
}

/// Notification that the cache of one entity is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub entity_type: String,
    pub entity_id: EntityId,
    pub cause: InvalidationCause,
}

impl InvalidationEvent {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id)
    }
}

/// Fan-out channel for invalidation events. Clones share subscribers.
#[derive(Debug, Clone, Default)]
pub struct InvalidationBus {
    subscribers: Arc<Mutex<Vec<Sender<InvalidationEvent>>>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver for every event published from now on.
    pub fn subscribe(&self) -> Receiver<InvalidationEvent> {
        let (sender, receiver) = channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Sends `event` to every live subscriber and drops disconnected ones.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: &InvalidationEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Outcome of one propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Emitted events in emission order.
    pub events: Vec<InvalidationEvent>,
    /// Targets that could not be resolved.
    pub missing: Vec<EntityRef>,
}

/// Walks the dependency graph after a mutation and publishes invalidations.
#[derive(Debug, Clone)]
pub struct InvalidationPropagator {
    graph: DependencyGraph,
    bus: InvalidationBus,
}

enum Pending {
    Resolved(StoredRecord),
    Target { source: EntityRef, target: EntityRef },
}

impl InvalidationPropagator {
    pub fn new(graph: DependencyGraph, bus: InvalidationBus) -> Self {
        Self { graph, bus }
    }

    pub fn from_config(config: &CacheConfig, bus: InvalidationBus) -> Self {
        Self::new(DependencyGraph::new(config.type_dependencies.clone()), bus)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    /// Invalidates `entity` and, depth-first, everything depending on it.
    ///
    /// Unsaved records emit nothing. Store read failures abort the walk.
    pub fn invalidate(
        &self,
        store: &dyn EntityStore,
        entity: &StoredRecord,
        cause: InvalidationCause,
    ) -> RepoResult<InvalidationReport> {
        let mut report = InvalidationReport::default();
        let mut visited: HashSet<EntityRef> = HashSet::new();
        let mut pending = vec![Pending::Resolved(entity.clone())];

        while let Some(next) = pending.pop() {
            let record = match next {
                Pending::Resolved(record) => record,
                Pending::Target { source, target } => {
                    if visited.contains(&target) {
                        continue;
                    }
                    match store.load_record(&target.entity_type, target.id)? {
                        Some(record) => record,
                        None => {
                            warn!(
                                "event=cache_invalidate module=invalidation status=missing_target source={source} target={target}"
                            );
                            visited.insert(target.clone());
                            report.missing.push(target);
                            continue;
                        }
                    }
                }
            };

            let Some(entity_ref) = record.entity_ref() else {
                continue;
            };
            if !visited.insert(entity_ref.clone()) {
                continue;
            }

            let event = InvalidationEvent {
                entity_type: entity_ref.entity_type.clone(),
                entity_id: entity_ref.id,
                cause,
            };
            let reached = self.bus.publish(&event);
            debug!(
                "event=cache_invalidate module=invalidation status=ok target={entity_ref} cause={cause:?} subscribers={reached}"
            );
            report.events.push(event);

            // Reverse so the first declared target is expanded first.
            for target in self.graph.targets_of(&record).into_iter().rev() {
                if !visited.contains(&target) {
                    pending.push(Pending::Target {
                        source: entity_ref.clone(),
                        target,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Resolves `target` and invalidates it. A missing target is reported,
    /// not an error.
    pub fn invalidate_ref(
        &self,
        store: &dyn EntityStore,
        target: &EntityRef,
        cause: InvalidationCause,
    ) -> RepoResult<InvalidationReport> {
        match store.load_record(&target.entity_type, target.id)? {
            Some(record) => self.invalidate(store, &record, cause),
            None => {
                warn!("event=cache_invalidate module=invalidation status=missing_target target={target}");
                Ok(InvalidationReport {
                    events: Vec::new(),
                    missing: vec![target.clone()],
                })
            }
        }
    }
}

impl LifecycleListener for InvalidationPropagator {
    fn after_create(&self, store: &dyn EntityStore, record: &StoredRecord) -> RepoResult<()> {
        self.invalidate(store, record, InvalidationCause::Created)
            .map(|_| ())
    }

    fn before_update(&self, store: &dyn EntityStore, record: &StoredRecord) -> RepoResult<()> {
        self.invalidate(store, record, InvalidationCause::Updated)
            .map(|_| ())
    }

    fn before_remove(&self, store: &dyn EntityStore, record: &StoredRecord) -> RepoResult<()> {
        self.invalidate(store, record, InvalidationCause::Deleted)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::{InvalidationBus, InvalidationCause, InvalidationEvent};

    fn event(id: i64) -> InvalidationEvent {
        InvalidationEvent {
            entity_type: "page".to_string(),
            entity_id: id,
            cause: InvalidationCause::Updated,
        }
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let bus = InvalidationBus::new();
        let first = bus.subscribe();
        let second = bus.clone().subscribe();

        assert_eq!(bus.publish(&event(1)), 2);
        assert_eq!(first.try_recv().unwrap(), event(1));
        assert_eq!(second.try_recv().unwrap(), event(1));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InvalidationBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        assert_eq!(bus.publish(&event(2)), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap().entity_id, 2);
    }
}
