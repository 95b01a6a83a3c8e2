//! Cache dependency declarations.
//!
//! Instance-level dependencies live in the owner's own row
//! (`EntityMeta::dependencies`) and are written with it. Type-level
//! dependencies are configuration: every change to any entity of a type
//! invalidates the listed entities.
//!
//! Declarations never trigger invalidation themselves; the propagator reads them.

use crate::model::entity::{validate_entity_type, ContractViolation, Entity, EntityRef};
use crate::repo::record::StoredRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Static `entity type -> [EntityRef]` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeDependencies(BTreeMap<String, Vec<EntityRef>>);

impl TypeDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities invalidated whenever any `entity_type` entity changes.
    pub fn get(&self, entity_type: &str) -> &[EntityRef] {
        self.0.get(entity_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns `false` when the pair was already registered.
    pub fn add(&mut self, entity_type: impl Into<String>, target: EntityRef) -> bool {
        let targets = self.0.entry(entity_type.into()).or_default();
        if targets.contains(&target) {
            return false;
        }
        targets.push(target);
        true
    }

    /// Returns `false` when the pair was not registered.
    pub fn remove(&mut self, entity_type: &str, target: &EntityRef) -> bool {
        let Some(targets) = self.0.get_mut(entity_type) else {
            return false;
        };
        let before = targets.len();
        targets.retain(|item| item != target);
        let removed = targets.len() != before;
        if targets.is_empty() {
            self.0.remove(entity_type);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks every entity type name, keys and targets alike.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        for (entity_type, targets) in &self.0 {
            validate_entity_type(entity_type)?;
            for target in targets {
                validate_entity_type(&target.entity_type)?;
            }
        }
        Ok(())
    }
}

/// Instance-level and type-level cache dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    type_level: TypeDependencies,
}

impl DependencyGraph {
    pub fn new(type_level: TypeDependencies) -> Self {
        Self { type_level }
    }

    pub fn type_level(&self) -> &TypeDependencies {
        &self.type_level
    }

    pub fn type_level_mut(&mut self) -> &mut TypeDependencies {
        &mut self.type_level
    }

    /// Decoded instance-level list of `owner`.
    pub fn get_dependencies<T: Entity>(owner: &T) -> BTreeSet<EntityRef> {
        owner.meta().dependencies().iter().cloned().collect()
    }

    /// Registers `target` under `owner`. Idempotent; persisted with the owner's
    /// next write. Returns whether the list changed.
    pub fn add_dependency<T: Entity>(owner: &mut T, target: EntityRef) -> bool {
        owner.meta_mut().dependencies_mut().insert(target)
    }

    /// Idempotent removal. Returns whether the list changed.
    pub fn remove_dependency<T: Entity>(owner: &mut T, target: &EntityRef) -> bool {
        owner.meta_mut().dependencies_mut().remove(target)
    }

    pub fn has_dependency<T: Entity>(owner: &T, target: &EntityRef) -> bool {
        owner.meta().dependencies().contains(target)
    }

    /// Everything to invalidate after `record` changes: type-level targets
    /// first, then the record's own list.
    pub fn targets_of(&self, record: &StoredRecord) -> Vec<EntityRef> {
        self.type_level
            .get(&record.entity_type)
            .iter()
            .chain(record.dependencies.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{DependencyGraph, TypeDependencies};
    use crate::model::entity::EntityRef;
    use crate::repo::record::StoredRecord;

    #[test]
    fn type_level_add_is_idempotent_and_remove_prunes_empty_types() {
        let mut deps = TypeDependencies::new();
        assert!(deps.add("page", EntityRef::new("menu", 1)));
        assert!(!deps.add("page", EntityRef::new("menu", 1)));
        assert_eq!(deps.get("page").len(), 1);

        assert!(deps.remove("page", &EntityRef::new("menu", 1)));
        assert!(deps.is_empty());
        assert!(deps.get("page").is_empty());
    }

    #[test]
    fn targets_list_type_level_before_instance_level() {
        let mut deps = TypeDependencies::new();
        deps.add("page", EntityRef::new("menu", 1));
        let graph = DependencyGraph::new(deps);

        let mut record = StoredRecord::new("page");
        record.dependencies.insert(EntityRef::new("layout", 2));

        assert_eq!(
            graph.targets_of(&record),
            vec![EntityRef::new("menu", 1), EntityRef::new("layout", 2)]
        );
    }

    #[test]
    fn validate_rejects_bad_target_type() {
        let mut deps = TypeDependencies::new();
        deps.add("page", EntityRef::new("Menu", 1));
        assert!(deps.validate().is_err());
    }

    #[test]
    fn type_level_deserializes_from_plain_map() {
        let deps: TypeDependencies =
            serde_json::from_str(r#"{"page":[{"type":"menu","id":3}]}"#).unwrap();
        assert_eq!(deps.get("page"), &[EntityRef::new("menu", 3)]);
    }
}
