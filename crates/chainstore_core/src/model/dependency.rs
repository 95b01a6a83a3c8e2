//! Instance-level cache dependency list.
//!
//! Stored on the owner's own row as a JSON array of `{"type", "id"}` objects.
//! Every listed entity has its cache invalidated whenever the owner changes.

use crate::model::entity::EntityRef;
use serde::{Deserialize, Serialize};

/// Ordered set of `EntityRef`s. Pairs are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyList(Vec<EntityRef>);

impl DependencyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a stored list. `None` decodes to an empty list; duplicates
    /// collapse to their first occurrence.
    pub fn from_json(value: Option<&str>) -> Result<Self, serde_json::Error> {
        let Some(value) = value else {
            return Ok(Self::default());
        };
        let decoded: Vec<EntityRef> = serde_json::from_str(value)?;
        let mut list = Self::default();
        for item in decoded {
            list.insert(item);
        }
        Ok(list)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// Returns `false` when the pair was already present.
    pub fn insert(&mut self, target: EntityRef) -> bool {
        if self.0.contains(&target) {
            return false;
        }
        self.0.push(target);
        true
    }

    /// Returns `false` when the pair was not present.
    pub fn remove(&mut self, target: &EntityRef) -> bool {
        let before = self.0.len();
        self.0.retain(|item| item != target);
        self.0.len() != before
    }

    pub fn contains(&self, target: &EntityRef) -> bool {
        self.0.contains(target)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::DependencyList;
    use crate::model::entity::EntityRef;

    #[test]
    fn unset_column_decodes_to_empty_list() {
        assert!(DependencyList::from_json(None).unwrap().is_empty());
    }

    #[test]
    fn stored_duplicates_collapse_on_decode() {
        let list = DependencyList::from_json(Some(
            r#"[{"type":"menu","id":1},{"type":"menu","id":1},{"type":"page","id":1}]"#,
        ))
        .unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&EntityRef::new("page", 1)));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut list = DependencyList::new();
        list.insert(EntityRef::new("menu", 4));
        assert!(list.remove(&EntityRef::new("menu", 4)));
        assert!(!list.remove(&EntityRef::new("menu", 4)));
    }
}
