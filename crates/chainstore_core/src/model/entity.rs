//! Entity identity, chain metadata and the `Entity` / `Versionable` contracts.
//!
//! # Responsibility
//! - Carry the bookkeeping the engine needs on every entity (`EntityMeta`).
//! - Reject malformed chain pointers at construction time.
//!
//! # Invariants
//! - `head_id == None` is the only representation of "this revision is the
//!   head". A self-referencing head pointer is rejected.
//! - `versions` is only meaningful on a head; it lists sibling ids in
//!   creation order.

use crate::model::dependency::DependencyList;
use crate::model::field::FieldDescriptor;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

static ENTITY_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid entity type regex"));

/// Store-assigned primary key.
pub type EntityId = i64;

/// `(entity type, id)` pair addressing one persisted row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: EntityId) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
        }
    }

    /// Builds a reference to a persisted entity.
    ///
    /// # Errors
    /// - `ContractViolation::UnsavedEntity` when the entity has no id yet.
    pub fn of<T: Entity>(entity: &T) -> Result<Self, ContractViolation> {
        let id = entity
            .meta()
            .id()
            .ok_or(ContractViolation::UnsavedEntity {
                entity_type: T::ENTITY_TYPE,
            })?;
        Ok(Self::new(T::ENTITY_TYPE, id))
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.id)
    }
}

/// Publication stage of a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Draft,
    Published,
}

impl Stage {
    pub fn is_published(self) -> bool {
        self == Self::Published
    }

    pub(crate) fn to_db(self) -> i64 {
        match self {
            Self::Draft => 0,
            Self::Published => 1,
        }
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Draft),
            1 => Some(Self::Published),
            _ => None,
        }
    }
}

/// Caller-side misuse of the engine. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// Operation requires a persisted entity.
    UnsavedEntity { entity_type: &'static str },
    /// A record of one type was handed to code expecting another.
    EntityTypeMismatch { expected: String, actual: String },
    /// A fillable field could not be read or written.
    FieldMismatch {
        entity_type: String,
        field: String,
        reason: String,
    },
    /// A revision was pointed at itself as head.
    SelfReferencingHead { entity_type: String, id: EntityId },
    /// A revision was pointed at a row that is itself a version.
    HeadIsVersion { entity_type: String, head_id: EntityId },
    /// Entity type name is not a lowercase identifier.
    InvalidEntityType(String),
}

impl Display for ContractViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsavedEntity { entity_type } => {
                write!(f, "{entity_type} entity must be persisted first")
            }
            Self::EntityTypeMismatch { expected, actual } => {
                write!(f, "expected entity type `{expected}`, got `{actual}`")
            }
            Self::FieldMismatch {
                entity_type,
                field,
                reason,
            } => write!(f, "fillable field `{entity_type}.{field}`: {reason}"),
            Self::SelfReferencingHead { entity_type, id } => {
                write!(f, "{entity_type}#{id} cannot be its own head")
            }
            Self::HeadIsVersion {
                entity_type,
                head_id,
            } => write!(f, "{entity_type}#{head_id} is a version and cannot be a head"),
            Self::InvalidEntityType(value) => write!(
                f,
                "invalid entity type `{value}`; expected lowercase identifier"
            ),
        }
    }
}

impl Error for ContractViolation {}

/// Validates an entity type name (`^[a-z][a-z0-9_]*$`).
pub fn validate_entity_type(entity_type: &str) -> Result<(), ContractViolation> {
    if ENTITY_TYPE_RE.is_match(entity_type) {
        Ok(())
    } else {
        Err(ContractViolation::InvalidEntityType(entity_type.to_string()))
    }
}

/// Engine bookkeeping embedded in every entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMeta {
    id: Option<EntityId>,
    head_id: Option<EntityId>,
    versions: Vec<EntityId>,
    stage: Stage,
    created_at: Option<i64>,
    updated_at: Option<i64>,
    preserve_updated_at: bool,
    deleted_at: Option<i64>,
    dependencies: DependencyList,
}

impl EntityMeta {
    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    /// Head pointer. `None` means this revision is the head.
    pub fn head_id(&self) -> Option<EntityId> {
        self.head_id
    }

    pub fn is_head(&self) -> bool {
        self.head_id.is_none()
    }

    /// Sibling revision ids, oldest first. Empty on non-head revisions.
    pub fn versions(&self) -> &[EntityId] {
        &self.versions
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn is_published(&self) -> bool {
        self.stage.is_published()
    }

    pub fn publish(&mut self) {
        self.stage = Stage::Published;
    }

    pub fn unpublish(&mut self) {
        self.stage = Stage::Draft;
    }

    pub fn created_at(&self) -> Option<i64> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<i64> {
        self.updated_at
    }

    /// Keeps the current `updated_at` for the next write only.
    pub fn preserve_updated_at(&mut self) {
        self.preserve_updated_at = true;
    }

    /// Sets `updated_at` and keeps it for the next write only.
    pub fn pin_updated_at(&mut self, updated_at: Option<i64>) {
        self.updated_at = updated_at;
        self.preserve_updated_at = true;
    }

    pub fn is_updated_at_preserved(&self) -> bool {
        self.preserve_updated_at
    }

    /// Soft-delete timestamp. May lie in the future.
    pub fn deleted_at(&self) -> Option<i64> {
        self.deleted_at
    }

    /// Schedules (or with `None` cancels) a soft delete; takes effect on the
    /// next write.
    pub fn set_deleted_at(&mut self, deleted_at: Option<i64>) {
        self.deleted_at = deleted_at;
    }

    /// True once `now` has reached the soft-delete timestamp.
    pub fn is_deleted_at(&self, now: i64) -> bool {
        self.deleted_at.is_some_and(|deleted_at| deleted_at <= now)
    }

    /// Instance-level cache dependencies.
    pub fn dependencies(&self) -> &DependencyList {
        &self.dependencies
    }

    pub fn dependencies_mut(&mut self) -> &mut DependencyList {
        &mut self.dependencies
    }

    pub(crate) fn set_head(
        &mut self,
        entity_type: &str,
        head_id: Option<EntityId>,
    ) -> Result<(), ContractViolation> {
        if let (Some(head_id), Some(id)) = (head_id, self.id) {
            if head_id == id {
                return Err(ContractViolation::SelfReferencingHead {
                    entity_type: entity_type.to_string(),
                    id,
                });
            }
        }
        self.head_id = head_id;
        Ok(())
    }

    pub(crate) fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    pub(crate) fn set_versions(&mut self, versions: Vec<EntityId>) {
        self.versions = versions;
    }

    pub(crate) fn push_version(&mut self, id: EntityId) {
        if !self.versions.contains(&id) {
            self.versions.push(id);
        }
    }

    pub(crate) fn set_timestamps(&mut self, created_at: i64, updated_at: i64) {
        self.created_at = Some(created_at);
        self.updated_at = Some(updated_at);
        self.preserve_updated_at = false;
    }

    pub(crate) fn set_dependencies(&mut self, dependencies: DependencyList) {
        self.dependencies = dependencies;
    }
}

/// A persisted entity type with explicitly declared fillable fields.
pub trait Entity: Default + Clone {
    /// Stable type name stored with every row (`^[a-z][a-z0-9_]*$`).
    const ENTITY_TYPE: &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Business fields the engine may copy and swap. Never includes the id,
    /// chain pointers, stage or timestamps.
    fn fillable_fields() -> Vec<FieldDescriptor<Self>>;
}

/// Entities that take part in version chains.
pub trait Versionable: Entity {}

#[cfg(test)]
mod tests {
    use super::{validate_entity_type, ContractViolation, EntityMeta, EntityRef, Stage};

    #[test]
    fn self_referencing_head_is_rejected() {
        let mut meta = EntityMeta::default();
        meta.set_id(7);
        let err = meta.set_head("page", Some(7)).unwrap_err();
        assert_eq!(
            err,
            ContractViolation::SelfReferencingHead {
                entity_type: "page".to_string(),
                id: 7
            }
        );
        assert!(meta.is_head());
    }

    #[test]
    fn pin_updated_at_marks_preserve_flag() {
        let mut meta = EntityMeta::default();
        meta.pin_updated_at(Some(42));
        assert_eq!(meta.updated_at(), Some(42));
        assert!(meta.is_updated_at_preserved());

        meta.set_timestamps(1, 2);
        assert!(!meta.is_updated_at_preserved());
    }

    #[test]
    fn scheduled_soft_delete_takes_effect_at_its_timestamp() {
        let mut meta = EntityMeta::default();
        assert!(!meta.is_deleted_at(i64::MAX));

        meta.set_deleted_at(Some(100));
        assert!(!meta.is_deleted_at(99));
        assert!(meta.is_deleted_at(100));

        meta.set_deleted_at(None);
        assert!(!meta.is_deleted_at(100));
    }

    #[test]
    fn stage_db_values_roundtrip() {
        assert_eq!(Stage::from_db(Stage::Published.to_db()), Some(Stage::Published));
        assert_eq!(Stage::from_db(9), None);
    }

    #[test]
    fn entity_type_names_must_be_lowercase_identifiers() {
        assert!(validate_entity_type("menu_item").is_ok());
        assert!(validate_entity_type("Menu").is_err());
        assert!(validate_entity_type("").is_err());
    }

    #[test]
    fn entity_ref_serializes_with_type_key() {
        let value = serde_json::to_string(&EntityRef::new("page", 3)).unwrap();
        assert_eq!(value, r#"{"type":"page","id":3}"#);
    }
}
