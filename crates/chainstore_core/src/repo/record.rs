//! Untyped row representation shared by every entity type.

use crate::model::dependency::DependencyList;
use crate::model::entity::{EntityId, EntityRef, Stage};
use rusqlite::types::Value;
use serde_json::{Map, Value as JsonValue};

/// One `entities` row as the store sees it.
///
/// `payload` holds the fillable fields keyed by descriptor name. `versions`
/// is derived on load (rows whose `head_id` points here) and never written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub entity_type: String,
    pub id: Option<EntityId>,
    pub head_id: Option<EntityId>,
    pub stage: Stage,
    pub payload: Map<String, JsonValue>,
    pub dependencies: DependencyList,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    /// Keep `updated_at` as-is for the next write only.
    pub preserve_updated_at: bool,
    pub deleted_at: Option<i64>,
    pub versions: Vec<EntityId>,
}

impl StoredRecord {
    /// Creates an unsaved head record with an empty payload.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: None,
            head_id: None,
            stage: Stage::Draft,
            payload: Map::new(),
            dependencies: DependencyList::new(),
            created_at: None,
            updated_at: None,
            preserve_updated_at: false,
            deleted_at: None,
            versions: Vec::new(),
        }
    }

    pub fn is_head(&self) -> bool {
        self.head_id.is_none()
    }

    /// Id of the chain head this record belongs to.
    pub fn chain_head_id(&self) -> Option<EntityId> {
        self.head_id.or(self.id)
    }

    pub fn entity_ref(&self) -> Option<EntityRef> {
        self.id
            .map(|id| EntityRef::new(self.entity_type.clone(), id))
    }
}

/// Row filter for listings and bulk updates. Always scoped to one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    All,
    Id(EntityId),
    /// Heads only (excludes versions).
    HeadsOnly,
    /// Non-head revisions only.
    VersionsOnly,
    /// The head with the given id plus every version pointing at it.
    ChainOf(EntityId),
    Stage(Stage),
    /// Rows not soft-deleted as of the given time (null or future `deleted_at`).
    ExcludeTrashed(i64),
    /// Rows soft-deleted at or before the given time.
    OnlyTrashed(i64),
    And(Vec<Predicate>),
}

impl Predicate {
    /// Renders the predicate as a SQL boolean expression, pushing bind values
    /// in placeholder order.
    pub(crate) fn to_sql(&self, binds: &mut Vec<Value>) -> String {
        match self {
            Self::All => "1 = 1".to_string(),
            Self::Id(id) => {
                binds.push(Value::Integer(*id));
                "id = ?".to_string()
            }
            Self::HeadsOnly => "head_id IS NULL".to_string(),
            Self::VersionsOnly => "head_id IS NOT NULL".to_string(),
            Self::ChainOf(head_id) => {
                binds.push(Value::Integer(*head_id));
                binds.push(Value::Integer(*head_id));
                "(id = ? OR head_id = ?)".to_string()
            }
            Self::Stage(stage) => {
                binds.push(Value::Integer(stage.to_db()));
                "stage = ?".to_string()
            }
            Self::ExcludeTrashed(now) => {
                binds.push(Value::Integer(*now));
                "(deleted_at IS NULL OR deleted_at > ?)".to_string()
            }
            Self::OnlyTrashed(now) => {
                binds.push(Value::Integer(*now));
                "(deleted_at IS NOT NULL AND deleted_at <= ?)".to_string()
            }
            Self::And(parts) if parts.is_empty() => "1 = 1".to_string(),
            Self::And(parts) => {
                let rendered = parts
                    .iter()
                    .map(|part| part.to_sql(binds))
                    .collect::<Vec<_>>();
                format!("({})", rendered.join(" AND "))
            }
        }
    }
}

/// Column assignment applied by `bulk_update_where`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Stage(Stage),
    HeadId(Option<EntityId>),
    UpdatedAt(i64),
}

impl Assignment {
    pub(crate) fn apply(&self, record: &mut StoredRecord) {
        match self {
            Self::Stage(stage) => record.stage = *stage,
            Self::HeadId(head_id) => record.head_id = *head_id,
            Self::UpdatedAt(updated_at) => record.updated_at = Some(*updated_at),
        }
    }

    pub(crate) fn to_sql(&self, binds: &mut Vec<Value>) -> &'static str {
        match self {
            Self::Stage(stage) => {
                binds.push(Value::Integer(stage.to_db()));
                "stage = ?"
            }
            Self::HeadId(head_id) => {
                binds.push(head_id.map_or(Value::Null, Value::Integer));
                "head_id = ?"
            }
            Self::UpdatedAt(updated_at) => {
                binds.push(Value::Integer(*updated_at));
                "updated_at = ?"
            }
        }
    }
}
