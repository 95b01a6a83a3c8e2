//! Persistence contract and SQLite implementation.
//!
//! # Responsibility
//! - Load, persist, remove and bulk-update entity rows of any type.
//! - Group every write into one open transaction until `commit()`.
//! - Fire lifecycle hooks around row writes.
//!
//! # Invariants
//! - Write paths validate entity type names and chain pointers before SQL runs.
//! - Read paths reject invalid persisted state instead of masking it.
//! - `versions` on a loaded head lists its version ids in ascending id order.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::clock::{Clock, SystemClock};
use crate::model::dependency::DependencyList;
use crate::model::entity::{validate_entity_type, ContractViolation, EntityId, EntityRef, Stage};
use crate::repo::lifecycle::{dispatch, LifecycleHook, LifecycleListener};
use crate::repo::record::{Assignment, Predicate, StoredRecord};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value as JsonValue;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const RECORD_SELECT_SQL: &str = "SELECT
    id,
    entity_type,
    head_id,
    stage,
    payload,
    dependencies,
    created_at,
    updated_at,
    deleted_at
FROM entities";

pub type RepoResult<T> = Result<T, RepoError>;

/// Store-level error.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    NotFound(EntityRef),
    InvalidData(String),
    Contract(ContractViolation),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(target) => write!(f, "entity not found: {target}"),
            Self::InvalidData(message) => write!(f, "invalid persisted entity data: {message}"),
            Self::Contract(err) => write!(f, "{err}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "entity store requires schema version {expected_version}, got {actual_version}"
            ),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Contract(err) => Some(err),
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
            Self::UninitializedConnection { .. } => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ContractViolation> for RepoError {
    fn from(value: ContractViolation) -> Self {
        Self::Contract(value)
    }
}

/// Persistence contract consumed by the lifecycle services.
///
/// Writes join the currently open transaction (opening one when needed);
/// nothing is durable until `commit()`.
pub trait EntityStore {
    /// Loads one row. Returns `None` when no row of that type has the id.
    fn load_record(&self, entity_type: &str, id: EntityId) -> RepoResult<Option<StoredRecord>>;

    /// Inserts (`id == None`) or updates the record and returns its id.
    /// Refreshes the record's id and timestamps and consumes its
    /// preserve-`updated_at` pin.
    fn persist_record(&self, record: &mut StoredRecord) -> RepoResult<EntityId>;

    fn remove_record(&self, entity_type: &str, id: EntityId) -> RepoResult<()>;

    /// Applies `assignments` to every row matching `predicate`; returns the
    /// number of rows changed.
    fn bulk_update_where(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> RepoResult<usize>;

    /// Lists matching rows ordered by id.
    fn list_records(&self, entity_type: &str, predicate: &Predicate)
        -> RepoResult<Vec<StoredRecord>>;

    /// Ids of the versions pointing at `head_id`, oldest first.
    fn version_ids(&self, entity_type: &str, head_id: EntityId) -> RepoResult<Vec<EntityId>>;

    fn commit(&self) -> RepoResult<()>;

    fn rollback(&self) -> RepoResult<()>;

    fn now_ms(&self) -> i64;
}

impl<S: EntityStore + ?Sized> EntityStore for &S {
    fn load_record(&self, entity_type: &str, id: EntityId) -> RepoResult<Option<StoredRecord>> {
        (**self).load_record(entity_type, id)
    }

    fn persist_record(&self, record: &mut StoredRecord) -> RepoResult<EntityId> {
        (**self).persist_record(record)
    }

    fn remove_record(&self, entity_type: &str, id: EntityId) -> RepoResult<()> {
        (**self).remove_record(entity_type, id)
    }

    fn bulk_update_where(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> RepoResult<usize> {
        (**self).bulk_update_where(entity_type, predicate, assignments)
    }

    fn list_records(
        &self,
        entity_type: &str,
        predicate: &Predicate,
    ) -> RepoResult<Vec<StoredRecord>> {
        (**self).list_records(entity_type, predicate)
    }

    fn version_ids(&self, entity_type: &str, head_id: EntityId) -> RepoResult<Vec<EntityId>> {
        (**self).version_ids(entity_type, head_id)
    }

    fn commit(&self) -> RepoResult<()> {
        (**self).commit()
    }

    fn rollback(&self) -> RepoResult<()> {
        (**self).rollback()
    }

    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

/// SQLite-backed entity store.
pub struct SqliteEntityStore<'conn> {
    conn: &'conn Connection,
    clock: Arc<dyn Clock>,
    listeners: Vec<Box<dyn LifecycleListener + 'conn>>,
}

impl<'conn> SqliteEntityStore<'conn> {
    /// Creates a store over a migrated connection using the system clock.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    /// Creates a store whose timestamps come from `clock`.
    pub fn with_clock(conn: &'conn Connection, clock: Arc<dyn Clock>) -> RepoResult<Self> {
        ensure_store_connection_ready(conn)?;
        Ok(Self {
            conn,
            clock,
            listeners: Vec::new(),
        })
    }

    /// Registers a lifecycle listener. Listeners run in registration order.
    pub fn register_listener(&mut self, listener: impl LifecycleListener + 'conn) {
        self.listeners.push(Box::new(listener));
    }

    /// Row count per entity type as `(entity_type, heads, versions, published)`.
    pub fn type_summary(&self) -> RepoResult<Vec<(String, i64, i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                entity_type,
                SUM(CASE WHEN head_id IS NULL THEN 1 ELSE 0 END),
                SUM(CASE WHEN head_id IS NOT NULL THEN 1 ELSE 0 END),
                SUM(CASE WHEN stage = 1 THEN 1 ELSE 0 END)
             FROM entities
             GROUP BY entity_type
             ORDER BY entity_type ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut summary = Vec::new();
        while let Some(row) = rows.next()? {
            summary.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
        }
        Ok(summary)
    }

    fn fire(&self, hook: LifecycleHook, record: &StoredRecord) -> RepoResult<()> {
        for listener in &self.listeners {
            dispatch(listener.as_ref(), hook, self, record)?;
        }
        Ok(())
    }

    fn ensure_transaction(&self) -> RepoResult<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE;")?;
            debug!("event=store_begin module=repo status=ok");
        }
        Ok(())
    }

    /// Checks that `head_id` names an existing head of the same type.
    fn check_head_pointer(&self, record: &StoredRecord) -> RepoResult<()> {
        let Some(head_id) = record.head_id else {
            return Ok(());
        };
        if record.id == Some(head_id) {
            return Err(ContractViolation::SelfReferencingHead {
                entity_type: record.entity_type.clone(),
                id: head_id,
            }
            .into());
        }

        let head: Option<(String, Option<EntityId>)> = self
            .conn
            .query_row(
                "SELECT entity_type, head_id FROM entities WHERE id = ?1;",
                [head_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match head {
            None => Err(RepoError::NotFound(EntityRef::new(
                record.entity_type.clone(),
                head_id,
            ))),
            Some((head_type, _)) if head_type != record.entity_type => {
                Err(ContractViolation::EntityTypeMismatch {
                    expected: record.entity_type.clone(),
                    actual: head_type,
                }
                .into())
            }
            Some((_, Some(_))) => Err(ContractViolation::HeadIsVersion {
                entity_type: record.entity_type.clone(),
                head_id,
            }
            .into()),
            Some((_, None)) => Ok(()),
        }
    }

    fn row_exists(&self, entity_type: &str, id: EntityId) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1 AND entity_type = ?2);",
            params![id, entity_type],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn with_versions(&self, mut record: StoredRecord) -> RepoResult<StoredRecord> {
        if let (Some(id), true) = (record.id, record.is_head()) {
            record.versions = self.version_ids(&record.entity_type, id)?;
        }
        Ok(record)
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn load_record(&self, entity_type: &str, id: EntityId) -> RepoResult<Option<StoredRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL}
             WHERE id = ?1
               AND entity_type = ?2;"
        ))?;
        let mut rows = stmt.query(params![id, entity_type])?;
        match rows.next()? {
            Some(row) => Ok(Some(self.with_versions(parse_record_row(row)?)?)),
            None => Ok(None),
        }
    }

    fn persist_record(&self, record: &mut StoredRecord) -> RepoResult<EntityId> {
        validate_entity_type(&record.entity_type)?;
        self.check_head_pointer(record)?;
        let payload = serde_json::to_string(&record.payload)
            .map_err(|err| RepoError::InvalidData(format!("unserializable payload: {err}")))?;
        let dependencies = encode_dependencies(&record.dependencies)?;
        let now = self.clock.now_ms();
        let updated_at = match (record.preserve_updated_at, record.updated_at) {
            (true, Some(pinned)) => pinned,
            _ => now,
        };

        self.ensure_transaction()?;
        match record.id {
            None => {
                self.conn.execute(
                    "INSERT INTO entities (
                        entity_type,
                        head_id,
                        stage,
                        payload,
                        dependencies,
                        created_at,
                        updated_at,
                        deleted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                    params![
                        record.entity_type.as_str(),
                        record.head_id,
                        record.stage.to_db(),
                        payload,
                        dependencies,
                        now,
                        updated_at,
                        record.deleted_at,
                    ],
                )?;
                let id = self.conn.last_insert_rowid();
                record.id = Some(id);
                record.created_at = Some(now);
                record.updated_at = Some(updated_at);
                record.preserve_updated_at = false;
                debug!(
                    "event=entity_insert module=repo status=ok entity_type={} entity_id={id}",
                    record.entity_type
                );
                self.fire(LifecycleHook::AfterCreate, record)?;
                Ok(id)
            }
            Some(id) => {
                if !self.row_exists(&record.entity_type, id)? {
                    return Err(RepoError::NotFound(EntityRef::new(
                        record.entity_type.clone(),
                        id,
                    )));
                }
                record.updated_at = Some(updated_at);
                record.preserve_updated_at = false;
                self.fire(LifecycleHook::BeforeUpdate, record)?;
                self.conn.execute(
                    "UPDATE entities
                     SET
                        head_id = ?1,
                        stage = ?2,
                        payload = ?3,
                        dependencies = ?4,
                        updated_at = ?5,
                        deleted_at = ?6
                     WHERE id = ?7
                       AND entity_type = ?8;",
                    params![
                        record.head_id,
                        record.stage.to_db(),
                        payload,
                        dependencies,
                        updated_at,
                        record.deleted_at,
                        id,
                        record.entity_type.as_str(),
                    ],
                )?;
                debug!(
                    "event=entity_update module=repo status=ok entity_type={} entity_id={id}",
                    record.entity_type
                );
                Ok(id)
            }
        }
    }

    fn remove_record(&self, entity_type: &str, id: EntityId) -> RepoResult<()> {
        let record = self
            .load_record(entity_type, id)?
            .ok_or_else(|| RepoError::NotFound(EntityRef::new(entity_type, id)))?;

        self.ensure_transaction()?;
        self.fire(LifecycleHook::BeforeRemove, &record)?;
        self.conn.execute(
            "DELETE FROM entities WHERE id = ?1 AND entity_type = ?2;",
            params![id, entity_type],
        )?;
        debug!("event=entity_remove module=repo status=ok entity_type={entity_type} entity_id={id}");
        Ok(())
    }

    fn bulk_update_where(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> RepoResult<usize> {
        validate_entity_type(entity_type)?;
        if assignments.is_empty() {
            return Ok(0);
        }

        let explicit_timestamp = assignments
            .iter()
            .any(|assignment| matches!(assignment, Assignment::UpdatedAt(_)));
        let now = self.clock.now_ms();

        self.ensure_transaction()?;
        for mut record in self.list_records(entity_type, predicate)? {
            for assignment in assignments {
                assignment.apply(&mut record);
            }
            if !explicit_timestamp {
                record.updated_at = Some(now);
            }
            self.fire(LifecycleHook::BeforeUpdate, &record)?;
        }

        let mut binds = Vec::new();
        let mut set_clauses = assignments
            .iter()
            .map(|assignment| assignment.to_sql(&mut binds))
            .collect::<Vec<_>>();
        if !explicit_timestamp {
            set_clauses.push("updated_at = ?");
            binds.push(Value::Integer(now));
        }
        binds.push(Value::Text(entity_type.to_string()));
        let where_sql = predicate.to_sql(&mut binds);

        let changed = self.conn.execute(
            &format!(
                "UPDATE entities SET {} WHERE entity_type = ? AND {where_sql};",
                set_clauses.join(", ")
            ),
            params_from_iter(binds),
        )?;
        debug!(
            "event=entity_bulk_update module=repo status=ok entity_type={entity_type} changed={changed}"
        );
        Ok(changed)
    }

    fn list_records(
        &self,
        entity_type: &str,
        predicate: &Predicate,
    ) -> RepoResult<Vec<StoredRecord>> {
        let mut binds = vec![Value::Text(entity_type.to_string())];
        let where_sql = predicate.to_sql(&mut binds);
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL}
             WHERE entity_type = ?
               AND {where_sql}
             ORDER BY id ASC;"
        ))?;
        let mut rows = stmt.query(params_from_iter(binds))?;
        let mut parsed = Vec::new();
        while let Some(row) = rows.next()? {
            parsed.push(parse_record_row(row)?);
        }
        parsed
            .into_iter()
            .map(|record| self.with_versions(record))
            .collect()
    }

    fn version_ids(&self, entity_type: &str, head_id: EntityId) -> RepoResult<Vec<EntityId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id
             FROM entities
             WHERE head_id = ?1
               AND entity_type = ?2
             ORDER BY id ASC;",
        )?;
        let mut rows = stmt.query(params![head_id, entity_type])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    fn commit(&self) -> RepoResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT;")?;
            debug!("event=store_commit module=repo status=ok");
        }
        Ok(())
    }

    fn rollback(&self) -> RepoResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK;")?;
            warn!("event=store_rollback module=repo status=ok");
        }
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

fn ensure_store_connection_ready(conn: &Connection) -> RepoResult<()> {
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let expected_version = latest_version();
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }
    Ok(())
}

fn encode_dependencies(dependencies: &DependencyList) -> RepoResult<Option<String>> {
    if dependencies.is_empty() {
        return Ok(None);
    }
    dependencies
        .to_json()
        .map(Some)
        .map_err(|err| RepoError::InvalidData(format!("unserializable dependencies: {err}")))
}

fn parse_record_row(row: &Row<'_>) -> RepoResult<StoredRecord> {
    let id: EntityId = row.get("id")?;
    let entity_type: String = row.get("entity_type")?;
    let head_id: Option<EntityId> = row.get("head_id")?;
    if head_id == Some(id) {
        return Err(RepoError::InvalidData(format!(
            "{entity_type}#{id} references itself in entities.head_id"
        )));
    }

    let stage_value: i64 = row.get("stage")?;
    let stage = Stage::from_db(stage_value).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid stage `{stage_value}` in entities.stage"))
    })?;

    let payload_text: String = row.get("payload")?;
    let payload = match serde_json::from_str::<JsonValue>(&payload_text) {
        Ok(JsonValue::Object(map)) => map,
        _ => {
            return Err(RepoError::InvalidData(format!(
                "entities.payload of {entity_type}#{id} is not a JSON object"
            )));
        }
    };

    let dependencies_text: Option<String> = row.get("dependencies")?;
    let dependencies = DependencyList::from_json(dependencies_text.as_deref()).map_err(|err| {
        RepoError::InvalidData(format!(
            "invalid entities.dependencies of {entity_type}#{id}: {err}"
        ))
    })?;

    Ok(StoredRecord {
        entity_type,
        id: Some(id),
        head_id,
        stage,
        payload,
        dependencies,
        created_at: Some(row.get("created_at")?),
        updated_at: Some(row.get("updated_at")?),
        preserve_updated_at: false,
        deleted_at: row.get("deleted_at")?,
        versions: Vec::new(),
    })
}
