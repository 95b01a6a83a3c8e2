//! Conversion between typed entities and `StoredRecord`s.
//!
//! Fillable fields travel through the entity's descriptor list; engine
//! metadata travels through `EntityMeta`.

use crate::model::entity::{ContractViolation, Entity};
use crate::model::field::FieldError;
use crate::repo::record::StoredRecord;
use crate::repo::store::{RepoError, RepoResult};

/// Builds the record that persists `entity`.
pub fn to_record<T: Entity>(entity: &T) -> Result<StoredRecord, ContractViolation> {
    let meta = entity.meta();
    let mut record = StoredRecord::new(T::ENTITY_TYPE);
    record.id = meta.id();
    record.head_id = meta.head_id();
    record.stage = meta.stage();
    record.dependencies = meta.dependencies().clone();
    record.created_at = meta.created_at();
    record.updated_at = meta.updated_at();
    record.preserve_updated_at = meta.is_updated_at_preserved();
    record.deleted_at = meta.deleted_at();
    record.versions = meta.versions().to_vec();

    for field in T::fillable_fields() {
        let value = field
            .read(entity)
            .map_err(|err| field_mismatch::<T>(field.name(), &err))?;
        record.payload.insert(field.name().to_string(), value);
    }
    Ok(record)
}

/// Hydrates a typed entity from a loaded record.
///
/// # Errors
/// - `RepoError::Contract` when the record belongs to another entity type.
/// - `RepoError::InvalidData` when the payload does not match the declared
///   fillable fields exactly.
pub fn from_record<T: Entity>(record: StoredRecord) -> RepoResult<T> {
    if record.entity_type != T::ENTITY_TYPE {
        return Err(ContractViolation::EntityTypeMismatch {
            expected: T::ENTITY_TYPE.to_string(),
            actual: record.entity_type,
        }
        .into());
    }
    let id = record
        .id
        .ok_or(ContractViolation::UnsavedEntity {
            entity_type: T::ENTITY_TYPE,
        })?;

    let mut entity = T::default();
    let mut payload = record.payload;
    for field in T::fillable_fields() {
        let value = payload.remove(field.name()).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "{}#{id} payload is missing fillable field `{}`",
                T::ENTITY_TYPE,
                field.name()
            ))
        })?;
        field.write(&mut entity, value).map_err(|err| {
            RepoError::InvalidData(format!(
                "{}#{id} field `{}`: {err}",
                T::ENTITY_TYPE,
                field.name()
            ))
        })?;
    }
    if let Some(unknown) = payload.keys().next() {
        return Err(RepoError::InvalidData(format!(
            "{}#{id} payload has undeclared field `{unknown}`",
            T::ENTITY_TYPE
        )));
    }

    let meta = entity.meta_mut();
    meta.set_id(id);
    meta.set_head(T::ENTITY_TYPE, record.head_id)?;
    meta.set_stage(record.stage);
    meta.set_versions(record.versions);
    meta.set_dependencies(record.dependencies);
    meta.set_deleted_at(record.deleted_at);
    if let (Some(created_at), Some(updated_at)) = (record.created_at, record.updated_at) {
        meta.set_timestamps(created_at, updated_at);
    }
    Ok(entity)
}

/// Copies store-assigned state (id, timestamps) back after a write.
pub(crate) fn sync_after_write<T: Entity>(entity: &mut T, record: &StoredRecord) {
    let meta = entity.meta_mut();
    if let Some(id) = record.id {
        meta.set_id(id);
    }
    let updated_at = record.updated_at.unwrap_or_default();
    let created_at = record.created_at.or(meta.created_at()).unwrap_or(updated_at);
    meta.set_timestamps(created_at, updated_at);
}

pub(crate) fn field_mismatch<T: Entity>(field: &str, err: &FieldError) -> ContractViolation {
    ContractViolation::FieldMismatch {
        entity_type: T::ENTITY_TYPE.to_string(),
        field: field.to_string(),
        reason: err.to_string(),
    }
}
