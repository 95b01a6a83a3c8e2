//! Fillable field descriptors.
//!
//! Each entity type lists its copyable business fields as `(name, getter,
//! setter)` triples. The engine iterates that list to snapshot revisions,
//! swap revision contents and (de)hydrate store payloads.

use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type FieldValue = Value;
pub type FieldGetter<T> = fn(&T) -> Result<FieldValue, FieldError>;
pub type FieldSetter<T> = fn(&mut T, FieldValue) -> Result<(), FieldError>;

/// Failure to convert a field to or from its stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    message: String,
}

impl FieldError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for FieldError {}

impl From<serde_json::Error> for FieldError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(value.to_string())
    }
}

/// Name plus accessor pair for one fillable field.
pub struct FieldDescriptor<T> {
    name: &'static str,
    get: FieldGetter<T>,
    set: FieldSetter<T>,
}

impl<T> FieldDescriptor<T> {
    pub fn new(name: &'static str, get: FieldGetter<T>, set: FieldSetter<T>) -> Self {
        Self { name, get, set }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn read(&self, entity: &T) -> Result<FieldValue, FieldError> {
        (self.get)(entity)
    }

    pub fn write(&self, entity: &mut T, value: FieldValue) -> Result<(), FieldError> {
        (self.set)(entity, value)
    }
}

impl<T> std::fmt::Debug for FieldDescriptor<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

/// Copies every described field from `source` into `target`.
///
/// Returns the name of the failing field with its error.
pub fn copy_fields<T>(
    fields: &[FieldDescriptor<T>],
    source: &T,
    target: &mut T,
) -> Result<(), (&'static str, FieldError)> {
    for field in fields {
        let value = field.read(source).map_err(|err| (field.name, err))?;
        field.write(target, value).map_err(|err| (field.name, err))?;
    }
    Ok(())
}

/// Exchanges every described field between `left` and `right`.
pub fn swap_fields<T>(
    fields: &[FieldDescriptor<T>],
    left: &mut T,
    right: &mut T,
) -> Result<(), (&'static str, FieldError)> {
    for field in fields {
        let left_value = field.read(left).map_err(|err| (field.name, err))?;
        let right_value = field.read(right).map_err(|err| (field.name, err))?;
        field.write(left, right_value).map_err(|err| (field.name, err))?;
        field.write(right, left_value).map_err(|err| (field.name, err))?;
    }
    Ok(())
}

/// Builds a `FieldDescriptor` for a serde-compatible struct field.
///
/// ```ignore
/// fn fillable_fields() -> Vec<FieldDescriptor<Self>> {
///     vec![fillable_field!(Page, title), fillable_field!(Page, body)]
/// }
/// ```
#[macro_export]
macro_rules! fillable_field {
    ($entity:ty, $field:ident) => {
        $crate::model::field::FieldDescriptor::<$entity>::new(
            stringify!($field),
            |entity: &$entity| Ok($crate::serde_json::to_value(&entity.$field)?),
            |entity: &mut $entity, value| {
                entity.$field = $crate::serde_json::from_value(value)?;
                Ok(())
            },
        )
    };
}
