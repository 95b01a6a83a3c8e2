#![allow(dead_code)]

use chainstore_core::model::field::FieldError;
use chainstore_core::{
    fillable_field, Entity, EntityMeta, FieldDescriptor, ManualClock, SqliteEntityStore,
    VersioningConfig, VersioningService, Versionable,
};
use rusqlite::Connection;
use std::sync::Arc;

pub const HOUR_MS: i64 = 60 * 60 * 1000;
pub const T0: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    meta: EntityMeta,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

impl Page {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            body: format!("{title} body"),
            ..Self::default()
        }
    }
}

impl Entity for Page {
    const ENTITY_TYPE: &'static str = "page";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn fillable_fields() -> Vec<FieldDescriptor<Self>> {
        vec![
            fillable_field!(Page, title),
            fillable_field!(Page, body),
            fillable_field!(Page, tags),
        ]
    }
}

impl Versionable for Page {}

/// Not versionable: only plain saves and deletes apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Menu {
    meta: EntityMeta,
    pub label: String,
}

impl Menu {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Menu {
    const ENTITY_TYPE: &'static str = "menu";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn fillable_fields() -> Vec<FieldDescriptor<Self>> {
        vec![fillable_field!(Menu, label)]
    }
}

/// Versionable entity whose `code` setter rejects empty values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snippet {
    meta: EntityMeta,
    pub code: String,
}

impl Entity for Snippet {
    const ENTITY_TYPE: &'static str = "snippet";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn fillable_fields() -> Vec<FieldDescriptor<Self>> {
        vec![FieldDescriptor::new(
            "code",
            |snippet: &Snippet| Ok(serde_json::Value::String(snippet.code.clone())),
            |snippet: &mut Snippet, value| match value {
                serde_json::Value::String(code) if !code.is_empty() => {
                    snippet.code = code;
                    Ok(())
                }
                _ => Err(FieldError::new("code must be a non-empty string")),
            },
        )]
    }
}

impl Versionable for Snippet {}

pub fn service(conn: &Connection) -> VersioningService<SqliteEntityStore<'_>> {
    VersioningService::new(
        SqliteEntityStore::try_new(conn).unwrap(),
        &VersioningConfig::default(),
    )
}

pub fn service_with_clock<'conn>(
    conn: &'conn Connection,
    clock: &ManualClock,
) -> VersioningService<SqliteEntityStore<'conn>> {
    VersioningService::new(
        SqliteEntityStore::with_clock(conn, Arc::new(clock.clone())).unwrap(),
        &VersioningConfig::default(),
    )
}
