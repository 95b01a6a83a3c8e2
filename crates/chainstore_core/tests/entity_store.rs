mod common;

use chainstore_core::db::open_db_in_memory;
use chainstore_core::repo::lifecycle::LifecycleListener;
use chainstore_core::repo::mapping::{from_record, to_record};
use chainstore_core::{
    Assignment, ContractViolation, EngineError, Entity, EntityRef, EntityStore, ManualClock,
    Predicate, RepoError, RepoResult, SqliteEntityStore, Stage, StoredRecord,
};
use common::{service, Page, HOUR_MS, T0};
use rusqlite::Connection;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

fn store_with_clock<'conn>(
    conn: &'conn Connection,
    clock: &ManualClock,
) -> SqliteEntityStore<'conn> {
    SqliteEntityStore::with_clock(conn, Arc::new(clock.clone())).unwrap()
}

fn insert(store: &SqliteEntityStore<'_>, head_id: Option<i64>) -> StoredRecord {
    let mut record = StoredRecord::new("page");
    record.head_id = head_id;
    record
        .payload
        .insert("title".to_string(), serde_json::json!("t"));
    store.persist_record(&mut record).unwrap();
    record
}

#[test]
fn store_requires_migrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let result = SqliteEntityStore::try_new(&conn);
    match result {
        Err(RepoError::UninitializedConnection {
            actual_version, ..
        }) => assert_eq!(actual_version, 0),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("unmigrated connection must be rejected"),
    }
}

#[test]
fn insert_assigns_id_and_timestamps() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let store = store_with_clock(&conn, &clock);

    let record = insert(&store, None);
    store.commit().unwrap();

    let id = record.id.unwrap();
    assert_eq!(record.created_at, Some(T0));
    assert_eq!(record.updated_at, Some(T0));
    let loaded = store.load_record("page", id).unwrap().unwrap();
    assert_eq!(loaded.payload, record.payload);
    assert_eq!(loaded.stage, Stage::Draft);
    assert!(store.load_record("menu", id).unwrap().is_none());
}

#[test]
fn update_touches_updated_at_unless_pinned_once() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let store = store_with_clock(&conn, &clock);
    let mut record = insert(&store, None);

    clock.set(T0 + HOUR_MS);
    record.preserve_updated_at = true;
    store.persist_record(&mut record).unwrap();
    assert_eq!(record.updated_at, Some(T0));
    assert!(!record.preserve_updated_at);

    clock.set(T0 + 2 * HOUR_MS);
    store.persist_record(&mut record).unwrap();
    store.commit().unwrap();

    let loaded = store.load_record("page", record.id.unwrap()).unwrap().unwrap();
    assert_eq!(loaded.created_at, Some(T0));
    assert_eq!(loaded.updated_at, Some(T0 + 2 * HOUR_MS));
}

#[test]
fn rollback_discards_open_writes() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    let record = insert(&store, None);
    store.rollback().unwrap();

    assert!(store.load_record("page", record.id.unwrap()).unwrap().is_none());
    assert!(conn.is_autocommit());
}

#[test]
fn head_pointer_must_name_existing_head_of_same_type() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    let head = insert(&store, None);
    let version = insert(&store, head.id);

    let mut self_ref = head.clone();
    self_ref.head_id = head.id;
    assert!(matches!(
        store.persist_record(&mut self_ref),
        Err(RepoError::Contract(ContractViolation::SelfReferencingHead { .. }))
    ));

    let mut nested = StoredRecord::new("page");
    nested.head_id = version.id;
    assert!(matches!(
        store.persist_record(&mut nested),
        Err(RepoError::Contract(ContractViolation::HeadIsVersion { .. }))
    ));

    let mut foreign = StoredRecord::new("menu");
    foreign.head_id = head.id;
    assert!(matches!(
        store.persist_record(&mut foreign),
        Err(RepoError::Contract(ContractViolation::EntityTypeMismatch { .. }))
    ));

    let mut dangling = StoredRecord::new("page");
    dangling.head_id = Some(999);
    assert!(matches!(
        store.persist_record(&mut dangling),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn invalid_entity_type_is_rejected_before_sql() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    let mut record = StoredRecord::new("Page");
    let err = store.persist_record(&mut record).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Contract(ContractViolation::InvalidEntityType(_))
    ));
    assert!(conn.is_autocommit());
}

#[test]
fn loaded_head_lists_versions_in_id_order() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    let head = insert(&store, None);
    let first = insert(&store, head.id);
    let second = insert(&store, head.id);
    store.commit().unwrap();

    let loaded = store.load_record("page", head.id.unwrap()).unwrap().unwrap();
    assert_eq!(loaded.versions, vec![first.id.unwrap(), second.id.unwrap()]);

    let chain = store
        .list_records("page", &Predicate::ChainOf(head.id.unwrap()))
        .unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(
        store
            .list_records("page", &Predicate::HeadsOnly)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        store
            .list_records("page", &Predicate::VersionsOnly)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn bulk_update_with_explicit_timestamp_keeps_it() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let store = store_with_clock(&conn, &clock);
    let head = insert(&store, None);
    insert(&store, head.id);

    clock.set(T0 + HOUR_MS);
    let changed = store
        .bulk_update_where(
            "page",
            &Predicate::ChainOf(head.id.unwrap()),
            &[Assignment::Stage(Stage::Published), Assignment::UpdatedAt(T0 - 1)],
        )
        .unwrap();
    store.commit().unwrap();

    assert_eq!(changed, 2);
    for record in store.list_records("page", &Predicate::All).unwrap() {
        assert_eq!(record.stage, Stage::Published);
        assert_eq!(record.updated_at, Some(T0 - 1));
    }
}

#[test]
fn type_summary_counts_heads_versions_and_published() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    let head = insert(&store, None);
    insert(&store, head.id);
    let mut menu = StoredRecord::new("menu");
    menu.stage = Stage::Published;
    store.persist_record(&mut menu).unwrap();
    store.commit().unwrap();

    assert_eq!(
        store.type_summary().unwrap(),
        vec![
            ("menu".to_string(), 1, 0, 1),
            ("page".to_string(), 1, 1, 0),
        ]
    );
}

#[test]
fn corrupt_rows_surface_as_invalid_data() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    conn.execute(
        "INSERT INTO entities (id, entity_type, payload, created_at, updated_at)
         VALUES (1, 'page', '[1, 2]', 1, 1);",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO entities (id, entity_type, dependencies, created_at, updated_at)
         VALUES (2, 'page', '{\"type\": 3}', 1, 1);",
        [],
    )
    .unwrap();

    assert!(matches!(
        store.load_record("page", 1),
        Err(RepoError::InvalidData(_))
    ));
    assert!(matches!(
        store.load_record("page", 2),
        Err(RepoError::InvalidData(_))
    ));
}

#[test]
fn payload_must_match_fillable_fields() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let record = insert(service.store(), None);
    service.flush().unwrap();

    let err = service
        .find::<Page>(record.id.unwrap())
        .unwrap_err();
    match err {
        EngineError::Repo(RepoError::InvalidData(message)) => {
            assert!(message.contains("missing fillable field `body`"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mapping_roundtrips_fields_and_metadata() {
    let mut page = Page::new("about");
    page.tags = vec!["a".to_string()];
    page.meta_mut().publish();
    page.meta_mut()
        .dependencies_mut()
        .insert(EntityRef::new("menu", 4));

    let mut record = to_record(&page).unwrap();
    assert_eq!(record.payload.len(), 3);
    record.id = Some(10);

    let loaded: Page = from_record(record.clone()).unwrap();
    assert_eq!(loaded.title, "about");
    assert_eq!(loaded.tags, vec!["a".to_string()]);
    assert_eq!(loaded.meta().id(), Some(10));
    assert!(loaded.meta().is_published());
    assert!(loaded.meta().dependencies().contains(&EntityRef::new("menu", 4)));

    record.entity_type = "menu".to_string();
    assert!(matches!(
        from_record::<Page>(record),
        Err(RepoError::Contract(ContractViolation::EntityTypeMismatch { .. }))
    ));
}

#[derive(Clone, Default)]
struct HookLog(Rc<RefCell<Vec<(&'static str, i64)>>>);

impl LifecycleListener for HookLog {
    fn after_create(&self, _store: &dyn EntityStore, record: &StoredRecord) -> RepoResult<()> {
        self.0
            .borrow_mut()
            .push(("after_create", record.id.unwrap_or_default()));
        Ok(())
    }

    fn before_update(&self, store: &dyn EntityStore, record: &StoredRecord) -> RepoResult<()> {
        // The row still holds its previous state.
        let current = store
            .load_record(&record.entity_type, record.id.unwrap_or_default())?
            .ok_or_else(|| RepoError::InvalidData("row vanished".to_string()))?;
        assert_ne!(current.payload, record.payload);
        self.0
            .borrow_mut()
            .push(("before_update", record.id.unwrap_or_default()));
        Ok(())
    }

    fn before_remove(&self, store: &dyn EntityStore, record: &StoredRecord) -> RepoResult<()> {
        let id = record.id.unwrap_or_default();
        assert!(store.load_record(&record.entity_type, id)?.is_some());
        self.0.borrow_mut().push(("before_remove", id));
        Ok(())
    }
}

#[test]
fn lifecycle_hooks_fire_around_row_writes() {
    let conn = open_db_in_memory().unwrap();
    let log = HookLog::default();
    let mut store = SqliteEntityStore::try_new(&conn).unwrap();
    store.register_listener(log.clone());

    let mut record = insert(&store, None);
    let id = record.id.unwrap();
    record
        .payload
        .insert("title".to_string(), serde_json::json!("changed"));
    store.persist_record(&mut record).unwrap();
    store.remove_record("page", id).unwrap();
    store.commit().unwrap();

    assert_eq!(
        *log.0.borrow(),
        vec![("after_create", id), ("before_update", id), ("before_remove", id)]
    );
}
