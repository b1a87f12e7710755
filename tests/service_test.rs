//! End-to-end record contract over the in-memory driver
//!
//! Router, facade and search mirror wired the way the binary wires them,
//! with sim drivers standing in for the primary store and the search engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use polystore::driver::{SimBackend, SimDriver, SimFault, DRIVER_MEMORY};
use polystore::record::now_unix;
use polystore::service::{
    CreateRequest, DatabaseRequest, DeleteRequest, ReadRequest, RunQueryRequest, SearchRequest,
    UpdateRequest,
};
use polystore::{
    CallContext, Database, DriverTable, Node, Record, RecordApi, RecordService, Router,
    SearchSync, ServiceError, StaticRegistry,
};
use tokio_test::{assert_err, assert_ok};

const SEARCH_DRIVER: &str = "elasticsearch";
const CONSISTENCY_WINDOW: Duration = Duration::from_secs(2);

struct Harness {
    api: SearchSync<RecordService>,
    primary: SimBackend,
    search: SimBackend,
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("polystore=debug")
        .with_test_writer()
        .try_init();

    let primary = SimBackend::new();
    let search = SimBackend::new();

    let registry = StaticRegistry::new();
    registry
        .register("test.memory", Node::new("mem-1", DRIVER_MEMORY, "mem://1"))
        .await;
    registry
        .register("test.elasticsearch", Node::new("es-1", SEARCH_DRIVER, "mem://es"))
        .await;

    let mut drivers = DriverTable::new();
    drivers.register(Arc::new(SimDriver::new(primary.clone())));
    drivers.register(Arc::new(SimDriver::named(SEARCH_DRIVER, search.clone())));

    let router = Router::new(Arc::new(registry), drivers).with_default_driver(DRIVER_MEMORY);
    let service = RecordService::new(Arc::new(router));
    let api = SearchSync::new(Arc::new(service))
        .with_default_driver(DRIVER_MEMORY)
        .with_search_driver(SEARCH_DRIVER);

    Harness {
        api,
        primary,
        search,
    }
}

fn db() -> Database {
    Database::new("test_db", "test_table")
}

fn filter(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn sample() -> Record {
    Record::builder()
        .id("111")
        .name("test_name")
        .parameter1("p1")
        .parameter2("p2")
        .parameter3("p3")
        .metadata("color", "blue")
        .build()
}

async fn create(h: &Harness, database: Database, record: Record) {
    let ctx = CallContext::new();
    assert_ok!(h.api.create(&ctx, CreateRequest { database, record }).await);
}

async fn read(h: &Harness, id: &str, secondary_key: &str) -> Result<Record, ServiceError> {
    let req = ReadRequest {
        database: db(),
        id: id.into(),
        secondary_key: secondary_key.into(),
    };
    h.api
        .read(&CallContext::new(), req)
        .await
        .map(|resp| resp.record)
}

async fn search(h: &Harness, req: SearchRequest) -> Vec<Record> {
    h.api
        .search(&CallContext::new(), req)
        .await
        .unwrap()
        .records
}

// =============================================================================
// CRUD
// =============================================================================

#[tokio::test]
async fn test_create_then_read() {
    let h = harness().await;
    create(&h, db(), sample()).await;

    let record = read(&h, "111", "p3").await.unwrap();
    let expected = sample();
    assert_eq!(record.id, expected.id);
    assert_eq!(record.name, expected.name);
    assert_eq!(record.parameter1, expected.parameter1);
    assert_eq!(record.parameter2, expected.parameter2);
    assert_eq!(record.parameter3, expected.parameter3);
    assert_eq!(record.metadata, expected.metadata);
    assert!(record.created > 0);
    assert!(record.created <= record.updated);

    // Wrong secondary key is a miss
    assert!(matches!(read(&h, "111", "other").await, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_update_visible_and_monotonic() {
    let h = harness().await;
    let ctx = CallContext::new();
    create(&h, db(), sample()).await;
    let before = read(&h, "111", "").await.unwrap();

    let mut changed = before.clone();
    changed.name = "renamed".into();
    changed.parameter1 = "p1-new".into();
    assert_ok!(
        h.api
            .update(&ctx, UpdateRequest { database: db(), record: changed.clone() })
            .await
    );
    let first = read(&h, "111", "").await.unwrap();
    assert_eq!(first.name, "renamed");
    assert_eq!(first.parameter1, "p1-new");
    assert_eq!(first.created, before.created);
    assert!(first.updated > before.updated);

    // Same value again still moves updated forward
    assert_ok!(
        h.api
            .update(&ctx, UpdateRequest { database: db(), record: first.clone() })
            .await
    );
    let second = read(&h, "111", "").await.unwrap();
    assert!(second.updated > first.updated);

    let missing = UpdateRequest {
        database: db(),
        record: Record::new("missing", "x"),
    };
    assert!(matches!(
        h.api.update(&ctx, missing).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_then_read() {
    let h = harness().await;
    let ctx = CallContext::new();
    create(&h, db(), sample()).await;

    let req = DeleteRequest {
        database: db(),
        id: "111".into(),
        secondary_key: String::new(),
    };
    assert_ok!(h.api.delete(&ctx, req.clone()).await);
    assert!(matches!(read(&h, "111", "").await, Err(ServiceError::NotFound(_))));
    assert_eq!(h.primary.count("test_db", "test_table").await, 0);

    // Deleting again is not an error
    assert_ok!(h.api.delete(&ctx, req).await);
}

// =============================================================================
// Search
// =============================================================================

#[tokio::test]
async fn test_search_by_parameter() {
    let h = harness().await;
    create(&h, db(), sample()).await;
    create(&h, db(), Record::builder().id("222").name("other").parameter1("p9").build()).await;

    let records = search(
        &h,
        SearchRequest {
            database: db(),
            metadata: filter(&[("parameter1", "p1")]),
            limit: 1,
            ..SearchRequest::default()
        },
    )
    .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "test_name");
}

#[tokio::test]
async fn test_search_order_and_reverse() {
    let h = harness().await;
    let now = now_unix();
    create(&h, db(), Record::builder().id("a").name("early").created(now - 60).build()).await;
    create(&h, db(), Record::builder().id("b").name("late").created(now).build()).await;

    let forward = search(
        &h,
        SearchRequest {
            database: db(),
            limit: 2,
            ..SearchRequest::default()
        },
    )
    .await;
    let ids: Vec<&str> = forward.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);

    let backward = search(
        &h,
        SearchRequest {
            database: db(),
            limit: 2,
            reverse: true,
            ..SearchRequest::default()
        },
    )
    .await;
    let ids: Vec<&str> = backward.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["b", "a"]);

    let page = search(
        &h,
        SearchRequest {
            database: db(),
            limit: 1,
            offset: 1,
            ..SearchRequest::default()
        },
    )
    .await;
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "b");
}

#[tokio::test]
async fn test_search_time_window() {
    let h = harness().await;
    let now = now_unix();
    create(&h, db(), Record::builder().id("old").name("old").created(now - 3600).build()).await;
    create(&h, db(), Record::builder().id("new").name("new").build()).await;

    let records = search(
        &h,
        SearchRequest {
            database: db(),
            from: now - 60,
            ..SearchRequest::default()
        },
    )
    .await;
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["new"]);
}

#[tokio::test]
async fn test_search_geo_radius() {
    let h = harness().await;
    create(&h, db(), Record::builder().id("here").name("here").location(51.5007, -0.1246).build()).await;
    // Roughly eleven metres north
    create(&h, db(), Record::builder().id("near").name("near").location(51.5008, -0.1246).build()).await;

    let records = search(
        &h,
        SearchRequest {
            database: db(),
            metadata: filter(&[("distance", "0"), ("lat", "51.5007"), ("lng", "-0.1246")]),
            ..SearchRequest::default()
        },
    )
    .await;
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["here"]);

    let records = search(
        &h,
        SearchRequest {
            database: db(),
            metadata: filter(&[("distance", "0.1"), ("lat", "51.5007"), ("lng", "-0.1246")]),
            ..SearchRequest::default()
        },
    )
    .await;
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_search_metadata_fallback() {
    let h = harness().await;
    create(&h, db(), sample()).await;
    create(&h, db(), Record::builder().id("222").name("other").metadata("color", "red").build()).await;

    let records = search(
        &h,
        SearchRequest {
            database: db(),
            metadata: filter(&[("color", "red")]),
            ..SearchRequest::default()
        },
    )
    .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "222");
}

#[tokio::test]
async fn test_run_query() {
    let h = harness().await;
    let ctx = CallContext::new();
    create(&h, db(), sample()).await;

    let resp = h
        .api
        .run_query(&ctx, RunQueryRequest { database: db(), query: "parameter2:p2".into() })
        .await
        .unwrap();
    assert_eq!(resp.records.len(), 1);

    // Backend rejects the native syntax
    let err = h
        .api
        .run_query(&ctx, RunQueryRequest { database: db(), query: "nonsense".into() })
        .await;
    assert!(matches!(err, Err(ServiceError::Internal(_))));
}

// =============================================================================
// Search Mirror
// =============================================================================

#[tokio::test]
async fn test_searchable_create_is_mirrored() {
    let h = harness().await;
    let searchable = db().with_metadata("searchable", "true");
    create(&h, searchable.clone(), sample()).await;

    // Primary is visible immediately
    assert_eq!(h.primary.count("test_db", "test_table").await, 1);
    assert_ok!(read(&h, "111", "").await);

    // Search engine within the window
    assert!(h.api.tasks().wait_idle(CONSISTENCY_WINDOW).await);
    assert_eq!(h.search.count("test_db", "test_table").await, 1);

    let records = search(
        &h,
        SearchRequest {
            database: searchable.clone(),
            metadata: filter(&[("name", "test"), ("autocomplete", "true")]),
            ..SearchRequest::default()
        },
    )
    .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "111");

    let ctx = CallContext::new();
    let req = DeleteRequest {
        database: searchable,
        id: "111".into(),
        secondary_key: String::new(),
    };
    assert_ok!(h.api.delete(&ctx, req).await);
    assert!(h.api.tasks().wait_idle(CONSISTENCY_WINDOW).await);
    assert_eq!(h.search.count("test_db", "test_table").await, 0);
    assert_eq!(h.api.tasks().stats().failed, 0);
}

#[tokio::test]
async fn test_mirror_failure_not_surfaced() {
    let h = harness().await;
    h.search.inject(SimFault::Write);

    create(&h, db().with_metadata("searchable", "true"), sample()).await;
    assert!(h.api.tasks().wait_idle(CONSISTENCY_WINDOW).await);

    assert_ok!(read(&h, "111", "").await);
    let stats = h.api.tasks().stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_unsearchable_writes_stay_local() {
    let h = harness().await;
    create(&h, db(), sample()).await;
    assert!(h.api.tasks().wait_idle(CONSISTENCY_WINDOW).await);
    assert_eq!(h.search.count("test_db", "test_table").await, 0);
    assert_eq!(h.api.tasks().stats().completed, 0);
}

// =============================================================================
// Routing and Lifecycle
// =============================================================================

#[tokio::test]
async fn test_unregistered_namespace_not_available() {
    let h = harness().await;
    let req = ReadRequest {
        database: Database::new("prod_db", "t"),
        id: "1".into(),
        secondary_key: String::new(),
    };
    assert!(matches!(
        h.api.read(&CallContext::new(), req).await,
        Err(ServiceError::NotAvailable(_))
    ));
}

#[tokio::test]
async fn test_connections_released() {
    let h = harness().await;
    create(&h, db(), sample()).await;
    let _ = read(&h, "111", "").await;
    let _ = read(&h, "missing", "").await;

    assert_eq!(h.primary.connections_opened(), 3);
    assert_eq!(h.primary.connections_closed(), 3);
}

#[tokio::test]
async fn test_delete_database_requires_test_context() {
    let h = harness().await;
    create(&h, db(), sample()).await;
    let req = DatabaseRequest { database: db() };

    let err = assert_err!(h.api.delete_database(&CallContext::new(), req.clone()).await);
    assert!(matches!(err, ServiceError::BadRequest(_)));
    assert!(h.primary.has_database("test_db").await);

    assert_ok!(h.api.delete_database(&CallContext::test(), req).await);
    assert!(!h.primary.has_database("test_db").await);
}
