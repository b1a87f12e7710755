//! SimDriver - In-memory backend for testing
//!
//! TigerStyle: Deterministic storage with injectable faults.
//!
//! Implements the full connection contract (including geo search) over
//! process memory. Every connection opened from the same [`SimBackend`]
//! sees the same data, so the router's open-use-close cycle behaves like a
//! real networked store. Faults can be injected per operation class or per
//! node address.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::predicate::Predicate;
use super::{Connection, Driver, Guarded};
use crate::error::{StoreError, StoreResult};
use crate::record::{now_unix, Database, Record, SearchQuery};
use crate::registry::Node;

/// Driver name of the in-memory backend
pub const DRIVER_MEMORY: &str = "memory";

type Tables = HashMap<String, BTreeMap<String, Record>>;

// =============================================================================
// Faults
// =============================================================================

/// Operation classes that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    /// `init` fails
    Init,
    /// `create`, `update`, `delete` fail
    Write,
    /// `read`, `search`, `run_query` fail
    Read,
}

// =============================================================================
// SimBackend
// =============================================================================

/// Shared in-memory state behind every sim connection.
#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    databases: Arc<RwLock<HashMap<String, Tables>>>,
    faults: Arc<Mutex<HashSet<SimFault>>>,
    down: Arc<Mutex<HashSet<String>>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl SimBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an operation class fail until cleared.
    pub fn inject(&self, fault: SimFault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(fault);
        }
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Refuse handshakes on a node address.
    pub fn take_down(&self, address: impl Into<String>) {
        if let Ok(mut down) = self.down.lock() {
            down.insert(address.into());
        }
    }

    /// Connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    #[must_use]
    pub fn connections_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of records stored in a table.
    pub async fn count(&self, database: &str, table: &str) -> usize {
        self.databases
            .read()
            .await
            .get(database)
            .and_then(|tables| tables.get(table))
            .map_or(0, BTreeMap::len)
    }

    /// Whether a logical database exists.
    pub async fn has_database(&self, database: &str) -> bool {
        self.databases.read().await.contains_key(database)
    }

    fn check(&self, fault: SimFault) -> StoreResult<()> {
        let injected = self
            .faults
            .lock()
            .map(|faults| faults.contains(&fault))
            .unwrap_or(false);
        if injected {
            return Err(StoreError::backend(format!("injected {fault:?} fault")));
        }
        Ok(())
    }

    fn is_down(&self, address: &str) -> bool {
        self.down
            .lock()
            .map(|down| down.contains(address))
            .unwrap_or(false)
    }
}

// =============================================================================
// SimDriver
// =============================================================================

/// Driver over a [`SimBackend`].
#[derive(Debug, Clone)]
pub struct SimDriver {
    name: String,
    backend: SimBackend,
}

impl SimDriver {
    /// Driver registered as `memory`.
    #[must_use]
    pub fn new(backend: SimBackend) -> Self {
        Self::named(DRIVER_MEMORY, backend)
    }

    /// Driver registered under another name, standing in for a real backend.
    #[must_use]
    pub fn named(name: impl Into<String>, backend: SimBackend) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    /// Backend shared by this driver's connections.
    #[must_use]
    pub fn backend(&self) -> &SimBackend {
        &self.backend
    }
}

#[async_trait]
impl Driver for SimDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>> {
        for node in nodes {
            if self.backend.is_down(&node.address) {
                tracing::debug!(node = %node.id, "Sim node refused handshake");
                continue;
            }
            self.backend.opened.fetch_add(1, Ordering::SeqCst);
            return Ok(Box::new(SimConnection {
                backend: Guarded::new(self.backend.clone()),
                database: None,
            }));
        }
        Err(StoreError::not_available(format!(
            "no reachable {} node among {} candidates",
            self.name,
            nodes.len()
        )))
    }
}

// =============================================================================
// SimConnection
// =============================================================================

/// Connection to a [`SimBackend`].
#[derive(Debug)]
pub struct SimConnection {
    backend: Guarded<SimBackend>,
    database: Option<Database>,
}

impl SimConnection {
    fn target(&self) -> StoreResult<&Database> {
        self.database
            .as_ref()
            .ok_or_else(|| StoreError::backend("connection not initialised"))
    }

    async fn with_table<R>(
        &self,
        backend: &SimBackend,
        f: impl FnOnce(&mut BTreeMap<String, Record>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let db = self.target()?;
        let mut databases = backend.databases.write().await;
        let table = databases
            .get_mut(&db.name)
            .and_then(|tables| tables.get_mut(&db.table))
            .ok_or_else(|| StoreError::not_found(format!("table {}.{}", db.name, db.table)))?;
        f(table)
    }

    async fn snapshot(&self, backend: &SimBackend) -> StoreResult<Vec<Record>> {
        let db = self.target()?;
        let databases = backend.databases.read().await;
        Ok(databases
            .get(&db.name)
            .and_then(|tables| tables.get(&db.table))
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Sort by `created` (ties by id) and paginate.
fn sort_and_page(mut records: Vec<Record>, reverse: bool, limit: i64, offset: i64) -> Vec<Record> {
    records.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
    if reverse {
        records.reverse();
    }
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    records.into_iter().skip(offset).take(limit).collect()
}

/// Parse the sim's native query language: space-separated `key:value` terms.
fn parse_native_query(query: &str) -> StoreResult<HashMap<String, String>> {
    let mut filter = HashMap::new();
    for term in query.split_whitespace() {
        let (key, value) = term
            .split_once(':')
            .ok_or_else(|| StoreError::backend(format!("malformed query term {term:?}")))?;
        if key.is_empty() {
            return Err(StoreError::backend(format!("malformed query term {term:?}")));
        }
        filter.insert(key.to_string(), value.to_string());
    }
    Ok(filter)
}

#[async_trait]
impl Connection for SimConnection {
    async fn init(&mut self, database: &Database) -> StoreResult<()> {
        {
            let backend = self.backend.write().await?;
            backend.check(SimFault::Init)?;
            let mut databases = backend.databases.write().await;
            databases
                .entry(database.name.clone())
                .or_default()
                .entry(database.table.clone())
                .or_default();
        }
        self.database = Some(database.clone());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if let Some(backend) = self.backend.take().await {
            backend.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let backend = self.backend.read().await?;
        backend.check(SimFault::Read)?;
        let db = self.target()?;
        let databases = backend.databases.read().await;
        databases
            .get(&db.name)
            .and_then(|tables| tables.get(&db.table))
            .and_then(|table| table.get(id))
            .filter(|record| record.matches_secondary(secondary_key))
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("record {id}")))
    }

    async fn create(&self, record: &Record) -> StoreResult<()> {
        let backend = self.backend.write().await?;
        backend.check(SimFault::Write)?;
        let mut record = record.clone();
        record.stamp_created(now_unix());
        self.with_table(&backend, |table| {
            table.insert(record.id.clone(), record);
            Ok(())
        })
        .await
    }

    async fn update(&self, record: &Record) -> StoreResult<()> {
        let backend = self.backend.write().await?;
        backend.check(SimFault::Write)?;
        let mut record = record.clone();
        self.with_table(&backend, |table| {
            let existing = table
                .get(&record.id)
                .ok_or_else(|| StoreError::not_found(format!("record {}", record.id)))?;
            record.created = existing.created;
            record.updated = record.updated.max(existing.updated);
            record.touch(now_unix())?;
            table.insert(record.id.clone(), record);
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()> {
        let backend = self.backend.write().await?;
        backend.check(SimFault::Write)?;
        self.with_table(&backend, |table| {
            let matches = table
                .get(id)
                .is_some_and(|record| record.matches_secondary(secondary_key));
            if !matches {
                return Err(StoreError::not_found(format!("record {id}")));
            }
            table.remove(id);
            Ok(())
        })
        .await
    }

    async fn search(&self, query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let backend = self.backend.read().await?;
        backend.check(SimFault::Read)?;
        let predicate = Predicate::classify(query);
        let records = self
            .snapshot(&backend)
            .await?
            .into_iter()
            .filter(|r| query.in_range(r.created) && predicate.matches(r))
            .collect();
        Ok(sort_and_page(records, query.reverse, query.limit, query.offset))
    }

    async fn run_query(&self, query: &str) -> StoreResult<Vec<Record>> {
        let backend = self.backend.read().await?;
        backend.check(SimFault::Read)?;
        let filter = parse_native_query(query)?;
        let search = SearchQuery::new(filter, 0, 0, i64::MAX, 0, false);
        let predicate = Predicate::classify(&search);
        let records = self
            .snapshot(&backend)
            .await?
            .into_iter()
            .filter(|r| predicate.matches(r))
            .collect();
        Ok(sort_and_page(records, false, i64::MAX, 0))
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        let backend = self.backend.write().await?;
        backend
            .databases
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        let backend = self.backend.write().await?;
        backend.databases.write().await.remove(name);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str) -> Node {
        Node::new(address, DRIVER_MEMORY, address)
    }

    async fn open(backend: &SimBackend) -> Box<dyn Connection> {
        let driver = SimDriver::new(backend.clone());
        let mut conn = driver.connect(&[node("mem://1")]).await.unwrap();
        conn.init(&Database::new("test_db", "test_table")).await.unwrap();
        conn
    }

    fn filter(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_connect_requires_nodes() {
        let driver = SimDriver::new(SimBackend::new());
        assert!(matches!(
            driver.connect(&[]).await,
            Err(StoreError::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_skips_down_nodes() {
        let backend = SimBackend::new();
        backend.take_down("mem://1");
        let driver = SimDriver::new(backend.clone());
        assert!(driver.connect(&[node("mem://1")]).await.is_err());
        assert!(driver
            .connect(&[node("mem://1"), node("mem://2")])
            .await
            .is_ok());
        assert_eq!(backend.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_crud() {
        let backend = SimBackend::new();
        let conn = open(&backend).await;

        let record = Record::builder()
            .id("111")
            .name("test_name")
            .parameter1("p1")
            .parameter3("p3")
            .build();
        conn.create(&record).await.unwrap();

        let read = conn.read("111", "p3").await.unwrap();
        assert_eq!(read.name, "test_name");
        assert!(read.created > 0);
        assert!(conn.read("111", "other-tenant").await.unwrap_err().is_not_found());

        let mut changed = read.clone();
        changed.name = "renamed".to_string();
        conn.update(&changed).await.unwrap();
        let reread = conn.read("111", "").await.unwrap();
        assert_eq!(reread.name, "renamed");
        assert!(reread.updated > read.updated);
        assert_eq!(reread.created, read.created);

        conn.delete("111", "").await.unwrap();
        assert!(conn.read("111", "").await.unwrap_err().is_not_found());
        assert!(conn.delete("111", "").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let conn = open(&SimBackend::new()).await;
        let err = conn.update(&Record::new("nope", "x")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_upserts() {
        let backend = SimBackend::new();
        let conn = open(&backend).await;
        conn.create(&Record::new("1", "a")).await.unwrap();
        conn.create(&Record::new("1", "b")).await.unwrap();
        assert_eq!(backend.count("test_db", "test_table").await, 1);
        assert_eq!(conn.read("1", "").await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_search_order_range_and_paging() {
        let conn = open(&SimBackend::new()).await;
        let now = now_unix();
        for (id, created) in [("old", now - 3600), ("a", now - 10), ("b", now)] {
            conn.create(&Record::builder().id(id).parameter1("p1").created(created).build())
                .await
                .unwrap();
        }

        let asc = conn
            .search(&SearchQuery::new(filter(&[]), now - 60, 0, 2, 0, false))
            .await
            .unwrap();
        assert_eq!(asc.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let desc = conn
            .search(&SearchQuery::new(filter(&[]), 0, 0, 2, 0, true))
            .await
            .unwrap();
        assert_eq!(desc.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        let page = conn
            .search(&SearchQuery::new(filter(&[]), 0, 0, 2, 2, false))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");
    }

    #[tokio::test]
    async fn test_geo_search() {
        let conn = open(&SimBackend::new()).await;
        conn.create(&Record::builder().id("here").location(51.5, -0.12).build())
            .await
            .unwrap();
        conn.create(&Record::builder().id("near").location(51.50003, -0.12).build())
            .await
            .unwrap();
        conn.create(&Record::builder().id("nowhere").build()).await.unwrap();

        let found = conn
            .search(&SearchQuery::new(
                filter(&[("distance", "0"), ("lat", "51.5"), ("lng", "-0.12")]),
                0,
                0,
                10,
                0,
                false,
            ))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "here");
    }

    #[tokio::test]
    async fn test_run_query() {
        let conn = open(&SimBackend::new()).await;
        conn.create(&Record::builder().id("1").parameter2("owner").build())
            .await
            .unwrap();
        conn.create(&Record::builder().id("2").parameter2("other").build())
            .await
            .unwrap();

        let found = conn.run_query("parameter2:owner").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(
            conn.run_query("SELECT * FROM x").await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_faults() {
        let backend = SimBackend::new();
        let conn = open(&backend).await;
        backend.inject(SimFault::Write);
        assert!(conn.create(&Record::new("1", "a")).await.is_err());
        backend.clear_faults();
        assert!(conn.create(&Record::new("1", "a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        let backend = SimBackend::new();
        let conn = open(&backend).await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(backend.connections_closed(), 1);
        assert!(matches!(conn.read("1", "").await, Err(StoreError::Closed)));
        assert!(matches!(
            conn.create(&Record::new("1", "a")).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_database_lifecycle() {
        let backend = SimBackend::new();
        let conn = open(&backend).await;
        conn.create_database("other").await.unwrap();
        assert!(backend.has_database("other").await);
        conn.delete_database("other").await.unwrap();
        assert!(!backend.has_database("other").await);
    }
}
