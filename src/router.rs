//! Router - Registry-backed connection routing
//!
//! TigerStyle: One connection per call, opened and closed explicitly.
//!
//! # Resolution
//!
//! ```text
//! Database { name, driver } ──▶ "<namespace>.<driver>" ──▶ Registry::lookup
//!                                                             │
//!          Selector (cycling) ◀────────── candidate nodes ◀───┘
//!                 │
//!                 ▼
//!   skip: no driver metadata / other driver / unregistered driver / unreachable
//!                 │
//!                 ▼
//!   Driver::connect(&[node]) ──▶ Connection::init(database) ──▶ one call ──▶ close
//! ```
//!
//! Databases whose name starts with `test` resolve in the `test`
//! namespace. A node id seen twice means every candidate was tried.

use std::collections::HashSet;
use std::sync::Arc;

use crate::driver::{Connection, DriverTable};
use crate::error::{StoreError, StoreResult};
use crate::record::{Database, Record, SearchQuery};
use crate::registry::{service_name, Registry, Selector, SelectorStrategy};
use crate::{DRIVER_DEFAULT, NAMESPACE_DEFAULT, NAMESPACE_TEST, TEST_DATABASE_PREFIX};

// =============================================================================
// Router
// =============================================================================

/// Resolves descriptors to live connections and runs single operations.
pub struct Router {
    registry: Arc<dyn Registry>,
    drivers: DriverTable,
    selector: Selector,
    namespace: String,
    default_driver: String,
}

impl Router {
    /// Create a router with the default namespace, driver and selector.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, drivers: DriverTable) -> Self {
        Self {
            registry,
            drivers,
            selector: Selector::new(SelectorStrategy::default()),
            namespace: NAMESPACE_DEFAULT.to_string(),
            default_driver: DRIVER_DEFAULT.to_string(),
        }
    }

    /// Set the registry namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the driver used when a descriptor names none.
    #[must_use]
    pub fn with_default_driver(mut self, driver: impl Into<String>) -> Self {
        self.default_driver = driver.into();
        self
    }

    /// Set the node selection strategy.
    #[must_use]
    pub fn with_selector(mut self, strategy: SelectorStrategy) -> Self {
        self.selector = Selector::new(strategy);
        self
    }

    /// Registry namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Driver used when a descriptor names none.
    #[must_use]
    pub fn default_driver(&self) -> &str {
        &self.default_driver
    }

    /// Registered drivers.
    #[must_use]
    pub fn drivers(&self) -> &DriverTable {
        &self.drivers
    }

    /// Registry service name a descriptor resolves to.
    #[must_use]
    pub fn lookup_name(&self, database: &Database) -> String {
        let driver = database.driver_or(&self.default_driver);
        if database.name.starts_with(TEST_DATABASE_PREFIX) {
            service_name(NAMESPACE_TEST, driver)
        } else {
            service_name(&self.namespace, driver)
        }
    }

    /// Open a connection for a descriptor and provision its target.
    ///
    /// The caller owns the connection and must close it.
    ///
    /// # Errors
    /// `NotAvailable` when no candidate node is usable; registry and `init`
    /// errors propagate.
    pub async fn connect(&self, database: &Database) -> StoreResult<Box<dyn Connection>> {
        let mut conn = self.open(database).await?;
        if let Err(e) = conn.init(database).await {
            if let Err(close_err) = conn.close().await {
                tracing::warn!(error = %close_err, "Failed to close connection after init error");
            }
            return Err(e);
        }
        Ok(conn)
    }

    /// Resolve and connect without provisioning a target.
    async fn open(&self, database: &Database) -> StoreResult<Box<dyn Connection>> {
        let driver_name = database.driver_or(&self.default_driver);
        let service = self.lookup_name(database);

        let nodes = self.registry.lookup(&service).await?;
        if nodes.is_empty() {
            return Err(StoreError::not_available(format!(
                "no nodes registered for {service}"
            )));
        }
        let candidates = nodes.len();

        let mut visited: HashSet<String> = HashSet::with_capacity(candidates);
        for node in self.selector.select(nodes) {
            if !visited.insert(node.id.clone()) {
                break;
            }

            let Some(declared) = node.driver() else {
                tracing::warn!(service = %service, node = %node.id, "Skipping node without driver metadata");
                continue;
            };
            if declared != driver_name {
                tracing::debug!(
                    service = %service,
                    node = %node.id,
                    declared = %declared,
                    driver = %driver_name,
                    "Skipping node for another driver"
                );
                continue;
            }
            let Some(driver) = self.drivers.get(declared) else {
                tracing::warn!(service = %service, node = %node.id, driver = %declared, "Skipping node with unregistered driver");
                continue;
            };

            match driver.connect(std::slice::from_ref(&node)).await {
                Ok(conn) => {
                    tracing::debug!(
                        service = %service,
                        node = %node.id,
                        database = %database.name,
                        table = %database.table,
                        "Routed connection"
                    );
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(service = %service, node = %node.id, error = %e, "Node unreachable, trying next");
                }
            }
        }

        Err(StoreError::not_available(format!(
            "exhausted {candidates} candidate nodes for {service}"
        )))
    }

    /// Close a connection, keeping the operation's result.
    async fn release<T>(conn: Box<dyn Connection>, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e) = conn.close().await {
            tracing::warn!(error = %e, "Failed to close connection");
        }
        result
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Read a record.
    pub async fn read(&self, database: &Database, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let conn = self.connect(database).await?;
        let result = conn.read(id, secondary_key).await;
        Self::release(conn, result).await
    }

    /// Create (upsert) a record.
    pub async fn create(&self, database: &Database, record: &Record) -> StoreResult<()> {
        let conn = self.connect(database).await?;
        let result = conn.create(record).await;
        Self::release(conn, result).await
    }

    /// Update an existing record.
    pub async fn update(&self, database: &Database, record: &Record) -> StoreResult<()> {
        let conn = self.connect(database).await?;
        let result = conn.update(record).await;
        Self::release(conn, result).await
    }

    /// Delete a record.
    pub async fn delete(&self, database: &Database, id: &str, secondary_key: &str) -> StoreResult<()> {
        let conn = self.connect(database).await?;
        let result = conn.delete(id, secondary_key).await;
        Self::release(conn, result).await
    }

    /// Filtered, sorted, paginated search.
    pub async fn search(&self, database: &Database, query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let conn = self.connect(database).await?;
        let result = conn.search(query).await;
        Self::release(conn, result).await
    }

    /// Backend-native query.
    pub async fn run_query(&self, database: &Database, query: &str) -> StoreResult<Vec<Record>> {
        let conn = self.connect(database).await?;
        let result = conn.run_query(query).await;
        Self::release(conn, result).await
    }

    /// Create the descriptor's logical database.
    pub async fn create_database(&self, database: &Database) -> StoreResult<()> {
        let conn = self.open(database).await?;
        let result = conn.create_database(&database.name).await;
        Self::release(conn, result).await
    }

    /// Drop the descriptor's logical database.
    pub async fn delete_database(&self, database: &Database) -> StoreResult<()> {
        let conn = self.open(database).await?;
        let result = conn.delete_database(&database.name).await;
        Self::release(conn, result).await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("namespace", &self.namespace)
            .field("default_driver", &self.default_driver)
            .field("selector", &self.selector.strategy())
            .field("drivers", &self.drivers)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::driver::{SimBackend, SimDriver, SimFault, DRIVER_MEMORY};
    use crate::registry::{Node, StaticRegistry};

    const SERVICE: &str = "test.memory";

    async fn setup(nodes: Vec<Node>) -> (Router, SimBackend) {
        let backend = SimBackend::new();
        let registry = StaticRegistry::new();
        for node in nodes {
            registry.register(SERVICE, node).await;
        }
        let mut drivers = DriverTable::new();
        drivers.register(Arc::new(SimDriver::new(backend.clone())));
        let router = Router::new(Arc::new(registry), drivers).with_default_driver(DRIVER_MEMORY);
        (router, backend)
    }

    fn db() -> Database {
        Database::new("test_db", "test_table")
    }

    #[tokio::test]
    async fn test_lookup_name() {
        let (router, _) = setup(Vec::new()).await;
        assert_eq!(router.lookup_name(&db()), "test.memory");
        assert_eq!(
            router.lookup_name(&Database::new("prod", "t").with_driver("postgres")),
            "polystore.db.postgres"
        );

        let router = router.with_namespace("acme.db");
        assert_eq!(router.lookup_name(&Database::new("prod", "t")), "acme.db.memory");
        assert_eq!(router.lookup_name(&Database::new("testing", "t")), "test.memory");
    }

    #[tokio::test]
    async fn test_empty_registry_is_not_available() {
        let (router, _) = setup(Vec::new()).await;
        let err = router.read(&db(), "1", "").await.unwrap_err();
        assert!(matches!(err, StoreError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn test_failover_to_reachable_node() {
        let (router, backend) = setup(vec![
            Node::new("a", DRIVER_MEMORY, "mem://a"),
            Node::new("b", DRIVER_MEMORY, "mem://b"),
        ])
        .await;
        backend.take_down("mem://a");

        for _ in 0..4 {
            router.create(&db(), &Record::new("1", "n")).await.unwrap();
        }
        assert_eq!(backend.connections_opened(), 4);
        assert_eq!(backend.count("test_db", "test_table").await, 1);
    }

    #[tokio::test]
    async fn test_skips_unusable_nodes() {
        let bare = Node {
            id: "bare".into(),
            address: "mem://bare".into(),
            metadata: HashMap::new(),
        };
        let (router, backend) = setup(vec![
            bare,
            Node::new("pg", "postgres", "postgres://x"),
            Node::new("unknown", "mysterydb", "mystery://x"),
            Node::new("mem", DRIVER_MEMORY, "mem://ok"),
        ])
        .await;

        for _ in 0..4 {
            router.create(&db(), &Record::new("1", "n")).await.unwrap();
        }
        assert_eq!(backend.connections_opened(), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_available() {
        let (router, backend) = setup(vec![
            Node::new("pg", "postgres", "postgres://x"),
            Node::new("a", DRIVER_MEMORY, "mem://a"),
        ])
        .await;
        backend.take_down("mem://a");

        let err = router.read(&db(), "1", "").await.unwrap_err();
        assert!(matches!(err, StoreError::NotAvailable(_)));
        assert_eq!(backend.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_every_call_closes_its_connection() {
        let (router, backend) = setup(vec![Node::new("a", DRIVER_MEMORY, "mem://a")]).await;

        router.create(&db(), &Record::new("1", "n")).await.unwrap();
        router.read(&db(), "1", "").await.unwrap();
        assert!(router.read(&db(), "missing", "").await.unwrap_err().is_not_found());
        assert!(router.update(&db(), &Record::new("missing", "n")).await.is_err());
        router.search(&db(), &SearchQuery::default()).await.unwrap();
        router.delete(&db(), "1", "").await.unwrap();

        backend.inject(SimFault::Init);
        assert!(router.read(&db(), "1", "").await.is_err());

        assert_eq!(backend.connections_opened(), 7);
        assert_eq!(backend.connections_closed(), 7);
    }

    #[tokio::test]
    async fn test_database_lifecycle_skips_init() {
        let (router, backend) = setup(vec![Node::new("a", DRIVER_MEMORY, "mem://a")]).await;
        backend.inject(SimFault::Init);

        let target = Database::new("test_other", "");
        router.create_database(&target).await.unwrap();
        assert!(backend.has_database("test_other").await);
        router.delete_database(&target).await.unwrap();
        assert!(!backend.has_database("test_other").await);
    }

    struct FailingRegistry;

    #[async_trait]
    impl Registry for FailingRegistry {
        async fn lookup(&self, _service: &str) -> StoreResult<Vec<Node>> {
            Err(StoreError::registry("registry unreachable"))
        }
    }

    #[tokio::test]
    async fn test_registry_errors_propagate() {
        let router = Router::new(Arc::new(FailingRegistry), DriverTable::new());
        let err = router.read(&db(), "1", "").await.unwrap_err();
        assert!(matches!(err, StoreError::Registry(_)));
    }
}
