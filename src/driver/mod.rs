//! Driver - Backend Trait and Implementations
//!
//! TigerStyle: Abstract storage with simulation-first testing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Driver (connect) → Connection Trait             │
//! └─────────────────────────────────────────────────────────────┘
//!     ↑           ↑            ↑             ↑           ↑          ↑
//! ┌───┴────┐ ┌────┴─────┐ ┌────┴──────┐ ┌────┴─────┐ ┌───┴───┐ ┌────┴────┐
//! │Postgres│ │ ArangoDB │ │Elastic-   │ │ InfluxDB │ │ Redis │ │   Sim   │
//! │(sqlx)  │ │(graph)   │ │search     │ │ (series) │ │ (kv)  │ │(testing)│
//! └────────┘ └──────────┘ └───────────┘ └──────────┘ └───────┘ └─────────┘
//! ```
//!
//! A [`Driver`] turns registry nodes into a live [`Connection`]. The router
//! opens one connection per call, provisions the target with
//! [`Connection::init`], runs a single operation and closes it again.

mod document;
mod keyvalue;
pub mod predicate;
mod relational;
mod search;
mod sim;
mod timeseries;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{StoreError, StoreResult};
use crate::record::{Database, Record, SearchQuery};
use crate::registry::Node;
use crate::HTTP_TIMEOUT_SECS_DEFAULT;

pub use document::{ArangoConnection, ArangoDriver, DRIVER_ARANGODB};
pub use keyvalue::{RedisConnection, RedisDriver, DRIVER_REDIS};
pub use relational::{PostgresConnection, PostgresDriver, DRIVER_POSTGRES};
pub use search::{ElasticConnection, ElasticDriver, DRIVER_ELASTICSEARCH};
pub use sim::{SimBackend, SimConnection, SimDriver, SimFault, DRIVER_MEMORY};
pub use timeseries::{InfluxConnection, InfluxDriver, DRIVER_INFLUXDB};

// =============================================================================
// Traits
// =============================================================================

/// A backend implementation, registered by name.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name nodes declare in their `driver` metadata.
    fn name(&self) -> &str;

    /// Establish a connection to the first reachable node.
    ///
    /// # Errors
    /// `NotAvailable` when `nodes` is empty or no node answers the handshake.
    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>>;
}

/// A live connection to one backend node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Provision the container for `database` and target it. Idempotent.
    async fn init(&mut self, database: &Database) -> StoreResult<()>;

    /// Release the backend handle. Further calls fail with `Closed`.
    async fn close(&self) -> StoreResult<()>;

    /// Read a record by id. A non-empty secondary key must match `parameter3`.
    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record>;

    /// Insert or replace a record, stamping unset timestamps.
    async fn create(&self, record: &Record) -> StoreResult<()>;

    /// Replace an existing record, refreshing `updated`.
    async fn update(&self, record: &Record) -> StoreResult<()>;

    /// Delete a record by id.
    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()>;

    /// Filtered, sorted, paginated search over `created`.
    async fn search(&self, query: &SearchQuery) -> StoreResult<Vec<Record>>;

    /// Backend-native query, passed through unvalidated.
    async fn run_query(&self, query: &str) -> StoreResult<Vec<Record>>;

    /// Create a whole logical database.
    async fn create_database(&self, name: &str) -> StoreResult<()>;

    /// Drop a whole logical database.
    async fn delete_database(&self, name: &str) -> StoreResult<()>;
}

// =============================================================================
// Driver Table
// =============================================================================

/// Drivers available to the router, keyed by name.
#[derive(Clone, Default)]
pub struct DriverTable {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every production driver plus the in-memory driver.
    #[must_use]
    pub fn with_defaults(http_timeout: Duration) -> Self {
        let mut table = Self::new();
        table.register(Arc::new(PostgresDriver::new()));
        table.register(Arc::new(ArangoDriver::new(http_timeout)));
        table.register(Arc::new(ElasticDriver::new(http_timeout)));
        table.register(Arc::new(InfluxDriver::new(http_timeout)));
        table.register(Arc::new(RedisDriver::new()));
        table.register(Arc::new(SimDriver::new(SimBackend::new())));
        table
    }

    /// Register a driver under its own name, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Look up a driver.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    /// Registered driver names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverTable")
            .field("drivers", &self.names())
            .finish()
    }
}

// =============================================================================
// Guarded Handle
// =============================================================================

/// Reader/writer-locked backend handle shared by every connection type.
///
/// Mutations take [`Guarded::write`], pure reads take [`Guarded::read`],
/// and [`Guarded::take`] empties the slot on close.
#[derive(Debug)]
pub struct Guarded<T> {
    slot: RwLock<Option<T>>,
}

impl<T> Guarded<T> {
    /// Wrap an open handle.
    pub fn new(handle: T) -> Self {
        Self {
            slot: RwLock::new(Some(handle)),
        }
    }

    /// Shared access for pure reads.
    pub async fn read(&self) -> StoreResult<RwLockReadGuard<'_, T>> {
        let guard = self.slot.read().await;
        RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| StoreError::Closed)
    }

    /// Exclusive access for mutations.
    pub async fn write(&self) -> StoreResult<RwLockMappedWriteGuard<'_, T>> {
        let guard = self.slot.write().await;
        RwLockWriteGuard::try_map(guard, Option::as_mut).map_err(|_| StoreError::Closed)
    }

    /// Remove the handle, returning it if it was still open.
    pub async fn take(&self) -> Option<T> {
        self.slot.write().await.take()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Reject names that cannot be safely spliced into a backend identifier.
pub fn validate_identifier(kind: &str, name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName(format!("{kind} name is empty")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidName(format!(
            "{kind} name {name:?} may only contain letters, digits and '_'"
        )));
    }
    Ok(())
}

// =============================================================================
// HTTP Transport
// =============================================================================

/// One HTTP-speaking node: client, base URL and optional basic auth.
#[derive(Debug, Clone)]
pub(crate) struct HttpEndpoint {
    client: reqwest::Client,
    base: reqwest::Url,
    auth: Option<(String, String)>,
}

/// Status plus parsed JSON body of one response.
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: reqwest::StatusCode,
    pub body: serde_json::Value,
}

impl HttpEndpoint {
    /// Endpoint for a node, using the node's address as base URL.
    pub fn new(client: reqwest::Client, node: &Node) -> StoreResult<Self> {
        let base = reqwest::Url::parse(&node.address)
            .map_err(|e| StoreError::connection(format!("bad address {}: {e}", node.address)))?;
        Ok(Self {
            client,
            base,
            auth: node_credentials(node),
        })
    }

    /// Base URL extended with path segments, each percent-encoded.
    pub fn url(&self, segments: &[&str]) -> StoreResult<reqwest::Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::connection(format!("address {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Request builder carrying credentials.
    pub fn request(&self, method: reqwest::Method, url: reqwest::Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    /// Send a request. Transport failures are `Connection` errors; any
    /// HTTP status is returned for the driver to interpret.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> StoreResult<HttpReply> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::connection(format!("request to {} failed: {e}", self.base)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::connection(format!("response from {} failed: {e}", self.base)))?;
        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        Ok(HttpReply { status, body })
    }
}

/// Default HTTP client for HTTP-speaking drivers.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

/// Default timeout as a duration.
#[must_use]
pub fn default_http_timeout() -> Duration {
    Duration::from_secs(HTTP_TIMEOUT_SECS_DEFAULT)
}

/// Credentials advertised in node metadata.
pub(crate) fn node_credentials(node: &Node) -> Option<(String, String)> {
    let user = node.get_metadata("username")?;
    let password = node.get_metadata("password").unwrap_or_default();
    Some((user.to_string(), password.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
