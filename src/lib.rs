//! Polystore - Polyglot Persistence Service
//!
//! TigerStyle: One record contract, many backing stores.
//!
//! Every caller speaks the same CRUD + Search + RawQuery contract over a
//! generic [`Record`]. Each request carries a [`Database`] descriptor that
//! the router resolves, through a service registry, to a live backend node
//! and the driver that knows how to talk to it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  HTTP API (axum, api.rs)                     │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼──────────────────────────────┐
//! │        SearchSync (mirrors searchable writes, sync.rs)       │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼──────────────────────────────┐
//! │         RecordService (validate + classify, service.rs)      │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼──────────────────────────────┐
//! │      Router (registry lookup + failover, router.rs)          │
//! └──────────────────────────────┬──────────────────────────────┘
//!          ┌──────────┬──────────┼──────────┬──────────┐
//!          ▼          ▼          ▼          ▼          ▼
//!      Postgres   ArangoDB  Elasticsearch InfluxDB   Redis
//! ```

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod record;
pub mod registry;
pub mod router;
pub mod service;
pub mod sync;

pub use config::{Config, ConfigError, NodeConfig};
pub use driver::{Connection, Driver, DriverTable};
pub use error::{ServiceError, ServiceResult, StoreError, StoreResult};
pub use record::{Database, Payload, Record, RecordBuilder, SearchQuery};
pub use registry::{Node, Registry, SelectorStrategy, StaticRegistry};
pub use router::Router;
pub use service::{CallContext, RecordApi, RecordService};
pub use sync::{MirrorStats, MirrorTasks, SearchSync};

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Application name
pub const APP_NAME: &str = "polystore";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP bind address
pub const HTTP_BIND_ADDRESS_DEFAULT: &str = "127.0.0.1:8285";

/// Default registry namespace for backend services
pub const NAMESPACE_DEFAULT: &str = "polystore.db";

/// Registry namespace used by databases whose name carries the test prefix
pub const NAMESPACE_TEST: &str = "test";

/// Database names starting with this prefix resolve in the test namespace
pub const TEST_DATABASE_PREFIX: &str = "test";

/// Driver used when a descriptor does not name one
pub const DRIVER_DEFAULT: &str = "arangodb";

/// Driver that receives mirrored writes for searchable databases
pub const SEARCH_DRIVER_DEFAULT: &str = "elasticsearch";

/// Search limit applied when the caller passes zero or a negative value
pub const SEARCH_LIMIT_DEFAULT: i64 = 10;

/// Upper bound of the created-time range when the caller leaves it unset
pub const SEARCH_TO_SENTINEL: i64 = i64::MAX;

/// Latest accepted `created`/`updated` value (9999-12-31T23:59:59Z)
pub const TIMESTAMP_MAX_SECS: i64 = 253_402_300_799;

/// Mean Earth radius used by haversine distance, in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default timeout for HTTP-speaking backend clients
pub const HTTP_TIMEOUT_SECS_DEFAULT: u64 = 30;
