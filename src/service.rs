//! Service - The RPC facade
//!
//! TigerStyle: Validate at the boundary, classify errors exactly once.
//!
//! [`RecordApi`] is the caller-facing contract. [`RecordService`] implements
//! it over the [`Router`]: it rejects malformed requests, forwards the call
//! and turns raw [`StoreError`]s into the [`ServiceError`] taxonomy.
//!
//! [`StoreError`]: crate::error::StoreError

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult, StoreError};
use crate::record::{Database, Record, SearchQuery};
use crate::router::Router;
use crate::TIMESTAMP_MAX_SECS;

// =============================================================================
// Call Context
// =============================================================================

/// Per-call context supplied by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    test: bool,
}

impl CallContext {
    /// Context for a production call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a call marked as a test.
    #[must_use]
    pub fn test() -> Self {
        Self { test: true }
    }

    /// Whether destructive test-only operations are allowed.
    #[must_use]
    pub fn is_test(&self) -> bool {
        self.test
    }
}

// =============================================================================
// Requests and Responses
// =============================================================================

/// Read one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadRequest {
    pub database: Database,
    pub id: String,
    /// When non-empty, must equal the record's `parameter3`
    pub secondary_key: String,
}

/// A single record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub record: Record,
}

/// Create (upsert) a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub database: Database,
    pub record: Record,
}

/// Replace an existing record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    pub database: Database,
    pub record: Record,
}

/// Delete one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRequest {
    pub database: Database,
    pub id: String,
    /// When non-empty, must equal the record's `parameter3`
    pub secondary_key: String,
}

/// Filtered, sorted, paginated search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub database: Database,
    /// Filter map: reserved keys plus best-effort metadata matches
    pub metadata: HashMap<String, String>,
    pub from: i64,
    pub to: i64,
    pub limit: i64,
    pub offset: i64,
    pub reverse: bool,
}

impl SearchRequest {
    /// Normalized query for drivers.
    #[must_use]
    pub fn to_query(&self) -> SearchQuery {
        SearchQuery::new(
            self.metadata.clone(),
            self.from,
            self.to,
            self.limit,
            self.offset,
            self.reverse,
        )
    }
}

/// Records returned by search and native queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub records: Vec<Record>,
}

/// Backend-native query, passed through unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunQueryRequest {
    pub database: Database,
    pub query: String,
}

/// Whole-database lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseRequest {
    pub database: Database,
}

/// Acknowledgement with no body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResponse {}

// =============================================================================
// RecordApi
// =============================================================================

/// Caller-facing record contract.
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Read a record. `NotFound` when absent.
    async fn read(&self, ctx: &CallContext, req: ReadRequest) -> ServiceResult<ReadResponse>;

    /// Create (upsert) a record.
    async fn create(&self, ctx: &CallContext, req: CreateRequest) -> ServiceResult<EmptyResponse>;

    /// Update an existing record. `NotFound` when absent.
    async fn update(&self, ctx: &CallContext, req: UpdateRequest) -> ServiceResult<EmptyResponse>;

    /// Delete a record. Absent records are not an error.
    async fn delete(&self, ctx: &CallContext, req: DeleteRequest) -> ServiceResult<EmptyResponse>;

    /// Search a table.
    async fn search(&self, ctx: &CallContext, req: SearchRequest) -> ServiceResult<SearchResponse>;

    /// Run a backend-native query.
    async fn run_query(
        &self,
        ctx: &CallContext,
        req: RunQueryRequest,
    ) -> ServiceResult<SearchResponse>;

    /// Create a logical database.
    async fn create_database(
        &self,
        ctx: &CallContext,
        req: DatabaseRequest,
    ) -> ServiceResult<EmptyResponse>;

    /// Drop a logical database. Test contexts only.
    async fn delete_database(
        &self,
        ctx: &CallContext,
        req: DatabaseRequest,
    ) -> ServiceResult<EmptyResponse>;
}

// =============================================================================
// Validation
// =============================================================================

fn require_table(database: &Database) -> ServiceResult<()> {
    if database.name.is_empty() {
        return Err(ServiceError::bad_request("database name is required"));
    }
    if database.table.is_empty() {
        return Err(ServiceError::bad_request("database table is required"));
    }
    Ok(())
}

fn require_name(database: &Database) -> ServiceResult<()> {
    if database.name.is_empty() {
        return Err(ServiceError::bad_request("database name is required"));
    }
    Ok(())
}

fn require_timestamps(record: &Record) -> ServiceResult<()> {
    if !record.timestamps_in_range() {
        return Err(ServiceError::bad_request(format!(
            "record timestamps must be within 0..={TIMESTAMP_MAX_SECS}"
        )));
    }
    Ok(())
}

fn require_id(id: &str) -> ServiceResult<()> {
    if id.is_empty() {
        return Err(ServiceError::bad_request("record id is required"));
    }
    Ok(())
}

// =============================================================================
// RecordService
// =============================================================================

/// Facade over the router.
#[derive(Debug, Clone)]
pub struct RecordService {
    router: Arc<Router>,
}

impl RecordService {
    /// Create the facade.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Router used by this facade.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Classify a raw error, logging it at the level its class deserves.
    fn classify(op: &str, database: &Database, err: StoreError) -> ServiceError {
        let err = ServiceError::from(err);
        match &err {
            ServiceError::NotFound(what) => {
                tracing::debug!(op, database = %database.name, table = %database.table, what = %what, "Not found");
            }
            ServiceError::BadRequest(message) | ServiceError::NotAvailable(message) => {
                tracing::warn!(op, database = %database.name, table = %database.table, error = %message, "Request failed");
            }
            ServiceError::Internal(message) => {
                tracing::error!(op, database = %database.name, table = %database.table, error = %message, "Internal error");
            }
        }
        err
    }
}

#[async_trait]
impl RecordApi for RecordService {
    async fn read(&self, _ctx: &CallContext, req: ReadRequest) -> ServiceResult<ReadResponse> {
        require_table(&req.database)?;
        require_id(&req.id)?;

        let record = self
            .router
            .read(&req.database, &req.id, &req.secondary_key)
            .await
            .map_err(|e| Self::classify("read", &req.database, e))?;
        Ok(ReadResponse { record })
    }

    async fn create(&self, _ctx: &CallContext, req: CreateRequest) -> ServiceResult<EmptyResponse> {
        require_table(&req.database)?;
        require_id(&req.record.id)?;
        require_timestamps(&req.record)?;

        self.router
            .create(&req.database, &req.record)
            .await
            .map_err(|e| Self::classify("create", &req.database, e))?;
        tracing::debug!(database = %req.database.name, table = %req.database.table, id = %req.record.id, "Created record");
        Ok(EmptyResponse {})
    }

    async fn update(&self, _ctx: &CallContext, req: UpdateRequest) -> ServiceResult<EmptyResponse> {
        require_table(&req.database)?;
        require_id(&req.record.id)?;
        require_timestamps(&req.record)?;

        self.router
            .update(&req.database, &req.record)
            .await
            .map_err(|e| Self::classify("update", &req.database, e))?;
        Ok(EmptyResponse {})
    }

    async fn delete(&self, _ctx: &CallContext, req: DeleteRequest) -> ServiceResult<EmptyResponse> {
        require_table(&req.database)?;
        require_id(&req.id)?;

        match self
            .router
            .delete(&req.database, &req.id, &req.secondary_key)
            .await
        {
            Ok(()) => Ok(EmptyResponse {}),
            Err(e) if e.is_not_found() => {
                tracing::debug!(database = %req.database.name, id = %req.id, "Delete of absent record");
                Ok(EmptyResponse {})
            }
            Err(e) => Err(Self::classify("delete", &req.database, e)),
        }
    }

    async fn search(&self, _ctx: &CallContext, req: SearchRequest) -> ServiceResult<SearchResponse> {
        require_table(&req.database)?;

        let records = self
            .router
            .search(&req.database, &req.to_query())
            .await
            .map_err(|e| Self::classify("search", &req.database, e))?;
        Ok(SearchResponse { records })
    }

    async fn run_query(
        &self,
        _ctx: &CallContext,
        req: RunQueryRequest,
    ) -> ServiceResult<SearchResponse> {
        require_table(&req.database)?;
        if req.query.trim().is_empty() {
            return Err(ServiceError::bad_request("query is required"));
        }

        let records = self
            .router
            .run_query(&req.database, &req.query)
            .await
            .map_err(|e| Self::classify("run_query", &req.database, e))?;
        Ok(SearchResponse { records })
    }

    async fn create_database(
        &self,
        _ctx: &CallContext,
        req: DatabaseRequest,
    ) -> ServiceResult<EmptyResponse> {
        require_name(&req.database)?;

        self.router
            .create_database(&req.database)
            .await
            .map_err(|e| Self::classify("create_database", &req.database, e))?;
        tracing::info!(database = %req.database.name, "Created database");
        Ok(EmptyResponse {})
    }

    async fn delete_database(
        &self,
        ctx: &CallContext,
        req: DatabaseRequest,
    ) -> ServiceResult<EmptyResponse> {
        if !ctx.is_test() {
            tracing::warn!(database = %req.database.name, "Refused delete_database outside a test context");
            return Err(ServiceError::bad_request(
                "delete_database is only allowed in a test context",
            ));
        }
        require_name(&req.database)?;

        self.router
            .delete_database(&req.database)
            .await
            .map_err(|e| Self::classify("delete_database", &req.database, e))?;
        tracing::info!(database = %req.database.name, "Deleted database");
        Ok(EmptyResponse {})
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverTable, SimBackend, SimDriver, SimFault, DRIVER_MEMORY};
    use crate::registry::{Node, StaticRegistry};

    async fn service() -> (RecordService, SimBackend) {
        let backend = SimBackend::new();
        let registry = StaticRegistry::new();
        registry
            .register("test.memory", Node::new("mem-1", DRIVER_MEMORY, "mem://1"))
            .await;
        let mut drivers = DriverTable::new();
        drivers.register(Arc::new(SimDriver::new(backend.clone())));
        let router = Router::new(Arc::new(registry), drivers).with_default_driver(DRIVER_MEMORY);
        (RecordService::new(Arc::new(router)), backend)
    }

    fn db() -> Database {
        Database::new("test_db", "test_table")
    }

    fn create(id: &str) -> CreateRequest {
        CreateRequest {
            database: db(),
            record: Record::builder().id(id).name("test_name").build(),
        }
    }

    #[tokio::test]
    async fn test_validation() {
        let (svc, _) = service().await;
        let ctx = CallContext::new();

        let mut req = create("1");
        req.database.table.clear();
        assert!(matches!(svc.create(&ctx, req).await, Err(ServiceError::BadRequest(_))));

        let mut req = create("1");
        req.record.id.clear();
        assert!(matches!(svc.create(&ctx, req).await, Err(ServiceError::BadRequest(_))));

        let req = ReadRequest {
            database: db(),
            ..ReadRequest::default()
        };
        assert!(matches!(svc.read(&ctx, req).await, Err(ServiceError::BadRequest(_))));

        let req = RunQueryRequest {
            database: db(),
            query: "  ".into(),
        };
        assert!(matches!(svc.run_query(&ctx, req).await, Err(ServiceError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let (svc, _) = service().await;
        let ctx = CallContext::new();

        svc.create(&ctx, create("1")).await.unwrap();
        let resp = svc
            .read(
                &ctx,
                ReadRequest {
                    database: db(),
                    id: "1".into(),
                    secondary_key: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.record.name, "test_name");

        let delete = DeleteRequest {
            database: db(),
            id: "1".into(),
            secondary_key: String::new(),
        };
        svc.delete(&ctx, delete.clone()).await.unwrap();
        // Absent is OK
        svc.delete(&ctx, delete).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_classification() {
        let (svc, backend) = service().await;
        let ctx = CallContext::new();

        let read = ReadRequest {
            database: db(),
            id: "missing".into(),
            secondary_key: String::new(),
        };
        assert!(matches!(svc.read(&ctx, read.clone()).await, Err(ServiceError::NotFound(_))));

        let update = UpdateRequest {
            database: db(),
            record: Record::new("missing", "x"),
        };
        assert!(matches!(svc.update(&ctx, update).await, Err(ServiceError::NotFound(_))));

        let mut unrouted = read.clone();
        unrouted.database = Database::new("prod_db", "t");
        assert!(matches!(
            svc.read(&ctx, unrouted).await,
            Err(ServiceError::NotAvailable(_))
        ));

        backend.inject(SimFault::Read);
        assert!(matches!(svc.read(&ctx, read).await, Err(ServiceError::Internal(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_timestamps_rejected() {
        let (svc, backend) = service().await;
        let ctx = CallContext::new();
        svc.create(&ctx, create("1")).await.unwrap();

        let update = UpdateRequest {
            database: db(),
            record: Record::builder().id("1").name("x").updated(i64::MAX).build(),
        };
        assert!(matches!(svc.update(&ctx, update).await, Err(ServiceError::BadRequest(_))));

        let mut req = create("2");
        req.record.created = -1;
        assert!(matches!(svc.create(&ctx, req).await, Err(ServiceError::BadRequest(_))));
        assert_eq!(backend.count("test_db", "test_table").await, 1);

        // Stored record is untouched
        let read = ReadRequest {
            database: db(),
            id: "1".into(),
            secondary_key: String::new(),
        };
        assert_eq!(svc.read(&ctx, read).await.unwrap().record.name, "test_name");
    }

    #[tokio::test]
    async fn test_delete_database_requires_test_context() {
        let (svc, backend) = service().await;
        let req = DatabaseRequest {
            database: Database::new("test_scratch", ""),
        };

        svc.create_database(&CallContext::new(), req.clone()).await.unwrap();
        assert!(backend.has_database("test_scratch").await);

        assert!(matches!(
            svc.delete_database(&CallContext::new(), req.clone()).await,
            Err(ServiceError::BadRequest(_))
        ));
        assert!(backend.has_database("test_scratch").await);

        svc.delete_database(&CallContext::test(), req).await.unwrap();
        assert!(!backend.has_database("test_scratch").await);
    }

    #[test]
    fn test_search_request_normalizes() {
        let req = SearchRequest {
            database: db(),
            limit: -1,
            ..SearchRequest::default()
        };
        let query = req.to_query();
        assert_eq!(query.limit, crate::SEARCH_LIMIT_DEFAULT);
        assert_eq!(query.to, crate::SEARCH_TO_SENTINEL);
    }

    #[test]
    fn test_request_json_defaults() {
        let req: SearchRequest = serde_json::from_value(serde_json::json!({
            "database": {"name": "db", "table": "t"},
            "metadata": {"name": "run"}
        }))
        .unwrap();
        assert_eq!(req.limit, 0);
        assert_eq!(req.metadata.get("name").map(String::as_str), Some("run"));
    }
}
