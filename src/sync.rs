//! Sync - Search-index synchronization wrapper
//!
//! TigerStyle: Primary writes are synchronous, mirrors are observable.
//!
//! # Flow
//!
//! ```text
//!             create/update/delete/run_query on a searchable database
//!                                   │
//!                ┌──────────────────┴──────────────────┐
//!                ▼                                     ▼
//!   inner call (awaited, result returned)   same request, driver = search driver
//!                                           spawned on MirrorTasks (not awaited)
//!
//!             search on a searchable database
//!                                   │
//!                                   ▼
//!        rewritten to the search driver, `autocomplete` lifted into the
//!        descriptor, awaited
//! ```
//!
//! Mirrors on the same lane (one record, or one table for native queries)
//! run one after another in submission order; different lanes run
//! concurrently. Mirror failures are logged at `warn` and counted, never
//! returned. [`MirrorTasks::wait_idle`] bounds the eventual-consistency
//! window in tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::error::ServiceResult;
use crate::record::{Database, FLAG_TRUE, META_AUTOCOMPLETE};
use crate::service::{
    CallContext, CreateRequest, DatabaseRequest, DeleteRequest, EmptyResponse, ReadRequest,
    ReadResponse, RecordApi, RunQueryRequest, SearchRequest, SearchResponse, UpdateRequest,
};
use crate::{DRIVER_DEFAULT, SEARCH_DRIVER_DEFAULT};

// =============================================================================
// MirrorTasks
// =============================================================================

/// Counters describing mirror activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    /// Mirrors spawned but not finished
    pub pending: usize,
    /// Mirrors that succeeded
    pub completed: u64,
    /// Mirrors that failed
    pub failed: u64,
}

/// Tail of a lane: the most recently submitted mirror.
#[derive(Debug)]
struct LaneTail {
    seq: u64,
    done: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct MirrorState {
    pending: watch::Sender<usize>,
    completed: AtomicU64,
    failed: AtomicU64,
    next_seq: AtomicU64,
    lanes: Mutex<HashMap<String, LaneTail>>,
}

impl MirrorState {
    /// Become the lane's tail, returning the previous tail's completion.
    fn enqueue(
        &self,
        lane: &str,
        seq: u64,
        done: oneshot::Receiver<()>,
    ) -> Option<oneshot::Receiver<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        lanes
            .insert(lane.to_string(), LaneTail { seq, done })
            .map(|previous| previous.done)
    }

    /// Drop the lane entry if no later mirror joined it.
    fn retire(&self, lane: &str, seq: u64) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes.get(lane).is_some_and(|tail| tail.seq == seq) {
            lanes.remove(lane);
        }
    }
}

/// Lane for mirrors touching one record.
#[must_use]
pub fn record_lane(database: &Database, id: &str) -> String {
    format!("{}/{}/{}", database.name, database.table, id)
}

/// Lane for mirrors touching a whole table.
#[must_use]
pub fn table_lane(database: &Database) -> String {
    format!("{}/{}", database.name, database.table)
}

/// Background mirror tasks with observable completion.
#[derive(Debug, Clone)]
pub struct MirrorTasks {
    state: Arc<MirrorState>,
}

impl Default for MirrorTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorTasks {
    /// Create an idle task set.
    #[must_use]
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            state: Arc::new(MirrorState {
                pending,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawn one mirror on a lane. It starts once every earlier mirror on
    /// the same lane has finished. Its outcome is counted and failures are
    /// logged.
    pub fn spawn<F, T>(&self, op: &'static str, lane: String, database: &Database, mirror: F)
    where
        F: Future<Output = ServiceResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let seq = self.state.next_seq.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self.state.enqueue(&lane, seq, done_rx);
        self.state.pending.send_modify(|n| *n += 1);

        let state = Arc::clone(&self.state);
        let name = database.name.clone();
        let table = database.table.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // A dropped sender still means the predecessor is gone
                let _ = previous.await;
            }
            match mirror.await {
                Ok(_) => {
                    state.completed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(op, database = %name, table = %table, "Mirror completed");
                }
                Err(e) => {
                    state.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(op, database = %name, table = %table, error = %e, "Mirror failed");
                }
            }
            let _ = done_tx.send(());
            state.retire(&lane, seq);
            state.pending.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            pending: *self.state.pending.borrow(),
            completed: self.state.completed.load(Ordering::SeqCst),
            failed: self.state.failed.load(Ordering::SeqCst),
        }
    }

    /// Wait until no mirror is pending. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut pending = self.state.pending.subscribe();
        let idle = matches!(
            tokio::time::timeout(timeout, pending.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        idle
    }
}

// =============================================================================
// SearchSync
// =============================================================================

/// [`RecordApi`] decorator mirroring searchable writes into the search driver.
pub struct SearchSync<A> {
    inner: Arc<A>,
    default_driver: String,
    search_driver: String,
    tasks: MirrorTasks,
}

impl<A: RecordApi + 'static> SearchSync<A> {
    /// Wrap a facade using the default driver names.
    #[must_use]
    pub fn new(inner: Arc<A>) -> Self {
        Self {
            inner,
            default_driver: DRIVER_DEFAULT.to_string(),
            search_driver: SEARCH_DRIVER_DEFAULT.to_string(),
            tasks: MirrorTasks::new(),
        }
    }

    /// Set the driver descriptors fall back to when they name none.
    #[must_use]
    pub fn with_default_driver(mut self, driver: impl Into<String>) -> Self {
        self.default_driver = driver.into();
        self
    }

    /// Set the driver receiving mirrors and searches.
    #[must_use]
    pub fn with_search_driver(mut self, driver: impl Into<String>) -> Self {
        self.search_driver = driver.into();
        self
    }

    /// Mirror task set, for observing the consistency window.
    #[must_use]
    pub fn tasks(&self) -> &MirrorTasks {
        &self.tasks
    }

    /// Wrapped facade.
    #[must_use]
    pub fn inner(&self) -> &Arc<A> {
        &self.inner
    }

    /// Whether calls on this descriptor are mirrored.
    #[must_use]
    pub fn mirrors(&self, database: &Database) -> bool {
        database.is_searchable() && database.driver_or(&self.default_driver) != self.search_driver
    }

    fn retarget(&self, database: &mut Database) {
        database.driver.clone_from(&self.search_driver);
    }
}

#[async_trait]
impl<A: RecordApi + 'static> RecordApi for SearchSync<A> {
    async fn read(&self, ctx: &CallContext, req: ReadRequest) -> ServiceResult<ReadResponse> {
        self.inner.read(ctx, req).await
    }

    async fn create(&self, ctx: &CallContext, req: CreateRequest) -> ServiceResult<EmptyResponse> {
        if self.mirrors(&req.database) {
            let mut mirror = req.clone();
            self.retarget(&mut mirror.database);
            let inner = Arc::clone(&self.inner);
            let ctx_copy = ctx.clone();
            let lane = record_lane(&req.database, &req.record.id);
            self.tasks.spawn("create", lane, &req.database, async move {
                inner.create(&ctx_copy, mirror).await
            });
        }
        self.inner.create(ctx, req).await
    }

    async fn update(&self, ctx: &CallContext, req: UpdateRequest) -> ServiceResult<EmptyResponse> {
        if self.mirrors(&req.database) {
            let mut mirror = req.clone();
            self.retarget(&mut mirror.database);
            let inner = Arc::clone(&self.inner);
            let ctx_copy = ctx.clone();
            let lane = record_lane(&req.database, &req.record.id);
            self.tasks.spawn("update", lane, &req.database, async move {
                inner.update(&ctx_copy, mirror).await
            });
        }
        self.inner.update(ctx, req).await
    }

    async fn delete(&self, ctx: &CallContext, req: DeleteRequest) -> ServiceResult<EmptyResponse> {
        if self.mirrors(&req.database) {
            let mut mirror = req.clone();
            self.retarget(&mut mirror.database);
            let inner = Arc::clone(&self.inner);
            let ctx_copy = ctx.clone();
            let lane = record_lane(&req.database, &req.id);
            self.tasks.spawn("delete", lane, &req.database, async move {
                inner.delete(&ctx_copy, mirror).await
            });
        }
        self.inner.delete(ctx, req).await
    }

    async fn search(&self, ctx: &CallContext, mut req: SearchRequest) -> ServiceResult<SearchResponse> {
        if self.mirrors(&req.database) {
            let requested = req
                .metadata
                .remove(META_AUTOCOMPLETE)
                .is_some_and(|v| v.eq_ignore_ascii_case(FLAG_TRUE));
            if requested || req.database.is_autocomplete() {
                req.database
                    .metadata
                    .insert(META_AUTOCOMPLETE.to_string(), FLAG_TRUE.to_string());
            }
            self.retarget(&mut req.database);
            tracing::debug!(
                database = %req.database.name,
                table = %req.database.table,
                driver = %req.database.driver,
                autocomplete = req.database.is_autocomplete(),
                "Search routed to search driver"
            );
        }
        self.inner.search(ctx, req).await
    }

    async fn run_query(
        &self,
        ctx: &CallContext,
        req: RunQueryRequest,
    ) -> ServiceResult<SearchResponse> {
        if self.mirrors(&req.database) {
            let mut mirror = req.clone();
            self.retarget(&mut mirror.database);
            let inner = Arc::clone(&self.inner);
            let ctx_copy = ctx.clone();
            let lane = table_lane(&req.database);
            self.tasks.spawn("run_query", lane, &req.database, async move {
                inner.run_query(&ctx_copy, mirror).await
            });
        }
        self.inner.run_query(ctx, req).await
    }

    async fn create_database(
        &self,
        ctx: &CallContext,
        req: DatabaseRequest,
    ) -> ServiceResult<EmptyResponse> {
        self.inner.create_database(ctx, req).await
    }

    async fn delete_database(
        &self,
        ctx: &CallContext,
        req: DatabaseRequest,
    ) -> ServiceResult<EmptyResponse> {
        self.inner.delete_database(ctx, req).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::ServiceError;
    use crate::record::{Record, META_SEARCHABLE};

    /// Records every call's descriptor; fails calls routed to `broken`.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Database)>>,
    }

    impl Recorder {
        fn log(&self, op: &str, database: &Database) -> ServiceResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((op.to_string(), database.clone()));
            if database.driver == "broken" {
                return Err(ServiceError::NotAvailable("broken".into()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<(String, Database)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordApi for Recorder {
        async fn read(&self, _: &CallContext, req: ReadRequest) -> ServiceResult<ReadResponse> {
            self.log("read", &req.database)?;
            Ok(ReadResponse::default())
        }
        async fn create(&self, _: &CallContext, req: CreateRequest) -> ServiceResult<EmptyResponse> {
            self.log("create", &req.database)?;
            Ok(EmptyResponse {})
        }
        async fn update(&self, _: &CallContext, req: UpdateRequest) -> ServiceResult<EmptyResponse> {
            self.log("update", &req.database)?;
            Ok(EmptyResponse {})
        }
        async fn delete(&self, _: &CallContext, req: DeleteRequest) -> ServiceResult<EmptyResponse> {
            self.log("delete", &req.database)?;
            Ok(EmptyResponse {})
        }
        async fn search(&self, _: &CallContext, req: SearchRequest) -> ServiceResult<SearchResponse> {
            self.log("search", &req.database)?;
            Ok(SearchResponse::default())
        }
        async fn run_query(&self, _: &CallContext, req: RunQueryRequest) -> ServiceResult<SearchResponse> {
            self.log("run_query", &req.database)?;
            Ok(SearchResponse::default())
        }
        async fn create_database(&self, _: &CallContext, req: DatabaseRequest) -> ServiceResult<EmptyResponse> {
            self.log("create_database", &req.database)?;
            Ok(EmptyResponse {})
        }
        async fn delete_database(&self, _: &CallContext, req: DatabaseRequest) -> ServiceResult<EmptyResponse> {
            self.log("delete_database", &req.database)?;
            Ok(EmptyResponse {})
        }
    }

    fn searchable() -> Database {
        Database::new("db", "goals")
            .with_driver("postgres")
            .with_metadata(META_SEARCHABLE, "true")
    }

    fn create(database: Database) -> CreateRequest {
        CreateRequest {
            database,
            record: Record::new("1", "n"),
        }
    }

    #[test]
    fn test_mirrors() {
        let sync = SearchSync::new(Arc::new(Recorder::default()));
        assert!(sync.mirrors(&searchable()));
        assert!(sync.mirrors(&Database::new("db", "t").with_metadata(META_SEARCHABLE, "true")));
        assert!(!sync.mirrors(&Database::new("db", "t").with_driver("postgres")));
        assert!(!sync.mirrors(&searchable().with_driver("elasticsearch")));
    }

    #[tokio::test]
    async fn test_create_is_mirrored() {
        let recorder = Arc::new(Recorder::default());
        let sync = SearchSync::new(Arc::clone(&recorder));
        let ctx = CallContext::new();

        sync.create(&ctx, create(searchable())).await.unwrap();
        assert!(sync.tasks().wait_idle(Duration::from_secs(2)).await);

        let drivers: Vec<String> = recorder.calls().into_iter().map(|(_, db)| db.driver).collect();
        assert_eq!(drivers.len(), 2);
        assert!(drivers.contains(&"postgres".to_string()));
        assert!(drivers.contains(&"elasticsearch".to_string()));
        assert_eq!(
            sync.tasks().stats(),
            MirrorStats {
                pending: 0,
                completed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_unflagged_calls_pass_through() {
        let recorder = Arc::new(Recorder::default());
        let sync = SearchSync::new(Arc::clone(&recorder));
        let ctx = CallContext::new();

        sync.create(&ctx, create(Database::new("db", "t").with_driver("postgres")))
            .await
            .unwrap();
        assert_eq!(recorder.calls().len(), 1);
        assert_eq!(sync.tasks().stats(), MirrorStats::default());
    }

    #[tokio::test]
    async fn test_mirror_failure_is_swallowed() {
        let recorder = Arc::new(Recorder::default());
        let sync = SearchSync::new(Arc::clone(&recorder)).with_search_driver("broken");
        let ctx = CallContext::new();

        sync.update(
            &ctx,
            UpdateRequest {
                database: searchable(),
                record: Record::new("1", "n"),
            },
        )
        .await
        .unwrap();
        assert!(sync.tasks().wait_idle(Duration::from_secs(2)).await);
        assert_eq!(sync.tasks().stats().failed, 1);
    }

    #[tokio::test]
    async fn test_search_rewritten_with_autocomplete() {
        let recorder = Arc::new(Recorder::default());
        let sync = SearchSync::new(Arc::clone(&recorder));
        let ctx = CallContext::new();

        let mut req = SearchRequest {
            database: searchable(),
            ..SearchRequest::default()
        };
        req.metadata.insert("autocomplete".into(), "true".into());
        req.metadata.insert("name".into(), "mor".into());
        sync.search(&ctx, req).await.unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        let (op, database) = &calls[0];
        assert_eq!(op, "search");
        assert_eq!(database.driver, "elasticsearch");
        assert!(database.is_autocomplete());
        assert_eq!(sync.tasks().stats(), MirrorStats::default());
    }

    #[tokio::test]
    async fn test_database_ops_pass_through() {
        let recorder = Arc::new(Recorder::default());
        let sync = SearchSync::new(Arc::clone(&recorder));
        let req = DatabaseRequest {
            database: searchable(),
        };
        sync.create_database(&CallContext::new(), req).await.unwrap();
        assert_eq!(recorder.calls().len(), 1);
        assert_eq!(recorder.calls()[0].1.driver, "postgres");
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let tasks = MirrorTasks::new();
        tasks.spawn("create", "db/t/1".into(), &Database::new("db", "t"), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ServiceError>(())
        });
        assert!(!tasks.wait_idle(Duration::from_millis(20)).await);
        assert_eq!(tasks.stats().pending, 1);
    }
    #[tokio::test]
    async fn test_same_lane_runs_in_order() {
        let tasks = MirrorTasks::new();
        let db = Database::new("db", "t");
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        tasks.spawn("create", record_lane(&db, "1"), &db, async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            first.lock().unwrap().push("create");
            Ok::<_, ServiceError>(())
        });
        let second = Arc::clone(&order);
        tasks.spawn("update", record_lane(&db, "1"), &db, async move {
            second.lock().unwrap().push("update");
            Ok::<_, ServiceError>(())
        });

        assert!(tasks.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*order.lock().unwrap(), vec!["create", "update"]);
        assert_eq!(tasks.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_lane_continues_after_failure() {
        let tasks = MirrorTasks::new();
        let db = Database::new("db", "t");
        tasks.spawn("create", record_lane(&db, "1"), &db, async {
            Err::<(), _>(ServiceError::NotAvailable("down".into()))
        });
        tasks.spawn("update", record_lane(&db, "1"), &db, async {
            Ok::<_, ServiceError>(())
        });

        assert!(tasks.wait_idle(Duration::from_secs(5)).await);
        let stats = tasks.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_other_lanes_not_blocked() {
        let tasks = MirrorTasks::new();
        let db = Database::new("db", "t");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        tasks.spawn("create", record_lane(&db, "1"), &db, async move {
            let _ = release_rx.await;
            Ok::<_, ServiceError>(())
        });
        tasks.spawn("create", record_lane(&db, "2"), &db, async {
            Ok::<_, ServiceError>(())
        });

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.stats().completed < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(done.is_ok());
        assert_eq!(tasks.stats().pending, 1);

        release_tx.send(()).unwrap();
        assert!(tasks.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_create_then_update_mirrored_in_order() {
        let recorder = Arc::new(Recorder::default());
        let sync = SearchSync::new(Arc::clone(&recorder));
        let ctx = CallContext::new();

        sync.create(&ctx, create(searchable())).await.unwrap();
        sync.update(
            &ctx,
            UpdateRequest {
                database: searchable(),
                record: Record::new("1", "renamed"),
            },
        )
        .await
        .unwrap();
        assert!(sync.tasks().wait_idle(Duration::from_secs(2)).await);

        let mirrored: Vec<String> = recorder
            .calls()
            .into_iter()
            .filter(|(_, db)| db.driver == "elasticsearch")
            .map(|(op, _)| op)
            .collect();
        assert_eq!(mirrored, vec!["create", "update"]);
    }
}
