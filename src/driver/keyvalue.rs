//! RedisDriver - Key-value storage
//!
//! TigerStyle: Exact-key operations only, TTL taken from record metadata.
//!
//! # Key Layout
//!
//! ```text
//! <database>:<table>:<id>  →  Record JSON
//! ```
//!
//! `metadata["expiryTime"]` (seconds) becomes the key's `EX` TTL and is
//! stripped before the record is persisted. Search and native queries are
//! not supported by this layout and return no records.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{validate_identifier, Connection, Driver, Guarded};
use crate::error::{StoreError, StoreResult};
use crate::record::{now_unix, Database, Record, SearchQuery, META_EXPIRY_TIME};
use crate::registry::Node;

/// Driver name of the key-value backend
pub const DRIVER_REDIS: &str = "redis";

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 500;

// =============================================================================
// RedisDriver
// =============================================================================

/// Driver for Redis servers.
#[derive(Debug, Clone, Default)]
pub struct RedisDriver;

impl RedisDriver {
    /// Create the driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn map_err(context: &str, err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::connection(format!("{context}: {err}"))
    } else {
        StoreError::backend(format!("{context}: {err}"))
    }
}

async fn open(address: &str) -> StoreResult<MultiplexedConnection> {
    let client = redis::Client::open(address).map_err(|e| map_err("bad redis address", e))?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| map_err("failed to connect", e))?;
    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .map_err(|e| map_err("ping failed", e))?;
    Ok(conn)
}

#[async_trait]
impl Driver for RedisDriver {
    fn name(&self) -> &str {
        DRIVER_REDIS
    }

    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>> {
        for node in nodes {
            match open(&node.address).await {
                Ok(conn) => {
                    tracing::debug!(node = %node.id, "Connected to redis");
                    return Ok(Box::new(RedisConnection {
                        conn: Guarded::new(conn),
                        prefix: None,
                    }));
                }
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Redis handshake failed");
                }
            }
        }
        Err(StoreError::not_available(format!(
            "no reachable redis node among {} candidates",
            nodes.len()
        )))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn key_prefix(database: &str, table: &str) -> String {
    format!("{database}:{table}:")
}

/// Strip the TTL key from a record, returning the TTL in seconds.
///
/// Missing, unparsable or non-positive values mean no expiry.
fn take_expiry(record: &mut Record) -> Option<u64> {
    record
        .metadata
        .remove(META_EXPIRY_TIME)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ttl| *ttl > 0)
}

/// SET command for a record; `XX` when the key must already exist.
fn set_command(key: &str, value: &str, ttl: Option<u64>, must_exist: bool) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if must_exist {
        cmd.arg("XX");
    }
    match ttl {
        Some(ttl) => {
            cmd.arg("EX").arg(ttl);
        }
        None if must_exist => {
            cmd.arg("KEEPTTL");
        }
        None => {}
    }
    cmd
}

// =============================================================================
// RedisConnection
// =============================================================================

/// Connection to one Redis server.
pub struct RedisConnection {
    conn: Guarded<MultiplexedConnection>,
    prefix: Option<String>,
}

impl RedisConnection {
    fn key(&self, id: &str) -> StoreResult<String> {
        self.prefix
            .as_ref()
            .map(|prefix| format!("{prefix}{id}"))
            .ok_or_else(|| StoreError::backend("connection not initialised"))
    }

    async fn get(conn: &mut MultiplexedConnection, key: &str) -> StoreResult<Option<Record>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(|e| map_err("failed to read record", e))?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn init(&mut self, database: &Database) -> StoreResult<()> {
        validate_identifier("database", &database.name)?;
        validate_identifier("table", &database.table)?;
        self.prefix = Some(key_prefix(&database.name, &database.table));
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.conn.take().await;
        Ok(())
    }

    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let guard = self.conn.read().await?;
        let mut conn = guard.clone();
        match Self::get(&mut conn, &self.key(id)?).await? {
            Some(record) if record.matches_secondary(secondary_key) => Ok(record),
            _ => Err(StoreError::not_found(format!("record {id}"))),
        }
    }

    async fn create(&self, record: &Record) -> StoreResult<()> {
        let mut conn = self.conn.write().await?;
        let key = self.key(&record.id)?;

        let mut record = record.clone();
        let ttl = take_expiry(&mut record);
        if record.created <= 0 {
            if let Some(existing) = Self::get(&mut conn, &key).await? {
                record.created = existing.created;
            }
        }
        record.stamp_created(now_unix());

        let value = serde_json::to_string(&record)?;
        set_command(&key, &value, ttl, false)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| map_err("failed to create record", e))?;
        Ok(())
    }

    async fn update(&self, record: &Record) -> StoreResult<()> {
        let mut conn = self.conn.write().await?;
        let key = self.key(&record.id)?;

        let Some(existing) = Self::get(&mut conn, &key).await? else {
            return Err(StoreError::not_found(format!("record {}", record.id)));
        };

        let mut record = record.clone();
        let ttl = take_expiry(&mut record);
        record.created = existing.created;
        record.updated = record.updated.max(existing.updated);
        record.touch(now_unix())?;

        let value = serde_json::to_string(&record)?;
        let reply: Option<String> = set_command(&key, &value, ttl, true)
            .query_async(&mut *conn)
            .await
            .map_err(|e| map_err("failed to update record", e))?;
        if reply.is_none() {
            return Err(StoreError::not_found(format!("record {}", record.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()> {
        let mut conn = self.conn.write().await?;
        let key = self.key(id)?;

        if !secondary_key.is_empty() {
            match Self::get(&mut conn, &key).await? {
                Some(record) if record.matches_secondary(secondary_key) => {}
                _ => return Err(StoreError::not_found(format!("record {id}"))),
            }
        }

        let removed: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| map_err("failed to delete record", e))?;
        if removed == 0 {
            return Err(StoreError::not_found(format!("record {id}")));
        }
        Ok(())
    }

    async fn search(&self, _query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let _conn = self.conn.read().await?;
        Ok(Vec::new())
    }

    async fn run_query(&self, _query: &str) -> StoreResult<Vec<Record>> {
        let _conn = self.conn.read().await?;
        Ok(Vec::new())
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        // Keys are created on demand
        validate_identifier("database", name)?;
        let _conn = self.conn.write().await?;
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let mut conn = self.conn.write().await?;

        let pattern = format!("{name}:*");
        let mut cursor: u64 = 0;
        let mut removed: i64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await
                .map_err(|e| map_err("failed to scan keys", e))?;
            if !keys.is_empty() {
                removed += redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, i64>(&mut *conn)
                    .await
                    .map_err(|e| map_err("failed to delete keys", e))?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::info!(database = %name, keys = removed, "Deleted redis keys");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
