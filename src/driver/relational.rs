//! PostgresDriver - Relational storage
//!
//! TigerStyle: Real database storage, explicit schema, one predicate builder.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PostgresConnection                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pool: sqlx::PgPool (small, one per routed call)             │
//! │  Logical database → schema, table → table                    │
//! │  Search: QueryBuilder composing WHERE from the predicate     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Schema
//!
//! ```sql
//! CREATE SCHEMA IF NOT EXISTS "<database>";
//! CREATE TABLE IF NOT EXISTS "<database>"."<table>" (
//!     id TEXT PRIMARY KEY,
//!     created BIGINT NOT NULL,
//!     updated BIGINT NOT NULL,
//!     name TEXT NOT NULL DEFAULT '',
//!     parameter1 TEXT NOT NULL DEFAULT '',
//!     parameter2 TEXT NOT NULL DEFAULT '',
//!     parameter3 TEXT NOT NULL DEFAULT '',
//!     lat DOUBLE PRECISION,
//!     lng DOUBLE PRECISION,
//!     metadata TEXT NOT NULL DEFAULT '{}',
//!     payload TEXT
//! );
//! ```
//!
//! `metadata` is stored as serialized JSON text so the metadata fallback
//! search can match `"key":"value"` fragments with `LIKE`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use super::predicate::{metadata_like_pattern, Predicate};
use super::{validate_identifier, Connection, Driver, Guarded};
use crate::error::{StoreError, StoreResult};
use crate::record::{now_unix, Database, Payload, Record, SearchQuery};
use crate::registry::Node;
use crate::EARTH_RADIUS_KM;

/// Driver name of the relational backend
pub const DRIVER_POSTGRES: &str = "postgres";

/// Connections per routed call
const POOL_CONNECTIONS_MAX: u32 = 2;

/// Time allowed for the handshake with one node
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Column list shared by every SELECT
const COLUMNS: &str =
    "id, created, updated, name, parameter1, parameter2, parameter3, lat, lng, metadata, payload";

/// SQLSTATE codes meaning "already exists"
const DUPLICATE_CODES: &[&str] = &["42P06", "42P07", "23505"];

// =============================================================================
// PostgresDriver
// =============================================================================

/// Driver for PostgreSQL nodes.
#[derive(Debug, Clone, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create the driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &str {
        DRIVER_POSTGRES
    }

    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>> {
        for node in nodes {
            let pool = PgPoolOptions::new()
                .max_connections(POOL_CONNECTIONS_MAX)
                .acquire_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .connect(&node.address)
                .await;
            match pool {
                Ok(pool) => {
                    tracing::debug!(node = %node.id, "Connected to postgres");
                    return Ok(Box::new(PostgresConnection {
                        pool: Guarded::new(pool),
                        table_ref: None,
                    }));
                }
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Postgres handshake failed");
                }
            }
        }
        Err(StoreError::not_available(format!(
            "no reachable postgres node among {} candidates",
            nodes.len()
        )))
    }
}

// =============================================================================
// PostgresConnection
// =============================================================================

/// Connection to one PostgreSQL node.
pub struct PostgresConnection {
    pool: Guarded<PgPool>,
    table_ref: Option<String>,
}

impl PostgresConnection {
    fn table(&self) -> StoreResult<&str> {
        self.table_ref
            .as_deref()
            .ok_or_else(|| StoreError::backend("connection not initialised"))
    }
}

/// Quoted `"schema"."table"` reference.
fn table_ref(database: &Database) -> StoreResult<String> {
    validate_identifier("database", &database.name)?;
    validate_identifier("table", &database.table)?;
    Ok(format!("\"{}\".\"{}\"", database.name, database.table))
}

fn is_duplicate(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| DUPLICATE_CODES.contains(&&*code))
}

fn map_err(context: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::not_found(context.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::connection(format!("{context}: {err}"))
        }
        _ => StoreError::backend(format!("{context}: {err}")),
    }
}

/// Escape LIKE wildcards in a caller value.
fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Build the search statement for a table.
fn build_search(table: &str, query: &SearchQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {table} WHERE created >= "));
    qb.push_bind(query.from);
    qb.push(" AND created <= ");
    qb.push_bind(query.to);

    match Predicate::classify(query) {
        Predicate::Geo {
            lat,
            lng,
            distance_km,
        } => {
            qb.push(" AND lat IS NOT NULL AND lng IS NOT NULL AND ");
            qb.push(format!("(2 * {EARTH_RADIUS_KM:.1} * ASIN(LEAST(1.0, SQRT("));
            qb.push("POWER(SIN(RADIANS(lat - ");
            qb.push_bind(lat);
            qb.push(") / 2), 2) + COS(RADIANS(");
            qb.push_bind(lat);
            qb.push(")) * COS(RADIANS(lat)) * POWER(SIN(RADIANS(lng - ");
            qb.push_bind(lng);
            qb.push(") / 2), 2))))) <= ");
            qb.push_bind(distance_km);
        }
        Predicate::Fields(fields) => {
            for m in fields {
                if m.field.is_text() {
                    qb.push(format!(" AND {} ILIKE ", m.field.column()));
                    qb.push_bind(format!("%{}%", escape_like(&m.value)));
                } else {
                    qb.push(format!(" AND {} = ", m.field.column()));
                    qb.push_bind(m.value);
                }
            }
        }
        Predicate::Metadata(pairs) => {
            for (key, value) in pairs {
                qb.push(" AND metadata LIKE ");
                qb.push_bind(metadata_like_pattern(&key, &value));
            }
        }
        Predicate::All => {}
    }

    let direction = if query.reverse { "DESC" } else { "ASC" };
    qb.push(format!(" ORDER BY created {direction}, id {direction} LIMIT "));
    qb.push_bind(query.limit);
    qb.push(" OFFSET ");
    qb.push_bind(query.offset);
    qb
}

/// Parse a database row into a Record.
fn row_to_record(row: &PgRow) -> StoreResult<Record> {
    let get_err = |e: sqlx::Error| StoreError::backend(format!("failed to decode row: {e}"));

    let metadata_text: String = row.try_get("metadata").map_err(get_err)?;
    let metadata: HashMap<String, String> = if metadata_text.is_empty() {
        HashMap::new()
    } else {
        serde_json::from_str(&metadata_text)?
    };

    let payload_text: Option<String> = row.try_get("payload").map_err(get_err)?;
    let payload: Option<Payload> = match payload_text {
        Some(text) if !text.is_empty() => Some(serde_json::from_str(&text)?),
        _ => None,
    };

    Ok(Record {
        id: row.try_get("id").map_err(get_err)?,
        created: row.try_get("created").map_err(get_err)?,
        updated: row.try_get("updated").map_err(get_err)?,
        name: row.try_get("name").map_err(get_err)?,
        parameter1: row.try_get("parameter1").map_err(get_err)?,
        parameter2: row.try_get("parameter2").map_err(get_err)?,
        parameter3: row.try_get("parameter3").map_err(get_err)?,
        lat: row.try_get("lat").map_err(get_err)?,
        lng: row.try_get("lng").map_err(get_err)?,
        metadata,
        payload,
    })
}

fn encode_payload(record: &Record) -> StoreResult<Option<String>> {
    Ok(match &record.payload {
        Some(payload) => Some(serde_json::to_string(payload)?),
        None => None,
    })
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn init(&mut self, database: &Database) -> StoreResult<()> {
        let table = table_ref(database)?;
        {
            let pool = self.pool.write().await?;

            let schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", database.name);
            if let Err(e) = sqlx::query(&schema).execute(&*pool).await {
                if !is_duplicate(&e) {
                    return Err(map_err("failed to create schema", e));
                }
            }

            let create = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    created BIGINT NOT NULL,
                    updated BIGINT NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    parameter1 TEXT NOT NULL DEFAULT '',
                    parameter2 TEXT NOT NULL DEFAULT '',
                    parameter3 TEXT NOT NULL DEFAULT '',
                    lat DOUBLE PRECISION,
                    lng DOUBLE PRECISION,
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    payload TEXT
                )"
            );
            if let Err(e) = sqlx::query(&create).execute(&*pool).await {
                if !is_duplicate(&e) {
                    return Err(map_err("failed to create table", e));
                }
            }

            let index = format!(
                "CREATE INDEX IF NOT EXISTS \"{}_created_idx\" ON {table} (created)",
                database.table
            );
            if let Err(e) = sqlx::query(&index).execute(&*pool).await {
                if !is_duplicate(&e) {
                    return Err(map_err("failed to create index", e));
                }
            }
        }

        self.table_ref = Some(table);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if let Some(pool) = self.pool.take().await {
            pool.close().await;
        }
        Ok(())
    }

    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let pool = self.pool.read().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1 AND ($2 = '' OR parameter3 = $2)",
            self.table()?
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(secondary_key)
            .fetch_optional(&*pool)
            .await
            .map_err(|e| map_err("failed to read record", e))?;

        match row {
            Some(row) => {
                let record = row_to_record(&row)?;
                // Postcondition
                assert_eq!(record.id, id, "returned record must match requested id");
                Ok(record)
            }
            None => Err(StoreError::not_found(format!("record {id}"))),
        }
    }

    async fn create(&self, record: &Record) -> StoreResult<()> {
        let pool = self.pool.write().await?;
        let mut record = record.clone();
        record.stamp_created(now_unix());

        let sql = format!(
            "INSERT INTO {} ({COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                updated = EXCLUDED.updated,
                name = EXCLUDED.name,
                parameter1 = EXCLUDED.parameter1,
                parameter2 = EXCLUDED.parameter2,
                parameter3 = EXCLUDED.parameter3,
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                metadata = EXCLUDED.metadata,
                payload = EXCLUDED.payload",
            self.table()?
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.created)
            .bind(record.updated)
            .bind(&record.name)
            .bind(&record.parameter1)
            .bind(&record.parameter2)
            .bind(&record.parameter3)
            .bind(record.lat)
            .bind(record.lng)
            .bind(serde_json::to_string(&record.metadata)?)
            .bind(encode_payload(&record)?)
            .execute(&*pool)
            .await
            .map_err(|e| map_err("failed to create record", e))?;
        Ok(())
    }

    async fn update(&self, record: &Record) -> StoreResult<()> {
        let pool = self.pool.write().await?;
        let mut record = record.clone();
        record.touch(now_unix())?;

        let sql = format!(
            "UPDATE {} SET
                updated = GREATEST($2, updated + 1),
                name = $3,
                parameter1 = $4,
                parameter2 = $5,
                parameter3 = $6,
                lat = $7,
                lng = $8,
                metadata = $9,
                payload = $10
             WHERE id = $1",
            self.table()?
        );
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.updated)
            .bind(&record.name)
            .bind(&record.parameter1)
            .bind(&record.parameter2)
            .bind(&record.parameter3)
            .bind(record.lat)
            .bind(record.lng)
            .bind(serde_json::to_string(&record.metadata)?)
            .bind(encode_payload(&record)?)
            .execute(&*pool)
            .await
            .map_err(|e| map_err("failed to update record", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("record {}", record.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()> {
        let pool = self.pool.write().await?;
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND ($2 = '' OR parameter3 = $2)",
            self.table()?
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(secondary_key)
            .execute(&*pool)
            .await
            .map_err(|e| map_err("failed to delete record", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("record {id}")));
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let pool = self.pool.read().await?;
        let mut qb = build_search(self.table()?, query);
        let rows = qb
            .build()
            .fetch_all(&*pool)
            .await
            .map_err(|e| map_err("failed to search", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(row)?);
        }

        // Postcondition
        assert!(
            records.len() as i64 <= query.limit,
            "result count {} exceeds limit {}",
            records.len(),
            query.limit
        );

        Ok(records)
    }

    async fn run_query(&self, query: &str) -> StoreResult<Vec<Record>> {
        let pool = self.pool.read().await?;
        let rows = sqlx::query(query)
            .fetch_all(&*pool)
            .await
            .map_err(|e| map_err("failed to run query", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let pool = self.pool.write().await?;
        let sql = format!("CREATE SCHEMA IF NOT EXISTS \"{name}\"");
        match sqlx::query(&sql).execute(&*pool).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate(&e) => Ok(()),
            Err(e) => Err(map_err("failed to create database", e)),
        }
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let pool = self.pool.write().await?;
        let sql = format!("DROP SCHEMA IF EXISTS \"{name}\" CASCADE");
        sqlx::query(&sql)
            .execute(&*pool)
            .await
            .map_err(|e| map_err("failed to delete database", e))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
