//! InfluxDriver - Time-series storage over the InfluxDB 1.x HTTP API
//!
//! TigerStyle: Line protocol out, InfluxQL in, both built as pure functions.
//!
//! # Point Layout
//!
//! ```text
//! measurement = <table>           database = <database>
//! tags:   id, name, parameter1, parameter2   (empty tags omitted)
//! fields: parameter3, created, updated, lat, lng, metadata, payload
//! time:   created (seconds precision)
//! ```
//!
//! Points are immutable in practice: `update` is a no-op, `delete` drops
//! the record's series. Geo filter keys are ignored.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::predicate::{field_matches, metadata_pairs};
use super::{http_client, validate_identifier, Connection, Driver, Guarded, HttpEndpoint};
use crate::error::{StoreError, StoreResult};
use crate::record::{now_unix, Database, Record, SearchQuery};
use crate::registry::Node;

/// Driver name of the time-series backend
pub const DRIVER_INFLUXDB: &str = "influxdb";

/// Latest instant InfluxDB can store, in seconds
const TIME_MAX_SECS: i64 = 9_223_372_035;

// =============================================================================
// InfluxDriver
// =============================================================================

/// Driver for InfluxDB 1.x servers.
#[derive(Debug, Clone)]
pub struct InfluxDriver {
    client: reqwest::Client,
}

impl InfluxDriver {
    /// Create the driver with a per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl Driver for InfluxDriver {
    fn name(&self) -> &str {
        DRIVER_INFLUXDB
    }

    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>> {
        for node in nodes {
            let endpoint = match HttpEndpoint::new(self.client.clone(), node) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Invalid influxdb address");
                    continue;
                }
            };
            let ping = match endpoint.url(&["ping"]) {
                Ok(url) => endpoint.send(endpoint.request(Method::GET, url)).await,
                Err(e) => Err(e),
            };
            match ping {
                Ok(reply) if reply.status.is_success() => {
                    tracing::debug!(node = %node.id, "Connected to influxdb");
                    return Ok(Box::new(InfluxConnection {
                        endpoint: Guarded::new(endpoint),
                        target: None,
                    }));
                }
                Ok(reply) => {
                    tracing::warn!(node = %node.id, status = %reply.status, "Influxdb ping rejected");
                }
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Influxdb ping failed");
                }
            }
        }
        Err(StoreError::not_available(format!(
            "no reachable influxdb node among {} candidates",
            nodes.len()
        )))
    }
}

// =============================================================================
// Line Protocol
// =============================================================================

/// Escape a measurement name.
fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape a tag key or value.
fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Quote a string field value.
fn quote_field(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// One point for a record.
fn to_line(measurement: &str, record: &Record) -> StoreResult<String> {
    let tags: Vec<String> = [
        ("id", &record.id),
        ("name", &record.name),
        ("parameter1", &record.parameter1),
        ("parameter2", &record.parameter2),
    ]
    .iter()
    .filter(|(_, value)| !value.is_empty())
    .map(|(key, value)| format!("{key}={}", escape_tag(value)))
    .collect();

    let mut fields = vec![
        format!("parameter3={}", quote_field(&record.parameter3)),
        format!("created={}i", record.created),
        format!("updated={}i", record.updated),
    ];
    if let Some((lat, lng)) = record.coordinates() {
        fields.push(format!("lat={lat}"));
        fields.push(format!("lng={lng}"));
    }
    fields.push(format!(
        "metadata={}",
        quote_field(&serde_json::to_string(&record.metadata)?)
    ));
    if let Some(payload) = &record.payload {
        fields.push(format!(
            "payload={}",
            quote_field(&serde_json::to_string(payload)?)
        ));
    }

    let mut series = escape_measurement(measurement);
    for tag in tags {
        series.push(',');
        series.push_str(&tag);
    }
    Ok(format!("{series} {} {}", fields.join(","), record.created))
}

// =============================================================================
// InfluxQL Builders
// =============================================================================

/// Quote an identifier.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Quote a string literal.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Escape a value for use inside a `/.../` regex literal.
fn regex_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\.+*?()|[]{}^$/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn build_read(measurement: &str, id: &str) -> String {
    format!(
        "SELECT * FROM {} WHERE \"id\" = {} ORDER BY time DESC LIMIT 1",
        ident(measurement),
        literal(id)
    )
}

fn build_drop_series(measurement: &str, id: &str) -> String {
    format!(
        "DROP SERIES FROM {} WHERE \"id\" = {}",
        ident(measurement),
        literal(id)
    )
}

/// Search statement; the `to` sentinel is clamped to the storable range.
fn build_search(measurement: &str, query: &SearchQuery) -> String {
    let mut conditions = vec![
        format!("time >= {}s", query.from.clamp(0, TIME_MAX_SECS)),
        format!("time <= {}s", query.to.clamp(0, TIME_MAX_SECS)),
    ];

    let fields = field_matches(query);
    if fields.is_empty() {
        for (key, value) in metadata_pairs(query) {
            let fragment = format!(
                "{}:{}",
                Value::String(key).to_string(),
                Value::String(value).to_string()
            );
            conditions.push(format!("\"metadata\" =~ /{}/", regex_escape(&fragment)));
        }
    } else {
        for m in fields {
            let column = m.field.column();
            if m.field.is_text() {
                conditions.push(format!(
                    "{} =~ /(?i){}/",
                    ident(column),
                    regex_escape(&m.value)
                ));
            } else {
                conditions.push(format!("{} = {}", ident(column), literal(&m.value)));
            }
        }
    }

    let direction = if query.reverse { "DESC" } else { "ASC" };
    format!(
        "SELECT * FROM {} WHERE {} ORDER BY time {direction} LIMIT {} OFFSET {}",
        ident(measurement),
        conditions.join(" AND "),
        query.limit,
        query.offset
    )
}

// =============================================================================
// Result Parsing
// =============================================================================

fn column_str(row: &HashMap<&str, &Value>, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn column_i64(row: &HashMap<&str, &Value>, key: &str) -> i64 {
    row.get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or_default()
}

fn column_f64(row: &HashMap<&str, &Value>, key: &str) -> Option<f64> {
    row.get(key).and_then(|v| v.as_f64())
}

/// Records from every series of every statement in a `/query` response.
fn parse_results(body: &Value) -> StoreResult<Vec<Record>> {
    let mut records = Vec::new();
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return Ok(records);
    };

    for result in results {
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            return Err(StoreError::backend(format!("influxql error: {error}")));
        }
        let Some(series) = result.get("series").and_then(Value::as_array) else {
            continue;
        };
        for serie in series {
            let columns: Vec<&str> = serie
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| cols.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let Some(values) = serie.get("values").and_then(Value::as_array) else {
                continue;
            };
            for value in values {
                let Some(cells) = value.as_array() else {
                    continue;
                };
                let row: HashMap<&str, &Value> =
                    columns.iter().copied().zip(cells.iter()).collect();
                records.push(row_to_record(&row)?);
            }
        }
    }
    Ok(records)
}

fn row_to_record(row: &HashMap<&str, &Value>) -> StoreResult<Record> {
    let metadata_text = column_str(row, "metadata");
    let metadata = if metadata_text.is_empty() {
        HashMap::new()
    } else {
        serde_json::from_str(&metadata_text)?
    };
    let payload_text = column_str(row, "payload");
    let payload = if payload_text.is_empty() {
        None
    } else {
        Some(serde_json::from_str(&payload_text)?)
    };

    Ok(Record {
        id: column_str(row, "id"),
        created: column_i64(row, "created"),
        updated: column_i64(row, "updated"),
        name: column_str(row, "name"),
        parameter1: column_str(row, "parameter1"),
        parameter2: column_str(row, "parameter2"),
        parameter3: column_str(row, "parameter3"),
        lat: column_f64(row, "lat"),
        lng: column_f64(row, "lng"),
        metadata,
        payload,
    })
}

// =============================================================================
// InfluxConnection
// =============================================================================

#[derive(Debug, Clone)]
struct Target {
    database: String,
    measurement: String,
}

/// Connection to one InfluxDB server.
pub struct InfluxConnection {
    endpoint: Guarded<HttpEndpoint>,
    target: Option<Target>,
}

impl InfluxConnection {
    fn target(&self) -> StoreResult<&Target> {
        self.target
            .as_ref()
            .ok_or_else(|| StoreError::backend("connection not initialised"))
    }

    /// Run InfluxQL, optionally against a database.
    async fn query(
        endpoint: &HttpEndpoint,
        database: Option<&str>,
        statement: &str,
    ) -> StoreResult<Vec<Record>> {
        let url = endpoint.url(&["query"])?;
        let mut form = vec![("q", statement), ("epoch", "s")];
        if let Some(database) = database {
            form.push(("db", database));
        }
        let reply = endpoint
            .send(endpoint.request(Method::POST, url).form(&form))
            .await?;
        if !reply.status.is_success() {
            let message = reply
                .body
                .get("error")
                .and_then(Value::as_str)
                .map_or_else(|| reply.status.to_string(), str::to_string);
            return Err(StoreError::backend(format!("influxdb query failed: {message}")));
        }
        parse_results(&reply.body)
    }

    async fn write(endpoint: &HttpEndpoint, database: &str, line: String) -> StoreResult<()> {
        let mut url = endpoint.url(&["write"])?;
        url.query_pairs_mut()
            .append_pair("db", database)
            .append_pair("precision", "s");
        let reply = endpoint
            .send(endpoint.request(Method::POST, url).body(line))
            .await?;
        if !reply.status.is_success() {
            return Err(StoreError::backend(format!(
                "influxdb write failed: {}",
                reply.body
            )));
        }
        Ok(())
    }

    async fn find(endpoint: &HttpEndpoint, target: &Target, id: &str) -> StoreResult<Option<Record>> {
        let records = Self::query(
            endpoint,
            Some(&target.database),
            &build_read(&target.measurement, id),
        )
        .await?;
        Ok(records.into_iter().next())
    }
}

#[async_trait]
impl Connection for InfluxConnection {
    async fn init(&mut self, database: &Database) -> StoreResult<()> {
        validate_identifier("database", &database.name)?;
        validate_identifier("table", &database.table)?;
        {
            let endpoint = self.endpoint.write().await?;
            let statement = format!("CREATE DATABASE {}", ident(&database.name));
            Self::query(&endpoint, None, &statement).await?;
        }
        self.target = Some(Target {
            database: database.name.clone(),
            measurement: database.table.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.endpoint.take().await;
        Ok(())
    }

    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let endpoint = self.endpoint.read().await?;
        match Self::find(&endpoint, self.target()?, id).await? {
            Some(record) if record.matches_secondary(secondary_key) => Ok(record),
            _ => Err(StoreError::not_found(format!("record {id}"))),
        }
    }

    async fn create(&self, record: &Record) -> StoreResult<()> {
        let endpoint = self.endpoint.write().await?;
        let target = self.target()?;

        let mut record = record.clone();
        if let Some(existing) = Self::find(&endpoint, target, &record.id).await? {
            if record.created <= 0 {
                record.created = existing.created;
            }
            Self::query(
                &endpoint,
                Some(&target.database),
                &build_drop_series(&target.measurement, &record.id),
            )
            .await?;
        }
        record.stamp_created(now_unix());

        let line = to_line(&target.measurement, &record)?;
        Self::write(&endpoint, &target.database, line).await
    }

    async fn update(&self, record: &Record) -> StoreResult<()> {
        // Points are immutable
        tracing::debug!(id = %record.id, "Influxdb update is a no-op");
        Ok(())
    }

    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()> {
        let endpoint = self.endpoint.write().await?;
        let target = self.target()?;

        match Self::find(&endpoint, target, id).await? {
            Some(record) if record.matches_secondary(secondary_key) => {}
            _ => return Err(StoreError::not_found(format!("record {id}"))),
        }

        Self::query(
            &endpoint,
            Some(&target.database),
            &build_drop_series(&target.measurement, id),
        )
        .await?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let endpoint = self.endpoint.read().await?;
        let target = self.target()?;
        Self::query(
            &endpoint,
            Some(&target.database),
            &build_search(&target.measurement, query),
        )
        .await
    }

    async fn run_query(&self, query: &str) -> StoreResult<Vec<Record>> {
        let endpoint = self.endpoint.read().await?;
        let target = self.target()?;
        Self::query(&endpoint, Some(&target.database), query).await
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let endpoint = self.endpoint.write().await?;
        Self::query(&endpoint, None, &format!("CREATE DATABASE {}", ident(name))).await?;
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let endpoint = self.endpoint.write().await?;
        Self::query(&endpoint, None, &format!("DROP DATABASE {}", ident(name))).await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
