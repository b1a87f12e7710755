//! ElasticDriver - Search-engine storage over the Elasticsearch HTTP API
//!
//! TigerStyle: One index per table, query bodies built as pure functions.
//!
//! # Index Layout
//!
//! ```text
//! index:     "<database>-<table>" (lowercased)
//! document:  Record JSON + "location": { "lat", "lon" } when geo-located
//! ```
//!
//! Search modes:
//! - normal: `query_string` of `field:"value"` clauses ANDed in rank order,
//!   then metadata keys; `created` range filter; optional `geo_distance`;
//!   sorted by `created`
//! - autocomplete (`autocomplete = "true"` descriptor flag): `match_all`
//!   with `should` clauses on `name`, sorted by score only
//!
//! Writes use `refresh=true` so a mirrored record is searchable as soon as
//! the write returns.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::predicate::{field_matches, metadata_pairs, Predicate};
use super::{http_client, validate_identifier, Connection, Driver, Guarded, HttpEndpoint, HttpReply};
use crate::error::{StoreError, StoreResult};
use crate::record::{now_unix, Database, Record, SearchQuery, FILTER_NAME};
use crate::registry::Node;

/// Driver name of the search-engine backend
pub const DRIVER_ELASTICSEARCH: &str = "elasticsearch";

/// Field carrying the geo point
const FIELD_LOCATION: &str = "location";

/// Error type for a missing index
const INDEX_NOT_FOUND: &str = "index_not_found_exception";

/// Error type for an index created concurrently
const INDEX_EXISTS: &str = "resource_already_exists_exception";

// =============================================================================
// ElasticDriver
// =============================================================================

/// Driver for Elasticsearch clusters.
#[derive(Debug, Clone)]
pub struct ElasticDriver {
    client: reqwest::Client,
}

impl ElasticDriver {
    /// Create the driver with a per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl Driver for ElasticDriver {
    fn name(&self) -> &str {
        DRIVER_ELASTICSEARCH
    }

    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>> {
        for node in nodes {
            let endpoint = match HttpEndpoint::new(self.client.clone(), node) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Invalid elasticsearch address");
                    continue;
                }
            };
            let handshake = match endpoint.url(&[]) {
                Ok(url) => endpoint.send(endpoint.request(Method::GET, url)).await,
                Err(e) => Err(e),
            };
            match handshake {
                Ok(reply) if reply.status.is_success() => {
                    tracing::debug!(node = %node.id, "Connected to elasticsearch");
                    return Ok(Box::new(ElasticConnection {
                        endpoint: Guarded::new(endpoint),
                        target: None,
                    }));
                }
                Ok(reply) => {
                    tracing::warn!(node = %node.id, status = %reply.status, "Elasticsearch handshake rejected");
                }
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Elasticsearch handshake failed");
                }
            }
        }
        Err(StoreError::not_available(format!(
            "no reachable elasticsearch node among {} candidates",
            nodes.len()
        )))
    }
}

// =============================================================================
// Reply Helpers
// =============================================================================

/// `error.type` of an Elasticsearch error body.
fn error_type(reply: &HttpReply) -> Option<&str> {
    reply.body.get("error")?.get("type")?.as_str()
}

fn check(reply: HttpReply, context: &str) -> StoreResult<Value> {
    if reply.status.is_success() {
        return Ok(reply.body);
    }
    if reply.status == StatusCode::NOT_FOUND {
        return Err(StoreError::not_found(context.to_string()));
    }
    let reason = reply
        .body
        .get("error")
        .and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
        .map_or_else(|| reply.status.to_string(), str::to_string);
    Err(StoreError::backend(format!("{context}: {reason}")))
}

// =============================================================================
// Query Builders
// =============================================================================

/// Index name for a descriptor.
fn index_name(database: &str, table: &str) -> String {
    format!("{database}-{table}").to_lowercase()
}

/// Index settings with explicit mappings for the reserved fields.
fn index_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "created": { "type": "long" },
                "updated": { "type": "long" },
                "name": {
                    "type": "text",
                    "fields": { "keyword": { "type": "keyword" } }
                },
                "parameter1": { "type": "keyword" },
                "parameter2": { "type": "keyword" },
                "parameter3": { "type": "keyword" },
                "lat": { "type": "double" },
                "lng": { "type": "double" },
                FIELD_LOCATION: { "type": "geo_point" },
                "metadata": { "type": "object" },
                "payload": { "type": "object", "enabled": false }
            }
        }
    })
}

/// Stored form of a record.
fn document(record: &Record) -> StoreResult<Value> {
    let mut doc = serde_json::to_value(record)?;
    if let (Some((lat, lng)), Some(object)) = (record.coordinates(), doc.as_object_mut()) {
        object.insert(FIELD_LOCATION.to_string(), json!({ "lat": lat, "lon": lng }));
    }
    Ok(doc)
}

/// Quote a value for a `query_string` phrase.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `field:"value"` clauses in rank order, then metadata keys.
fn query_string_clauses(query: &SearchQuery) -> Vec<String> {
    let mut clauses: Vec<String> = field_matches(query)
        .into_iter()
        .map(|m| format!("{}:{}", m.field.column(), quote(&m.value)))
        .collect();
    clauses.extend(
        metadata_pairs(query)
            .into_iter()
            .map(|(key, value)| format!("metadata.{key}:{}", quote(&value))),
    );
    clauses
}

fn range_filter(query: &SearchQuery) -> Value {
    json!({ "range": { "created": { "gte": query.from, "lte": query.to } } })
}

/// Search body for normal or autocomplete mode.
fn build_search(query: &SearchQuery, autocomplete: bool) -> Value {
    let mut filter = vec![range_filter(query)];

    if autocomplete {
        let should: Vec<Value> = query
            .get(FILTER_NAME)
            .map(|name| {
                vec![
                    json!({ "match_phrase_prefix": { "name": { "query": name } } }),
                    json!({ "match": { "name": { "query": name, "fuzziness": "AUTO" } } }),
                ]
            })
            .unwrap_or_default();
        return json!({
            "from": query.offset,
            "size": query.limit,
            "query": {
                "bool": {
                    "must": [{ "match_all": {} }],
                    "should": should,
                    "filter": filter,
                }
            },
            "sort": ["_score"],
        });
    }

    if let Some(Predicate::Geo {
        lat,
        lng,
        distance_km,
    }) = Predicate::geo(query)
    {
        filter.push(json!({
            "geo_distance": {
                "distance": format!("{distance_km}km"),
                FIELD_LOCATION: { "lat": lat, "lon": lng }
            }
        }));
    }

    let clauses = query_string_clauses(query);
    let must: Vec<Value> = if clauses.is_empty() {
        vec![json!({ "match_all": {} })]
    } else {
        vec![json!({
            "query_string": {
                "query": clauses.join(" AND "),
                "default_operator": "AND",
            }
        })]
    };

    let order = if query.reverse { "desc" } else { "asc" };
    json!({
        "from": query.offset,
        "size": query.limit,
        "query": { "bool": { "must": must, "filter": filter } },
        "sort": [{ "created": { "order": order } }],
    })
}

/// Raw query: a JSON search body, or else a `query_string` expression.
fn raw_search_body(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(body @ Value::Object(_)) => body,
        _ => json!({ "query": { "query_string": { "query": raw } } }),
    }
}

/// `_source` of every hit.
fn decode_hits(body: &Value) -> StoreResult<Vec<Record>> {
    let Some(hits) = body
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };
    hits.iter()
        .filter_map(|hit| hit.get("_source"))
        .map(|source| serde_json::from_value(source.clone()).map_err(StoreError::from))
        .collect()
}

// =============================================================================
// ElasticConnection
// =============================================================================

#[derive(Debug, Clone)]
struct Target {
    index: String,
    autocomplete: bool,
}

/// Connection to one Elasticsearch node.
pub struct ElasticConnection {
    endpoint: Guarded<HttpEndpoint>,
    target: Option<Target>,
}

impl ElasticConnection {
    fn target(&self) -> StoreResult<&Target> {
        self.target
            .as_ref()
            .ok_or_else(|| StoreError::backend("connection not initialised"))
    }

    async fn fetch(endpoint: &HttpEndpoint, index: &str, id: &str) -> StoreResult<Record> {
        let url = endpoint.url(&[index, "_doc", id])?;
        let body = check(
            endpoint.send(endpoint.request(Method::GET, url)).await?,
            &format!("record {id}"),
        )?;
        match body.get("_source") {
            Some(source) => Ok(serde_json::from_value(source.clone())?),
            None => Err(StoreError::not_found(format!("record {id}"))),
        }
    }

    async fn put(endpoint: &HttpEndpoint, index: &str, record: &Record) -> StoreResult<()> {
        let mut url = endpoint.url(&[index, "_doc", record.id.as_str()])?;
        url.query_pairs_mut().append_pair("refresh", "true");
        check(
            endpoint
                .send(endpoint.request(Method::PUT, url).json(&document(record)?))
                .await?,
            "failed to index record",
        )?;
        Ok(())
    }
}

#[async_trait]
impl Connection for ElasticConnection {
    async fn init(&mut self, database: &Database) -> StoreResult<()> {
        validate_identifier("database", &database.name)?;
        validate_identifier("table", &database.table)?;
        let index = index_name(&database.name, &database.table);
        {
            let endpoint = self.endpoint.write().await?;
            let url = endpoint.url(&[index.as_str()])?;
            let reply = endpoint
                .send(endpoint.request(Method::PUT, url).json(&index_mappings()))
                .await?;
            if error_type(&reply) != Some(INDEX_EXISTS) {
                check(reply, "failed to create index")?;
            }
        }

        tracing::debug!(index = %index, "Elasticsearch target ready");
        self.target = Some(Target {
            index,
            autocomplete: database.is_autocomplete(),
        });
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.endpoint.take().await;
        Ok(())
    }

    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let endpoint = self.endpoint.read().await?;
        let record = Self::fetch(&endpoint, &self.target()?.index, id).await?;
        if !record.matches_secondary(secondary_key) {
            return Err(StoreError::not_found(format!("record {id}")));
        }
        Ok(record)
    }

    async fn create(&self, record: &Record) -> StoreResult<()> {
        let endpoint = self.endpoint.write().await?;
        let index = &self.target()?.index;

        let mut record = record.clone();
        match Self::fetch(&endpoint, index, &record.id).await {
            Ok(existing) => record.created = existing.created,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        record.stamp_created(now_unix());

        Self::put(&endpoint, index, &record).await
    }

    async fn update(&self, record: &Record) -> StoreResult<()> {
        let endpoint = self.endpoint.write().await?;
        let index = &self.target()?.index;

        let existing = Self::fetch(&endpoint, index, &record.id).await?;
        let mut record = record.clone();
        record.created = existing.created;
        record.updated = record.updated.max(existing.updated);
        record.touch(now_unix())?;

        Self::put(&endpoint, index, &record).await
    }

    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()> {
        let endpoint = self.endpoint.write().await?;
        let index = &self.target()?.index;

        if !secondary_key.is_empty() {
            let existing = Self::fetch(&endpoint, index, id).await?;
            if !existing.matches_secondary(secondary_key) {
                return Err(StoreError::not_found(format!("record {id}")));
            }
        }

        let mut url = endpoint.url(&[index.as_str(), "_doc", id])?;
        url.query_pairs_mut().append_pair("refresh", "true");
        check(
            endpoint.send(endpoint.request(Method::DELETE, url)).await?,
            &format!("record {id}"),
        )?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let endpoint = self.endpoint.read().await?;
        let target = self.target()?;
        let body = build_search(query, target.autocomplete);

        let url = endpoint.url(&[target.index.as_str(), "_search"])?;
        let reply = endpoint
            .send(endpoint.request(Method::POST, url).json(&body))
            .await?;
        if error_type(&reply) == Some(INDEX_NOT_FOUND) {
            return Ok(Vec::new());
        }
        decode_hits(&check(reply, "failed to search")?)
    }

    async fn run_query(&self, query: &str) -> StoreResult<Vec<Record>> {
        let endpoint = self.endpoint.read().await?;
        let target = self.target()?;

        let url = endpoint.url(&[target.index.as_str(), "_search"])?;
        let reply = endpoint
            .send(endpoint.request(Method::POST, url).json(&raw_search_body(query)))
            .await?;
        if error_type(&reply) == Some(INDEX_NOT_FOUND) {
            return Ok(Vec::new());
        }
        decode_hits(&check(reply, "failed to run query")?)
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        // Indices are created per table by init
        validate_identifier("database", name)
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let endpoint = self.endpoint.write().await?;

        let pattern = format!("{}-*", name.to_lowercase());
        let mut url = endpoint.url(&["_cat", "indices", pattern.as_str()])?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("h", "index");
        let listing = check(
            endpoint.send(endpoint.request(Method::GET, url)).await?,
            "failed to list indices",
        )?;

        let indices: Vec<String> = listing
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("index").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let endpoint = &*endpoint;
        let deletes = indices.iter().map(|index| async move {
            let url = endpoint.url(&[index.as_str()])?;
            match check(
                endpoint.send(endpoint.request(Method::DELETE, url)).await?,
                "failed to delete index",
            ) {
                Err(e) if !e.is_not_found() => Err(e),
                _ => Ok::<(), StoreError>(()),
            }
        });
        futures::future::try_join_all(deletes).await?;

        tracing::info!(database = %name, indices = indices.len(), "Deleted search indices");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn query(pairs: &[(&str, &str)], reverse: bool) -> SearchQuery {
        let filter: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SearchQuery::new(filter, 10, 20, 5, 1, reverse)
    }

    #[test]
    fn test_index_name_lowercased() {
        assert_eq!(index_name("TestDB", "Goals"), "testdb-goals");
    }

    #[test]
    fn test_document_location() {
        let record = Record::builder().id("1").location(51.5, -0.12).build();
        let doc = document(&record).unwrap();
        assert_eq!(doc["location"]["lat"], 51.5);
        assert_eq!(doc["location"]["lon"], -0.12);

        let decoded: Record = serde_json::from_value(doc).unwrap();
        assert_eq!(decoded, record);

        let doc = document(&Record::builder().id("2").build()).unwrap();
        assert!(doc.get("location").is_none());
    }

    #[test]
    fn test_query_string_rank_then_metadata() {
        let q = query(
            &[("name", "morning run"), ("color", "blue"), ("parameter2", "owner")],
            false,
        );
        assert_eq!(
            query_string_clauses(&q),
            vec![
                "parameter2:\"owner\"".to_string(),
                "name:\"morning run\"".to_string(),
                "metadata.color:\"blue\"".to_string(),
            ]
        );
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn test_build_search_normal() {
        let body = build_search(&query(&[("parameter1", "org")], true), false);
        assert_eq!(body["from"], 1);
        assert_eq!(body["size"], 5);
        assert_eq!(body["sort"][0]["created"]["order"], "desc");
        assert_eq!(
            body["query"]["bool"]["must"][0]["query_string"]["query"],
            "parameter1:\"org\""
        );
        let range = &body["query"]["bool"]["filter"][0]["range"]["created"];
        assert_eq!(range["gte"], 10);
        assert_eq!(range["lte"], 20);
    }

    #[test]
    fn test_build_search_match_all_and_geo() {
        let body = build_search(
            &query(&[("distance", "2"), ("lat", "1.5"), ("lng", "2.5")], false),
            false,
        );
        assert!(body["query"]["bool"]["must"][0].get("match_all").is_some());
        let geo = &body["query"]["bool"]["filter"][1]["geo_distance"];
        assert_eq!(geo["distance"], "2km");
        assert_eq!(geo["location"]["lon"], 2.5);
    }

    #[test]
    fn test_build_search_autocomplete() {
        let body = build_search(&query(&[("name", "mor")], false), true);
        assert_eq!(body["sort"], json!(["_score"]));
        assert!(body["query"]["bool"]["must"][0].get("match_all").is_some());
        assert_eq!(
            body["query"]["bool"]["should"][0]["match_phrase_prefix"]["name"]["query"],
            "mor"
        );

        let body = build_search(&query(&[], false), true);
        assert_eq!(body["query"]["bool"]["should"], json!([]));
    }

    #[test]
    fn test_raw_search_body() {
        let body = raw_search_body(r#"{"query":{"match_all":{}}}"#);
        assert!(body["query"].get("match_all").is_some());

        let body = raw_search_body("name:run");
        assert_eq!(body["query"]["query_string"]["query"], "name:run");
    }

    #[test]
    fn test_decode_hits_and_missing_index() {
        let body = json!({"hits": {"hits": [{"_source": {"id": "1", "name": "a"}}]}});
        let records = decode_hits(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "1");

        let reply = HttpReply {
            status: StatusCode::NOT_FOUND,
            body: json!({"error": {"type": "index_not_found_exception"}}),
        };
        assert_eq!(error_type(&reply), Some(INDEX_NOT_FOUND));
        assert!(check(reply, "search").unwrap_err().is_not_found());
    }

    // -------------------------------------------------------------------------
    // Live tests (require running Elasticsearch)
    // -------------------------------------------------------------------------

    macro_rules! require_env {
        ($var:literal) => {
            match std::env::var($var).ok() {
                Some(value) => value,
                None => {
                    eprintln!("Skipping test: {} not set", $var);
                    return;
                }
            }
        };
    }

    #[tokio::test]
    async fn test_elasticsearch_crud_and_search() {
        let url = require_env!("TEST_ELASTIC_URL");
        let driver = ElasticDriver::new(Duration::from_secs(10));
        let mut conn = driver
            .connect(&[Node::new("es", DRIVER_ELASTICSEARCH, url)])
            .await
            .unwrap();
        conn.init(&Database::new("test_es_db", "goals")).await.unwrap();

        let record = Record::builder().id("111").name("morning run").parameter1("org").build();
        conn.create(&record).await.unwrap();

        let found = conn.search(&query(&[("parameter1", "org")], false)).await;
        assert!(found.is_ok());

        conn.delete("111", "").await.unwrap();
        assert!(conn.read("111", "").await.unwrap_err().is_not_found());
        conn.delete_database("test_es_db").await.unwrap();
        conn.close().await.unwrap();
    }
}
