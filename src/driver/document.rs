//! ArangoDriver - Document and graph storage over the ArangoDB HTTP API
//!
//! TigerStyle: Pure query builders, thin transport, explicit duplicates.
//!
//! # Modes
//!
//! ```text
//! plain:  <database>/<table>            documents keyed by _key = id
//! graph:  <from> ──[<table> edges]──▶ <to>
//!         edge _from = "<from>/<name>", _to = "<to>/<parameter1>"
//! ```
//!
//! Graph mode is selected by the `graph = "true"` descriptor flag. The
//! vertex collections default to `<table>_from` and `<table>_to`.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::predicate::Predicate;
use super::{http_client, validate_identifier, Connection, Driver, Guarded, HttpEndpoint};
use crate::error::{StoreError, StoreResult};
use crate::record::{now_unix, Database, Record, SearchQuery, FILTER_NAME, FILTER_PARAMETER1};
use crate::registry::Node;

/// Driver name of the document/graph backend
pub const DRIVER_ARANGODB: &str = "arangodb";

/// Documents fetched per cursor round trip
const CURSOR_BATCH_SIZE: usize = 1000;

/// Upper bound on cursor continuation requests
const CURSOR_BATCHES_MAX: usize = 10_000;

/// Arango error numbers meaning "already exists"
const ERROR_DUPLICATE_NAME: i64 = 1207;
const ERROR_UNIQUE_CONSTRAINT: i64 = 1210;
const ERROR_GRAPH_DUPLICATE: i64 = 1925;

/// Arango collection types
const COLLECTION_DOCUMENT: u8 = 2;
const COLLECTION_EDGE: u8 = 3;

// =============================================================================
// ArangoDriver
// =============================================================================

/// Driver for ArangoDB coordinators.
#[derive(Debug, Clone)]
pub struct ArangoDriver {
    client: reqwest::Client,
}

impl ArangoDriver {
    /// Create the driver with a per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl Driver for ArangoDriver {
    fn name(&self) -> &str {
        DRIVER_ARANGODB
    }

    async fn connect(&self, nodes: &[Node]) -> StoreResult<Box<dyn Connection>> {
        for node in nodes {
            let http = match HttpEndpoint::new(self.client.clone(), node) {
                Ok(endpoint) => ArangoHttp { endpoint },
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Invalid arangodb address");
                    continue;
                }
            };
            match http.handshake().await {
                Ok(()) => {
                    tracing::debug!(node = %node.id, "Connected to arangodb");
                    return Ok(Box::new(ArangoConnection {
                        http: Guarded::new(http),
                        target: None,
                    }));
                }
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "Arangodb handshake failed");
                }
            }
        }
        Err(StoreError::not_available(format!(
            "no reachable arangodb node among {} candidates",
            nodes.len()
        )))
    }
}

// =============================================================================
// Transport
// =============================================================================

/// HTTP handle for one coordinator.
#[derive(Debug, Clone)]
struct ArangoHttp {
    endpoint: HttpEndpoint,
}

/// Status plus parsed body of one response.
#[derive(Debug)]
struct ArangoReply {
    status: StatusCode,
    body: Value,
}

impl ArangoReply {
    fn error_num(&self) -> i64 {
        self.body
            .get("errorNum")
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }

    fn is_duplicate(&self) -> bool {
        self.status == StatusCode::CONFLICT
            || matches!(
                self.error_num(),
                ERROR_DUPLICATE_NAME | ERROR_UNIQUE_CONSTRAINT | ERROR_GRAPH_DUPLICATE
            )
    }

    fn message(&self) -> String {
        self.body
            .get("errorMessage")
            .and_then(Value::as_str)
            .map_or_else(|| self.status.to_string(), str::to_string)
    }

    /// Body on success; NotFound on 404; Backend otherwise.
    fn into_result(self, context: &str) -> StoreResult<Value> {
        if self.status.is_success() {
            return Ok(self.body);
        }
        if self.status == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found(format!("{context}: {}", self.message())));
        }
        Err(StoreError::backend(format!(
            "{context}: {} (errorNum {})",
            self.message(),
            self.error_num()
        )))
    }

    /// Like `into_result`, treating "already exists" as success.
    fn allow_duplicate(self, context: &str) -> StoreResult<()> {
        if self.is_duplicate() {
            return Ok(());
        }
        self.into_result(context).map(|_| ())
    }
}

impl ArangoHttp {
    fn url(&self, segments: &[&str]) -> StoreResult<Url> {
        self.endpoint.url(segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.endpoint.request(method, url)
    }

    async fn send(&self, request: RequestBuilder) -> StoreResult<ArangoReply> {
        let reply = self.endpoint.send(request).await?;
        Ok(ArangoReply {
            status: reply.status,
            body: reply.body,
        })
    }

    async fn handshake(&self) -> StoreResult<()> {
        let url = self.url(&["_api", "version"])?;
        self.send(self.request(Method::GET, url))
            .await?
            .into_result("arangodb version")
            .map(|_| ())
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        let url = self.url(&["_api", "database"])?;
        self.send(self.request(Method::POST, url).json(&json!({ "name": name })))
            .await?
            .allow_duplicate("failed to create database")
    }

    async fn create_collection(&self, database: &str, name: &str, kind: u8) -> StoreResult<()> {
        let url = self.url(&["_db", database, "_api", "collection"])?;
        self.send(
            self.request(Method::POST, url)
                .json(&json!({ "name": name, "type": kind })),
        )
        .await?
        .allow_duplicate("failed to create collection")
    }

    async fn create_created_index(&self, database: &str, collection: &str) -> StoreResult<()> {
        let mut url = self.url(&["_db", database, "_api", "index"])?;
        url.query_pairs_mut().append_pair("collection", collection);
        self.send(
            self.request(Method::POST, url)
                .json(&json!({ "type": "persistent", "fields": ["created"] })),
        )
        .await?
        .allow_duplicate("failed to create index")
    }

    async fn create_graph(&self, database: &str, graph: &GraphTarget, edges: &str) -> StoreResult<()> {
        let url = self.url(&["_db", database, "_api", "gharial"])?;
        let body = json!({
            "name": graph.name,
            "edgeDefinitions": [{
                "collection": edges,
                "from": [graph.from],
                "to": [graph.to],
            }],
        });
        self.send(self.request(Method::POST, url).json(&body))
            .await?
            .allow_duplicate("failed to create graph")
    }

    async fn get_document(&self, database: &str, collection: &str, key: &str) -> StoreResult<Value> {
        let url = self.url(&["_db", database, "_api", "document", collection, key])?;
        self.send(self.request(Method::GET, url))
            .await?
            .into_result(&format!("record {key}"))
    }

    async fn replace_document(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        doc: &Value,
    ) -> StoreResult<()> {
        let url = self.url(&["_db", database, "_api", "document", collection, key])?;
        self.send(self.request(Method::PUT, url).json(doc))
            .await?
            .into_result(&format!("record {key}"))
            .map(|_| ())
    }

    async fn delete_document(&self, database: &str, collection: &str, key: &str) -> StoreResult<()> {
        let url = self.url(&["_db", database, "_api", "document", collection, key])?;
        self.send(self.request(Method::DELETE, url))
            .await?
            .into_result(&format!("record {key}"))
            .map(|_| ())
    }

    /// Insert a bare vertex unless one with the same key exists.
    async fn ensure_vertex(&self, database: &str, collection: &str, key: &str) -> StoreResult<()> {
        let mut url = self.url(&["_db", database, "_api", "document", collection])?;
        url.query_pairs_mut().append_pair("overwriteMode", "ignore");
        self.send(self.request(Method::POST, url).json(&json!({ "_key": key })))
            .await?
            .allow_duplicate("failed to ensure vertex")
    }

    /// Run AQL and drain the cursor.
    async fn cursor(&self, database: &str, aql: &Aql) -> StoreResult<Vec<Value>> {
        let url = self.url(&["_db", database, "_api", "cursor"])?;
        let body = json!({
            "query": aql.query,
            "bindVars": aql.bind_vars,
            "batchSize": CURSOR_BATCH_SIZE,
        });
        let mut reply = self
            .send(self.request(Method::POST, url).json(&body))
            .await?
            .into_result("failed to run query")?;

        let mut results = take_results(&mut reply);
        for _ in 0..CURSOR_BATCHES_MAX {
            if reply.get("hasMore").and_then(Value::as_bool) != Some(true) {
                return Ok(results);
            }
            let Some(id) = reply.get("id").and_then(Value::as_str).map(str::to_string) else {
                return Err(StoreError::backend("cursor has more results but no id"));
            };
            let url = self.url(&["_db", database, "_api", "cursor", id.as_str()])?;
            reply = self
                .send(self.request(Method::PUT, url))
                .await?
                .into_result("failed to continue cursor")?;
            results.extend(take_results(&mut reply));
        }
        Err(StoreError::backend("cursor exceeded maximum batch count"))
    }
}

fn take_results(reply: &mut Value) -> Vec<Value> {
    match reply.get_mut("result").map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

// =============================================================================
// Target
// =============================================================================

/// Collection addressed by an initialised connection.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    database: String,
    collection: String,
    graph: Option<GraphTarget>,
}

/// Graph definition around an edge collection.
#[derive(Debug, Clone, PartialEq)]
struct GraphTarget {
    name: String,
    from: String,
    to: String,
}

impl GraphTarget {
    /// Endpoint vertex keys of an edge: `name` on the from side, `parameter1` on the to side.
    fn vertex_keys<'r>(&self, record: &'r Record) -> StoreResult<(&'r str, &'r str)> {
        if record.name.is_empty() || record.parameter1.is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "edge {} in graph {} needs name and parameter1 as vertex keys",
                record.id, self.name
            )));
        }
        Ok((&record.name, &record.parameter1))
    }
}

impl Target {
    fn from_database(database: &Database) -> StoreResult<Self> {
        validate_identifier("database", &database.name)?;
        validate_identifier("table", &database.table)?;

        let graph = if database.is_graph() {
            let (from, to) = database.graph_endpoints();
            validate_identifier("graph_from", &from)?;
            validate_identifier("graph_to", &to)?;
            Some(GraphTarget {
                name: format!("{}_graph", database.table),
                from,
                to,
            })
        } else {
            None
        };

        Ok(Self {
            database: database.name.clone(),
            collection: database.table.clone(),
            graph,
        })
    }

    /// Stored form of a record.
    fn document(&self, record: &Record) -> StoreResult<Value> {
        let mut doc = serde_json::to_value(record)?;
        let Some(object) = doc.as_object_mut() else {
            return Err(StoreError::backend("record did not serialize to an object"));
        };
        object.insert("_key".to_string(), Value::String(record.id.clone()));
        if let Some(graph) = &self.graph {
            object.insert(
                "_from".to_string(),
                Value::String(format!("{}/{}", graph.from, record.name)),
            );
            object.insert(
                "_to".to_string(),
                Value::String(format!("{}/{}", graph.to, record.parameter1)),
            );
        }
        Ok(doc)
    }
}

// =============================================================================
// AQL Builders
// =============================================================================

/// AQL text plus bind variables.
#[derive(Debug, Clone, Default, PartialEq)]
struct Aql {
    query: String,
    bind_vars: Map<String, Value>,
}

impl Aql {
    fn bind(&mut self, name: &str, value: impl Into<Value>) {
        self.bind_vars.insert(name.to_string(), value.into());
    }
}

/// Upsert keeping the stored `created` on conflict.
fn build_upsert(collection: &str, doc: Value, key: &str) -> Aql {
    let mut aql = Aql {
        query: "UPSERT { _key: @key } INSERT @doc \
                REPLACE MERGE(@doc, { created: OLD.created }) IN @@collection"
            .to_string(),
        ..Aql::default()
    };
    aql.bind("key", key);
    aql.bind("doc", doc);
    aql.bind("@collection", collection);
    aql
}

/// Search statement for the target, graph traversal when applicable.
fn build_search(target: &Target, query: &SearchQuery) -> Aql {
    let mut aql = Aql::default();
    let mut clauses: Vec<String> = Vec::new();

    let traversal = target.graph.as_ref().and_then(|graph| {
        let name = query.get(FILTER_NAME);
        let parameter1 = query.get(FILTER_PARAMETER1);
        aql.bind("graph", graph.name.clone());
        match (name, parameter1) {
            (Some(name), None) => {
                aql.bind("start", format!("{}/{name}", graph.from));
                Some("FOR v, doc IN 1..1 OUTBOUND @start GRAPH @graph".to_string())
            }
            (None, Some(parameter1)) => {
                aql.bind("start", format!("{}/{parameter1}", graph.to));
                Some("FOR v, doc IN 1..1 INBOUND @start GRAPH @graph".to_string())
            }
            (Some(name), Some(parameter1)) => {
                aql.bind("from_start", format!("{}/{name}", graph.from));
                aql.bind("to_start", format!("{}/{parameter1}", graph.to));
                Some(
                    "LET outbound = (FOR v, e IN 1..1 OUTBOUND @from_start GRAPH @graph RETURN e) \
                     LET inbound = (FOR v, e IN 1..1 INBOUND @to_start GRAPH @graph RETURN e) \
                     FOR doc IN INTERSECTION(outbound, inbound)"
                        .to_string(),
                )
            }
            (None, None) => None,
        }
    });

    match traversal {
        Some(source) => {
            clauses.push(source);
            push_range(&mut aql, &mut clauses, query);
        }
        None => {
            aql.bind_vars.remove("graph");
            aql.bind("@collection", target.collection.clone());
            clauses.push("FOR doc IN @@collection".to_string());
            push_range(&mut aql, &mut clauses, query);
            push_predicate(&mut aql, &mut clauses, query);
        }
    }

    let direction = if query.reverse { "DESC" } else { "ASC" };
    clauses.push(format!("SORT doc.created {direction}, doc._key {direction}"));
    clauses.push("LIMIT @offset, @limit".to_string());
    clauses.push("RETURN doc".to_string());
    aql.bind("offset", query.offset);
    aql.bind("limit", query.limit);

    aql.query = clauses.join(" ");
    aql
}

fn push_range(aql: &mut Aql, clauses: &mut Vec<String>, query: &SearchQuery) {
    clauses.push("FILTER doc.created >= @from AND doc.created <= @to".to_string());
    aql.bind("from", query.from);
    aql.bind("to", query.to);
}

fn push_predicate(aql: &mut Aql, clauses: &mut Vec<String>, query: &SearchQuery) {
    match Predicate::classify(query) {
        Predicate::Geo {
            lat,
            lng,
            distance_km,
        } => {
            clauses.push(
                "FILTER doc.lat != null AND doc.lng != null \
                 AND DISTANCE(doc.lat, doc.lng, @lat, @lng) <= @distance"
                    .to_string(),
            );
            aql.bind("lat", lat);
            aql.bind("lng", lng);
            // DISTANCE answers in metres
            aql.bind("distance", distance_km * 1000.0);
        }
        Predicate::Fields(fields) => {
            for m in fields {
                let column = m.field.column();
                if m.field.is_text() {
                    clauses.push(format!(
                        "FILTER CONTAINS(LOWER(doc.{column}), LOWER(@{column}))"
                    ));
                } else {
                    clauses.push(format!("FILTER doc.{column} == @{column}"));
                }
                aql.bind(column, m.value);
            }
        }
        Predicate::Metadata(pairs) => {
            for (i, (key, value)) in pairs.into_iter().enumerate() {
                clauses.push(format!("FILTER doc.metadata[@meta_key_{i}] == @meta_value_{i}"));
                aql.bind(&format!("meta_key_{i}"), key);
                aql.bind(&format!("meta_value_{i}"), value);
            }
        }
        Predicate::All => {}
    }
}

fn decode_records(values: Vec<Value>) -> StoreResult<Vec<Record>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(StoreError::from))
        .collect()
}

// =============================================================================
// ArangoConnection
// =============================================================================

/// Connection to one ArangoDB coordinator.
pub struct ArangoConnection {
    http: Guarded<ArangoHttp>,
    target: Option<Target>,
}

impl ArangoConnection {
    fn target(&self) -> StoreResult<&Target> {
        self.target
            .as_ref()
            .ok_or_else(|| StoreError::backend("connection not initialised"))
    }
}

#[async_trait]
impl Connection for ArangoConnection {
    async fn init(&mut self, database: &Database) -> StoreResult<()> {
        let target = Target::from_database(database)?;
        {
            let http = self.http.write().await?;
            http.create_database(&target.database).await?;

            match &target.graph {
                Some(graph) => {
                    http.create_collection(&target.database, &graph.from, COLLECTION_DOCUMENT)
                        .await?;
                    http.create_collection(&target.database, &graph.to, COLLECTION_DOCUMENT)
                        .await?;
                    http.create_collection(&target.database, &target.collection, COLLECTION_EDGE)
                        .await?;
                    http.create_graph(&target.database, graph, &target.collection)
                        .await?;
                }
                None => {
                    http.create_collection(
                        &target.database,
                        &target.collection,
                        COLLECTION_DOCUMENT,
                    )
                    .await?;
                }
            }
            http.create_created_index(&target.database, &target.collection)
                .await?;
        }

        tracing::debug!(
            database = %target.database,
            table = %target.collection,
            graph = target.graph.is_some(),
            "Arangodb target ready"
        );
        self.target = Some(target);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.http.take().await;
        Ok(())
    }

    async fn read(&self, id: &str, secondary_key: &str) -> StoreResult<Record> {
        let http = self.http.read().await?;
        let target = self.target()?;
        let doc = http
            .get_document(&target.database, &target.collection, id)
            .await?;
        let record: Record = serde_json::from_value(doc)?;
        if !record.matches_secondary(secondary_key) {
            return Err(StoreError::not_found(format!("record {id}")));
        }
        Ok(record)
    }

    async fn create(&self, record: &Record) -> StoreResult<()> {
        let http = self.http.write().await?;
        let target = self.target()?;
        let mut record = record.clone();
        record.stamp_created(now_unix());

        if let Some(graph) = &target.graph {
            let (from_key, to_key) = graph.vertex_keys(&record)?;
            http.ensure_vertex(&target.database, &graph.from, from_key)
                .await?;
            http.ensure_vertex(&target.database, &graph.to, to_key)
                .await?;
        }

        let doc = target.document(&record)?;
        let aql = build_upsert(&target.collection, doc, &record.id);
        http.cursor(&target.database, &aql).await?;
        Ok(())
    }

    async fn update(&self, record: &Record) -> StoreResult<()> {
        let http = self.http.write().await?;
        let target = self.target()?;
        if let Some(graph) = &target.graph {
            graph.vertex_keys(record)?;
        }

        let existing: Record = serde_json::from_value(
            http.get_document(&target.database, &target.collection, &record.id)
                .await?,
        )?;

        let mut record = record.clone();
        record.created = existing.created;
        record.updated = record.updated.max(existing.updated);
        record.touch(now_unix())?;

        if let Some(graph) = &target.graph {
            let (from_key, to_key) = graph.vertex_keys(&record)?;
            http.ensure_vertex(&target.database, &graph.from, from_key)
                .await?;
            http.ensure_vertex(&target.database, &graph.to, to_key)
                .await?;
        }

        let doc = target.document(&record)?;
        http.replace_document(&target.database, &target.collection, &record.id, &doc)
            .await
    }

    async fn delete(&self, id: &str, secondary_key: &str) -> StoreResult<()> {
        let http = self.http.write().await?;
        let target = self.target()?;

        if !secondary_key.is_empty() {
            let existing: Record = serde_json::from_value(
                http.get_document(&target.database, &target.collection, id)
                    .await?,
            )?;
            if !existing.matches_secondary(secondary_key) {
                return Err(StoreError::not_found(format!("record {id}")));
            }
        }

        http.delete_document(&target.database, &target.collection, id)
            .await
    }

    async fn search(&self, query: &SearchQuery) -> StoreResult<Vec<Record>> {
        let http = self.http.read().await?;
        let target = self.target()?;
        let aql = build_search(target, query);
        decode_records(http.cursor(&target.database, &aql).await?)
    }

    async fn run_query(&self, query: &str) -> StoreResult<Vec<Record>> {
        let http = self.http.read().await?;
        let target = self.target()?;
        let aql = Aql {
            query: query.to_string(),
            ..Aql::default()
        };
        decode_records(http.cursor(&target.database, &aql).await?)
    }

    async fn create_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let http = self.http.write().await?;
        http.create_database(name).await
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        validate_identifier("database", name)?;
        let http = self.http.write().await?;
        let url = http.url(&["_api", "database", name])?;
        match http
            .send(http.request(Method::DELETE, url))
            .await?
            .into_result("failed to delete database")
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
