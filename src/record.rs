//! Record - The universal persisted unit
//!
//! TigerStyle: Explicit types, builder pattern, timestamps owned here.
//!
//! A [`Record`] is what every driver stores and returns. A [`Database`]
//! descriptor is the routing key supplied alongside every call; it is never
//! persisted. [`SearchQuery`] is the normalized form of a search request
//! handed to drivers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::{SEARCH_LIMIT_DEFAULT, SEARCH_TO_SENTINEL, TIMESTAMP_MAX_SECS};

// =============================================================================
// Reserved Keys
// =============================================================================

/// Descriptor flag: mirror writes into the search-engine driver
pub const META_SEARCHABLE: &str = "searchable";

/// Descriptor flag (or search filter key): autocomplete search semantics
pub const META_AUTOCOMPLETE: &str = "autocomplete";

/// Descriptor flag: document driver graph mode
pub const META_GRAPH: &str = "graph";

/// Descriptor key naming the graph's "from" vertex collection
pub const META_GRAPH_FROM: &str = "graph_from";

/// Descriptor key naming the graph's "to" vertex collection
pub const META_GRAPH_TO: &str = "graph_to";

/// Record metadata key carrying a TTL in seconds for the key-value driver
pub const META_EXPIRY_TIME: &str = "expiryTime";

/// Search filter key matched against `Record::name`
pub const FILTER_NAME: &str = "name";

/// Search filter key matched against `Record::parameter1`
pub const FILTER_PARAMETER1: &str = "parameter1";

/// Search filter key matched against `Record::parameter2`
pub const FILTER_PARAMETER2: &str = "parameter2";

/// Search filter key matched against `Record::parameter3`
pub const FILTER_PARAMETER3: &str = "parameter3";

/// Search filter key: radius in kilometres for geo search
pub const FILTER_DISTANCE: &str = "distance";

/// Search filter key: latitude of the geo search centre
pub const FILTER_LAT: &str = "lat";

/// Search filter key: longitude of the geo search centre
pub const FILTER_LNG: &str = "lng";

/// Value that turns a flag on
pub const FLAG_TRUE: &str = "true";

/// Current unix time in seconds.
#[must_use]
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Payload
// =============================================================================

/// Opaque, versioned caller-defined JSON carried alongside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Caller-owned schema version
    pub version: u32,
    /// Caller-owned document
    pub data: serde_json::Value,
}

impl Payload {
    /// Create a payload at the given version.
    #[must_use]
    pub fn new(version: u32, data: serde_json::Value) -> Self {
        Self { version, data }
    }
}

// =============================================================================
// Record
// =============================================================================

/// The universal persisted unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    /// Primary identifier, unique within a collection
    pub id: String,
    /// Creation time (unix seconds), set once on first write
    pub created: i64,
    /// Last write time (unix seconds)
    pub updated: i64,
    /// Free-text label
    pub name: String,
    /// Caller-defined secondary key (commonly an organization id)
    pub parameter1: String,
    /// Caller-defined secondary key (commonly an owner id)
    pub parameter2: String,
    /// Caller-defined secondary key (commonly a serialized domain object)
    pub parameter3: String,
    /// Latitude for geo search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude for geo search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    /// Free-form key/value bag
    pub metadata: HashMap<String, String>,
    /// Versioned caller JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Record {
    /// Create a record with an id and a name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// Get metadata value.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Both coordinates, when the record is geo-located.
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }

    /// Apply first-write timestamp rules.
    ///
    /// Unset `created`/`updated` become `now`; `updated` never trails
    /// `created`.
    pub fn stamp_created(&mut self, now: i64) {
        if self.created <= 0 {
            self.created = now;
        }
        if self.updated <= 0 {
            self.updated = now;
        }
        if self.updated < self.created {
            self.updated = self.created;
        }

        // Postcondition
        assert!(self.created <= self.updated, "created must not exceed updated");
    }

    /// Refresh `updated` for a subsequent write.
    ///
    /// `updated` strictly increases even when two writes land in the same
    /// second.
    ///
    /// # Errors
    /// `InvalidRecord` when `updated` is already at the timestamp ceiling.
    pub fn touch(&mut self, now: i64) -> StoreResult<()> {
        let previous = self.updated;
        let next = previous
            .checked_add(1)
            .filter(|next| *next <= TIMESTAMP_MAX_SECS)
            .ok_or_else(|| {
                StoreError::InvalidRecord(format!("record {} updated {previous} is out of range", self.id))
            })?;
        self.updated = now.max(next);
        if self.created <= 0 || self.created > self.updated {
            self.created = self.updated;
        }

        // Postconditions
        assert!(self.updated > previous, "updated must strictly increase");
        assert!(self.created <= self.updated, "created must not exceed updated");
        Ok(())
    }

    /// Whether caller-supplied timestamps are unset or within range.
    #[must_use]
    pub fn timestamps_in_range(&self) -> bool {
        let valid = |t: i64| (0..=TIMESTAMP_MAX_SECS).contains(&t);
        valid(self.created) && valid(self.updated)
    }

    /// Whether a stored record answers to the caller's secondary key.
    ///
    /// An empty secondary key matches everything.
    #[must_use]
    pub fn matches_secondary(&self, secondary_key: &str) -> bool {
        secondary_key.is_empty() || self.parameter3 == secondary_key
    }
}

// =============================================================================
// Record Builder
// =============================================================================

/// Builder for Record with fluent API.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    /// Set id. A random UUID is used when never set.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.record.id = id.into();
        self
    }

    /// Set name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.record.name = name.into();
        self
    }

    /// Set parameter1.
    #[must_use]
    pub fn parameter1(mut self, value: impl Into<String>) -> Self {
        self.record.parameter1 = value.into();
        self
    }

    /// Set parameter2.
    #[must_use]
    pub fn parameter2(mut self, value: impl Into<String>) -> Self {
        self.record.parameter2 = value.into();
        self
    }

    /// Set parameter3.
    #[must_use]
    pub fn parameter3(mut self, value: impl Into<String>) -> Self {
        self.record.parameter3 = value.into();
        self
    }

    /// Set coordinates.
    #[must_use]
    pub fn location(mut self, lat: f64, lng: f64) -> Self {
        self.record.lat = Some(lat);
        self.record.lng = Some(lng);
        self
    }

    /// Add metadata key-value pair.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.record.metadata.insert(key.into(), value.into());
        self
    }

    /// Set versioned payload.
    #[must_use]
    pub fn payload(mut self, payload: Payload) -> Self {
        self.record.payload = Some(payload);
        self
    }

    /// Set creation timestamp.
    #[must_use]
    pub fn created(mut self, created: i64) -> Self {
        self.record.created = created;
        self
    }

    /// Set update timestamp.
    #[must_use]
    pub fn updated(mut self, updated: i64) -> Self {
        self.record.updated = updated;
        self
    }

    /// Build the record.
    #[must_use]
    pub fn build(mut self) -> Record {
        if self.record.id.is_empty() {
            self.record.id = uuid::Uuid::new_v4().to_string();
        }
        self.record
    }
}

// =============================================================================
// Database Descriptor
// =============================================================================

/// Routing key supplied on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    /// Logical database name
    pub name: String,
    /// Table / collection / measurement / index within the database
    pub table: String,
    /// Driver name; empty selects the configured default
    pub driver: String,
    /// Driver-facing flags
    pub metadata: HashMap<String, String>,
}

impl Database {
    /// Create a descriptor for the default driver.
    #[must_use]
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    /// Same descriptor routed to another driver.
    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Same descriptor with a flag or key set.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Driver name, falling back to `default` when unset.
    #[must_use]
    pub fn driver_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.driver.is_empty() {
            default
        } else {
            &self.driver
        }
    }

    /// Whether a metadata flag is set to "true".
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .is_some_and(|v| v.eq_ignore_ascii_case(FLAG_TRUE))
    }

    /// Writes must be mirrored into the search engine.
    #[must_use]
    pub fn is_searchable(&self) -> bool {
        self.flag(META_SEARCHABLE)
    }

    /// Search uses autocomplete semantics.
    #[must_use]
    pub fn is_autocomplete(&self) -> bool {
        self.flag(META_AUTOCOMPLETE)
    }

    /// Document driver graph mode.
    #[must_use]
    pub fn is_graph(&self) -> bool {
        self.flag(META_GRAPH)
    }

    /// Vertex collections at either end of the graph edge set.
    #[must_use]
    pub fn graph_endpoints(&self) -> (String, String) {
        let from = self
            .metadata
            .get(META_GRAPH_FROM)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("{}_from", self.table));
        let to = self
            .metadata
            .get(META_GRAPH_TO)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("{}_to", self.table));
        (from, to)
    }
}

// =============================================================================
// Search Query
// =============================================================================

/// Normalized search parameters handed to drivers.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Filter map: reserved keys plus best-effort metadata matches
    pub filter: HashMap<String, String>,
    /// Inclusive lower bound on `created`
    pub from: i64,
    /// Inclusive upper bound on `created`
    pub to: i64,
    /// Page size
    pub limit: i64,
    /// Records to skip
    pub offset: i64,
    /// Sort by `created` descending
    pub reverse: bool,
}

impl SearchQuery {
    /// Normalize raw caller parameters.
    ///
    /// `to <= 0` becomes the maximum sentinel, `limit <= 0` becomes the
    /// default limit, negative `offset`/`from` become zero.
    #[must_use]
    pub fn new(
        filter: HashMap<String, String>,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
        reverse: bool,
    ) -> Self {
        let query = Self {
            filter,
            from: from.max(0),
            to: if to <= 0 { SEARCH_TO_SENTINEL } else { to },
            limit: if limit <= 0 { SEARCH_LIMIT_DEFAULT } else { limit },
            offset: offset.max(0),
            reverse,
        };

        // Postconditions
        assert!(query.limit > 0, "limit must be positive");
        assert!(query.offset >= 0, "offset must be non-negative");

        query
    }

    /// Filter value for a key, ignoring empty strings.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.filter
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether a record's `created` falls inside `[from, to]`.
    #[must_use]
    pub fn in_range(&self, created: i64) -> bool {
        created >= self.from && created <= self.to
    }
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self::new(HashMap::new(), 0, 0, 0, 0, false)
    }
}

// =============================================================================
// Tests
// =============================================================================
