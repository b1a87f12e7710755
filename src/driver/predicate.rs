//! Predicate - Search filter classification shared by drivers
//!
//! TigerStyle: One precedence rule, many translations.
//!
//! Every driver answers the same question: which of the caller's filter keys
//! apply? The answer is a [`Predicate`], chosen with fixed precedence:
//!
//! 1. geo radius (`distance` + `lat` + `lng`, all numeric)
//! 2. field matches (`parameter1`, `parameter2`, `parameter3`, `name`), ANDed
//! 3. metadata fallback (every other key)
//! 4. no filter beyond the `created` range
//!
//! Drivers translate the predicate into SQL, AQL, query strings or InfluxQL.

use crate::record::{
    Record, SearchQuery, FILTER_DISTANCE, FILTER_LAT, FILTER_LNG, FILTER_NAME, FILTER_PARAMETER1,
    FILTER_PARAMETER2, FILTER_PARAMETER3, META_AUTOCOMPLETE,
};
use crate::EARTH_RADIUS_KM;

/// Keys never treated as metadata matches.
const RESERVED_FILTER_KEYS: &[&str] = &[
    FILTER_NAME,
    FILTER_PARAMETER1,
    FILTER_PARAMETER2,
    FILTER_PARAMETER3,
    FILTER_DISTANCE,
    FILTER_LAT,
    FILTER_LNG,
    META_AUTOCOMPLETE,
];

// =============================================================================
// Field
// =============================================================================

/// Record field addressable by a filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `parameter1`, exact match
    Parameter1,
    /// `parameter2`, exact match
    Parameter2,
    /// `parameter3`, exact match
    Parameter3,
    /// `name`, case-insensitive substring match
    Name,
}

impl Field {
    /// Fields in rank order, most specific first.
    #[must_use]
    pub fn ranked() -> &'static [Field] {
        &[Self::Parameter1, Self::Parameter2, Self::Parameter3, Self::Name]
    }

    /// Column / attribute name in every backend.
    #[must_use]
    pub fn column(&self) -> &'static str {
        match self {
            Self::Parameter1 => FILTER_PARAMETER1,
            Self::Parameter2 => FILTER_PARAMETER2,
            Self::Parameter3 => FILTER_PARAMETER3,
            Self::Name => FILTER_NAME,
        }
    }

    /// Whether the match is a substring match rather than equality.
    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Name)
    }

    /// Value of this field on a record.
    #[must_use]
    pub fn value<'a>(&self, record: &'a Record) -> &'a str {
        match self {
            Self::Parameter1 => &record.parameter1,
            Self::Parameter2 => &record.parameter2,
            Self::Parameter3 => &record.parameter3,
            Self::Name => &record.name,
        }
    }

    /// Evaluate against a record in memory.
    #[must_use]
    pub fn matches(&self, record: &Record, wanted: &str) -> bool {
        let actual = self.value(record);
        if self.is_text() {
            actual.to_lowercase().contains(&wanted.to_lowercase())
        } else {
            actual == wanted
        }
    }
}

/// One field constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMatch {
    /// Field constrained
    pub field: Field,
    /// Wanted value
    pub value: String,
}

// =============================================================================
// Predicate
// =============================================================================

/// The filter a search applies on top of its `created` range.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Records within `distance_km` of a point
    Geo {
        /// Centre latitude
        lat: f64,
        /// Centre longitude
        lng: f64,
        /// Radius in kilometres
        distance_km: f64,
    },
    /// All field constraints must hold, in rank order
    Fields(Vec<FieldMatch>),
    /// Every metadata pair must be present, sorted by key
    Metadata(Vec<(String, String)>),
    /// Range only
    All,
}

impl Predicate {
    /// Classify a search's filter map.
    #[must_use]
    pub fn classify(query: &SearchQuery) -> Self {
        if let Some(geo) = Self::geo(query) {
            return geo;
        }

        let fields = field_matches(query);
        if !fields.is_empty() {
            return Self::Fields(fields);
        }

        let pairs = metadata_pairs(query);
        if !pairs.is_empty() {
            return Self::Metadata(pairs);
        }

        Self::All
    }

    /// Geo radius, when `distance`, `lat` and `lng` are all numeric.
    #[must_use]
    pub fn geo(query: &SearchQuery) -> Option<Self> {
        let parse = |key: &str| query.get(key).and_then(|v| v.trim().parse::<f64>().ok());
        let distance_km = parse(FILTER_DISTANCE)?;
        let lat = parse(FILTER_LAT)?;
        let lng = parse(FILTER_LNG)?;
        Some(Self::Geo {
            lat,
            lng,
            distance_km,
        })
    }

    /// Evaluate against a record in memory.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Geo {
                lat,
                lng,
                distance_km,
            } => record
                .coordinates()
                .is_some_and(|(rlat, rlng)| haversine_km(*lat, *lng, rlat, rlng) <= *distance_km),
            Self::Fields(fields) => fields.iter().all(|m| m.field.matches(record, &m.value)),
            Self::Metadata(pairs) => pairs
                .iter()
                .all(|(k, v)| record.metadata.get(k).is_some_and(|actual| actual == v)),
            Self::All => true,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Field constraints present in a query, in rank order.
#[must_use]
pub fn field_matches(query: &SearchQuery) -> Vec<FieldMatch> {
    Field::ranked()
        .iter()
        .filter_map(|field| {
            query.get(field.column()).map(|value| FieldMatch {
                field: *field,
                value: value.to_string(),
            })
        })
        .collect()
}

/// Non-reserved filter pairs, sorted by key.
#[must_use]
pub fn metadata_pairs(query: &SearchQuery) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .filter
        .iter()
        .filter(|(k, v)| !v.is_empty() && !RESERVED_FILTER_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    pairs
}

/// Great-circle distance between two points, in kilometres.
#[must_use]
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// LIKE pattern matching one `"key":"value"` pair inside serialized metadata.
///
/// Matches the compact form produced by `serde_json::to_string` on the
/// metadata map. String matching on JSON fragments is fragile; it is kept
/// for compatibility with records written by older clients.
#[must_use]
pub fn metadata_like_pattern(key: &str, value: &str) -> String {
    let key = serde_json::Value::String(key.to_string()).to_string();
    let value = serde_json::Value::String(value.to_string()).to_string();
    format!("%{key}:{value}%")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn query(pairs: &[(&str, &str)]) -> SearchQuery {
        let filter: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SearchQuery::new(filter, 0, 0, 10, 0, false)
    }

    #[test]
    fn test_geo_takes_precedence() {
        let q = query(&[
            ("distance", "1.5"),
            ("lat", "51.5"),
            ("lng", "-0.1"),
            ("name", "ignored"),
        ]);
        assert_eq!(
            Predicate::classify(&q),
            Predicate::Geo {
                lat: 51.5,
                lng: -0.1,
                distance_km: 1.5
            }
        );
    }

    #[test]
    fn test_incomplete_geo_falls_through() {
        let q = query(&[("distance", "1"), ("lat", "51.5"), ("name", "run")]);
        assert!(matches!(Predicate::classify(&q), Predicate::Fields(_)));

        let q = query(&[("distance", "far"), ("lat", "1"), ("lng", "2")]);
        assert_eq!(Predicate::classify(&q), Predicate::All);
    }

    #[test]
    fn test_fields_in_rank_order() {
        let q = query(&[("name", "n"), ("parameter2", "p2"), ("parameter1", "p1")]);
        let Predicate::Fields(fields) = Predicate::classify(&q) else {
            panic!("expected field predicate");
        };
        let order: Vec<Field> = fields.iter().map(|m| m.field).collect();
        assert_eq!(order, vec![Field::Parameter1, Field::Parameter2, Field::Name]);
    }

    #[test]
    fn test_metadata_fallback_only_without_fields() {
        let q = query(&[("color", "blue"), ("size", "xl")]);
        assert_eq!(
            Predicate::classify(&q),
            Predicate::Metadata(vec![
                ("color".to_string(), "blue".to_string()),
                ("size".to_string(), "xl".to_string())
            ])
        );

        let q = query(&[("color", "blue"), ("parameter3", "p3")]);
        assert!(matches!(Predicate::classify(&q), Predicate::Fields(_)));
    }

    #[test]
    fn test_empty_filter_is_all() {
        assert_eq!(Predicate::classify(&query(&[])), Predicate::All);
        assert_eq!(
            Predicate::classify(&query(&[("autocomplete", "true")])),
            Predicate::All
        );
    }

    #[test]
    fn test_in_memory_matching() {
        let record = Record::builder()
            .id("1")
            .name("Morning Run")
            .parameter1("org")
            .metadata("color", "blue")
            .location(51.5007, -0.1246)
            .build();

        assert!(Field::Name.matches(&record, "run"));
        assert!(!Field::Parameter1.matches(&record, "or"));
        assert!(Predicate::classify(&query(&[("color", "blue")])).matches(&record));
        assert!(!Predicate::classify(&query(&[("color", "red")])).matches(&record));

        let here = query(&[("distance", "0"), ("lat", "51.5007"), ("lng", "-0.1246")]);
        assert!(Predicate::classify(&here).matches(&record));
    }

    #[test]
    fn test_haversine() {
        assert_eq!(haversine_km(10.0, 20.0, 10.0, 20.0), 0.0);
        // London to Paris is roughly 344 km
        let d = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((d - 343.5).abs() < 2.0, "distance was {d}");
        // A few metres apart
        let d = haversine_km(51.5, -0.12, 51.50003, -0.12);
        assert!(d > 0.0 && d < 0.01);
    }

    #[test]
    fn test_metadata_like_pattern() {
        assert_eq!(metadata_like_pattern("color", "blue"), r#"%"color":"blue"%"#);
        assert_eq!(metadata_like_pattern("q", "a\"b"), r#"%"q":"a\"b"%"#);
    }
}
