//! Config - Service configuration
//!
//! TigerStyle: Defaults in code, overrides layered on top, validated once.
//!
//! # Precedence (lowest to highest)
//!
//! ```text
//! built-in defaults → JSON file (--config) → .env → CLI flags / env vars
//! ```
//!
//! Nodes are given either in the JSON file or as compact specs:
//!
//! ```text
//! id=pg-1,driver=postgres,address=postgres://localhost/app,username=app
//! ```
//!
//! `id`, `driver` and `address` are required; `service` overrides the
//! registry service name; any other `key=value` lands in node metadata.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::{service_name, Node, SelectorStrategy, StaticRegistry};
use crate::{
    DRIVER_DEFAULT, HTTP_BIND_ADDRESS_DEFAULT, HTTP_TIMEOUT_SECS_DEFAULT, NAMESPACE_DEFAULT,
    SEARCH_DRIVER_DEFAULT,
};

/// Maximum HTTP client timeout accepted
pub const HTTP_TIMEOUT_SECS_MAX: u64 = 600;

/// Separator between node specs in a single string
pub const NODE_LIST_SEPARATOR: char = ';';

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for [`Config`]
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Node spec is malformed
    #[error("invalid node spec '{spec}': {reason}")]
    InvalidNode { spec: String, reason: String },

    /// A field holds an unusable value
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// =============================================================================
// NodeConfig
// =============================================================================

/// One configured backend node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub driver: String,
    pub address: String,
    /// Registry service name; defaults to `<namespace>.<driver>`
    pub service: Option<String>,
    /// Extra node metadata (credentials, hints)
    pub metadata: HashMap<String, String>,
}

impl NodeConfig {
    /// Parse a compact `key=value,...` node spec.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidNode {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut node = Self::default();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            // Split on the first '=' only; addresses carry their own
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(&format!("expected key=value, got '{part}'")))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "id" => node.id = value.to_string(),
                "driver" => node.driver = value.to_string(),
                "address" => node.address = value.to_string(),
                "service" => node.service = Some(value.to_string()),
                "" => return Err(invalid("empty key")),
                _ => {
                    node.metadata.insert(key.to_string(), value.to_string());
                }
            }
        }

        node.check().map_err(|reason| invalid(&reason))?;
        Ok(node)
    }

    /// Parse a `;`-separated list of node specs.
    pub fn parse_list(specs: &str) -> Result<Vec<Self>, ConfigError> {
        specs
            .split(NODE_LIST_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("id is required".into());
        }
        if self.driver.is_empty() {
            return Err("driver is required".into());
        }
        if self.address.is_empty() {
            return Err("address is required".into());
        }
        Ok(())
    }

    /// Registry service name under `namespace`.
    #[must_use]
    pub fn service_name(&self, namespace: &str) -> String {
        self.service
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| service_name(namespace, &self.driver))
    }

    /// Registry node.
    #[must_use]
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(&self.id, &self.driver, &self.address);
        for (key, value) in &self.metadata {
            node.metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
        node
    }
}

// =============================================================================
// Config
// =============================================================================

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP bind address
    pub bind: String,
    /// Registry namespace for service names
    pub namespace: String,
    /// Driver used when a descriptor names none
    pub default_driver: String,
    /// Driver receiving searchable mirrors
    pub search_driver: String,
    /// Node selection strategy
    pub selector: SelectorStrategy,
    /// Backend HTTP client timeout
    pub http_timeout_secs: u64,
    /// Backend nodes seeded into the registry
    pub nodes: Vec<NodeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: HTTP_BIND_ADDRESS_DEFAULT.to_string(),
            namespace: NAMESPACE_DEFAULT.to_string(),
            default_driver: DRIVER_DEFAULT.to_string(),
            search_driver: SEARCH_DRIVER_DEFAULT.to_string(),
            selector: SelectorStrategy::default(),
            http_timeout_secs: HTTP_TIMEOUT_SECS_DEFAULT,
            nodes: Vec::new(),
        }
    }
}

impl Config {
    /// Defaults, overlaid with a JSON file when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        tracing::debug!(path = %shown, nodes = config.nodes.len(), "Loaded config file");
        Ok(config)
    }

    /// Check every field once, after all layers are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "bind",
                reason: format!("'{}' is not a socket address", self.bind),
            });
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::Invalid {
                field: "namespace",
                reason: "must not be empty".into(),
            });
        }
        if self.default_driver.is_empty() || self.search_driver.is_empty() {
            return Err(ConfigError::Invalid {
                field: "driver",
                reason: "default and search drivers must be named".into(),
            });
        }
        if self.http_timeout_secs == 0 || self.http_timeout_secs > HTTP_TIMEOUT_SECS_MAX {
            return Err(ConfigError::Invalid {
                field: "http_timeout_secs",
                reason: format!("must be within 1..={HTTP_TIMEOUT_SECS_MAX}"),
            });
        }
        for node in &self.nodes {
            node.check().map_err(|reason| ConfigError::InvalidNode {
                spec: node.id.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Backend HTTP client timeout.
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Registry holding every configured node.
    pub async fn registry(&self) -> StaticRegistry {
        let registry = StaticRegistry::new();
        for node in &self.nodes {
            registry
                .register(node.service_name(&self.namespace), node.to_node())
                .await;
        }
        tracing::info!(
            namespace = %self.namespace,
            nodes = self.nodes.len(),
            "Seeded registry"
        );
        registry
    }
}

// =============================================================================
// Tests
// =============================================================================
