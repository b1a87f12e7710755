//! Registry - Backend node discovery
//!
//! TigerStyle: The registry is a capability, not an implementation detail.
//!
//! Given a logical service name, a [`Registry`] returns the candidate
//! backend nodes that serve it. A [`SelectorStrategy`] turns that list into
//! an endlessly cycling sequence, the way a client-side load balancer does;
//! the router detects exhaustion by noticing a repeated node id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreResult;

/// Node metadata key declaring which driver speaks to the node
pub const NODE_META_DRIVER: &str = "driver";

// =============================================================================
// Node
// =============================================================================

/// A backend endpoint advertised by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id
    pub id: String,
    /// Connection address (URL or host:port, driver-specific)
    pub address: String,
    /// Node metadata; `driver` names the driver for this node
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Create a node declaring a driver.
    #[must_use]
    pub fn new(id: impl Into<String>, driver: impl Into<String>, address: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(NODE_META_DRIVER.to_string(), driver.into());
        Self {
            id: id.into(),
            address: address.into(),
            metadata,
        }
    }

    /// Declared driver, if any.
    #[must_use]
    pub fn driver(&self) -> Option<&str> {
        self.metadata
            .get(NODE_META_DRIVER)
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }

    /// Get metadata value.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Registry service name for a driver within a namespace.
#[must_use]
pub fn service_name(namespace: &str, driver: &str) -> String {
    format!("{namespace}.{driver}")
}

// =============================================================================
// Registry
// =============================================================================

/// Resolves a logical service name to candidate nodes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Candidate nodes for a service. An unknown service yields an empty list.
    async fn lookup(&self, service: &str) -> StoreResult<Vec<Node>>;
}

/// In-process registry seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Vec<Node>>>,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under a service name, replacing a node with the same id.
    pub async fn register(&self, service: impl Into<String>, node: Node) {
        let service = service.into();
        let mut services = self.services.write().await;
        let nodes = services.entry(service.clone()).or_default();
        nodes.retain(|n| n.id != node.id);
        tracing::debug!(service = %service, node = %node.id, "Registered node");
        nodes.push(node);
    }

    /// Remove a node from a service.
    pub async fn deregister(&self, service: &str, node_id: &str) -> bool {
        let mut services = self.services.write().await;
        let Some(nodes) = services.get_mut(service) else {
            return false;
        };
        let before = nodes.len();
        nodes.retain(|n| n.id != node_id);
        before != nodes.len()
    }

    /// All registered service names.
    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn lookup(&self, service: &str) -> StoreResult<Vec<Node>> {
        Ok(self
            .services
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// Selector
// =============================================================================

/// How the cycling node sequence picks its starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    /// Start one position further on each selection
    #[default]
    RoundRobin,
    /// Start at a random position
    Random,
}

impl SelectorStrategy {
    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// Produces cycling node sequences according to a strategy.
#[derive(Debug, Default)]
pub struct Selector {
    strategy: SelectorStrategy,
    counter: AtomicUsize,
}

impl Selector {
    /// Create a selector.
    #[must_use]
    pub fn new(strategy: SelectorStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    /// Strategy in use.
    #[must_use]
    pub fn strategy(&self) -> SelectorStrategy {
        self.strategy
    }

    /// Endless sequence over `nodes`. Empty input yields an empty sequence.
    pub fn select(&self, nodes: Vec<Node>) -> impl Iterator<Item = Node> {
        let start = if nodes.is_empty() {
            0
        } else {
            match self.strategy {
                SelectorStrategy::RoundRobin => {
                    self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len()
                }
                SelectorStrategy::Random => rand::thread_rng().gen_range(0..nodes.len()),
            }
        };
        let len = nodes.len();
        (0..).map_while(move |i: usize| {
            if len == 0 {
                None
            } else {
                Some(nodes[(start + i) % len].clone())
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("a", "postgres", "postgres://a"),
            Node::new("b", "postgres", "postgres://b"),
            Node::new("c", "postgres", "postgres://c"),
        ]
    }

    #[test]
    fn test_node_driver() {
        let node = Node::new("a", "redis", "redis://localhost");
        assert_eq!(node.driver(), Some("redis"));

        let bare = Node {
            id: "b".into(),
            address: "x".into(),
            metadata: HashMap::new(),
        };
        assert_eq!(bare.driver(), None);
    }

    #[test]
    fn test_service_name() {
        assert_eq!(service_name("polystore.db", "postgres"), "polystore.db.postgres");
    }

    #[test]
    fn test_round_robin_cycles_and_rotates() {
        let selector = Selector::new(SelectorStrategy::RoundRobin);

        let first: Vec<String> = selector.select(nodes()).take(4).map(|n| n.id).collect();
        assert_eq!(first, vec!["a", "b", "c", "a"]);

        let second: Vec<String> = selector.select(nodes()).take(3).map(|n| n.id).collect();
        assert_eq!(second, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_random_visits_every_node() {
        let selector = Selector::new(SelectorStrategy::Random);
        let mut ids: Vec<String> = selector.select(nodes()).take(3).map(|n| n.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_selection() {
        let selector = Selector::default();
        assert_eq!(selector.select(Vec::new()).count(), 0);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(SelectorStrategy::parse("round-robin"), Some(SelectorStrategy::RoundRobin));
        assert_eq!(SelectorStrategy::parse("RANDOM"), Some(SelectorStrategy::Random));
        assert_eq!(SelectorStrategy::parse("fastest"), None);
    }

    #[tokio::test]
    async fn test_static_registry_register_lookup() {
        let registry = StaticRegistry::new();
        registry.register("svc", Node::new("a", "memory", "mem://")).await;
        registry.register("svc", Node::new("a", "memory", "mem://replaced")).await;
        registry.register("svc", Node::new("b", "memory", "mem://")).await;

        let found = registry.lookup("svc").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "a");
        assert_eq!(found[1].address, "mem://");
        assert!(found.iter().any(|n| n.address == "mem://replaced"));

        assert!(registry.lookup("missing").await.unwrap().is_empty());

        assert!(registry.deregister("svc", "a").await);
        assert!(!registry.deregister("svc", "a").await);
        assert_eq!(registry.services().await, vec!["svc".to_string()]);
    }
}
