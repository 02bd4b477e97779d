//! Storage contracts behind the node registry.
//!
//! The registry talks to two collaborators: a durable store (source of
//! truth) and a fast cache (optimization only). Both are expressed as async
//! traits so the real engines stay external; the in-memory implementations
//! here satisfy the same contracts and back the test suite.

use crate::error::{ControlError, Result};
use crate::node::Node;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

/// Durable record of nodes, keyed by node id
///
/// Writes are atomic per key; a failed write must leave the previous record
/// intact. Failures surface as [`ControlError::StoreUnavailable`].
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert or replace a node record
    async fn put(&self, node: Node) -> Result<()>;

    /// Fetch a node record
    async fn get(&self, node_id: &str) -> Result<Option<Node>>;

    /// All node records
    async fn list(&self) -> Result<Vec<Node>>;

    /// Delete a node record, returning whether it existed
    async fn remove(&self, node_id: &str) -> Result<bool>;
}

/// Fast lookup cache in front of the durable store
///
/// The cache is never a source of truth: implementations report failures,
/// but the registry swallows them and falls through to the store.
#[async_trait]
pub trait NodeCache: Send + Sync {
    /// Fetch a cached node, honoring the entry's TTL
    async fn get(&self, node_id: &str) -> Result<Option<Node>>;

    /// Cache a node with a bounded TTL
    async fn put(&self, node: Node, ttl: Duration) -> Result<()>;

    /// Drop a cache entry
    async fn invalidate(&self, node_id: &str) -> Result<()>;
}

/// In-memory durable store
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: DashMap<String, Node>,
}

impl MemoryNodeStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn put(&self, node: Node) -> Result<()> {
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        Ok(self.nodes.get(node_id).map(|e| e.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.iter().map(|e| e.value().clone()).collect())
    }

    async fn remove(&self, node_id: &str) -> Result<bool> {
        Ok(self.nodes.remove(node_id).is_some())
    }
}

/// A cached node with its expiry stamp
struct CacheEntry {
    node: Node,
    expires_at: std::time::Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: std::time::Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory TTL cache
///
/// Entries expire lazily on read; a full sweep is not needed because the
/// registry re-populates on every miss.
#[derive(Default)]
pub struct MemoryNodeCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryNodeCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (non-expired) entry count
    #[must_use]
    pub fn len(&self) -> usize {
        let now = std::time::Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the cache holds no live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NodeCache for MemoryNodeCache {
    async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        let now = std::time::Instant::now();
        if let Some(entry) = self.entries.get(node_id) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(node_id);
                return Ok(None);
            }
            return Ok(Some(entry.node.clone()));
        }
        Ok(None)
    }

    async fn put(&self, node: Node, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            node: node.clone(),
            expires_at: std::time::Instant::now() + ttl,
        };
        self.entries.insert(node.node_id, entry);
        Ok(())
    }

    async fn invalidate(&self, node_id: &str) -> Result<()> {
        self.entries.remove(node_id);
        Ok(())
    }
}

/// A store wrapper that fails every call, for exercising error paths
pub struct FailingNodeStore;

#[async_trait]
impl NodeStore for FailingNodeStore {
    async fn put(&self, _node: Node) -> Result<()> {
        Err(ControlError::StoreUnavailable("store down".to_string()))
    }

    async fn get(&self, _node_id: &str) -> Result<Option<Node>> {
        Err(ControlError::StoreUnavailable("store down".to_string()))
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Err(ControlError::StoreUnavailable("store down".to_string()))
    }

    async fn remove(&self, _node_id: &str) -> Result<bool> {
        Err(ControlError::StoreUnavailable("store down".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_node;

    #[tokio::test]
    async fn test_memory_store_put_get() {
        let store = MemoryNodeStore::new();
        store.put(test_node("n1")).await.unwrap();

        let fetched = store.get("n1").await.unwrap().unwrap();
        assert_eq!(fetched.node_id, "n1");
        assert!(store.get("n2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_remove() {
        let store = MemoryNodeStore::new();
        store.put(test_node("n1")).await.unwrap();

        assert!(store.remove("n1").await.unwrap());
        assert!(!store.remove("n1").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_put_replaces() {
        let store = MemoryNodeStore::new();
        store.put(test_node("n1")).await.unwrap();

        let mut updated = test_node("n1");
        updated.capabilities.max_connections = 128;
        store.put(updated).await.unwrap();

        let fetched = store.get("n1").await.unwrap().unwrap();
        assert_eq!(fetched.capabilities.max_connections, 128);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let cache = MemoryNodeCache::new();
        cache
            .put(test_node("n1"), Duration::from_millis(10))
            .await
            .unwrap();

        assert!(cache.get("n1").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_invalidate() {
        let cache = MemoryNodeCache::new();
        cache
            .put(test_node("n1"), Duration::from_secs(60))
            .await
            .unwrap();

        cache.invalidate("n1").await.unwrap();
        assert!(cache.get("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_store_surfaces_unavailable() {
        let store = FailingNodeStore;
        let err = store.get("n1").await.unwrap_err();
        assert!(matches!(err, ControlError::StoreUnavailable(_)));
    }
}
