//! Cache-aside facade over the node store.
//!
//! Reads check the fast cache first and fall back to the durable store,
//! re-populating the cache with a bounded TTL. Writes go through to the
//! store *first* and only then touch the cache, so a failed write is never
//! served from cache. Cache errors are swallowed and treated as misses -
//! the cache is an optimization, never a source of truth.

use crate::error::{ControlError, Result};
use crate::node::{Node, NodeStatus};
use crate::store::{NodeCache, NodeStore};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Registry tuning knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// TTL for cache entries populated on read
    pub cache_ttl: Duration,
    /// Heartbeat silence beyond which readers treat a node as offline
    pub liveness_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            liveness_window: Duration::from_secs(90),
        }
    }
}

/// Filter for candidate listing
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    /// Restrict to a single node
    pub node_id: Option<String>,
    /// Require forwarding capability
    pub require_routing: bool,
    /// Require NAT-relay capability
    pub require_natting: bool,
    /// Restrict to a country code
    pub country: Option<String>,
}

/// Node registry with heartbeat/staleness semantics
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    cache: Arc<dyn NodeCache>,
    config: RegistryConfig,
}

impl NodeRegistry {
    /// Create a registry over the given store and cache
    pub fn new(store: Arc<dyn NodeStore>, cache: Arc<dyn NodeCache>, config: RegistryConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Current unix time in seconds
    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Liveness window in whole seconds
    fn liveness_secs(&self) -> u64 {
        self.config.liveness_window.as_secs()
    }

    /// Register a node (idempotent upsert keyed by node id)
    ///
    /// A re-registration keeps the original `registered_at` and never lets
    /// `last_heartbeat` move backwards; capability and network fields are
    /// last-write-wins.
    pub async fn register(&self, mut node: Node) -> Result<Node> {
        let now = Self::now();

        match self.store.get(&node.node_id).await? {
            Some(existing) => {
                node.registered_at = existing.registered_at;
                node.last_heartbeat = existing.last_heartbeat.max(now);
                node.active_sessions = existing.active_sessions;
            }
            None => {
                node.registered_at = now;
                node.last_heartbeat = now;
            }
        }

        self.store.put(node.clone()).await?;
        self.cache_put(node.clone()).await;
        debug!(node_id = %node.node_id, "node registered");
        Ok(node)
    }

    /// Fetch a node, cache-aside
    pub async fn get(&self, node_id: &str) -> Result<Node> {
        match self.cache.get(node_id).await {
            Ok(Some(node)) => return Ok(node),
            Ok(None) => {}
            Err(e) => warn!(node_id, error = %e, "cache read failed, treating as miss"),
        }

        let node = self
            .store
            .get(node_id)
            .await?
            .ok_or_else(|| ControlError::UnknownNode(node_id.to_string()))?;

        self.cache_put(node.clone()).await;
        Ok(node)
    }

    /// Record a heartbeat for a known node
    ///
    /// Fails with `UnknownNode` if the node was never registered. The
    /// stored `last_heartbeat` is monotone: a racing older write never
    /// lowers it.
    pub async fn heartbeat(&self, node_id: &str) -> Result<()> {
        let mut node = self
            .store
            .get(node_id)
            .await?
            .ok_or_else(|| ControlError::UnknownNode(node_id.to_string()))?;

        node.last_heartbeat = node.last_heartbeat.max(Self::now());
        node.status = NodeStatus::Online;

        self.store.put(node.clone()).await?;
        self.cache_put(node).await;
        Ok(())
    }

    /// Remove a node on explicit deregistration
    pub async fn deregister(&self, node_id: &str) -> Result<()> {
        let existed = self.store.remove(node_id).await?;
        if let Err(e) = self.cache.invalidate(node_id).await {
            warn!(node_id, error = %e, "cache invalidate failed");
        }
        if !existed {
            return Err(ControlError::UnknownNode(node_id.to_string()));
        }
        debug!(node_id, "node deregistered");
        Ok(())
    }

    /// List nodes that are effectively online and satisfy the filter
    ///
    /// Staleness is applied here, at read time: a stored `Online` past the
    /// liveness window does not appear in the result.
    pub async fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Node>> {
        let now = Self::now();
        let window = self.liveness_secs();

        let nodes = match &filter.node_id {
            Some(id) => match self.store.get(id).await? {
                Some(node) => vec![node],
                None => Vec::new(),
            },
            None => self.store.list().await?,
        };

        Ok(nodes
            .into_iter()
            .filter(|n| n.effective_status(now, window) == NodeStatus::Online)
            .filter(|n| !filter.require_routing || n.capabilities.routing)
            .filter(|n| !filter.require_natting || n.capabilities.natting)
            .filter(|n| {
                filter
                    .country
                    .as_ref()
                    .is_none_or(|c| n.location.country.eq_ignore_ascii_case(c))
            })
            .collect())
    }

    /// Attach an active session to a node
    ///
    /// Called when the selector routes a client through the node; bumps the
    /// session count the spare-capacity tie-break reads.
    pub async fn attach_session(
        &self,
        node_id: &str,
        token: &str,
        expires_at: u64,
    ) -> Result<()> {
        let mut node = self
            .store
            .get(node_id)
            .await?
            .ok_or_else(|| ControlError::UnknownNode(node_id.to_string()))?;

        node.session_token = Some(token.to_string());
        node.expires_at = Some(expires_at);
        node.active_sessions = node.active_sessions.saturating_add(1);

        self.store.put(node.clone()).await?;
        self.cache_put(node).await;
        Ok(())
    }

    /// Release a previously attached session
    pub async fn release_session(&self, node_id: &str) -> Result<()> {
        let mut node = self
            .store
            .get(node_id)
            .await?
            .ok_or_else(|| ControlError::UnknownNode(node_id.to_string()))?;

        node.session_token = None;
        node.expires_at = None;
        node.active_sessions = node.active_sessions.saturating_sub(1);

        self.store.put(node.clone()).await?;
        self.cache_put(node).await;
        Ok(())
    }

    /// Populate the cache, swallowing failures
    async fn cache_put(&self, node: Node) {
        let id = node.node_id.clone();
        if let Err(e) = self.cache.put(node, self.config.cache_ttl).await {
            warn!(node_id = %id, error = %e, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_node;
    use crate::store::{FailingNodeStore, MemoryNodeCache, MemoryNodeStore, NodeStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper that counts reads, for cache-aside assertions
    struct CountingStore {
        inner: MemoryNodeStore,
        reads: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryNodeStore::new(),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NodeStore for CountingStore {
        async fn put(&self, node: Node) -> crate::error::Result<()> {
            self.inner.put(node).await
        }

        async fn get(&self, node_id: &str) -> crate::error::Result<Option<Node>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(node_id).await
        }

        async fn list(&self) -> crate::error::Result<Vec<Node>> {
            self.inner.list().await
        }

        async fn remove(&self, node_id: &str) -> crate::error::Result<bool> {
            self.inner.remove(node_id).await
        }
    }

    fn registry_with(store: Arc<dyn NodeStore>) -> NodeRegistry {
        NodeRegistry::new(
            store,
            Arc::new(MemoryNodeCache::new()),
            RegistryConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        registry.register(test_node("n1")).await.unwrap();

        let node = registry.get("n1").await.unwrap();
        assert_eq!(node.node_id, "n1");
    }

    #[tokio::test]
    async fn test_get_unknown_node() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        let err = registry.get("ghost").await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_get_is_cache_aside() {
        let store = Arc::new(CountingStore::new());
        let registry = registry_with(store.clone());
        registry.register(test_node("n1")).await.unwrap();

        let baseline = store.reads.load(Ordering::SeqCst);

        // First get after register hits the cache populated by the write path
        registry.get("n1").await.unwrap();
        registry.get("n1").await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), baseline);
    }

    #[tokio::test]
    async fn test_cache_miss_populates_cache() {
        let store = Arc::new(CountingStore::new());
        let cache = Arc::new(MemoryNodeCache::new());
        let registry = NodeRegistry::new(store.clone(), cache.clone(), RegistryConfig::default());

        // Seed the store directly so the cache starts cold
        store.put(test_node("n1")).await.unwrap();

        registry.get("n1").await.unwrap();
        let after_first = store.reads.load(Ordering::SeqCst);

        registry.get("n1").await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn test_register_idempotent_upsert() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        let first = registry.register(test_node("n1")).await.unwrap();

        let mut update = test_node("n1");
        update.capabilities.max_connections = 128;
        let second = registry.register(update).await.unwrap();

        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.capabilities.max_connections, 128);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        let err = registry.heartbeat("ghost").await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_is_monotone() {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = registry_with(store.clone());
        registry.register(test_node("n1")).await.unwrap();

        // Plant a heartbeat far in the future; a fresh heartbeat must not lower it
        let mut node = store.get("n1").await.unwrap().unwrap();
        node.last_heartbeat = u64::MAX - 1;
        store.put(node).await.unwrap();

        registry.heartbeat("n1").await.unwrap();
        let node = store.get("n1").await.unwrap().unwrap();
        assert_eq!(node.last_heartbeat, u64::MAX - 1);
    }

    #[tokio::test]
    async fn test_deregister_removes_everywhere() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        registry.register(test_node("n1")).await.unwrap();

        registry.deregister("n1").await.unwrap();
        let err = registry.get("n1").await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownNode(_)));

        let err = registry.deregister("n1").await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_list_candidates_filters_stale() {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = registry_with(store.clone());
        registry.register(test_node("fresh")).await.unwrap();

        // Seed a node whose heartbeat is ancient but whose record says Online
        let mut stale = test_node("stale");
        stale.last_heartbeat = 1_000;
        store.put(stale).await.unwrap();

        let candidates = registry
            .list_candidates(&CandidateFilter::default())
            .await
            .unwrap();
        let ids: Vec<_> = candidates.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_list_candidates_capability_filter() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));

        let mut no_nat = test_node("no-nat");
        no_nat.capabilities.natting = false;
        registry.register(no_nat).await.unwrap();
        registry.register(test_node("full")).await.unwrap();

        let filter = CandidateFilter {
            require_natting: true,
            ..Default::default()
        };
        let candidates = registry.list_candidates(&filter).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "full");
    }

    #[tokio::test]
    async fn test_list_candidates_country_filter() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        registry.register(test_node("de")).await.unwrap();

        let mut us = test_node("us");
        us.location.country = "US".to_string();
        registry.register(us).await.unwrap();

        let filter = CandidateFilter {
            country: Some("us".to_string()),
            ..Default::default()
        };
        let candidates = registry.list_candidates(&filter).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "us");
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let registry = registry_with(Arc::new(FailingNodeStore));
        let err = registry.register(test_node("n1")).await.unwrap_err();
        assert!(matches!(err, ControlError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_session_attach_release() {
        let registry = registry_with(Arc::new(MemoryNodeStore::new()));
        registry.register(test_node("n1")).await.unwrap();

        registry.attach_session("n1", "tok", 9_999).await.unwrap();
        let node = registry.get("n1").await.unwrap();
        assert_eq!(node.session_token.as_deref(), Some("tok"));
        assert_eq!(node.active_sessions, 1);

        registry.release_session("n1").await.unwrap();
        let node = registry.get("n1").await.unwrap();
        assert!(node.session_token.is_none());
        assert_eq!(node.active_sessions, 0);
    }
}
