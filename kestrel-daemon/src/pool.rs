//! Connection pool: one daemon client per registered node.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use kestrel_types::{Error, Result};

use crate::addr::normalize_node_addr;
use crate::{DaemonResult, NodeDaemon};

/// Builds a client for a node address. Injected so tests can hand the pool
/// fake daemons.
pub trait DaemonConnector: Send + Sync {
    fn connect(&self, node_id: &str, addr: &str) -> DaemonResult<Arc<dyn NodeDaemon>>;
}

struct PoolEntry {
    client: Arc<dyn NodeDaemon>,
    addr: String,
}

/// Registry of daemon clients keyed by node id.
///
/// Writers are rare (connect/disconnect); every caller path is a read.
/// A failing call does not evict the entry; reconnection happens when the
/// address changes or the entry is explicitly closed.
pub struct DaemonPool {
    connector: Box<dyn DaemonConnector>,
    entries: RwLock<HashMap<String, PoolEntry>>,
}

impl DaemonPool {
    pub fn new(connector: Box<dyn DaemonConnector>) -> Self {
        Self {
            connector,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Establishes (or returns the existing) client for a node.
    /// Idempotent for an unchanged address.
    pub async fn connect(&self, node_id: &str, addr: &str) -> Result<Arc<dyn NodeDaemon>> {
        let normalized = normalize_node_addr(addr);
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(node_id) {
                if entry.addr == normalized {
                    return Ok(Arc::clone(&entry.client));
                }
            }
        }

        let client = self
            .connector
            .connect(node_id, &normalized)
            .map_err(kestrel_types::Error::from)?;
        let mut entries = self.entries.write().await;
        info!(node_id = %node_id, addr = %normalized, "daemon connected");
        entries.insert(
            node_id.to_string(),
            PoolEntry {
                client: Arc::clone(&client),
                addr: normalized,
            },
        );
        Ok(client)
    }

    /// Non-erroring lookup.
    pub async fn get(&self, node_id: &str) -> Option<Arc<dyn NodeDaemon>> {
        let entries = self.entries.read().await;
        entries.get(node_id).map(|e| Arc::clone(&e.client))
    }

    /// Lookup that surfaces a retry-safe error for absent nodes.
    pub async fn get_or_error(&self, node_id: &str) -> Result<Arc<dyn NodeDaemon>> {
        self.get(node_id).await.ok_or_else(|| {
            Error::Unavailable(format!("no daemon connection for node {}", node_id))
        })
    }

    /// HTTP address for a node's streaming endpoints.
    pub async fn node_http_addr(&self, node_id: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(node_id).map(|e| format!("http://{}", e.addr))
    }

    /// Ids of currently connected nodes, sorted for determinism.
    pub async fn connected_nodes(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops the client for a node.
    pub async fn disconnect(&self, node_id: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(node_id).is_some() {
            debug!(node_id = %node_id, "daemon disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeConnector, FakeDaemon};

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let pool = DaemonPool::new(Box::new(FakeConnector::default()));
        let a = pool.connect("node-1", "10.0.0.1/24").await.unwrap();
        let b = pool.connect("node-1", "10.0.0.1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.connected_nodes().await, vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_on_address_change() {
        let pool = DaemonPool::new(Box::new(FakeConnector::default()));
        let a = pool.connect("node-1", "10.0.0.1").await.unwrap();
        let b = pool.connect("node-1", "10.0.0.2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_get_or_error_for_absent_node() {
        let pool = DaemonPool::new(Box::new(FakeConnector::default()));
        assert!(pool.get("ghost").await.is_none());
        let err = match pool.get_or_error("ghost").await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, kestrel_types::Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_http_addr_normalized() {
        let pool = DaemonPool::new(Box::new(FakeConnector::default()));
        pool.connect("node-1", "10.0.0.1/16").await.unwrap();
        assert_eq!(
            pool.node_http_addr("node-1").await.as_deref(),
            Some("http://10.0.0.1:9090")
        );
    }

    #[tokio::test]
    async fn test_disconnect_evicts() {
        let pool = DaemonPool::new(Box::new(FakeConnector::default()));
        pool.connect("node-1", "10.0.0.1").await.unwrap();
        pool.disconnect("node-1").await;
        assert!(pool.get("node-1").await.is_none());
    }

    #[tokio::test]
    async fn test_injected_fake_is_reachable_through_pool() {
        let fake = Arc::new(FakeDaemon::new());
        let connector = FakeConnector::with_daemon("node-1", Arc::clone(&fake));
        let pool = DaemonPool::new(Box::new(connector));

        pool.connect("node-1", "10.0.0.1").await.unwrap();
        let client = pool.get_or_error("node-1").await.unwrap();
        let result = client
            .init_storage_pool("pool-1", "nfs", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.total_bytes > 0);
    }
}
