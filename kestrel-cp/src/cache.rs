//! Short-TTL read cache, sessions, the VM/node change feed, and the
//! sliding-window rate limiter.
//!
//! Best-effort only: the repository stays authoritative and every miss
//! falls through to it. Entries are JSON-encoded so the cache layer stays
//! oblivious to entity internals. Every VM/node write or invalidation is
//! also published on the change feed, which replicas and watchers consume
//! independently of the streaming bus.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::warn;

use kestrel_types::{Node, VirtualMachine};

/// Default TTLs. Nodes mutate more often than VMs.
pub const DEFAULT_VM_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_NODE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

const CACHE_CAPACITY: usize = 4096;
const FEED_CAPACITY: usize = 256;

/// A VM/node change observed through the cache.
///
/// Updates carry the fresh entity; invalidations carry only the id and
/// tell subscribers to re-read from the repository.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    VmUpdated(Box<VirtualMachine>),
    VmInvalidated { id: String },
    NodeUpdated(Box<Node>),
    NodeInvalidated { id: String },
}

struct Entry {
    json: String,
    project_id: Option<String>,
    expires_at: Instant,
}

/// Read-through cache for hot entities plus session storage.
pub struct Cache {
    entries: Mutex<LruCache<String, Entry>>,
    events: broadcast::Sender<CacheEvent>,
    vm_ttl: Duration,
    node_ttl: Duration,
    session_ttl: Duration,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_ttls(DEFAULT_VM_TTL, DEFAULT_NODE_TTL, DEFAULT_SESSION_TTL)
    }

    pub fn with_ttls(vm_ttl: Duration, node_ttl: Duration, session_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            events,
            vm_ttl,
            node_ttl,
            session_ttl,
        }
    }

    /// Subscribes to the VM/node change feed. Lagging receivers skip
    /// ahead; the publisher never blocks.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CacheEvent) {
        // Send only fails without receivers, which is the common idle case.
        let _ = self.events.send(event);
    }

    async fn get_raw<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                match serde_json::from_str(&entry.json) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(key = key, error = %e, "evicting undecodable cache entry");
                        entries.pop(key);
                        None
                    }
                }
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    async fn set_raw<T: Serialize>(
        &self,
        key: String,
        value: &T,
        project_id: Option<String>,
        ttl: Duration,
    ) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %key, error = %e, "skipping unencodable cache entry");
                return;
            }
        };
        let mut entries = self.entries.lock().await;
        entries.put(
            key,
            Entry {
                json,
                project_id,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    // VM entries.

    pub async fn get_vm(&self, id: &str) -> Option<VirtualMachine> {
        self.get_raw(&format!("vm:{}", id)).await
    }

    pub async fn set_vm(&self, vm: &VirtualMachine) {
        self.set_raw(
            format!("vm:{}", vm.id),
            vm,
            Some(vm.project_id.clone()),
            self.vm_ttl,
        )
        .await;
        self.publish(CacheEvent::VmUpdated(Box::new(vm.clone())));
    }

    pub async fn invalidate_vm(&self, id: &str) {
        self.entries.lock().await.pop(&format!("vm:{}", id));
        self.publish(CacheEvent::VmInvalidated { id: id.to_string() });
    }

    // Node entries.

    pub async fn get_node(&self, id: &str) -> Option<Node> {
        self.get_raw(&format!("node:{}", id)).await
    }

    pub async fn set_node(&self, node: &Node) {
        self.set_raw(format!("node:{}", node.id), node, None, self.node_ttl)
            .await;
        self.publish(CacheEvent::NodeUpdated(Box::new(node.clone())));
    }

    pub async fn invalidate_node(&self, id: &str) {
        self.entries.lock().await.pop(&format!("node:{}", id));
        self.publish(CacheEvent::NodeInvalidated { id: id.to_string() });
    }

    /// Drops every entry belonging to a project.
    pub async fn invalidate_by_project(&self, project_id: &str) {
        let stale: Vec<String> = {
            let mut entries = self.entries.lock().await;
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.project_id.as_deref() == Some(project_id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &stale {
                entries.pop(key);
            }
            stale
        };
        for key in stale {
            if let Some(id) = key.strip_prefix("vm:") {
                self.publish(CacheEvent::VmInvalidated { id: id.to_string() });
            } else if let Some(id) = key.strip_prefix("node:") {
                self.publish(CacheEvent::NodeInvalidated { id: id.to_string() });
            }
        }
    }

    // Sessions.

    pub async fn set_session(&self, session_id: &str, user_id: &str) {
        self.set_raw(
            format!("session:{}", session_id),
            &user_id.to_string(),
            None,
            self.session_ttl,
        )
        .await;
    }

    pub async fn get_session(&self, session_id: &str) -> Option<String> {
        self.get_raw(&format!("session:{}", session_id)).await
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Rate limiter
// =============================================================================

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

struct Window {
    /// Admission instants within the window, oldest first.
    scores: Vec<Instant>,
    expires_at: Instant,
}

/// Sliding-window limiter with sorted-set semantics. Prune, count, append
/// and expire all run under one lock so the steps stay atomic.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        // Expired keys are dropped wholesale before the per-score prune.
        windows.retain(|_, w| w.expires_at > now);

        let entry = windows.entry(key.to_string()).or_insert_with(|| Window {
            scores: Vec::new(),
            expires_at: now + window,
        });

        let cutoff = now.checked_sub(window).unwrap_or(now);
        entry.scores.retain(|score| *score >= cutoff);

        let count = entry.scores.len() as u32;
        let allowed = count < limit;
        if allowed {
            entry.scores.push(now);
        }
        entry.expires_at = now + window;

        let reset_after = entry
            .scores
            .first()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or(window);

        RateLimitDecision {
            allowed,
            remaining: limit.saturating_sub(count + u32::from(allowed)),
            reset_at: Utc::now()
                + chrono::Duration::from_std(reset_after).unwrap_or(chrono::Duration::zero()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::{VmSpec, VmStatus};

    fn make_vm(id: &str, project: &str) -> VirtualMachine {
        VirtualMachine {
            id: id.to_string(),
            project_id: project.to_string(),
            name: id.to_string(),
            description: None,
            labels: Default::default(),
            hardware_version: 1,
            spec: VmSpec::default(),
            status: VmStatus::default(),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_vm_round_trip_and_invalidate() {
        let cache = Cache::new();
        let vm = make_vm("vm-1", "p1");
        cache.set_vm(&vm).await;

        let got = cache.get_vm("vm-1").await.unwrap();
        assert_eq!(got.id, "vm-1");

        cache.invalidate_vm("vm-1").await;
        assert!(cache.get_vm("vm-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_by_ttl() {
        let cache = Cache::with_ttls(
            Duration::from_secs(300),
            Duration::from_secs(60),
            DEFAULT_SESSION_TTL,
        );
        let vm = make_vm("vm-1", "p1");
        cache.set_vm(&vm).await;

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get_vm("vm-1").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_project() {
        let cache = Cache::new();
        cache.set_vm(&make_vm("vm-1", "p1")).await;
        cache.set_vm(&make_vm("vm-2", "p1")).await;
        cache.set_vm(&make_vm("vm-3", "p2")).await;

        cache.invalidate_by_project("p1").await;
        assert!(cache.get_vm("vm-1").await.is_none());
        assert!(cache.get_vm("vm-2").await.is_none());
        assert!(cache.get_vm("vm-3").await.is_some());
    }

    #[tokio::test]
    async fn test_sessions() {
        let cache = Cache::new();
        cache.set_session("sess-1", "user-42").await;
        assert_eq!(cache.get_session("sess-1").await.as_deref(), Some("user-42"));
        assert!(cache.get_session("sess-2").await.is_none());
    }

    #[tokio::test]
    async fn test_change_feed_publishes_vm_set_and_invalidate() {
        let cache = Cache::new();
        let mut feed = cache.subscribe();

        cache.set_vm(&make_vm("vm-1", "p1")).await;
        match feed.recv().await.unwrap() {
            CacheEvent::VmUpdated(vm) => assert_eq!(vm.id, "vm-1"),
            other => panic!("unexpected: {:?}", other),
        }

        cache.invalidate_vm("vm-1").await;
        match feed.recv().await.unwrap() {
            CacheEvent::VmInvalidated { id } => assert_eq!(id, "vm-1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_change_feed_covers_project_invalidation() {
        let cache = Cache::new();
        cache.set_vm(&make_vm("vm-1", "p1")).await;
        cache.set_vm(&make_vm("vm-2", "p1")).await;

        // Subscribing now only observes the invalidations below.
        let mut feed = cache.subscribe();
        cache.invalidate_by_project("p1").await;

        let mut invalidated = Vec::new();
        for _ in 0..2 {
            match feed.recv().await.unwrap() {
                CacheEvent::VmInvalidated { id } => invalidated.push(id),
                other => panic!("unexpected: {:?}", other),
            }
        }
        invalidated.sort();
        assert_eq!(invalidated, vec!["vm-1".to_string(), "vm-2".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_a_no_op() {
        let cache = Cache::new();
        // No receiver exists; the sends must not error the write path.
        cache.set_vm(&make_vm("vm-1", "p1")).await;
        cache.invalidate_vm("vm-1").await;
        assert!(cache.get_vm("vm-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(1);

        // Six calls within 200ms: first five pass with decreasing
        // remaining, the sixth is rejected.
        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = limiter.check("client-1", 5, window).await;
            assert!(decision.allowed);
            remaining.push(decision.remaining);
            tokio::time::advance(Duration::from_millis(40)).await;
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let decision = limiter.check("client-1", 5, window).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        // After the window passes, calls are admitted again.
        tokio::time::advance(Duration::from_millis(1200)).await;
        let decision = limiter.check("client-1", 5, window).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_rate_limit_keys_are_independent() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(1);
        for _ in 0..3 {
            assert!(limiter.check("a", 3, window).await.allowed);
        }
        assert!(!limiter.check("a", 3, window).await.allowed);
        assert!(limiter.check("b", 3, window).await.allowed);
    }
}
