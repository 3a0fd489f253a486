//! In-process lease-session backend.
//!
//! Leases are swept lazily: every public operation prunes expired sessions
//! before it reads or writes, so a crashed holder's keys disappear within
//! one operation of the TTL elapsing. Time uses the tokio clock, which
//! keeps the TTL paths testable under a paused runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    CoordError, CoordStore, LeadershipCallback, NodeState, Result, WatchEvent, LEADERS_PREFIX,
    NODES_PREFIX,
};

/// Default session TTL bounding how long a crashed holder retains keys.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

const CAMPAIGN_RETRY: Duration = Duration::from_millis(250);

struct KvEntry {
    value: String,
    lease_id: Option<u64>,
}

struct Lease {
    expires_at: Instant,
}

struct Watcher {
    target: String,
    is_prefix: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.is_prefix {
            key.starts_with(&self.target)
        } else {
            key == self.target
        }
    }
}

#[derive(Default)]
struct Election {
    holder_lease: Option<u64>,
    holder_identity: Option<String>,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, KvEntry>,
    leases: HashMap<u64, Lease>,
    next_lease_id: u64,
    watchers: Vec<Watcher>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    elections: HashMap<String, Election>,
    node_leases: HashMap<String, u64>,
}

impl Inner {
    fn grant_lease(&mut self, ttl: Duration) -> u64 {
        self.next_lease_id += 1;
        let id = self.next_lease_id;
        self.leases.insert(
            id,
            Lease {
                expires_at: Instant::now() + ttl,
            },
        );
        id
    }

    fn renew_lease(&mut self, id: u64, ttl: Duration) -> bool {
        match self.leases.get_mut(&id) {
            Some(lease) => {
                lease.expires_at = Instant::now() + ttl;
                true
            }
            None => false,
        }
    }

    fn revoke_lease(&mut self, id: u64) {
        self.leases.remove(&id);
        let expired: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, e)| e.lease_id == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.kv.remove(&key);
            self.notify(WatchEvent::Delete { key });
        }
        for election in self.elections.values_mut() {
            if election.holder_lease == Some(id) {
                election.holder_lease = None;
                election.holder_identity = None;
            }
        }
        self.node_leases.retain(|_, lease| *lease != id);
    }

    /// Prunes every expired lease and the keys bound to it.
    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease_id = id, "session expired");
            self.revoke_lease(id);
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|w| !w.matches(event.key()) || w.tx.send(event.clone()).is_ok());
    }

    fn insert(&mut self, key: String, value: String, lease_id: Option<u64>) {
        self.kv.insert(
            key.clone(),
            KvEntry {
                value: value.clone(),
                lease_id,
            },
        );
        self.notify(WatchEvent::Put { key, value });
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.kv.remove(key).is_some() {
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
            });
            true
        } else {
            false
        }
    }
}

/// In-process coordination store.
pub struct MemCoord {
    inner: Arc<Mutex<Inner>>,
    session_ttl: Duration,
}

impl MemCoord {
    pub fn new() -> Self {
        Self::with_session_ttl(DEFAULT_SESSION_TTL)
    }

    pub fn with_session_ttl(session_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            session_ttl,
        }
    }

    /// Revokes the current holder's session for an election. The holder
    /// observes the loss on its next keep-alive and re-campaigns.
    pub async fn revoke_leader(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        let lease = inner
            .elections
            .get(name)
            .and_then(|e| e.holder_lease);
        if let Some(lease_id) = lease {
            info!(election = name, "revoking leader session");
            inner.revoke_lease(lease_id);
        }
    }
}

impl Default for MemCoord {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a named distributed mutex; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
    name: String,
}

impl LockGuard {
    /// Explicit release; equivalent to dropping the guard.
    pub fn unlock(self) {
        debug!(lock = %self.name, "released");
    }
}

/// Handle to a running leadership campaign. Dropping the handle resigns.
pub struct LeaderHandle {
    is_leader: Arc<AtomicBool>,
    resign_tx: watch::Sender<bool>,
}

impl LeaderHandle {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Steps down and stops campaigning.
    pub fn resign(&self) {
        let _ = self.resign_tx.send(true);
    }
}

impl Drop for LeaderHandle {
    fn drop(&mut self) {
        let _ = self.resign_tx.send(true);
    }
}

#[async_trait::async_trait]
impl CoordStore for MemCoord {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sweep();
        inner.insert(key.to_string(), value.to_string(), None);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        inner.sweep();
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sweep();
        inner.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut inner = self.inner.lock().await;
        inner.sweep();
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn watch(
        &self,
        key_or_prefix: &str,
        is_prefix: bool,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.sweep();
        inner.watchers.push(Watcher {
            target: key_or_prefix.to_string(),
            is_prefix,
            tx,
        });
        Ok(rx)
    }

    async fn acquire_lock(&self, name: &str) -> Result<LockGuard> {
        let mutex = {
            let mut inner = self.inner.lock().await;
            inner
                .locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(LockGuard {
            _guard: guard,
            name: name.to_string(),
        })
    }

    async fn try_acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let mutex = {
            let mut inner = self.inner.lock().await;
            inner
                .locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard {
                _guard: guard,
                name: name.to_string(),
            }),
            Err(_) => Err(CoordError::LockTimeout(name.to_string())),
        }
    }

    async fn campaign(
        &self,
        name: &str,
        identity: &str,
        on_change: LeadershipCallback,
    ) -> Result<LeaderHandle> {
        let is_leader = Arc::new(AtomicBool::new(false));
        let (resign_tx, mut resign_rx) = watch::channel(false);

        let inner = Arc::clone(&self.inner);
        let ttl = self.session_ttl;
        let name = name.to_string();
        let identity = identity.to_string();
        let flag = Arc::clone(&is_leader);

        tokio::spawn(async move {
            let key = format!("{}{}", LEADERS_PREFIX, name);
            'campaign: loop {
                // Try to take the election.
                let lease_id = {
                    let mut guard = inner.lock().await;
                    guard.sweep();
                    let election = guard.elections.entry(name.clone()).or_default();
                    if election.holder_lease.is_none() {
                        let lease_id = guard.grant_lease(ttl);
                        let election = guard.elections.entry(name.clone()).or_default();
                        election.holder_lease = Some(lease_id);
                        election.holder_identity = Some(identity.clone());
                        guard.insert(key.clone(), identity.clone(), Some(lease_id));
                        Some(lease_id)
                    } else {
                        None
                    }
                };

                let lease_id = match lease_id {
                    Some(id) => id,
                    None => {
                        // Somebody else holds it; wait and retry.
                        tokio::select! {
                            _ = tokio::time::sleep(CAMPAIGN_RETRY) => continue 'campaign,
                            _ = resign_rx.changed() => break 'campaign,
                        }
                    }
                };

                info!(election = %name, identity = %identity, "leadership acquired");
                flag.store(true, Ordering::SeqCst);
                on_change(true);

                // Keep-alive until resigned or the session is revoked.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(ttl / 3) => {
                            let mut guard = inner.lock().await;
                            guard.sweep();
                            if !guard.renew_lease(lease_id, ttl) {
                                drop(guard);
                                warn!(election = %name, identity = %identity, "session lost");
                                flag.store(false, Ordering::SeqCst);
                                on_change(false);
                                continue 'campaign;
                            }
                        }
                        _ = resign_rx.changed() => {
                            let mut guard = inner.lock().await;
                            guard.revoke_lease(lease_id);
                            drop(guard);
                            info!(election = %name, identity = %identity, "resigned");
                            flag.store(false, Ordering::SeqCst);
                            on_change(false);
                            break 'campaign;
                        }
                    }
                }
            }
        });

        Ok(LeaderHandle {
            is_leader,
            resign_tx,
        })
    }

    async fn register_node(&self, state: &NodeState) -> Result<()> {
        let value = serde_json::to_string(state)
            .map_err(|e| CoordError::Internal(format!("encode node state: {}", e)))?;
        let mut inner = self.inner.lock().await;
        inner.sweep();
        // Re-registration replaces the previous session.
        if let Some(old) = inner.node_leases.remove(&state.node_id) {
            inner.revoke_lease(old);
        }
        let lease_id = inner.grant_lease(self.session_ttl);
        inner
            .node_leases
            .insert(state.node_id.clone(), lease_id);
        inner.insert(
            format!("{}{}", NODES_PREFIX, state.node_id),
            value,
            Some(lease_id),
        );
        Ok(())
    }

    async fn update_node_heartbeat(&self, node_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sweep();
        let lease_id = match inner.node_leases.get(node_id) {
            Some(id) => *id,
            None => {
                return Err(CoordError::Unavailable(format!(
                    "node {} not registered",
                    node_id
                )))
            }
        };
        let ttl = self.session_ttl;
        inner.renew_lease(lease_id, ttl);

        let key = format!("{}{}", NODES_PREFIX, node_id);
        let updated = match inner.kv.get(&key) {
            Some(entry) => {
                let mut state: NodeState = serde_json::from_str(&entry.value)
                    .map_err(|e| CoordError::Internal(format!("decode node state: {}", e)))?;
                state.last_heartbeat = Utc::now();
                serde_json::to_string(&state)
                    .map_err(|e| CoordError::Internal(format!("encode node state: {}", e)))?
            }
            None => {
                return Err(CoordError::Unavailable(format!(
                    "node {} not registered",
                    node_id
                )))
            }
        };
        inner.insert(key, updated, Some(lease_id));
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeState>> {
        let entries = self.list_prefix(NODES_PREFIX).await?;
        let mut nodes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_str(&value) {
                Ok(state) => nodes.push(state),
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable node state"),
            }
        }
        Ok(nodes)
    }

    async fn deregister_node(&self, node_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sweep();
        if let Some(lease_id) = inner.node_leases.remove(node_id) {
            inner.revoke_lease(lease_id);
        } else {
            inner.remove(&format!("{}{}", NODES_PREFIX, node_id));
        }
        Ok(())
    }
}
