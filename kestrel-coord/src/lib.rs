//! Coordination store.
//!
//! A linearizable key-value facility with lease-scoped keys, prefix watch,
//! distributed mutexes and single-winner leader election, plus the
//! `/nodes/` registry built on top of it. Services depend on the
//! [`CoordStore`] trait; [`MemCoord`] is the in-process lease-session
//! backend used by the single-binary deployment and tests. An etcd-backed
//! implementation is a deployment concern behind the same trait.
//!
//! Key layout:
//! - `/nodes/<id>`    -> NodeState JSON (lease-bound)
//! - `/leaders/<name>` -> election key (lease-bound)
//! - `/locks/<name>`   -> mutex namespace

mod mem;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use mem::{LeaderHandle, LockGuard, MemCoord};

/// Errors from the coordination backend.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The backend is unreachable or the session was lost.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// Timed out waiting for a lock.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Internal failure.
    #[error("coordination store internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// A single mutation observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } => key,
            WatchEvent::Delete { key } => key,
        }
    }
}

/// Node presence registered in the store, lease-bound so crashed nodes
/// disappear once their session expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub hostname: String,
    pub address: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Callback invoked on leadership transitions. Fires with `true` when the
/// campaign wins and `false` when the session is lost; fires again with
/// `true` on reacquisition.
pub type LeadershipCallback = Box<dyn Fn(bool) + Send + Sync>;

/// The coordination facility consumed by the control plane.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Streams mutations of `key_or_prefix`. The stream ends when the
    /// receiver is dropped.
    async fn watch(
        &self,
        key_or_prefix: &str,
        is_prefix: bool,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;

    /// Blocks until the named mutex is acquired. The lock is released on
    /// guard drop or [`LockGuard::unlock`].
    async fn acquire_lock(&self, name: &str) -> Result<LockGuard>;

    /// Like [`CoordStore::acquire_lock`] but gives up after `timeout`.
    async fn try_acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard>;

    /// Joins the election for `name`. Exactly one holder exists across all
    /// participants; the campaign keeps running in the background until
    /// the handle is dropped or resigned.
    async fn campaign(
        &self,
        name: &str,
        identity: &str,
        on_change: LeadershipCallback,
    ) -> Result<LeaderHandle>;

    // Node registry (under /nodes/).

    async fn register_node(&self, state: &NodeState) -> Result<()>;
    async fn update_node_heartbeat(&self, node_id: &str) -> Result<()>;
    async fn get_nodes(&self) -> Result<Vec<NodeState>>;
    async fn deregister_node(&self, node_id: &str) -> Result<()>;
}

/// Prefix for the node registry.
pub const NODES_PREFIX: &str = "/nodes/";
/// Prefix for election keys.
pub const LEADERS_PREFIX: &str = "/leaders/";
/// Prefix for distributed mutexes.
pub const LOCKS_PREFIX: &str = "/locks/";
