//! Node daemon clients.
//!
//! Every compute node runs a hypervisor daemon; the control plane talks to
//! it through the [`NodeDaemon`] contract. [`DaemonPool`] keeps one client
//! per registered node. Transport failures surface as [`DaemonError`] and
//! never evict a pool entry on their own; reconnection is lazy and callers
//! tolerate absent clients by trying other assigned nodes.

pub mod addr;
pub mod fake;
mod http;
mod pool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kestrel_types::{ResourceUsage, VirtualMachine, VmState};

pub use http::{HttpConnector, HttpDaemon};
pub use pool::{DaemonConnector, DaemonPool};

/// Default daemon port, appended when the management address has none.
pub const DEFAULT_DAEMON_PORT: u16 = 9090;

/// Errors from a node daemon call.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon could not be reached; retry-safe.
    #[error("daemon unreachable: {0}")]
    Transport(String),

    /// The daemon answered with a failure.
    #[error("daemon error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// The response could not be decoded.
    #[error("daemon protocol error: {0}")]
    Protocol(String),
}

impl From<DaemonError> for kestrel_types::Error {
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::Transport(msg) => kestrel_types::Error::Unavailable(msg),
            DaemonError::Remote { status, message } => {
                kestrel_types::Error::Unavailable(format!("daemon returned {}: {}", status, message))
            }
            DaemonError::Protocol(msg) => kestrel_types::Error::Internal(msg),
        }
    }
}

pub type DaemonResult<T> = std::result::Result<T, DaemonError>;

/// Capacity reported by a pool initialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolInitResult {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

/// One entry of a pool directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFileEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    /// "file" or "directory".
    pub file_type: String,
    pub permissions: String,
}

/// VM state observed by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonVmStatus {
    pub state: VmState,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    pub resources: Option<ResourceUsage>,
    pub message: Option<String>,
}

/// Snapshot as reported by the hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSnapshot {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Request routed to the node that owns the destination pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub catalog_id: String,
    pub image_id: String,
    pub url: String,
    pub target_dir: String,
    pub pool_id: String,
    pub checksum: Option<String>,
}

/// Remote download job state, polled by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDownloadStatus {
    /// "pending", "downloading", "converting", "completed" or "failed".
    pub state: String,
    pub progress_percent: u32,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub path: Option<String>,
    pub size_bytes: u64,
    pub error: Option<String>,
}

/// The hypervisor-daemon contract consumed per node.
#[async_trait]
pub trait NodeDaemon: Send + Sync {
    // Storage pools.
    async fn init_storage_pool(
        &self,
        pool_id: &str,
        kind: &str,
        config: &serde_json::Value,
    ) -> DaemonResult<PoolInitResult>;
    async fn list_pool_files(&self, pool_id: &str, path: &str)
        -> DaemonResult<Vec<PoolFileEntry>>;

    // VM lifecycle. Start carries the full machine so the daemon can
    // define the domain; the rest address it by id.
    async fn start_vm(&self, vm: &VirtualMachine) -> DaemonResult<DaemonVmStatus>;
    async fn stop_vm(&self, vm_id: &str, graceful: bool) -> DaemonResult<()>;
    async fn restart_vm(&self, vm_id: &str) -> DaemonResult<()>;
    async fn pause_vm(&self, vm_id: &str) -> DaemonResult<()>;
    async fn resume_vm(&self, vm_id: &str) -> DaemonResult<()>;
    async fn migrate_vm(&self, vm_id: &str, target_addr: &str) -> DaemonResult<()>;
    async fn get_vm_status(&self, vm_id: &str) -> DaemonResult<DaemonVmStatus>;

    // Snapshots.
    async fn list_vm_snapshots(&self, vm_id: &str) -> DaemonResult<Vec<DaemonSnapshot>>;
    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> DaemonResult<DaemonSnapshot>;
    async fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> DaemonResult<()>;
    async fn revert_snapshot(&self, vm_id: &str, snapshot_id: &str) -> DaemonResult<()>;

    // Image downloads (HTTP surface of the daemon).
    async fn start_image_download(&self, req: &DownloadRequest) -> DaemonResult<String>;
    async fn get_download_status(&self, remote_job_id: &str)
        -> DaemonResult<RemoteDownloadStatus>;
}
