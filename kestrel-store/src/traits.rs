//! Repository trait definitions.
//!
//! One trait per entity plus a composite [`Repository`] the services
//! depend on. Filters are plain structs with optional fields; an unset
//! field imposes no predicate. List operations return `(items, total)`
//! where `total` counts all rows matching the filter, not the page.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use kestrel_types::{
    Alert, AlertSeverity, AuditEntry, Cluster, DownloadJob, DownloadState, Image, ImagePhase,
    Node, NodePhase, RegistrationToken, Resources, Result, Snapshot, StoragePool,
    VirtualMachine, VmState, VmStatus, Volume, VolumeStatus,
};
use std::collections::HashMap;

// =============================================================================
// Filters
// =============================================================================

/// Filter for VM listings.
#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub project_id: Option<String>,
    pub node_id: Option<String>,
    pub states: Option<Vec<VmState>>,
    pub name_contains: Option<String>,
}

/// Filter for node listings.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub cluster_id: Option<String>,
    pub phase: Option<NodePhase>,
}

/// Filter for volume listings.
#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    pub project_id: Option<String>,
    pub pool_id: Option<String>,
}

/// Filter for image listings.
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub project_id: Option<String>,
    pub phase: Option<ImagePhase>,
}

/// Filter for audit exports and listings.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Filter for alert listings.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub resolved: Option<bool>,
    pub severity: Option<AlertSeverity>,
    pub resource_id: Option<String>,
}

/// One page of a cursor-based VM listing, newest first.
#[derive(Debug, Clone)]
pub struct VmCursorPage {
    pub items: Vec<VirtualMachine>,
    /// Opaque cursor for the next page; None when exhausted.
    pub next_cursor: Option<String>,
    pub total: u64,
}

/// Streaming audit export: entries arrive in ascending time order, the
/// channel closes on completion or when the receiver is dropped, and the
/// error channel fires at most once on failure.
pub struct AuditExport {
    pub entries: mpsc::Receiver<AuditEntry>,
    pub errors: oneshot::Receiver<kestrel_types::Error>,
}

// =============================================================================
// Per-entity traits
// =============================================================================

#[async_trait]
pub trait NodeRepo: Send + Sync {
    async fn create(&self, node: &Node) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Node>;
    async fn get_by_hostname(&self, hostname: &str) -> Result<Node>;
    async fn list(&self, filter: &NodeFilter, limit: u32, offset: u32)
        -> Result<(Vec<Node>, u64)>;
    async fn update(&self, node: &Node) -> Result<()>;
    /// Status-only write; spares the spec from concurrent clobbering.
    async fn update_status(&self, id: &str, status: &kestrel_types::NodeStatus) -> Result<()>;
    /// Updates allocated resources and stamps `last_heartbeat = now`.
    async fn update_heartbeat(&self, id: &str, allocated: Resources) -> Result<()>;
    /// Nodes with phase Ready and the compute role.
    async fn list_schedulable(&self) -> Result<Vec<Node>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait VmRepo: Send + Sync {
    async fn create(&self, vm: &VirtualMachine) -> Result<()>;
    async fn get(&self, id: &str) -> Result<VirtualMachine>;
    async fn get_by_name(&self, project_id: &str, name: &str) -> Result<VirtualMachine>;
    async fn list(&self, filter: &VmFilter, limit: u32, offset: u32)
        -> Result<(Vec<VirtualMachine>, u64)>;
    /// Cursor pagination keyed by (created_at desc, id).
    async fn list_cursor(
        &self,
        filter: &VmFilter,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<VmCursorPage>;
    async fn list_by_node(&self, node_id: &str) -> Result<Vec<VirtualMachine>>;
    async fn count_by_node(&self, node_id: &str) -> Result<u64>;
    async fn count_by_project(&self, project_id: &str) -> Result<u64>;
    async fn update(&self, vm: &VirtualMachine) -> Result<()>;
    async fn update_status(&self, id: &str, status: &VmStatus) -> Result<()>;
    /// Deletes the VM and cascades to its snapshots.
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ClusterRepo: Send + Sync {
    async fn create(&self, cluster: &Cluster) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Cluster>;
    async fn get_by_name(&self, name: &str) -> Result<Cluster>;
    async fn list(&self) -> Result<Vec<Cluster>>;
    async fn update(&self, cluster: &Cluster) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait PoolRepo: Send + Sync {
    async fn create(&self, pool: &StoragePool) -> Result<()>;
    async fn get(&self, id: &str) -> Result<StoragePool>;
    async fn get_by_name(&self, name: &str) -> Result<StoragePool>;
    async fn list(&self, project_id: Option<&str>) -> Result<Vec<StoragePool>>;
    /// Pools whose `assigned_node_ids` contain `node_id`.
    async fn list_assigned_to_node(&self, node_id: &str) -> Result<Vec<StoragePool>>;
    async fn update(&self, pool: &StoragePool) -> Result<()>;
    async fn update_status(&self, id: &str, status: &kestrel_types::PoolStatus) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait VolumeRepo: Send + Sync {
    async fn create(&self, volume: &Volume) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Volume>;
    async fn get_by_name(&self, project_id: &str, name: &str) -> Result<Volume>;
    async fn list(&self, filter: &VolumeFilter, limit: u32, offset: u32)
        -> Result<(Vec<Volume>, u64)>;
    async fn count_by_pool(&self, pool_id: &str) -> Result<u64>;
    async fn update(&self, volume: &Volume) -> Result<()>;
    async fn update_status(&self, id: &str, status: &VolumeStatus) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait SnapshotRepo: Send + Sync {
    async fn create(&self, snapshot: &Snapshot) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Snapshot>;
    async fn get_by_name(&self, vm_id: &str, name: &str) -> Result<Snapshot>;
    async fn list_by_vm(&self, vm_id: &str) -> Result<Vec<Snapshot>>;
    async fn update(&self, snapshot: &Snapshot) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Transactional reconciliation against the hypervisor-reported set:
    /// delivered snapshots are upserted as Available, stored snapshots
    /// missing from the delivery are marked Deleted, atomically.
    async fn sync_from_hypervisor(&self, vm_id: &str, delivered: &[Snapshot]) -> Result<()>;
}

#[async_trait]
pub trait ImageRepo: Send + Sync {
    async fn create(&self, image: &Image) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Image>;
    async fn list(&self, filter: &ImageFilter, limit: u32, offset: u32)
        -> Result<(Vec<Image>, u64)>;
    async fn find_by_catalog_ids(&self, catalog_ids: &[String]) -> Result<HashMap<String, Image>>;
    /// Upsert keyed by (node_id, path); used by the filesystem scanner.
    async fn upsert(&self, image: &Image) -> Result<()>;
    async fn update(&self, image: &Image) -> Result<()>;
    async fn update_status(&self, id: &str, status: &kestrel_types::ImageStatus) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn create(&self, token: &RegistrationToken) -> Result<()>;
    async fn get(&self, id: &str) -> Result<RegistrationToken>;
    async fn get_by_token(&self, token: &str) -> Result<RegistrationToken>;
    async fn list(&self) -> Result<Vec<RegistrationToken>>;
    async fn update(&self, token: &RegistrationToken) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn create(&self, entry: &AuditEntry) -> Result<()>;
    async fn list(&self, filter: &AuditFilter, limit: u32, offset: u32)
        -> Result<(Vec<AuditEntry>, u64)>;
    /// Streams matching entries in ascending time order.
    async fn export(&self, filter: &AuditFilter) -> Result<AuditExport>;
    /// Deletes entries older than `before`; returns the number removed.
    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait AlertRepo: Send + Sync {
    async fn create(&self, alert: &Alert) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Alert>;
    async fn list(&self, filter: &AlertFilter, limit: u32, offset: u32)
        -> Result<(Vec<Alert>, u64)>;
    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait DownloadJobRepo: Send + Sync {
    async fn create(&self, job: &DownloadJob) -> Result<()>;
    async fn get(&self, id: &str) -> Result<DownloadJob>;
    async fn list_active(&self) -> Result<Vec<DownloadJob>>;
    async fn update(&self, job: &DownloadJob) -> Result<()>;
    async fn list_by_state(&self, state: DownloadState) -> Result<Vec<DownloadJob>>;
}

// =============================================================================
// Composite
// =============================================================================

/// The persistence surface the control plane is written against.
pub trait Repository: Send + Sync {
    fn nodes(&self) -> &dyn NodeRepo;
    fn vms(&self) -> &dyn VmRepo;
    fn clusters(&self) -> &dyn ClusterRepo;
    fn pools(&self) -> &dyn PoolRepo;
    fn volumes(&self) -> &dyn VolumeRepo;
    fn snapshots(&self) -> &dyn SnapshotRepo;
    fn images(&self) -> &dyn ImageRepo;
    fn tokens(&self) -> &dyn TokenRepo;
    fn audit(&self) -> &dyn AuditRepo;
    fn alerts(&self) -> &dyn AlertRepo;
    fn download_jobs(&self) -> &dyn DownloadJobRepo;
}
