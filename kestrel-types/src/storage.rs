//! Storage entities: pools, volumes, snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::vm::VmSpec;

// =============================================================================
// Storage pool
// =============================================================================

/// A storage backend accessible to one or more nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub project_id: Option<String>,
    pub name: String,
    pub backend: PoolBackend,
    /// Nodes the pool has been initialized on.
    #[serde(default)]
    pub assigned_node_ids: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub status: PoolStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-specific pool configuration.
///
/// The tag is stored verbatim in the JSON column; decoding an unknown tag
/// is an error, not a silent default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PoolBackend {
    CephRbd {
        monitors: Vec<String>,
        user: String,
        keyring: String,
        secret_uuid: String,
        #[serde(default)]
        namespace: Option<String>,
        pool_name: String,
    },
    Nfs {
        server: String,
        export_path: String,
        version: String,
        #[serde(default)]
        options: Option<String>,
        mount_point: String,
    },
    LocalDir {
        path: String,
    },
    Iscsi {
        portal: String,
        target: String,
        #[serde(default)]
        chap_user: Option<String>,
        #[serde(default)]
        chap_secret: Option<String>,
        lun: u32,
        volume_group: String,
    },
}

impl PoolBackend {
    /// Shared backends expose identical capacity from every node, so
    /// initialization can short-circuit on the first success.
    pub fn is_shared(&self) -> bool {
        !matches!(self, PoolBackend::LocalDir { .. })
    }

    /// Stable lowercase name used in logs and the daemon protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolBackend::CephRbd { .. } => "ceph-rbd",
            PoolBackend::Nfs { .. } => "nfs",
            PoolBackend::LocalDir { .. } => "local-dir",
            PoolBackend::Iscsi { .. } => "iscsi",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PoolPhase {
    #[default]
    Pending,
    Ready,
    Error,
    Degraded,
}

/// Observed pool state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    pub phase: PoolPhase,
    pub capacity: PoolCapacity,
    pub volume_count: u64,
    #[serde(default)]
    pub host_statuses: Vec<PoolHostStatus>,
    pub error_message: Option<String>,
}

/// Byte-level capacity accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCapacity {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    /// Sum of volume sizes; exceeds total under thin provisioning.
    pub provisioned_bytes: u64,
}

impl PoolCapacity {
    /// Ready pools must satisfy available = total - used.
    pub fn is_consistent(&self) -> bool {
        self.total_bytes >= self.used_bytes
            && self.available_bytes == self.total_bytes - self.used_bytes
    }
}

/// Per-node view of pool health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHostStatus {
    pub node_id: String,
    pub healthy: bool,
    pub message: Option<String>,
}

// =============================================================================
// Volume
// =============================================================================

/// A block device carved from a pool, optionally attached to one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub pool_id: String,
    pub project_id: String,
    /// Unique per project.
    pub name: String,
    pub spec: VolumeSpec,
    pub status: VolumeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub size_bytes: u64,
    #[serde(default)]
    pub provisioning: Provisioning,
    #[serde(default)]
    pub access_mode: VolumeAccessMode,
    pub qos: Option<QosPolicy>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub source: VolumeSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Provisioning {
    Thick,
    #[default]
    Thin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VolumeAccessMode {
    #[default]
    ReadWriteOnce,
    ReadWriteMany,
    ReadOnlyMany,
}

/// IOPS / throughput limits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QosPolicy {
    pub min_iops: u64,
    pub max_iops: u64,
    pub burst_iops: u64,
    pub min_throughput_bps: u64,
    pub max_throughput_bps: u64,
    pub burst_throughput_bps: u64,
}

/// What the volume is populated from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum VolumeSource {
    #[default]
    Empty,
    Clone {
        volume_id: String,
    },
    Snapshot {
        snapshot_id: String,
    },
    Image {
        image_id: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VolumePhase {
    #[default]
    Pending,
    Ready,
    InUse,
    Error,
    Deleting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub phase: VolumePhase,
    pub attached_vm_id: Option<String>,
    pub device_path: Option<String>,
    pub actual_size_bytes: u64,
    pub backend_id: Option<String>,
    pub snapshot_count: u64,
}

impl Volume {
    /// InUse iff both the attachment and the device path are present.
    pub fn attachment_is_consistent(&self) -> bool {
        let attached = self.status.attached_vm_id.as_deref().is_some_and(|v| !v.is_empty())
            && self.status.device_path.as_deref().is_some_and(|p| !p.is_empty());
        (self.status.phase == VolumePhase::InUse) == attached
    }
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SnapshotState {
    #[default]
    Available,
    Deleting,
    Deleted,
}

/// Point-in-time VM image; `parent_id` links snapshots into a per-VM tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub vm_id: String,
    /// Unique per VM.
    pub name: String,
    /// Must refer to a snapshot of the same VM when set.
    pub parent_id: Option<String>,
    pub state: SnapshotState,
    pub size_bytes: u64,
    /// VM spec captured at snapshot time, restored on revert.
    pub vm_spec: VmSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
