//! Virtual machine entity (spec/status pattern).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// VM resource - combines spec, status and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub project_id: String,
    /// Unique per project.
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub hardware_version: u32,
    pub spec: VmSpec,
    pub status: VmStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Desired state for a VM (user-defined).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmSpec {
    pub cpu_cores: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub ha: HaPolicy,
    #[serde(default)]
    pub placement: PlacementConstraints,
}

/// Disk attached to a VM, carved from a storage pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Existing volume to attach; a new volume is provisioned when unset.
    pub volume_id: Option<String>,
    pub pool_id: Option<String>,
    pub size_bytes: u64,
    pub boot: bool,
    #[serde(default)]
    pub bus: DiskBus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DiskBus {
    #[default]
    Virtio,
    Sata,
    Scsi,
    Ide,
}

/// Network interface attached to a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub network_id: String,
    pub mac_address: Option<String>,
    #[serde(default)]
    pub model: NicModel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NicModel {
    #[default]
    Virtio,
    E1000,
    Rtl8139,
}

/// High-availability policy for a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaPolicy {
    /// Restart on a surviving host after node failure.
    pub auto_restart: bool,
    /// 1 is the highest priority; lower-priority VMs restart later.
    pub restart_priority: u32,
}

impl Default for HaPolicy {
    fn default() -> Self {
        Self {
            auto_restart: false,
            restart_priority: 100,
        }
    }
}

/// Scheduling constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// Restrict placement to nodes of this cluster.
    pub cluster_id: Option<String>,
    /// All labels must match on the candidate node.
    #[serde(default)]
    pub required_labels: HashMap<String, String>,
}

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum VmState {
    #[default]
    Pending,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Migrating,
    Error,
}

impl VmState {
    /// States that require a non-empty `node_id` in the status.
    pub fn requires_node(&self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Running
                | VmState::Paused
                | VmState::Stopping
                | VmState::Migrating
        )
    }
}

/// Observed VM state, owned by the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmStatus {
    pub state: VmState,
    pub node_id: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    pub resources: Option<ResourceUsage>,
    pub message: Option<String>,
}

/// Point-in-time usage snapshot reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_used_mib: u64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
}

impl VirtualMachine {
    /// Validates the node-placement invariant: active states carry a node.
    pub fn status_is_consistent(&self) -> bool {
        !self.status.state.requires_node()
            || self.status.node_id.as_deref().is_some_and(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states_require_node() {
        for state in [
            VmState::Starting,
            VmState::Running,
            VmState::Paused,
            VmState::Stopping,
            VmState::Migrating,
        ] {
            assert!(state.requires_node(), "{:?}", state);
        }
        for state in [VmState::Pending, VmState::Stopped, VmState::Error] {
            assert!(!state.requires_node(), "{:?}", state);
        }
    }

    #[test]
    fn test_status_consistency() {
        let mut vm = VirtualMachine {
            id: "vm-1".to_string(),
            project_id: "p1".to_string(),
            name: "web".to_string(),
            description: None,
            labels: HashMap::new(),
            hardware_version: 1,
            spec: VmSpec::default(),
            status: VmStatus {
                state: VmState::Running,
                node_id: Some("node-1".to_string()),
                ..Default::default()
            },
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(vm.status_is_consistent());

        vm.status.node_id = None;
        assert!(!vm.status_is_consistent());

        vm.status.state = VmState::Stopped;
        assert!(vm.status_is_consistent());
    }
}
