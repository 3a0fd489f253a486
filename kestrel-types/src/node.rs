//! Compute node entity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A physical or virtual host running the hypervisor daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    /// Management address; a CIDR suffix is tolerated and stripped where
    /// a dialable address is needed.
    pub management_ip: String,
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: NodeSpec,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Static node capacity and role assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub cpu_cores: u32,
    /// Per-core frequency in MHz; 0 when the daemon could not detect it.
    pub cpu_frequency_mhz: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub roles: NodeRoles,
}

/// Role bits controlling what workloads a node accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeRoles {
    pub compute: bool,
    pub storage: bool,
    pub control_plane: bool,
}

impl Default for NodeRoles {
    fn default() -> Self {
        Self {
            compute: true,
            storage: false,
            control_plane: false,
        }
    }
}

/// Node health phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NodePhase {
    #[default]
    Ready,
    NotReady,
    Maintenance,
    Draining,
}

/// Observed node state, written by the reconcilers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub phase: NodePhase,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
    /// Capacity the scheduler may hand out.
    pub allocatable: Resources,
    /// Capacity already committed to VMs.
    pub allocated: Resources,
    #[serde(default)]
    pub vm_ids: Vec<String>,
    pub system_info: Option<SystemInfo>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// A single reported condition (e.g. "DiskPressure").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCondition {
    pub kind: String,
    pub active: bool,
    pub message: String,
    pub since: DateTime<Utc>,
}

/// CPU and memory quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_mib: u64,
}

/// Host details reported by the daemon at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub kernel: String,
    pub hypervisor_version: String,
    pub architecture: String,
}

impl Node {
    /// Free capacity = allocatable - allocated, saturating at zero.
    pub fn headroom(&self) -> Resources {
        Resources {
            cpu_cores: self
                .status
                .allocatable
                .cpu_cores
                .saturating_sub(self.status.allocated.cpu_cores),
            memory_mib: self
                .status
                .allocatable
                .memory_mib
                .saturating_sub(self.status.allocated.memory_mib),
        }
    }

    /// A node is schedulable iff it is Ready, carries the compute role and
    /// heartbeated within `timeout` of `now`.
    pub fn is_schedulable(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status.phase == NodePhase::Ready
            && self.spec.roles.compute
            && self.heartbeat_age(now).map(|age| age <= timeout).unwrap_or(false)
    }

    /// Age of the last heartbeat, None if the node never heartbeated.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.status.last_heartbeat.map(|hb| now - hb)
    }
}
