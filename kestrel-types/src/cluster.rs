//! Cluster entity and aggregated statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical grouping of nodes sharing HA and placement policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ha: ClusterHaConfig,
    #[serde(default)]
    pub drs: DrsConfig,
    #[serde(default)]
    pub defaults: ClusterDefaults,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// HA policy applied to VMs in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHaConfig {
    pub enabled: bool,
    /// Reject placements that would leave no failover headroom.
    pub admission_control: bool,
    /// Number of host failures the cluster must tolerate.
    pub failover_capacity: u32,
    #[serde(default)]
    pub isolation_response: IsolationResponse,
}

impl Default for ClusterHaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admission_control: false,
            failover_capacity: 1,
            isolation_response: IsolationResponse::default(),
        }
    }
}

/// What an isolated host does with its running VMs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum IsolationResponse {
    #[default]
    None,
    PowerOff,
    Shutdown,
}

/// Distributed resource scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub mode: DrsMode,
    /// 1 (conservative) .. 5 (aggressive).
    pub migration_threshold: u32,
}

impl Default for DrsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DrsMode::default(),
            migration_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DrsMode {
    #[default]
    Manual,
    PartiallyAutomated,
    FullyAutomated,
}

/// Defaults applied to VMs created without explicit values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterDefaults {
    pub storage_pool_id: Option<String>,
    pub network_id: Option<String>,
}

// =============================================================================
// Aggregated statistics
// =============================================================================

/// Derived cluster health, worst-first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClusterHealth {
    Healthy,
    Warning,
    Critical,
    Maintenance,
}

/// Cluster plus statistics computed from its nodes and VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterWithStats {
    pub cluster: Cluster,
    pub health: ClusterHealth,
    pub host_count: u32,
    pub hosts_online: u32,
    pub hosts_maintenance: u32,
    pub hosts_offline: u32,
    pub cpu_total_ghz: f64,
    pub cpu_used_ghz: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub vm_count: u32,
    pub vms_running: u32,
    pub vms_stopped: u32,
}
