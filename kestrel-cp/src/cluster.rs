//! Cluster statistics aggregation.

use kestrel_store::{ClusterRepo, NodeFilter, NodeRepo, Repository, VmFilter, VmRepo};
use kestrel_types::{
    Cluster, ClusterHealth, ClusterWithStats, Node, NodePhase, Result, VirtualMachine, VmState,
};

use crate::SharedRepository;

/// Assumed per-core frequency when the daemon could not detect one.
const DEFAULT_CPU_FREQUENCY_MHZ: u32 = 2500;

/// Pure aggregation over a cluster's nodes and VMs.
pub fn compute_cluster_stats(
    cluster: Cluster,
    nodes: &[Node],
    vms: &[VirtualMachine],
) -> ClusterWithStats {
    let host_count = nodes.len() as u32;
    let hosts_maintenance = nodes
        .iter()
        .filter(|n| n.status.phase == NodePhase::Maintenance)
        .count() as u32;
    let hosts_offline = nodes
        .iter()
        .filter(|n| n.status.phase == NodePhase::NotReady)
        .count() as u32;
    let hosts_online = host_count - hosts_maintenance - hosts_offline;

    let mut cpu_total_ghz = 0.0;
    let mut cpu_used_ghz = 0.0;
    let mut memory_total_bytes = 0u64;
    let mut memory_used_bytes = 0u64;
    for node in nodes {
        let freq_mhz = if node.spec.cpu_frequency_mhz > 0 {
            node.spec.cpu_frequency_mhz
        } else {
            DEFAULT_CPU_FREQUENCY_MHZ
        };
        cpu_total_ghz += node.spec.cpu_cores as f64 * freq_mhz as f64 / 1000.0;
        cpu_used_ghz += node.status.allocated.cpu_cores as f64 * freq_mhz as f64 / 1000.0;
        memory_total_bytes += node.spec.memory_mib * 1024 * 1024;
        memory_used_bytes += node.status.allocated.memory_mib * 1024 * 1024;
    }

    let vm_count = vms.len() as u32;
    let vms_running = vms
        .iter()
        .filter(|vm| vm.status.state == VmState::Running)
        .count() as u32;
    let vms_stopped = vms
        .iter()
        .filter(|vm| vm.status.state == VmState::Stopped)
        .count() as u32;

    let health = derive_health(
        host_count,
        hosts_maintenance,
        hosts_offline,
        cpu_used_ghz,
        cpu_total_ghz,
        memory_used_bytes,
        memory_total_bytes,
    );

    ClusterWithStats {
        cluster,
        health,
        host_count,
        hosts_online,
        hosts_maintenance,
        hosts_offline,
        cpu_total_ghz,
        cpu_used_ghz,
        memory_total_bytes,
        memory_used_bytes,
        vm_count,
        vms_running,
        vms_stopped,
    }
}

fn derive_health(
    hosts: u32,
    maintenance: u32,
    offline: u32,
    cpu_used_ghz: f64,
    cpu_total_ghz: f64,
    memory_used: u64,
    memory_total: u64,
) -> ClusterHealth {
    if hosts == 0 {
        return ClusterHealth::Healthy;
    }
    if maintenance == hosts {
        return ClusterHealth::Maintenance;
    }
    if offline > hosts / 2 {
        return ClusterHealth::Critical;
    }
    let cpu_pressure = cpu_total_ghz > 0.0 && cpu_used_ghz / cpu_total_ghz > 0.9;
    let memory_pressure = memory_total > 0 && memory_used as f64 / memory_total as f64 > 0.9;
    if offline > 0 || cpu_pressure || memory_pressure {
        return ClusterHealth::Warning;
    }
    ClusterHealth::Healthy
}

/// Repository-backed wrapper.
pub struct ClusterService {
    repo: SharedRepository,
}

impl ClusterService {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    pub async fn get_with_stats(&self, cluster_id: &str) -> Result<ClusterWithStats> {
        let cluster = self.repo.clusters().get(cluster_id).await?;
        let (nodes, _) = self
            .repo
            .nodes()
            .list(
                &NodeFilter {
                    cluster_id: Some(cluster_id.to_string()),
                    ..Default::default()
                },
                1000,
                0,
            )
            .await?;

        // VMs of the cluster are the VMs placed on its nodes.
        let mut vms = Vec::new();
        for node in &nodes {
            vms.extend(self.repo.vms().list_by_node(&node.id).await?);
        }
        // Unplaced VMs pinned to the cluster still count.
        let (all_vms, _) = self.repo.vms().list(&VmFilter::default(), 10_000, 0).await?;
        for vm in all_vms {
            if vm.status.node_id.is_none()
                && vm.spec.placement.cluster_id.as_deref() == Some(cluster_id)
            {
                vms.push(vm);
            }
        }

        Ok(compute_cluster_stats(cluster, &nodes, &vms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kestrel_types::{NodeSpec, NodeStatus, Resources, VmSpec, VmStatus};
    use std::collections::HashMap;

    fn make_cluster() -> Cluster {
        Cluster {
            id: "c1".to_string(),
            name: "prod".to_string(),
            ha: Default::default(),
            drs: Default::default(),
            defaults: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_node(id: &str, phase: NodePhase, freq_mhz: u32, allocated_cores: u32) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            hostname: id.to_string(),
            management_ip: "10.0.0.1".to_string(),
            cluster_id: Some("c1".to_string()),
            labels: HashMap::new(),
            spec: NodeSpec {
                cpu_cores: 16,
                cpu_frequency_mhz: freq_mhz,
                memory_mib: 32768,
                roles: Default::default(),
            },
            status: NodeStatus {
                phase,
                allocatable: Resources {
                    cpu_cores: 16,
                    memory_mib: 32768,
                },
                allocated: Resources {
                    cpu_cores: allocated_cores,
                    memory_mib: 4096,
                },
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    fn make_vm(id: &str, state: VmState) -> VirtualMachine {
        let now = Utc::now();
        VirtualMachine {
            id: id.to_string(),
            project_id: "p1".to_string(),
            name: id.to_string(),
            description: None,
            labels: HashMap::new(),
            hardware_version: 1,
            spec: VmSpec::default(),
            status: VmStatus {
                state,
                ..Default::default()
            },
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_empty_cluster_is_healthy() {
        let stats = compute_cluster_stats(make_cluster(), &[], &[]);
        assert_eq!(stats.health, ClusterHealth::Healthy);
        assert_eq!(stats.host_count, 0);
    }

    #[test]
    fn test_cpu_totals_with_default_frequency() {
        // One node reports 2400 MHz, the other reports nothing.
        let nodes = vec![
            make_node("n1", NodePhase::Ready, 2400, 4),
            make_node("n2", NodePhase::Ready, 0, 0),
        ];
        let stats = compute_cluster_stats(make_cluster(), &nodes, &[]);
        let expected = 16.0 * 2.4 + 16.0 * 2.5;
        assert!((stats.cpu_total_ghz - expected).abs() < 1e-9);
        assert!((stats.cpu_used_ghz - 4.0 * 2.4).abs() < 1e-9);
    }

    #[test]
    fn test_vm_split() {
        let vms = vec![
            make_vm("v1", VmState::Running),
            make_vm("v2", VmState::Running),
            make_vm("v3", VmState::Stopped),
            make_vm("v4", VmState::Pending),
        ];
        let stats = compute_cluster_stats(make_cluster(), &[], &vms);
        assert_eq!(stats.vm_count, 4);
        assert_eq!(stats.vms_running, 2);
        assert_eq!(stats.vms_stopped, 1);
    }

    #[test]
    fn test_health_maintenance_when_all_hosts_maintenance() {
        let nodes = vec![
            make_node("n1", NodePhase::Maintenance, 2500, 0),
            make_node("n2", NodePhase::Maintenance, 2500, 0),
        ];
        let stats = compute_cluster_stats(make_cluster(), &nodes, &[]);
        assert_eq!(stats.health, ClusterHealth::Maintenance);
    }

    #[test]
    fn test_health_critical_when_majority_offline() {
        let nodes = vec![
            make_node("n1", NodePhase::NotReady, 2500, 0),
            make_node("n2", NodePhase::NotReady, 2500, 0),
            make_node("n3", NodePhase::Ready, 2500, 0),
        ];
        let stats = compute_cluster_stats(make_cluster(), &nodes, &[]);
        assert_eq!(stats.health, ClusterHealth::Critical);
    }

    #[test]
    fn test_health_warning_on_single_offline_host() {
        let nodes = vec![
            make_node("n1", NodePhase::NotReady, 2500, 0),
            make_node("n2", NodePhase::Ready, 2500, 0),
            make_node("n3", NodePhase::Ready, 2500, 0),
        ];
        let stats = compute_cluster_stats(make_cluster(), &nodes, &[]);
        assert_eq!(stats.health, ClusterHealth::Warning);
    }

    #[test]
    fn test_health_warning_on_cpu_pressure() {
        let nodes = vec![make_node("n1", NodePhase::Ready, 2500, 15)];
        let stats = compute_cluster_stats(make_cluster(), &nodes, &[]);
        assert_eq!(stats.health, ClusterHealth::Warning);
    }

    #[test]
    fn test_health_healthy_otherwise() {
        let nodes = vec![
            make_node("n1", NodePhase::Ready, 2500, 4),
            make_node("n2", NodePhase::Ready, 2500, 2),
        ];
        let stats = compute_cluster_stats(make_cluster(), &nodes, &[]);
        assert_eq!(stats.health, ClusterHealth::Healthy);
    }
}
