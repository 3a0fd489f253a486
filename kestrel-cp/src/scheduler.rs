//! VM scheduler - selects nodes for placement.
//!
//! Two stages over the schedulable candidates:
//! - hard filters: CPU and memory headroom, required labels, cluster
//!   affinity, storage-pool reachability, heartbeat freshness;
//! - soft scoring: least-allocated wins via a weighted sum of CPU and
//!   memory headroom fractions, ties broken by fewer running VMs, then
//!   lexicographic node id.
//!
//! Identical input state yields identical output.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::debug;

use kestrel_store::{NodeRepo, PoolRepo, Repository, VmRepo};
use kestrel_types::{Node, StoragePool, VirtualMachine};

/// Soft-scoring weights for CPU and memory headroom.
#[derive(Debug, Clone, Copy)]
pub struct SoftWeights {
    pub cpu: f64,
    pub memory: f64,
}

impl Default for SoftWeights {
    fn default() -> Self {
        Self {
            cpu: 0.5,
            memory: 0.5,
        }
    }
}

/// Bonus added to candidates that avoid the anti-affinity set during HA
/// failover, so restarted VMs spread instead of stacking on one survivor.
const ANTI_AFFINITY_BONUS: f64 = 0.05;

/// Why a candidate was filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterReason {
    InsufficientCpu,
    InsufficientMemory,
    LabelMismatch,
    ClusterMismatch,
    PoolUnreachable,
    StaleHeartbeat,
}

impl FilterReason {
    fn describe(&self) -> &'static str {
        match self {
            FilterReason::InsufficientCpu => "insufficient CPU",
            FilterReason::InsufficientMemory => "insufficient memory",
            FilterReason::LabelMismatch => "required labels not matched",
            FilterReason::ClusterMismatch => "cluster affinity not satisfied",
            FilterReason::PoolUnreachable => "storage pool not reachable",
            FilterReason::StaleHeartbeat => "heartbeat stale",
        }
    }
}

/// Scheduling failure with the dominant filter-out cause.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("no schedulable nodes")]
    NoCandidates,

    #[error("no feasible host for vm {vm_id}: {candidates} candidate(s) rejected, mostly: {reason}")]
    NoFeasibleHost {
        vm_id: String,
        candidates: usize,
        reason: &'static str,
    },

    #[error("scheduler repository access: {0}")]
    Repository(#[from] kestrel_types::Error),
}

impl From<ScheduleError> for kestrel_types::Error {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Repository(inner) => inner,
            other => kestrel_types::Error::FailedPrecondition(other.to_string()),
        }
    }
}

/// Placement request; exclusions are hard, the avoid set is soft.
#[derive(Debug, Default)]
pub struct PlacementContext {
    /// Nodes that must not be considered (e.g. the failed host).
    pub exclude: Vec<String>,
    /// Nodes to softly avoid (anti-affinity during HA failover).
    pub avoid: Vec<String>,
}

pub struct Scheduler {
    repo: Arc<dyn Repository>,
    weights: SoftWeights,
    heartbeat_timeout: Duration,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn Repository>, weights: SoftWeights, heartbeat_timeout: Duration) -> Self {
        Self {
            repo,
            weights,
            heartbeat_timeout,
        }
    }

    /// Selects the best node for `vm`, or a classified error.
    pub async fn select_node(
        &self,
        vm: &VirtualMachine,
        ctx: &PlacementContext,
    ) -> Result<String, ScheduleError> {
        let candidates: Vec<Node> = self
            .repo
            .nodes()
            .list_schedulable()
            .await?
            .into_iter()
            .filter(|n| !ctx.exclude.contains(&n.id))
            .collect();

        if candidates.is_empty() {
            return Err(ScheduleError::NoCandidates);
        }

        // Load the pools referenced by the VM's disks once.
        let mut pools: Vec<StoragePool> = Vec::new();
        for disk in &vm.spec.disks {
            if let Some(pool_id) = &disk.pool_id {
                if !pools.iter().any(|p| &p.id == pool_id) {
                    pools.push(self.repo.pools().get(pool_id).await?);
                }
            }
        }

        let now = Utc::now();
        let mut rejected: HashMap<FilterReason, usize> = HashMap::new();
        let mut feasible: Vec<Node> = Vec::new();

        for node in candidates {
            match self.filter(vm, &node, &pools, now) {
                None => feasible.push(node),
                Some(reason) => {
                    debug!(node = %node.id, reason = reason.describe(), "candidate filtered");
                    *rejected.entry(reason).or_insert(0) += 1;
                }
            }
        }

        if feasible.is_empty() {
            // Most frequent cause wins the error message; ties resolve by
            // a fixed reason order to stay deterministic.
            let dominant = [
                FilterReason::InsufficientCpu,
                FilterReason::InsufficientMemory,
                FilterReason::LabelMismatch,
                FilterReason::ClusterMismatch,
                FilterReason::PoolUnreachable,
                FilterReason::StaleHeartbeat,
            ]
            .into_iter()
            .max_by_key(|r| rejected.get(r).copied().unwrap_or(0))
            .unwrap_or(FilterReason::InsufficientCpu);

            return Err(ScheduleError::NoFeasibleHost {
                vm_id: vm.id.clone(),
                candidates: rejected.values().sum(),
                reason: dominant.describe(),
            });
        }

        // Score and order deterministically.
        let mut scored: Vec<(f64, u64, String)> = Vec::with_capacity(feasible.len());
        for node in &feasible {
            let score = self.score(node, ctx);
            let running = self.repo.vms().count_by_node(&node.id).await?;
            scored.push((score, running, node.id.clone()));
        }
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let (score, _, best) = &scored[0];
        debug!(vm = %vm.id, node = %best, score = score, "scheduled");
        Ok(best.clone())
    }

    /// Hard constraints; `None` means the node survives.
    fn filter(
        &self,
        vm: &VirtualMachine,
        node: &Node,
        pools: &[StoragePool],
        now: chrono::DateTime<Utc>,
    ) -> Option<FilterReason> {
        // list_schedulable already guarantees phase and role; heartbeat
        // age is re-checked against the configured timeout.
        match node.heartbeat_age(now) {
            Some(age) if age <= self.heartbeat_timeout => {}
            _ => return Some(FilterReason::StaleHeartbeat),
        }

        let headroom = node.headroom();
        if vm.spec.cpu_cores > headroom.cpu_cores {
            return Some(FilterReason::InsufficientCpu);
        }
        if vm.spec.memory_mib > headroom.memory_mib {
            return Some(FilterReason::InsufficientMemory);
        }

        for (key, value) in &vm.spec.placement.required_labels {
            if node.labels.get(key) != Some(value) {
                return Some(FilterReason::LabelMismatch);
            }
        }

        if let Some(cluster_id) = &vm.spec.placement.cluster_id {
            if node.cluster_id.as_ref() != Some(cluster_id) {
                return Some(FilterReason::ClusterMismatch);
            }
        }

        for pool in pools {
            let reachable =
                pool.backend.is_shared() || pool.assigned_node_ids.contains(&node.id);
            if !reachable {
                return Some(FilterReason::PoolUnreachable);
            }
        }

        None
    }

    /// Soft score: weighted headroom fractions, plus the anti-affinity
    /// bonus for nodes outside the avoid set.
    fn score(&self, node: &Node, ctx: &PlacementContext) -> f64 {
        let headroom = node.headroom();
        let cpu_fraction = if node.status.allocatable.cpu_cores > 0 {
            headroom.cpu_cores as f64 / node.status.allocatable.cpu_cores as f64
        } else {
            0.0
        };
        let memory_fraction = if node.status.allocatable.memory_mib > 0 {
            headroom.memory_mib as f64 / node.status.allocatable.memory_mib as f64
        } else {
            0.0
        };

        let mut score = self.weights.cpu * cpu_fraction + self.weights.memory * memory_fraction;
        if !ctx.avoid.is_empty() && !ctx.avoid.contains(&node.id) {
            score += ANTI_AFFINITY_BONUS;
        }
        score
    }
}
