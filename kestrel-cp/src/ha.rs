//! High-availability reconciler.
//!
//! Tracks heartbeat health per node and, when a node transitions to
//! Failed, restarts its protected VMs on surviving hosts in restart
//! priority order. Runs only on the leader; the ticker honors shutdown
//! within one tick and an in-flight failover completes before exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use kestrel_store::{NodeFilter, NodeRepo, Repository, VmRepo};
use kestrel_types::{AlertSeverity, Node, NodePhase, Result, VirtualMachine, VmState};

use crate::alerts::AlertService;
use crate::scheduler::{PlacementContext, Scheduler};
use crate::vms::VmService;
use crate::{Leadership, SharedRepository};

/// HA tuning; defaults match the cluster-wide policy.
#[derive(Debug, Clone)]
pub struct HaConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub heartbeat_timeout: chrono::Duration,
    pub failure_threshold: u32,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(10),
            heartbeat_timeout: chrono::Duration::seconds(30),
            failure_threshold: 3,
        }
    }
}

/// Per-node health as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    /// Missed heartbeats, not yet past the threshold.
    Unknown { failed_checks: u32 },
    Failed,
}

/// One observation step of the state machine. Returns the next health and
/// whether this step is the Healthy/Unknown -> Failed transition (failover
/// fires exactly once per transition).
fn next_health(current: NodeHealth, fresh: bool, threshold: u32) -> (NodeHealth, bool) {
    if fresh {
        return (NodeHealth::Healthy, false);
    }
    match current {
        NodeHealth::Healthy => {
            let checks = 1;
            if checks >= threshold {
                (NodeHealth::Failed, true)
            } else {
                (NodeHealth::Unknown { failed_checks: checks }, false)
            }
        }
        NodeHealth::Unknown { failed_checks } => {
            let checks = failed_checks + 1;
            if checks >= threshold {
                (NodeHealth::Failed, true)
            } else {
                (NodeHealth::Unknown { failed_checks: checks }, false)
            }
        }
        NodeHealth::Failed => (NodeHealth::Failed, false),
    }
}

pub struct HaReconciler {
    repo: SharedRepository,
    scheduler: Arc<Scheduler>,
    vms: Arc<VmService>,
    alerts: Arc<AlertService>,
    leadership: Arc<dyn Leadership>,
    config: HaConfig,
    health: Mutex<HashMap<String, NodeHealth>>,
}

impl HaReconciler {
    pub fn new(
        repo: SharedRepository,
        scheduler: Arc<Scheduler>,
        vms: Arc<VmService>,
        alerts: Arc<AlertService>,
        leadership: Arc<dyn Leadership>,
        config: HaConfig,
    ) -> Self {
        Self {
            repo,
            scheduler,
            vms,
            alerts,
            leadership,
            config,
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Monitoring loop; exits on shutdown within one tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("ha reconciler disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.check_interval);
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            threshold = self.config.failure_threshold,
            "ha reconciler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.leadership.is_leader() {
                        self.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("ha reconciler stopping");
                    return;
                }
            }
        }
    }

    /// One heartbeat evaluation pass over all nodes.
    pub async fn tick(&self) {
        let nodes = match self.repo.nodes().list(&NodeFilter::default(), 1000, 0).await {
            Ok((nodes, _)) => nodes,
            Err(e) => {
                warn!(error = %e, "ha tick: node listing failed");
                return;
            }
        };

        let now = Utc::now();
        for node in nodes {
            // Operator-driven states are not health failures.
            if matches!(
                node.status.phase,
                NodePhase::Maintenance | NodePhase::Draining
            ) {
                self.health.lock().await.remove(&node.id);
                continue;
            }

            let fresh = node
                .heartbeat_age(now)
                .map(|age| age <= self.config.heartbeat_timeout)
                .unwrap_or(false);

            let transition_to_failed = {
                let mut health = self.health.lock().await;
                let current = health
                    .get(&node.id)
                    .copied()
                    .unwrap_or(NodeHealth::Healthy);
                let (next, failed_now) =
                    next_health(current, fresh, self.config.failure_threshold);
                if next != current {
                    info!(node_id = %node.id, from = ?current, to = ?next, "node health transition");
                }
                health.insert(node.id.clone(), next);
                failed_now
            };

            if transition_to_failed {
                if let Err(e) = self.failover(&node).await {
                    error!(node_id = %node.id, error = %e, "failover pass failed");
                }
            }
        }
    }

    /// Synchronous alias for operators: treat the node as having exhausted
    /// its failure threshold and run the failover path now.
    pub async fn manual_failover(&self, node_id: &str) -> Result<()> {
        let node = self.repo.nodes().get(node_id).await?;
        {
            let mut health = self.health.lock().await;
            health.insert(node_id.to_string(), NodeHealth::Failed);
        }
        self.failover(&node).await
    }

    /// Restarts protected VMs of a failed node on surviving hosts.
    async fn failover(&self, node: &Node) -> Result<()> {
        warn!(node_id = %node.id, hostname = %node.hostname, "node failed, starting failover");

        self.alerts
            .raise_best_effort(
                AlertSeverity::Critical,
                "node",
                &node.id,
                &format!(
                    "Node {} failed: heartbeat missing for {} consecutive checks",
                    node.hostname, self.config.failure_threshold
                ),
            )
            .await;

        let mut protected: Vec<VirtualMachine> = self
            .repo
            .vms()
            .list_by_node(&node.id)
            .await?
            .into_iter()
            .filter(|vm| vm.status.state == VmState::Running && vm.spec.ha.auto_restart)
            .collect();
        // 1 is the highest priority; equal priorities restart in id order.
        protected.sort_by(|a, b| {
            a.spec
                .ha
                .restart_priority
                .cmp(&b.spec.ha.restart_priority)
                .then_with(|| a.id.cmp(&b.id))
        });

        info!(node_id = %node.id, count = protected.len(), "restarting protected vms");

        let mut chosen_targets: Vec<String> = Vec::new();
        for vm in &protected {
            let ctx = PlacementContext {
                exclude: vec![node.id.clone()],
                avoid: chosen_targets.clone(),
            };
            match self.scheduler.select_node(vm, &ctx).await {
                Ok(target) => {
                    match self.vms.failover_start(&vm.id, &target, &node.id).await {
                        Ok(()) => {
                            self.alerts
                                .raise_best_effort(
                                    AlertSeverity::Info,
                                    "vm",
                                    &vm.id,
                                    &format!(
                                        "VM {} restarting on {} after failure of {}",
                                        vm.name, target, node.hostname
                                    ),
                                )
                                .await;
                            chosen_targets.push(target);
                        }
                        Err(e) => {
                            self.alerts
                                .raise_best_effort(
                                    AlertSeverity::Critical,
                                    "vm",
                                    &vm.id,
                                    &format!("HA restart of VM {} failed: {}", vm.name, e),
                                )
                                .await;
                        }
                    }
                }
                Err(e) => {
                    self.alerts
                        .raise_best_effort(
                            AlertSeverity::Critical,
                            "vm",
                            &vm.id,
                            &format!("HA restart of VM {} found no host: {}", vm.name, e),
                        )
                        .await;
                }
            }
        }

        // The failed node is out of rotation until it heartbeats again.
        let mut status = node.status.clone();
        status.phase = NodePhase::NotReady;
        self.repo.nodes().update_status(&node.id, &status).await?;
        Ok(())
    }

    /// Health as currently tracked; Healthy when never observed.
    pub async fn node_health(&self, node_id: &str) -> NodeHealth {
        self.health
            .lock()
            .await
            .get(node_id)
            .copied()
            .unwrap_or(NodeHealth::Healthy)
    }
}

// TODO: fold guest-agent VM heartbeats into the failure decision once the
// daemon reports them; today only host-level heartbeats count.
