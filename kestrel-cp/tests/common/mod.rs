//! Shared test stack: SQLite repository, in-process coordination store,
//! fake daemons, and the full service graph wired the way the binary
//! wires it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use kestrel_coord::{CoordStore, MemCoord};
use kestrel_daemon::fake::{FakeConnector, FakeDaemon};
use kestrel_daemon::{DaemonConnector, DaemonPool, DaemonResult, NodeDaemon};
use kestrel_store::{NodeRepo, Repository, SqliteRepository, VmRepo};
use kestrel_types::{
    HaPolicy, Node, NodePhase, NodeRoles, NodeSpec, NodeStatus, Resources, VirtualMachine,
    VmSpec, VmState, VmStatus,
};

use kestrel_cp::alerts::AlertService;
use kestrel_cp::bus::EventBus;
use kestrel_cp::cache::Cache;
use kestrel_cp::downloads::DownloadManager;
use kestrel_cp::ha::{HaConfig, HaReconciler};
use kestrel_cp::pools::PoolController;
use kestrel_cp::scheduler::{Scheduler, SoftWeights};
use kestrel_cp::vms::{VmService, VmStatusReconciler};
use kestrel_cp::{Leadership, StaticLeadership};

/// Delegating connector so tests keep a handle on the fakes after the
/// pool takes ownership of its connector.
struct SharedConnector(Arc<FakeConnector>);

impl DaemonConnector for SharedConnector {
    fn connect(&self, node_id: &str, addr: &str) -> DaemonResult<Arc<dyn NodeDaemon>> {
        self.0.connect(node_id, addr)
    }
}

pub struct TestStack {
    pub repo: Arc<SqliteRepository>,
    pub coord: Arc<MemCoord>,
    pub daemons: Arc<DaemonPool>,
    pub fakes: Arc<FakeConnector>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<Cache>,
    pub scheduler: Arc<Scheduler>,
    pub alerts: Arc<AlertService>,
    pub vms: Arc<VmService>,
    pub pools: Arc<PoolController>,
    pub downloads: Arc<DownloadManager>,
    pub ha: Arc<HaReconciler>,
    pub status: Arc<VmStatusReconciler>,
}

impl TestStack {
    pub async fn new() -> Self {
        let repo = Arc::new(SqliteRepository::open_in_memory().await.unwrap());
        let shared: Arc<dyn Repository> = Arc::clone(&repo) as Arc<dyn Repository>;

        let coord = Arc::new(MemCoord::new());
        let fakes = Arc::new(FakeConnector::default());
        let daemons = Arc::new(DaemonPool::new(Box::new(SharedConnector(Arc::clone(
            &fakes,
        )))));
        let bus = EventBus::new();
        let cache = Arc::new(Cache::new());
        let leadership: Arc<dyn Leadership> = Arc::new(StaticLeadership(true));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&shared),
            SoftWeights::default(),
            Duration::seconds(30),
        ));
        let alerts = Arc::new(AlertService::new(Arc::clone(&shared), Arc::clone(&bus)));
        let vms = Arc::new(VmService::new(
            Arc::clone(&shared),
            Arc::clone(&daemons),
            Arc::clone(&coord) as Arc<dyn CoordStore>,
            Arc::clone(&bus),
            Arc::clone(&cache),
            Arc::clone(&scheduler),
        ));
        let pools = Arc::new(PoolController::new(Arc::clone(&shared), Arc::clone(&daemons)));
        let downloads = Arc::new(DownloadManager::new(
            Arc::clone(&shared),
            Arc::clone(&daemons),
            false,
        ));
        let ha = Arc::new(HaReconciler::new(
            Arc::clone(&shared),
            Arc::clone(&scheduler),
            Arc::clone(&vms),
            Arc::clone(&alerts),
            Arc::clone(&leadership),
            HaConfig::default(),
        ));
        let status = Arc::new(VmStatusReconciler::new(
            Arc::clone(&shared),
            Arc::clone(&daemons),
            Arc::clone(&bus),
            Arc::clone(&cache),
            Arc::clone(&leadership),
            std::time::Duration::from_secs(15),
        ));

        Self {
            repo,
            coord,
            daemons,
            fakes,
            bus,
            cache,
            scheduler,
            alerts,
            vms,
            pools,
            downloads,
            ha,
            status,
        }
    }

    fn node_row(id: &str, hostname: &str) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            hostname: hostname.to_string(),
            management_ip: "10.0.0.10/24".to_string(),
            cluster_id: None,
            labels: HashMap::new(),
            spec: NodeSpec {
                cpu_cores: 32,
                cpu_frequency_mhz: 2500,
                memory_mib: 131072,
                roles: NodeRoles::default(),
            },
            status: NodeStatus {
                phase: NodePhase::Ready,
                allocatable: Resources {
                    cpu_cores: 32,
                    memory_mib: 131072,
                },
                allocated: Resources {
                    cpu_cores: 4,
                    memory_mib: 8192,
                },
                last_heartbeat: Some(now),
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// Ready node with a fresh heartbeat and a connected fake daemon.
    pub async fn add_node(&self, id: &str) -> Node {
        let node = Self::node_row(id, &format!("host-{}", id));
        self.repo.nodes().create(&node).await.unwrap();
        self.fakes.add_daemon(id, Arc::new(FakeDaemon::new()));
        self.daemons.connect(id, &node.management_ip).await.unwrap();
        node
    }

    /// Ready node row only; the daemon stays unreachable.
    pub async fn add_offline_node(&self, id: &str) -> Node {
        let node = Self::node_row(id, &format!("host-{}", id));
        self.repo.nodes().create(&node).await.unwrap();
        self.fakes.set_unreachable(id);
        node
    }

    /// The fake daemon serving a node (registered by `add_node`).
    pub fn daemon(&self, node_id: &str) -> Arc<FakeDaemon> {
        match self.fakes.daemon(node_id) {
            Some(fake) => fake,
            None => {
                let fake = Arc::new(FakeDaemon::new());
                self.fakes.add_daemon(node_id, Arc::clone(&fake));
                fake
            }
        }
    }

    /// Marks a node's heartbeat as `age_secs` old.
    pub async fn age_heartbeat(&self, node_id: &str, age_secs: i64) {
        let node = self.repo.nodes().get(node_id).await.unwrap();
        let mut status = node.status.clone();
        status.last_heartbeat = Some(Utc::now() - Duration::seconds(age_secs));
        self.repo.nodes().update_status(node_id, &status).await.unwrap();
    }

    /// Running VM placed on a node, with the given HA policy.
    pub async fn add_running_vm(
        &self,
        id: &str,
        node_id: &str,
        auto_restart: bool,
        restart_priority: u32,
    ) -> VirtualMachine {
        let now = Utc::now();
        let vm = VirtualMachine {
            id: id.to_string(),
            project_id: "p1".to_string(),
            name: id.to_string(),
            description: None,
            labels: HashMap::new(),
            hardware_version: 1,
            spec: VmSpec {
                cpu_cores: 2,
                memory_mib: 2048,
                ha: HaPolicy {
                    auto_restart,
                    restart_priority,
                },
                ..Default::default()
            },
            status: VmStatus {
                state: VmState::Running,
                node_id: Some(node_id.to_string()),
                ip_addresses: vec!["192.0.2.1".to_string()],
                resources: None,
                message: None,
            },
            created_by: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.vms().create(&vm).await.unwrap();
        vm
    }
}
