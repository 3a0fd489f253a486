//! VM lifecycle service.
//!
//! Translates user intent into daemon calls and owns the authoritative VM
//! status. Start/stop/migrate on one VM are serialized through the per-VM
//! distributed lock; status flows back either synchronously from the
//! daemon call or through the periodic status reconciler (leader only).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kestrel_coord::CoordStore;
use kestrel_daemon::{DaemonPool, DaemonSnapshot, NodeDaemon};
use kestrel_store::{
    AuditRepo, NodeRepo, Repository, SnapshotRepo, VmCursorPage, VmFilter, VmRepo,
};
use kestrel_types::{
    normalize_project_id, AuditEntry, Error, Result, Snapshot, SnapshotState, VirtualMachine,
    VmSpec, VmState, VmStatus,
};

use crate::bus::{Event, EventBus, EventFilter, EventType, ResourceType, Subscription};
use crate::cache::Cache;
use crate::scheduler::{PlacementContext, Scheduler};
use crate::{Leadership, SharedRepository};

/// Request to create a new VM.
#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub labels: HashMap<String, String>,
    pub spec: VmSpec,
    pub created_by: Option<String>,
}

pub struct VmService {
    repo: SharedRepository,
    daemons: Arc<DaemonPool>,
    coord: Arc<dyn CoordStore>,
    bus: Arc<EventBus>,
    cache: Arc<Cache>,
    scheduler: Arc<Scheduler>,
}

fn coord_err(e: kestrel_coord::CoordError) -> Error {
    Error::Unavailable(e.to_string())
}

fn validate_spec(spec: &VmSpec) -> Result<()> {
    if spec.cpu_cores == 0 {
        return Err(Error::InvalidArgument("cpu_cores must be positive".to_string()));
    }
    if spec.memory_mib == 0 {
        return Err(Error::InvalidArgument("memory_mib must be positive".to_string()));
    }
    Ok(())
}

impl VmService {
    pub fn new(
        repo: SharedRepository,
        daemons: Arc<DaemonPool>,
        coord: Arc<dyn CoordStore>,
        bus: Arc<EventBus>,
        cache: Arc<Cache>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            repo,
            daemons,
            coord,
            bus,
            cache,
            scheduler,
        }
    }

    /// Best-effort audit trail; failures never fail the operation.
    async fn audit(&self, action: &str, vm_id: &str, project_id: &str, actor: Option<&str>) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.unwrap_or("system").to_string(),
            action: action.to_string(),
            resource_type: "vm".to_string(),
            resource_id: vm_id.to_string(),
            project_id: Some(project_id.to_string()),
            details: serde_json::Value::Null,
        };
        if let Err(e) = self.repo.audit().create(&entry).await {
            warn!(vm_id = vm_id, error = %e, "failed to record audit entry");
        }
    }

    /// Daemon client for a node, connecting lazily through the node's
    /// management address when the pool has no entry yet.
    async fn daemon_for(&self, node_id: &str) -> Result<Arc<dyn NodeDaemon>> {
        if let Some(client) = self.daemons.get(node_id).await {
            return Ok(client);
        }
        let node = self.repo.nodes().get(node_id).await?;
        self.daemons.connect(node_id, &node.management_ip).await
    }

    async fn persist_status(&self, vm: &VirtualMachine) -> Result<()> {
        self.repo.vms().update_status(&vm.id, &vm.status).await?;
        self.cache.invalidate_vm(&vm.id).await;
        Ok(())
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    pub async fn create(&self, req: CreateVmRequest) -> Result<VirtualMachine> {
        validate_spec(&req.spec)?;
        if req.name.trim().is_empty() {
            return Err(Error::InvalidArgument("name must not be empty".to_string()));
        }

        let now = Utc::now();
        let vm = VirtualMachine {
            id: Uuid::new_v4().to_string(),
            project_id: normalize_project_id(&req.project_id),
            name: req.name,
            description: req.description,
            labels: req.labels,
            hardware_version: 1,
            spec: req.spec,
            status: VmStatus::default(),
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
        };

        self.repo.vms().create(&vm).await?;
        info!(vm_id = %vm.id, name = %vm.name, "vm created");
        self.audit("vm.create", &vm.id, &vm.project_id, vm.created_by.as_deref())
            .await;
        self.cache.set_vm(&vm).await;
        self.bus.publish(Event::vm(EventType::Created, &vm));
        Ok(vm)
    }

    pub async fn get(&self, vm_id: &str) -> Result<VirtualMachine> {
        if let Some(vm) = self.cache.get_vm(vm_id).await {
            return Ok(vm);
        }
        let vm = self.repo.vms().get(vm_id).await?;
        self.cache.set_vm(&vm).await;
        Ok(vm)
    }

    pub async fn list(
        &self,
        filter: &VmFilter,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<VmCursorPage> {
        self.repo.vms().list_cursor(filter, limit, cursor).await
    }

    /// Spec-only update; status stays untouched.
    pub async fn update_spec(&self, vm_id: &str, spec: VmSpec) -> Result<VirtualMachine> {
        validate_spec(&spec)?;
        let mut vm = self.repo.vms().get(vm_id).await?;
        vm.spec = spec;
        self.repo.vms().update(&vm).await?;
        self.cache.invalidate_vm(vm_id).await;
        let vm = self.repo.vms().get(vm_id).await?;
        self.bus.publish(Event::vm(EventType::Updated, &vm));
        Ok(vm)
    }

    pub async fn delete(&self, vm_id: &str) -> Result<()> {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let vm = self.repo.vms().get(vm_id).await?;
        // Tear the domain down if it is still placed; unreachable daemons
        // do not block deletion.
        if let Some(node_id) = vm.status.node_id.clone() {
            if vm.status.state.requires_node() {
                match self.daemon_for(&node_id).await {
                    Ok(daemon) => {
                        if let Err(e) = daemon.stop_vm(&vm.id, false).await {
                            warn!(vm_id = vm_id, error = %e, "stop before delete failed");
                        }
                    }
                    Err(e) => warn!(vm_id = vm_id, error = %e, "daemon unreachable for delete"),
                }
            }
        }

        self.repo.vms().delete(vm_id).await?;
        self.cache.invalidate_vm(vm_id).await;
        self.audit("vm.delete", vm_id, &vm.project_id, None).await;
        self.bus.publish(Event::vm_deleted(vm_id, &vm.project_id));
        info!(vm_id = vm_id, "vm deleted");
        Ok(())
    }

    // =========================================================================
    // Power operations
    // =========================================================================

    pub async fn start(&self, vm_id: &str, target_node: Option<String>) -> Result<VirtualMachine> {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let mut vm = self.repo.vms().get(vm_id).await?;
        if matches!(vm.status.state, VmState::Running | VmState::Starting) {
            return Err(Error::FailedPrecondition(format!(
                "vm {} is already {:?}",
                vm_id, vm.status.state
            )));
        }

        let node_id = match target_node {
            Some(node_id) => {
                // Explicit targets are validated, not re-scheduled.
                self.repo.nodes().get(&node_id).await?;
                node_id
            }
            None => self
                .scheduler
                .select_node(&vm, &PlacementContext::default())
                .await
                .map_err(kestrel_types::Error::from)?,
        };

        let daemon = self.daemon_for(&node_id).await?;

        vm.status.state = VmState::Starting;
        vm.status.node_id = Some(node_id.clone());
        vm.status.message = None;
        self.persist_status(&vm).await?;
        self.bus.publish(Event::vm(EventType::Updated, &vm));

        match daemon.start_vm(&vm).await {
            Ok(remote) => {
                vm.status.state = remote.state;
                vm.status.ip_addresses = remote.ip_addresses;
                vm.status.resources = remote.resources;
                self.persist_status(&vm).await?;
                self.audit("vm.start", vm_id, &vm.project_id, None).await;
                // Started goes out on both fan-out paths: the streaming
                // bus and the cache's VM change feed.
                self.bus.publish(Event::vm(EventType::Started, &vm));
                self.cache.set_vm(&vm).await;
                info!(vm_id = vm_id, node_id = %node_id, "vm started");
                Ok(vm)
            }
            Err(e) => {
                vm.status.state = VmState::Error;
                vm.status.message = Some(e.to_string());
                self.persist_status(&vm).await?;
                self.bus.publish(Event::vm(EventType::Updated, &vm));
                error!(vm_id = vm_id, node_id = %node_id, error = %e, "vm start failed");
                Err(e.into())
            }
        }
    }

    /// HA restart on a surviving host. Leaves the VM in Starting; the
    /// status reconciler confirms Running once the daemon reports it.
    pub async fn failover_start(
        &self,
        vm_id: &str,
        target_node: &str,
        failed_node: &str,
    ) -> Result<()> {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let mut vm = self.repo.vms().get(vm_id).await?;
        vm.status.state = VmState::Starting;
        vm.status.node_id = Some(target_node.to_string());
        vm.status.ip_addresses.clear();
        vm.status.message = Some(format!("HA failover from {}", failed_node));
        self.persist_status(&vm).await?;
        self.bus.publish(Event::vm(EventType::Updated, &vm));

        let daemon = self.daemon_for(target_node).await?;
        match daemon.start_vm(&vm).await {
            Ok(_) => {
                self.audit("vm.failover", vm_id, &vm.project_id, None).await;
                self.bus.publish(Event::vm(EventType::Started, &vm));
                self.cache.set_vm(&vm).await;
                info!(vm_id = vm_id, target = target_node, from = failed_node, "failover started");
                Ok(())
            }
            Err(e) => {
                vm.status.state = VmState::Error;
                vm.status.message = Some(format!("HA failover from {}: {}", failed_node, e));
                self.persist_status(&vm).await?;
                self.bus.publish(Event::vm(EventType::Updated, &vm));
                Err(e.into())
            }
        }
    }

    pub async fn stop(&self, vm_id: &str, graceful: bool) -> Result<VirtualMachine> {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let mut vm = self.repo.vms().get(vm_id).await?;
        if vm.status.state == VmState::Stopped {
            return Ok(vm);
        }
        let node_id = vm
            .status
            .node_id
            .clone()
            .ok_or_else(|| Error::FailedPrecondition(format!("vm {} is not placed", vm_id)))?;

        vm.status.state = VmState::Stopping;
        self.persist_status(&vm).await?;
        self.bus.publish(Event::vm(EventType::Updated, &vm));

        let daemon = self.daemon_for(&node_id).await?;
        match daemon.stop_vm(vm_id, graceful).await {
            Ok(()) => {
                vm.status.state = VmState::Stopped;
                vm.status.ip_addresses.clear();
                vm.status.resources = None;
                self.persist_status(&vm).await?;
                self.audit("vm.stop", vm_id, &vm.project_id, None).await;
                self.bus.publish(Event::vm(EventType::Stopped, &vm));
                Ok(vm)
            }
            Err(e) => {
                vm.status.state = VmState::Error;
                vm.status.message = Some(e.to_string());
                self.persist_status(&vm).await?;
                self.bus.publish(Event::vm(EventType::Updated, &vm));
                Err(e.into())
            }
        }
    }

    pub async fn restart(&self, vm_id: &str) -> Result<VirtualMachine> {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let vm = self.repo.vms().get(vm_id).await?;
        if vm.status.state != VmState::Running {
            return Err(Error::FailedPrecondition(format!(
                "vm {} is not running",
                vm_id
            )));
        }
        let node_id = vm
            .status
            .node_id
            .clone()
            .ok_or_else(|| Error::FailedPrecondition(format!("vm {} is not placed", vm_id)))?;

        let daemon = self.daemon_for(&node_id).await?;
        daemon.restart_vm(vm_id).await.map_err(Error::from)?;
        self.audit("vm.restart", vm_id, &vm.project_id, None).await;
        self.bus.publish(Event::vm(EventType::Updated, &vm));
        Ok(vm)
    }

    pub async fn pause(&self, vm_id: &str) -> Result<VirtualMachine> {
        self.simple_transition(vm_id, VmState::Running, VmState::Paused, "vm.pause", |d, id| {
            Box::pin(async move { d.pause_vm(&id).await })
        })
        .await
    }

    pub async fn resume(&self, vm_id: &str) -> Result<VirtualMachine> {
        self.simple_transition(vm_id, VmState::Paused, VmState::Running, "vm.resume", |d, id| {
            Box::pin(async move { d.resume_vm(&id).await })
        })
        .await
    }

    async fn simple_transition<F>(
        &self,
        vm_id: &str,
        expect: VmState,
        next: VmState,
        action: &str,
        call: F,
    ) -> Result<VirtualMachine>
    where
        F: FnOnce(
            Arc<dyn NodeDaemon>,
            String,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = kestrel_daemon::DaemonResult<()>> + Send>,
        >,
    {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let mut vm = self.repo.vms().get(vm_id).await?;
        if vm.status.state != expect {
            return Err(Error::FailedPrecondition(format!(
                "vm {} is {:?}, expected {:?}",
                vm_id, vm.status.state, expect
            )));
        }
        let node_id = vm
            .status
            .node_id
            .clone()
            .ok_or_else(|| Error::FailedPrecondition(format!("vm {} is not placed", vm_id)))?;

        let daemon = self.daemon_for(&node_id).await?;
        call(daemon, vm_id.to_string()).await.map_err(Error::from)?;

        vm.status.state = next;
        self.persist_status(&vm).await?;
        self.audit(action, vm_id, &vm.project_id, None).await;
        self.bus.publish(Event::vm(EventType::Updated, &vm));
        Ok(vm)
    }

    pub async fn migrate(&self, vm_id: &str, target_node: Option<String>) -> Result<VirtualMachine> {
        let _lock = self
            .coord
            .acquire_lock(&format!("/vms/{}", vm_id))
            .await
            .map_err(coord_err)?;

        let mut vm = self.repo.vms().get(vm_id).await?;
        if vm.status.state != VmState::Running {
            return Err(Error::FailedPrecondition(format!(
                "vm {} is not running",
                vm_id
            )));
        }
        let source = vm
            .status
            .node_id
            .clone()
            .ok_or_else(|| Error::FailedPrecondition(format!("vm {} is not placed", vm_id)))?;

        let target = match target_node {
            Some(node_id) => {
                self.repo.nodes().get(&node_id).await?;
                node_id
            }
            None => {
                let ctx = PlacementContext {
                    exclude: vec![source.clone()],
                    avoid: Vec::new(),
                };
                self.scheduler
                    .select_node(&vm, &ctx)
                    .await
                    .map_err(kestrel_types::Error::from)?
            }
        };
        if target == source {
            return Err(Error::InvalidArgument(
                "migration target equals current node".to_string(),
            ));
        }

        let target_node_row = self.repo.nodes().get(&target).await?;
        let target_addr = kestrel_daemon::addr::normalize_node_addr(&target_node_row.management_ip);

        vm.status.state = VmState::Migrating;
        self.persist_status(&vm).await?;
        self.bus.publish(Event::vm(EventType::Updated, &vm));

        let daemon = self.daemon_for(&source).await?;
        match daemon.migrate_vm(vm_id, &target_addr).await {
            Ok(()) => {
                vm.status.state = VmState::Running;
                vm.status.node_id = Some(target.clone());
                self.persist_status(&vm).await?;
                self.audit("vm.migrate", vm_id, &vm.project_id, None).await;
                self.bus.publish(Event::vm(EventType::Updated, &vm));
                info!(vm_id = vm_id, source = %source, target = %target, "vm migrated");
                Ok(vm)
            }
            Err(e) => {
                // The VM stays on the source; record the failure only.
                vm.status.state = VmState::Running;
                vm.status.node_id = Some(source);
                vm.status.message = Some(format!("migration failed: {}", e));
                self.persist_status(&vm).await?;
                self.bus.publish(Event::vm(EventType::Updated, &vm));
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        parent_id: Option<String>,
    ) -> Result<Snapshot> {
        let vm = self.repo.vms().get(vm_id).await?;
        if self.repo.snapshots().get_by_name(vm_id, name).await.is_ok() {
            return Err(Error::AlreadyExists(format!(
                "snapshot {} already exists for vm {}",
                name, vm_id
            )));
        }
        if let Some(parent) = &parent_id {
            let parent_snapshot = self.repo.snapshots().get(parent).await?;
            if parent_snapshot.vm_id != vm_id {
                return Err(Error::InvalidArgument(format!(
                    "parent snapshot {} belongs to another vm",
                    parent
                )));
            }
        }
        let node_id = vm
            .status
            .node_id
            .clone()
            .ok_or_else(|| Error::FailedPrecondition(format!("vm {} is not placed", vm_id)))?;

        let daemon = self.daemon_for(&node_id).await?;
        let remote = daemon
            .create_snapshot(vm_id, name, parent_id.as_deref())
            .await
            .map_err(Error::from)?;

        let now = Utc::now();
        let snapshot = Snapshot {
            id: remote.id,
            vm_id: vm_id.to_string(),
            name: name.to_string(),
            parent_id,
            state: SnapshotState::Available,
            size_bytes: remote.size_bytes,
            vm_spec: vm.spec.clone(),
            created_at: now,
            updated_at: now,
        };
        self.repo.snapshots().create(&snapshot).await?;
        self.audit("vm.snapshot.create", vm_id, &vm.project_id, None).await;
        Ok(snapshot)
    }

    pub async fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()> {
        let snapshot = self.repo.snapshots().get(snapshot_id).await?;
        if snapshot.vm_id != vm_id {
            return Err(Error::InvalidArgument(format!(
                "snapshot {} belongs to another vm",
                snapshot_id
            )));
        }
        let vm = self.repo.vms().get(vm_id).await?;
        if let Some(node_id) = vm.status.node_id.clone() {
            let daemon = self.daemon_for(&node_id).await?;
            daemon
                .delete_snapshot(vm_id, snapshot_id)
                .await
                .map_err(Error::from)?;
        }
        self.repo.snapshots().delete(snapshot_id).await
    }

    /// Reverts the VM to a snapshot, restoring the captured spec.
    pub async fn revert_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<VirtualMachine> {
        let snapshot = self.repo.snapshots().get(snapshot_id).await?;
        if snapshot.vm_id != vm_id {
            return Err(Error::InvalidArgument(format!(
                "snapshot {} belongs to another vm",
                snapshot_id
            )));
        }
        let mut vm = self.repo.vms().get(vm_id).await?;
        let node_id = vm
            .status
            .node_id
            .clone()
            .ok_or_else(|| Error::FailedPrecondition(format!("vm {} is not placed", vm_id)))?;

        let daemon = self.daemon_for(&node_id).await?;
        daemon
            .revert_snapshot(vm_id, snapshot_id)
            .await
            .map_err(Error::from)?;

        vm.spec = snapshot.vm_spec.clone();
        self.repo.vms().update(&vm).await?;
        self.cache.invalidate_vm(vm_id).await;
        let vm = self.repo.vms().get(vm_id).await?;
        self.audit("vm.snapshot.revert", vm_id, &vm.project_id, None).await;
        self.bus.publish(Event::vm(EventType::Updated, &vm));
        Ok(vm)
    }

    pub async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        self.repo.snapshots().list_by_vm(vm_id).await
    }

    // =========================================================================
    // Watch
    // =========================================================================

    /// Current value plus a live subscription. Subscribing before the read
    /// guarantees no update is lost between the two.
    pub async fn watch_vm(&self, vm_id: &str) -> Result<(VirtualMachine, Subscription)> {
        let sub = self.bus.subscribe(EventFilter::one(ResourceType::Vm, vm_id));
        let current = self.repo.vms().get(vm_id).await?;
        Ok((current, sub))
    }

    pub async fn watch_vms(
        &self,
        project_id: Option<String>,
    ) -> Result<(Vec<VirtualMachine>, Subscription)> {
        let sub = self.bus.subscribe(EventFilter {
            resource_type: ResourceType::Vm,
            resource_id: None,
            event_types: Vec::new(),
            project_id: project_id.clone(),
        });
        let filter = VmFilter {
            project_id,
            ..Default::default()
        };
        let (vms, _) = self.repo.vms().list(&filter, 1000, 0).await?;
        Ok((vms, sub))
    }
}

// =============================================================================
// Status reconciler
// =============================================================================

/// Periodic leader-only reconciler: polls every connected node's daemon,
/// diffs the reported VM status against the repository and publishes the
/// resulting events. Snapshots reconcile through the transactional sync.
pub struct VmStatusReconciler {
    repo: SharedRepository,
    daemons: Arc<DaemonPool>,
    bus: Arc<EventBus>,
    cache: Arc<Cache>,
    leadership: Arc<dyn Leadership>,
    interval: Duration,
}

impl VmStatusReconciler {
    pub fn new(
        repo: SharedRepository,
        daemons: Arc<DaemonPool>,
        bus: Arc<EventBus>,
        cache: Arc<Cache>,
        leadership: Arc<dyn Leadership>,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            daemons,
            bus,
            cache,
            leadership,
            interval,
        }
    }

    /// Supervised loop; exits within one tick of shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "vm status reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.leadership.is_leader() {
                        self.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("vm status reconciler stopping");
                    return;
                }
            }
        }
    }

    pub async fn tick(&self) {
        for node_id in self.daemons.connected_nodes().await {
            let daemon = match self.daemons.get(&node_id).await {
                Some(daemon) => daemon,
                None => continue,
            };
            let vms = match self.repo.vms().list_by_node(&node_id).await {
                Ok(vms) => vms,
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "listing vms for status sync failed");
                    continue;
                }
            };
            for vm in vms {
                self.sync_vm(&daemon, &vm).await;
            }
        }
    }

    async fn sync_vm(&self, daemon: &Arc<dyn NodeDaemon>, vm: &VirtualMachine) {
        match daemon.get_vm_status(&vm.id).await {
            Ok(remote) => {
                let changed = remote.state != vm.status.state
                    || remote.ip_addresses != vm.status.ip_addresses
                    || remote.message != vm.status.message;
                if changed {
                    let previous = vm.status.state;
                    let mut status = vm.status.clone();
                    status.state = remote.state;
                    status.ip_addresses = remote.ip_addresses;
                    status.resources = remote.resources;
                    status.message = remote.message;

                    if let Err(e) = self.repo.vms().update_status(&vm.id, &status).await {
                        warn!(vm_id = %vm.id, error = %e, "status write failed");
                        return;
                    }
                    self.cache.invalidate_vm(&vm.id).await;

                    let mut updated = vm.clone();
                    updated.status = status;
                    let event_type = match remote.state {
                        VmState::Running if previous != VmState::Running => EventType::Started,
                        VmState::Stopped if previous != VmState::Stopped => EventType::Stopped,
                        _ => EventType::Updated,
                    };
                    debug!(vm_id = %vm.id, from = ?previous, to = ?remote.state, "status drift reconciled");
                    self.bus.publish(Event::vm(event_type, &updated));
                }
            }
            Err(e) => {
                debug!(vm_id = %vm.id, error = %e, "daemon status poll failed");
                return;
            }
        }

        // Snapshot reconciliation rides the same poll.
        match daemon.list_vm_snapshots(&vm.id).await {
            Ok(reported) => {
                let delivered: Vec<Snapshot> = reported
                    .into_iter()
                    .map(|s| daemon_snapshot_to_entity(s, vm))
                    .collect();
                if let Err(e) = self
                    .repo
                    .snapshots()
                    .sync_from_hypervisor(&vm.id, &delivered)
                    .await
                {
                    warn!(vm_id = %vm.id, error = %e, "snapshot sync failed");
                }
            }
            Err(e) => debug!(vm_id = %vm.id, error = %e, "snapshot list failed"),
        }
    }
}

fn daemon_snapshot_to_entity(remote: DaemonSnapshot, vm: &VirtualMachine) -> Snapshot {
    Snapshot {
        id: remote.id,
        vm_id: vm.id.clone(),
        name: remote.name,
        parent_id: remote.parent_id,
        state: SnapshotState::Available,
        size_bytes: remote.size_bytes,
        vm_spec: vm.spec.clone(),
        created_at: remote.created_at,
        updated_at: Utc::now(),
    }
}
