//! In-memory daemon test double.
//!
//! Used by unit and integration tests across the workspace: behavior is
//! scripted per method and every call is recorded for assertions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use kestrel_types::{VirtualMachine, VmState};

use crate::pool::DaemonConnector;
use crate::{
    DaemonError, DaemonResult, DaemonSnapshot, DaemonVmStatus, DownloadRequest, NodeDaemon,
    PoolFileEntry, PoolInitResult, RemoteDownloadStatus,
};

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    pool_init_error: Option<String>,
    pool_capacity: Option<PoolInitResult>,
    start_error: Option<String>,
    vm_statuses: HashMap<String, DaemonVmStatus>,
    snapshots: HashMap<String, Vec<DaemonSnapshot>>,
    files: Vec<PoolFileEntry>,
    download_requests: Vec<DownloadRequest>,
    download_polls: HashMap<String, u32>,
    download_scripts: HashMap<String, Vec<RemoteDownloadStatus>>,
    next_job: u32,
}

/// Scriptable [`NodeDaemon`] implementation.
#[derive(Default)]
pub struct FakeDaemon {
    state: Mutex<FakeState>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A test double may panic on a poisoned lock.
        self.state.lock().unwrap()
    }

    /// Every daemon call as `"method vm-or-pool-id"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn fail_pool_init(&self, message: &str) {
        self.lock().pool_init_error = Some(message.to_string());
    }

    pub fn set_pool_capacity(&self, capacity: PoolInitResult) {
        self.lock().pool_capacity = Some(capacity);
    }

    pub fn fail_start(&self, message: &str) {
        self.lock().start_error = Some(message.to_string());
    }

    pub fn set_vm_status(&self, vm_id: &str, status: DaemonVmStatus) {
        self.lock().vm_statuses.insert(vm_id.to_string(), status);
    }

    pub fn set_snapshots(&self, vm_id: &str, snapshots: Vec<DaemonSnapshot>) {
        self.lock().snapshots.insert(vm_id.to_string(), snapshots);
    }

    pub fn set_files(&self, files: Vec<PoolFileEntry>) {
        self.lock().files = files;
    }

    /// Scripts the poll responses for the next started download job.
    /// Without a script, jobs report "downloading" once and then complete.
    pub fn script_next_download(&self, responses: Vec<RemoteDownloadStatus>) {
        let mut state = self.lock();
        let job_id = format!("remote-{}", state.next_job + 1);
        state.download_scripts.insert(job_id, responses);
    }

    pub fn download_requests(&self) -> Vec<DownloadRequest> {
        self.lock().download_requests.clone()
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

fn running_status() -> DaemonVmStatus {
    DaemonVmStatus {
        state: VmState::Running,
        ip_addresses: vec!["192.0.2.10".to_string()],
        resources: None,
        message: None,
    }
}

#[async_trait]
impl NodeDaemon for FakeDaemon {
    async fn init_storage_pool(
        &self,
        pool_id: &str,
        kind: &str,
        _config: &serde_json::Value,
    ) -> DaemonResult<PoolInitResult> {
        self.record(format!("init_storage_pool {} {}", pool_id, kind));
        let state = self.lock();
        if let Some(message) = &state.pool_init_error {
            return Err(DaemonError::Remote {
                status: 500,
                message: message.clone(),
            });
        }
        Ok(state.pool_capacity.unwrap_or(PoolInitResult {
            total_bytes: 100 << 30,
            available_bytes: 80 << 30,
            used_bytes: 20 << 30,
        }))
    }

    async fn list_pool_files(
        &self,
        pool_id: &str,
        path: &str,
    ) -> DaemonResult<Vec<PoolFileEntry>> {
        self.record(format!("list_pool_files {} {}", pool_id, path));
        Ok(self.lock().files.clone())
    }

    async fn start_vm(&self, vm: &VirtualMachine) -> DaemonResult<DaemonVmStatus> {
        self.record(format!("start_vm {}", vm.id));
        let mut state = self.lock();
        if let Some(message) = &state.start_error {
            return Err(DaemonError::Remote {
                status: 500,
                message: message.clone(),
            });
        }
        let status = running_status();
        state.vm_statuses.insert(vm.id.clone(), status.clone());
        Ok(status)
    }

    async fn stop_vm(&self, vm_id: &str, graceful: bool) -> DaemonResult<()> {
        self.record(format!("stop_vm {} graceful={}", vm_id, graceful));
        self.lock().vm_statuses.insert(
            vm_id.to_string(),
            DaemonVmStatus {
                state: VmState::Stopped,
                ip_addresses: Vec::new(),
                resources: None,
                message: None,
            },
        );
        Ok(())
    }

    async fn restart_vm(&self, vm_id: &str) -> DaemonResult<()> {
        self.record(format!("restart_vm {}", vm_id));
        Ok(())
    }

    async fn pause_vm(&self, vm_id: &str) -> DaemonResult<()> {
        self.record(format!("pause_vm {}", vm_id));
        let mut state = self.lock();
        if let Some(status) = state.vm_statuses.get_mut(vm_id) {
            status.state = VmState::Paused;
        }
        Ok(())
    }

    async fn resume_vm(&self, vm_id: &str) -> DaemonResult<()> {
        self.record(format!("resume_vm {}", vm_id));
        let mut state = self.lock();
        if let Some(status) = state.vm_statuses.get_mut(vm_id) {
            status.state = VmState::Running;
        }
        Ok(())
    }

    async fn migrate_vm(&self, vm_id: &str, target_addr: &str) -> DaemonResult<()> {
        self.record(format!("migrate_vm {} -> {}", vm_id, target_addr));
        Ok(())
    }

    async fn get_vm_status(&self, vm_id: &str) -> DaemonResult<DaemonVmStatus> {
        self.record(format!("get_vm_status {}", vm_id));
        self.lock()
            .vm_statuses
            .get(vm_id)
            .cloned()
            .ok_or_else(|| DaemonError::Remote {
                status: 404,
                message: format!("vm {} unknown to daemon", vm_id),
            })
    }

    async fn list_vm_snapshots(&self, vm_id: &str) -> DaemonResult<Vec<DaemonSnapshot>> {
        self.record(format!("list_vm_snapshots {}", vm_id));
        Ok(self.lock().snapshots.get(vm_id).cloned().unwrap_or_default())
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> DaemonResult<DaemonSnapshot> {
        self.record(format!("create_snapshot {} {}", vm_id, name));
        let snapshot = DaemonSnapshot {
            id: format!("snap-{}-{}", vm_id, name),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            size_bytes: 1 << 20,
            created_at: Utc::now(),
        };
        self.lock()
            .snapshots
            .entry(vm_id.to_string())
            .or_default()
            .push(snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> DaemonResult<()> {
        self.record(format!("delete_snapshot {} {}", vm_id, snapshot_id));
        if let Some(list) = self.lock().snapshots.get_mut(vm_id) {
            list.retain(|s| s.id != snapshot_id);
        }
        Ok(())
    }

    async fn revert_snapshot(&self, vm_id: &str, snapshot_id: &str) -> DaemonResult<()> {
        self.record(format!("revert_snapshot {} {}", vm_id, snapshot_id));
        Ok(())
    }

    async fn start_image_download(&self, req: &DownloadRequest) -> DaemonResult<String> {
        let mut state = self.lock();
        state.next_job += 1;
        let job_id = format!("remote-{}", state.next_job);
        state.download_requests.push(req.clone());
        state.calls.push(format!("start_image_download {}", req.image_id));
        Ok(job_id)
    }

    async fn get_download_status(
        &self,
        remote_job_id: &str,
    ) -> DaemonResult<RemoteDownloadStatus> {
        let mut state = self.lock();
        state.calls.push(format!("get_download_status {}", remote_job_id));

        if let Some(script) = state.download_scripts.get_mut(remote_job_id) {
            if script.len() > 1 {
                return Ok(script.remove(0));
            }
            if let Some(last) = script.first() {
                return Ok(last.clone());
            }
        }

        // Default: one "downloading" poll, then completed.
        let polls = state.download_polls.entry(remote_job_id.to_string()).or_insert(0);
        *polls += 1;
        if *polls == 1 {
            Ok(RemoteDownloadStatus {
                state: "downloading".to_string(),
                progress_percent: 50,
                bytes_downloaded: 512 << 20,
                total_bytes: 1 << 30,
                path: None,
                size_bytes: 0,
                error: None,
            })
        } else {
            Ok(RemoteDownloadStatus {
                state: "completed".to_string(),
                progress_percent: 100,
                bytes_downloaded: 1 << 30,
                total_bytes: 1 << 30,
                path: Some("/mnt/pool/cloud-images/image.qcow2".to_string()),
                size_bytes: 1 << 30,
                error: None,
            })
        }
    }
}

/// Connector handing out fakes.
///
/// With no mapping it builds a fresh [`FakeDaemon`] per connect; explicit
/// mappings pin a shared instance per node, and listed node ids can be
/// made unreachable.
#[derive(Default)]
pub struct FakeConnector {
    daemons: Mutex<HashMap<String, Arc<FakeDaemon>>>,
    unreachable: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn with_daemon(node_id: &str, daemon: Arc<FakeDaemon>) -> Self {
        let connector = Self::default();
        connector
            .daemons
            .lock()
            .unwrap()
            .insert(node_id.to_string(), daemon);
        connector
    }

    pub fn add_daemon(&self, node_id: &str, daemon: Arc<FakeDaemon>) {
        self.daemons
            .lock()
            .unwrap()
            .insert(node_id.to_string(), daemon);
    }

    /// Makes connect attempts for `node_id` fail with a transport error.
    pub fn set_unreachable(&self, node_id: &str) {
        self.unreachable.lock().unwrap().push(node_id.to_string());
    }

    /// Allows previously unreachable connects to succeed again.
    pub fn set_reachable(&self, node_id: &str) {
        self.unreachable.lock().unwrap().retain(|n| n != node_id);
    }

    /// The fake currently registered for a node, if any.
    pub fn daemon(&self, node_id: &str) -> Option<Arc<FakeDaemon>> {
        self.daemons.lock().unwrap().get(node_id).cloned()
    }
}

impl DaemonConnector for FakeConnector {
    fn connect(&self, node_id: &str, _addr: &str) -> DaemonResult<Arc<dyn NodeDaemon>> {
        if self.unreachable.lock().unwrap().iter().any(|n| n == node_id) {
            return Err(DaemonError::Transport(format!(
                "connection refused: {}",
                node_id
            )));
        }
        let mut daemons = self.daemons.lock().unwrap();
        let daemon = daemons
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(FakeDaemon::new()));
        Ok(Arc::clone(daemon) as Arc<dyn NodeDaemon>)
    }
}
