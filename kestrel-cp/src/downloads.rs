//! Image download manager.
//!
//! The canonical path routes the byte transfer to a node that owns the
//! destination pool: the daemon does the download and this manager tracks
//! the remote job until it reaches a terminal state, then reconciles the
//! Image row. The local streaming downloader is a dev-mode fallback for
//! deployments without a daemon pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use kestrel_daemon::{DaemonPool, DownloadRequest};
use kestrel_store::{DownloadJobRepo, ImageRepo, NodeRepo, PoolRepo, Repository};
use kestrel_types::{
    normalize_folder_path, normalize_project_id, DownloadJob, DownloadState, Error, Image,
    ImagePhase, ImageSpec, ImageStatus, PoolBackend, Result, StoragePool,
};

use crate::SharedRepository;

/// Default progress-poll cadence against the remote daemon.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Request to download a catalog image into a pool.
#[derive(Debug, Clone)]
pub struct StartDownloadRequest {
    pub catalog_id: String,
    pub name: String,
    pub url: String,
    pub pool_id: String,
    pub project_id: String,
    pub checksum: Option<String>,
}

pub struct DownloadManager {
    repo: SharedRepository,
    daemons: Arc<DaemonPool>,
    poll_interval: Duration,
    /// Cancellation handles for dev-mode local downloads.
    running_local: RwLock<HashMap<String, oneshot::Sender<()>>>,
    dev_mode: bool,
}

fn target_dir_for(pool: &StoragePool) -> String {
    let base = match &pool.backend {
        PoolBackend::Nfs { mount_point, .. } => mount_point.clone(),
        PoolBackend::LocalDir { path } => path.clone(),
        _ => format!("/var/lib/kestrel/pools/{}", pool.id),
    };
    format!("{}/cloud-images", base.trim_end_matches('/'))
}

fn map_remote_state(raw: &str) -> Option<DownloadState> {
    match raw {
        "pending" => Some(DownloadState::Pending),
        "downloading" => Some(DownloadState::Downloading),
        "converting" => Some(DownloadState::Converting),
        "completed" => Some(DownloadState::Completed),
        "failed" => Some(DownloadState::Failed),
        _ => None,
    }
}

impl DownloadManager {
    pub fn new(repo: SharedRepository, daemons: Arc<DaemonPool>, dev_mode: bool) -> Self {
        Self {
            repo,
            daemons,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running_local: RwLock::new(HashMap::new()),
            dev_mode,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    // =========================================================================
    // Job creation
    // =========================================================================

    /// Creates the image record and routes the download to a node owning
    /// the pool. Duplicate catalog entries are rejected unless the
    /// previous attempt failed.
    pub async fn start_download_with_pool(
        &self,
        req: StartDownloadRequest,
    ) -> Result<DownloadJob> {
        let existing = self
            .repo
            .images()
            .find_by_catalog_ids(std::slice::from_ref(&req.catalog_id))
            .await?;
        if let Some(image) = existing.get(&req.catalog_id) {
            if image.status.phase == ImagePhase::Error {
                // A failed record does not block a retry.
                info!(image_id = %image.id, "removing failed image before re-download");
                self.repo.images().delete(&image.id).await?;
            } else {
                return Err(Error::AlreadyExists(format!(
                    "image {} already exists for catalog {} (phase {:?})",
                    image.id, req.catalog_id, image.status.phase
                )));
            }
        }

        let pool = self.repo.pools().get(&req.pool_id).await?;
        let target_dir = target_dir_for(&pool);

        let now = Utc::now();
        let image = Image {
            id: Uuid::new_v4().to_string(),
            project_id: normalize_project_id(&req.project_id),
            name: req.name.clone(),
            spec: ImageSpec {
                catalog_id: Some(req.catalog_id.clone()),
                source_url: Some(req.url.clone()),
                ..Default::default()
            },
            status: ImageStatus {
                phase: ImagePhase::Pending,
                storage_pool_id: Some(pool.id.clone()),
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        };
        self.repo.images().create(&image).await?;

        let mut job = DownloadJob {
            id: Uuid::new_v4().to_string(),
            image_id: image.id.clone(),
            catalog_id: req.catalog_id.clone(),
            pool_id: pool.id.clone(),
            node_id: None,
            remote_job_id: None,
            target_path: Some(target_dir.clone()),
            state: DownloadState::Pending,
            progress_percent: 0,
            bytes_downloaded: 0,
            total_bytes: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.download_jobs().create(&job).await?;

        if self.dev_mode {
            self.start_local(&job, &image, &req, &target_dir).await?;
            return self.repo.download_jobs().get(&job.id).await;
        }

        let node_id = match self.select_node(&pool).await {
            Ok(node_id) => node_id,
            Err(e) => {
                job.state = DownloadState::Failed;
                job.error = Some(e.to_string());
                self.repo.download_jobs().update(&job).await?;
                self.fail_image(&image.id, &e.to_string()).await;
                return Err(e);
            }
        };

        let daemon = self.daemons.get_or_error(&node_id).await?;
        let remote_req = DownloadRequest {
            catalog_id: req.catalog_id.clone(),
            image_id: image.id.clone(),
            url: req.url.clone(),
            target_dir,
            pool_id: pool.id.clone(),
            checksum: req.checksum.clone(),
        };
        match daemon.start_image_download(&remote_req).await {
            Ok(remote_job_id) => {
                job.node_id = Some(node_id.clone());
                job.remote_job_id = Some(remote_job_id);
                job.state = DownloadState::Downloading;
                self.repo.download_jobs().update(&job).await?;

                let mut status = image.status.clone();
                status.phase = ImagePhase::Downloading;
                status.node_id = Some(node_id.clone());
                self.repo.images().update_status(&image.id, &status).await?;

                info!(
                    job_id = %job.id,
                    image_id = %image.id,
                    node_id = %node_id,
                    catalog = %req.catalog_id,
                    "download routed to node"
                );
                Ok(job)
            }
            Err(e) => {
                job.state = DownloadState::Failed;
                job.error = Some(e.to_string());
                self.repo.download_jobs().update(&job).await?;
                self.fail_image(&image.id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Routed-node selection: first connected assigned node, else connect
    /// the first assigned node by management address, else any connected
    /// node, else a user-visible failure.
    async fn select_node(&self, pool: &StoragePool) -> Result<String> {
        let connected = self.daemons.connected_nodes().await;

        for node_id in &pool.assigned_node_ids {
            if connected.contains(node_id) {
                return Ok(node_id.clone());
            }
        }
        for node_id in &pool.assigned_node_ids {
            if let Ok(node) = self.repo.nodes().get(node_id).await {
                if self
                    .daemons
                    .connect(node_id, &node.management_ip)
                    .await
                    .is_ok()
                {
                    return Ok(node_id.clone());
                }
            }
        }
        if let Some(node_id) = connected.first() {
            return Ok(node_id.clone());
        }
        Err(Error::FailedPrecondition(
            "No connected nodes available to download image".to_string(),
        ))
    }

    async fn fail_image(&self, image_id: &str, message: &str) {
        let status = match self.repo.images().get(image_id).await {
            Ok(image) => {
                let mut status = image.status;
                status.phase = ImagePhase::Error;
                status.message = Some(message.to_string());
                status
            }
            Err(e) => {
                warn!(image_id = image_id, error = %e, "image lookup for failure update");
                return;
            }
        };
        if let Err(e) = self.repo.images().update_status(image_id, &status).await {
            warn!(image_id = image_id, error = %e, "image failure update");
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<DownloadJob> {
        self.repo.download_jobs().get(job_id).await
    }

    // =========================================================================
    // Progress poller
    // =========================================================================

    /// Supervised poll loop; exits within one tick of shutdown.
    pub async fn run_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "download poller started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_jobs().await,
                _ = shutdown.changed() => {
                    info!("download poller stopping");
                    return;
                }
            }
        }
    }

    /// One poll pass over the active remote jobs.
    pub async fn poll_jobs(&self) {
        let jobs = match self.repo.download_jobs().list_active().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "listing active downloads failed");
                return;
            }
        };

        for job in jobs {
            let (node_id, remote_job_id) = match (&job.node_id, &job.remote_job_id) {
                (Some(node), Some(remote)) => (node.clone(), remote.clone()),
                _ => continue, // local dev jobs update themselves
            };
            let daemon = match self.daemons.get(&node_id).await {
                Some(daemon) => daemon,
                None => continue,
            };
            match daemon.get_download_status(&remote_job_id).await {
                Ok(remote) => self.apply_remote_status(job, &remote).await,
                Err(e) => warn!(job_id = %job.id, error = %e, "download status poll failed"),
            }
        }
    }

    async fn apply_remote_status(
        &self,
        mut job: DownloadJob,
        remote: &kestrel_daemon::RemoteDownloadStatus,
    ) {
        let Some(next) = map_remote_state(&remote.state) else {
            warn!(job_id = %job.id, state = %remote.state, "unknown remote download state");
            return;
        };

        if next != job.state && !job.state.can_transition(next) {
            warn!(
                job_id = %job.id,
                from = ?job.state,
                to = ?next,
                "ignoring illegal download transition"
            );
            return;
        }

        job.state = next;
        job.progress_percent = remote.progress_percent;
        job.bytes_downloaded = remote.bytes_downloaded;
        job.total_bytes = remote.total_bytes;
        job.error = remote.error.clone();
        if let Err(e) = self.repo.download_jobs().update(&job).await {
            warn!(job_id = %job.id, error = %e, "download job update failed");
            return;
        }

        match next {
            DownloadState::Completed => {
                let mut status = match self.repo.images().get(&job.image_id).await {
                    Ok(image) => image.status,
                    Err(e) => {
                        warn!(image_id = %job.image_id, error = %e, "image lookup after download");
                        return;
                    }
                };
                status.phase = ImagePhase::Ready;
                status.progress_percent = 100;
                status.size_bytes = remote.size_bytes.max(remote.bytes_downloaded);
                status.node_id = job.node_id.clone();
                status.storage_pool_id = Some(job.pool_id.clone());
                status.path = remote.path.clone();
                status.folder_path = remote
                    .path
                    .as_deref()
                    .and_then(|p| Path::new(p).parent())
                    .and_then(|dir| normalize_folder_path(&dir.to_string_lossy()).ok());
                status.filename = remote
                    .path
                    .as_deref()
                    .and_then(|p| Path::new(p).file_name())
                    .map(|f| f.to_string_lossy().to_string());
                if let Err(e) = self.repo.images().update_status(&job.image_id, &status).await {
                    warn!(image_id = %job.image_id, error = %e, "image completion update");
                } else {
                    info!(job_id = %job.id, image_id = %job.image_id, "download completed");
                }
            }
            DownloadState::Failed => {
                let message = remote
                    .error
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string());
                self.fail_image(&job.image_id, &message).await;
                error!(job_id = %job.id, image_id = %job.image_id, error = %message, "download failed");
            }
            _ => {
                let mut status = match self.repo.images().get(&job.image_id).await {
                    Ok(image) => image.status,
                    Err(_) => return,
                };
                status.phase = match next {
                    DownloadState::Converting => ImagePhase::Converting,
                    _ => ImagePhase::Downloading,
                };
                status.progress_percent = remote.progress_percent;
                let _ = self.repo.images().update_status(&job.image_id, &status).await;
            }
        }
    }

    // =========================================================================
    // Dev-mode local downloader
    // =========================================================================

    /// Streams the URL straight to disk when no daemon pool is configured.
    async fn start_local(
        &self,
        job: &DownloadJob,
        image: &Image,
        req: &StartDownloadRequest,
        target_dir: &str,
    ) -> Result<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running_local
            .write()
            .await
            .insert(job.id.clone(), cancel_tx);

        let repo = Arc::clone(&self.repo);
        let job_id = job.id.clone();
        let image_id = image.id.clone();
        let url = req.url.clone();
        let target_path = format!(
            "{}/{}.img",
            target_dir.trim_end_matches('/'),
            image.id
        );

        tokio::spawn(async move {
            let result = run_local_download(&repo, &job_id, &image_id, &url, &target_path, cancel_rx)
                .await;
            if let Err(e) = result {
                error!(job_id = %job_id, error = %e, "local download failed");
                let _ = fail_job(&repo, &job_id, &image_id, &e.to_string()).await;
            }
        });
        Ok(())
    }

    /// Cancels a running dev-mode download.
    pub async fn cancel_local(&self, job_id: &str) -> bool {
        match self.running_local.write().await.remove(job_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

async fn fail_job(
    repo: &SharedRepository,
    job_id: &str,
    image_id: &str,
    message: &str,
) -> Result<()> {
    let mut job = repo.download_jobs().get(job_id).await?;
    if !job.state.is_terminal() {
        job.state = DownloadState::Failed;
        job.error = Some(message.to_string());
        repo.download_jobs().update(&job).await?;
    }
    let image = repo.images().get(image_id).await?;
    let mut status = image.status;
    status.phase = ImagePhase::Error;
    status.message = Some(message.to_string());
    repo.images().update_status(image_id, &status).await
}

async fn run_local_download(
    repo: &SharedRepository,
    job_id: &str,
    image_id: &str,
    url: &str,
    target_path: &str,
    mut cancel_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let mut job = repo.download_jobs().get(job_id).await?;
    job.state = DownloadState::Downloading;
    repo.download_jobs().update(&job).await?;

    let mut status = repo.images().get(image_id).await?.status;
    status.phase = ImagePhase::Downloading;
    repo.images().update_status(image_id, &status).await?;

    if let Some(parent) = Path::new(target_path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::internal("create image directory", e))?;
    }

    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::unavailable("image download", e))?;
    if !response.status().is_success() {
        return Err(Error::Unavailable(format!(
            "image download: HTTP {}",
            response.status()
        )));
    }
    let total_bytes = response.content_length().unwrap_or(0);

    let mut file = tokio::fs::File::create(target_path)
        .await
        .map_err(|e| Error::internal("create image file", e))?;

    let mut response = response;
    let mut bytes_downloaded: u64 = 0;
    let mut last_update = tokio::time::Instant::now();

    // Every exit below the file creation removes the partial file.
    loop {
        if cancel_rx.try_recv().is_ok() {
            drop(file);
            let _ = tokio::fs::remove_file(target_path).await;
            info!(job_id = job_id, "local download cancelled");
            return fail_job(repo, job_id, image_id, "cancelled").await;
        }

        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(target_path).await;
                return Err(Error::unavailable("image download read", e));
            }
        };
        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            let _ = tokio::fs::remove_file(target_path).await;
            return Err(Error::internal("image write", e));
        }
        bytes_downloaded += chunk.len() as u64;

        // Progress every second.
        if last_update.elapsed() >= Duration::from_secs(1) {
            job.bytes_downloaded = bytes_downloaded;
            job.total_bytes = total_bytes;
            job.progress_percent = if total_bytes > 0 {
                ((bytes_downloaded * 100) / total_bytes) as u32
            } else {
                0
            };
            if let Err(e) = repo.download_jobs().update(&job).await {
                drop(file);
                let _ = tokio::fs::remove_file(target_path).await;
                return Err(e);
            }
            last_update = tokio::time::Instant::now();
        }
    }

    if let Err(e) = file.flush().await {
        drop(file);
        let _ = tokio::fs::remove_file(target_path).await;
        return Err(Error::internal("image flush", e));
    }

    job.state = DownloadState::Completed;
    job.bytes_downloaded = bytes_downloaded;
    job.total_bytes = total_bytes.max(bytes_downloaded);
    job.progress_percent = 100;
    repo.download_jobs().update(&job).await?;

    let mut status = repo.images().get(image_id).await?.status;
    status.phase = ImagePhase::Ready;
    status.size_bytes = bytes_downloaded;
    status.progress_percent = 100;
    status.path = Some(target_path.to_string());
    status.filename = Path::new(target_path)
        .file_name()
        .map(|f| f.to_string_lossy().to_string());
    repo.images().update_status(image_id, &status).await?;

    info!(job_id = job_id, bytes = bytes_downloaded, "local download completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_dir_per_backend() {
        let nfs = StoragePool {
            id: "pool-1".to_string(),
            project_id: None,
            name: "nfs".to_string(),
            backend: PoolBackend::Nfs {
                server: "fs1".to_string(),
                export_path: "/exports".to_string(),
                version: "4.1".to_string(),
                options: None,
                mount_point: "/mnt/vms/".to_string(),
            },
            assigned_node_ids: Vec::new(),
            labels: Default::default(),
            status: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(target_dir_for(&nfs), "/mnt/vms/cloud-images");

        let mut local = nfs.clone();
        local.backend = PoolBackend::LocalDir {
            path: "/data/pool".to_string(),
        };
        assert_eq!(target_dir_for(&local), "/data/pool/cloud-images");

        let mut ceph = nfs.clone();
        ceph.backend = PoolBackend::CephRbd {
            monitors: vec!["mon1".to_string()],
            user: "admin".to_string(),
            keyring: String::new(),
            secret_uuid: String::new(),
            namespace: None,
            pool_name: "rbd".to_string(),
        };
        assert_eq!(
            target_dir_for(&ceph),
            "/var/lib/kestrel/pools/pool-1/cloud-images"
        );
    }

    #[test]
    fn test_remote_state_mapping() {
        assert_eq!(map_remote_state("downloading"), Some(DownloadState::Downloading));
        assert_eq!(map_remote_state("completed"), Some(DownloadState::Completed));
        assert_eq!(map_remote_state("bogus"), None);
    }
}
