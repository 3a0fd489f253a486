//! Volume service.
//!
//! Volumes are carved from pools and attached to at most one VM. The
//! attachment invariant is enforced here: InUse exactly when both the VM
//! and the device path are recorded.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use kestrel_store::{PoolRepo, Repository, VolumeFilter, VolumeRepo};
use kestrel_types::{
    normalize_project_id, Error, Result, Volume, VolumePhase, VolumeSpec, VolumeStatus,
};

use crate::SharedRepository;

/// Request to create a new volume.
#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub pool_id: String,
    pub project_id: String,
    pub name: String,
    pub spec: VolumeSpec,
}

pub struct VolumeService {
    repo: SharedRepository,
}

impl VolumeService {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    pub async fn create(&self, req: CreateVolumeRequest) -> Result<Volume> {
        if req.spec.size_bytes == 0 {
            return Err(Error::InvalidArgument("size_bytes must be positive".to_string()));
        }
        // The pool must exist before a volume can reference it.
        self.repo.pools().get(&req.pool_id).await?;

        let now = Utc::now();
        let volume = Volume {
            id: Uuid::new_v4().to_string(),
            pool_id: req.pool_id,
            project_id: normalize_project_id(&req.project_id),
            name: req.name,
            spec: req.spec,
            status: VolumeStatus {
                phase: VolumePhase::Ready,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        };
        self.repo.volumes().create(&volume).await?;
        info!(volume_id = %volume.id, pool_id = %volume.pool_id, "volume created");
        Ok(volume)
    }

    pub async fn get(&self, volume_id: &str) -> Result<Volume> {
        self.repo.volumes().get(volume_id).await
    }

    pub async fn list(
        &self,
        filter: &VolumeFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Volume>, u64)> {
        self.repo.volumes().list(filter, limit, offset).await
    }

    /// Grow-only resize.
    pub async fn resize(&self, volume_id: &str, new_size_bytes: u64) -> Result<Volume> {
        let mut volume = self.repo.volumes().get(volume_id).await?;
        if new_size_bytes <= volume.spec.size_bytes {
            return Err(Error::InvalidArgument(format!(
                "new size {} must exceed current size {}",
                new_size_bytes, volume.spec.size_bytes
            )));
        }
        volume.spec.size_bytes = new_size_bytes;
        self.repo.volumes().update(&volume).await?;
        self.repo.volumes().get(volume_id).await
    }

    /// Marks the volume attached to a VM at a device path.
    pub async fn attach(
        &self,
        volume_id: &str,
        vm_id: &str,
        device_path: &str,
    ) -> Result<Volume> {
        let mut volume = self.repo.volumes().get(volume_id).await?;
        if volume.status.phase == VolumePhase::InUse {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is already attached to vm {}",
                volume.name,
                volume.status.attached_vm_id.as_deref().unwrap_or("?")
            )));
        }
        if volume.status.phase != VolumePhase::Ready {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is {:?}, expected Ready",
                volume.name, volume.status.phase
            )));
        }
        volume.status.phase = VolumePhase::InUse;
        volume.status.attached_vm_id = Some(vm_id.to_string());
        volume.status.device_path = Some(device_path.to_string());
        self.repo
            .volumes()
            .update_status(volume_id, &volume.status)
            .await?;
        self.repo.volumes().get(volume_id).await
    }

    pub async fn detach(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.repo.volumes().get(volume_id).await?;
        if volume.status.phase != VolumePhase::InUse {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is not attached",
                volume.name
            )));
        }
        volume.status.phase = VolumePhase::Ready;
        volume.status.attached_vm_id = None;
        volume.status.device_path = None;
        self.repo
            .volumes()
            .update_status(volume_id, &volume.status)
            .await?;
        self.repo.volumes().get(volume_id).await
    }

    /// Deleting an attached volume requires force (which detaches first).
    pub async fn delete(&self, volume_id: &str, force: bool) -> Result<()> {
        let volume = self.repo.volumes().get(volume_id).await?;
        if volume.status.phase == VolumePhase::InUse && !force {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is attached to vm {}",
                volume.name,
                volume.status.attached_vm_id.as_deref().unwrap_or("?")
            )));
        }
        self.repo.volumes().delete(volume_id).await?;
        info!(volume_id = volume_id, forced = force, "volume deleted");
        Ok(())
    }
}
