//! Storage-pool controller.
//!
//! Creates pools, drives the multi-node initialization protocol, keeps
//! capacity and assignment consistent. Initialization runs sequentially
//! over the cohort and short-circuits on the first success: shared
//! backends (NFS/Ceph/iSCSI) expose identical capacity from every node.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use kestrel_daemon::{DaemonPool, PoolFileEntry};
use kestrel_store::{NodeFilter, NodeRepo, PoolRepo, Repository, VolumeRepo};
use kestrel_types::{
    Error, NodePhase, PoolBackend, PoolCapacity, PoolHostStatus, PoolPhase, Result, StoragePool,
};

use crate::SharedRepository;

/// Request to create a new storage pool.
#[derive(Debug, Clone)]
pub struct CreatePoolRequest {
    pub project_id: Option<String>,
    pub name: String,
    pub backend: PoolBackend,
    pub labels: HashMap<String, String>,
}

pub struct PoolController {
    repo: SharedRepository,
    daemons: Arc<DaemonPool>,
}

impl PoolController {
    pub fn new(repo: SharedRepository, daemons: Arc<DaemonPool>) -> Self {
        Self { repo, daemons }
    }

    /// Persists the pool in Pending and runs initialization synchronously;
    /// the returned pool carries the resulting phase.
    pub async fn create(&self, req: CreatePoolRequest) -> Result<StoragePool> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidArgument("name must not be empty".to_string()));
        }

        let now = Utc::now();
        let pool = StoragePool {
            id: Uuid::new_v4().to_string(),
            project_id: req.project_id,
            name: req.name,
            backend: req.backend,
            assigned_node_ids: Vec::new(),
            labels: req.labels,
            status: Default::default(),
            created_at: now,
            updated_at: now,
        };
        self.repo.pools().create(&pool).await?;
        info!(pool_id = %pool.id, name = %pool.name, backend = pool.backend.kind(), "pool created");

        self.initialize(&pool.id).await?;
        self.repo.pools().get(&pool.id).await
    }

    /// Runs the initialization protocol for an existing pool.
    pub async fn initialize(&self, pool_id: &str) -> Result<()> {
        let pool = self.repo.pools().get(pool_id).await?;
        let mut status = pool.status.clone();

        let cohort = self.initialization_cohort().await;
        if cohort.is_empty() {
            status.phase = PoolPhase::Error;
            status.error_message = Some(format!(
                "No connected nodes available to initialize pool {}",
                pool.name
            ));
            warn!(pool_id = %pool.id, "pool init: empty cohort");
            return self.repo.pools().update_status(pool_id, &status).await;
        }

        let config = serde_json::to_value(&pool.backend)
            .map_err(|e| Error::internal("encode pool backend", e))?;

        // Sequential on purpose: concurrent mounts of the same backend race.
        let mut last_error: Option<String> = None;
        let mut failures = 0usize;
        status.host_statuses.clear();

        for node_id in &cohort {
            let daemon = match self.daemons.get(node_id).await {
                Some(daemon) => daemon,
                None => continue,
            };
            match daemon
                .init_storage_pool(&pool.id, pool.backend.kind(), &config)
                .await
            {
                Ok(capacity) => {
                    // First success wins; shared backends report the same
                    // numbers everywhere.
                    // TODO: aggregate LocalDir capacity across assigned
                    // nodes once the daemon reports per-node stats.
                    status.phase = PoolPhase::Ready;
                    status.capacity = PoolCapacity {
                        total_bytes: capacity.total_bytes,
                        used_bytes: capacity.used_bytes,
                        available_bytes: capacity.total_bytes.saturating_sub(capacity.used_bytes),
                        provisioned_bytes: status.capacity.provisioned_bytes,
                    };
                    status.error_message = None;
                    status.host_statuses.push(PoolHostStatus {
                        node_id: node_id.clone(),
                        healthy: true,
                        message: None,
                    });
                    info!(
                        pool_id = %pool.id,
                        node_id = %node_id,
                        total_bytes = capacity.total_bytes,
                        "pool initialized"
                    );
                    return self.repo.pools().update_status(&pool.id, &status).await;
                }
                Err(e) => {
                    warn!(pool_id = %pool.id, node_id = %node_id, error = %e, "pool init failed on node");
                    status.host_statuses.push(PoolHostStatus {
                        node_id: node_id.clone(),
                        healthy: false,
                        message: Some(e.to_string()),
                    });
                    last_error = Some(e.to_string());
                    failures += 1;
                }
            }
        }

        status.phase = PoolPhase::Error;
        status.error_message = Some(format!(
            "pool initialization failed on {} node(s): {}",
            failures,
            last_error.unwrap_or_else(|| "no nodes attempted".to_string())
        ));
        self.repo.pools().update_status(&pool.id, &status).await
    }

    /// Nodes to attempt initialization on: currently connected daemons,
    /// else every Ready node reachable through its management address.
    async fn initialization_cohort(&self) -> Vec<String> {
        let connected = self.daemons.connected_nodes().await;
        if !connected.is_empty() {
            return connected;
        }

        let ready = match self
            .repo
            .nodes()
            .list(
                &NodeFilter {
                    phase: Some(NodePhase::Ready),
                    ..Default::default()
                },
                1000,
                0,
            )
            .await
        {
            Ok((nodes, _)) => nodes,
            Err(e) => {
                warn!(error = %e, "pool init: listing ready nodes failed");
                return Vec::new();
            }
        };

        let mut cohort = Vec::new();
        for node in ready {
            match self.daemons.connect(&node.id, &node.management_ip).await {
                Ok(_) => cohort.push(node.id),
                Err(e) => warn!(node_id = %node.id, error = %e, "pool init: connect failed"),
            }
        }
        cohort
    }

    /// Re-runs initialization, clearing or setting the error accordingly.
    pub async fn reconnect(&self, pool_id: &str) -> Result<StoragePool> {
        self.initialize(pool_id).await?;
        self.repo.pools().get(pool_id).await
    }

    /// Adds a node to the pool's assignment; idempotent.
    pub async fn assign_to_node(&self, pool_id: &str, node_id: &str) -> Result<StoragePool> {
        self.repo.nodes().get(node_id).await?;
        let mut pool = self.repo.pools().get(pool_id).await?;
        if !pool.assigned_node_ids.iter().any(|n| n == node_id) {
            pool.assigned_node_ids.push(node_id.to_string());
            self.repo.pools().update(&pool).await?;
        }
        self.repo.pools().get(pool_id).await
    }

    /// Removes a node from the pool's assignment; idempotent.
    pub async fn unassign_from_node(&self, pool_id: &str, node_id: &str) -> Result<StoragePool> {
        let mut pool = self.repo.pools().get(pool_id).await?;
        let before = pool.assigned_node_ids.len();
        pool.assigned_node_ids.retain(|n| n != node_id);
        if pool.assigned_node_ids.len() != before {
            self.repo.pools().update(&pool).await?;
        }
        self.repo.pools().get(pool_id).await
    }

    /// Pool with a fresh volume count.
    pub async fn get(&self, pool_id: &str) -> Result<StoragePool> {
        let mut pool = self.repo.pools().get(pool_id).await?;
        let volume_count = self.repo.volumes().count_by_pool(pool_id).await?;
        if pool.status.volume_count != volume_count {
            pool.status.volume_count = volume_count;
            self.repo.pools().update_status(pool_id, &pool.status).await?;
        }
        Ok(pool)
    }

    pub async fn list(&self, project_id: Option<&str>) -> Result<Vec<StoragePool>> {
        self.repo.pools().list(project_id).await
    }

    /// Deleting a pool that still has volumes requires force.
    pub async fn delete(&self, pool_id: &str, force: bool) -> Result<()> {
        let pool = self.repo.pools().get(pool_id).await?;
        let volume_count = self.repo.volumes().count_by_pool(pool_id).await?;
        if volume_count > 0 && !force {
            return Err(Error::FailedPrecondition(format!(
                "pool {} still has {} volume(s)",
                pool.name, volume_count
            )));
        }
        self.repo.pools().delete(pool_id).await?;
        info!(pool_id = pool_id, forced = force, "pool deleted");
        Ok(())
    }

    /// Lists a directory on the pool: assigned nodes are tried first, then
    /// any connected node; the first successful response wins.
    pub async fn list_files(&self, pool_id: &str, path: &str) -> Result<Vec<PoolFileEntry>> {
        let pool = self.repo.pools().get(pool_id).await?;

        let mut candidates = pool.assigned_node_ids.clone();
        for node_id in self.daemons.connected_nodes().await {
            if !candidates.contains(&node_id) {
                candidates.push(node_id);
            }
        }

        let mut last_error: Option<String> = None;
        for node_id in candidates {
            let daemon = match self.daemons.get(&node_id).await {
                Some(daemon) => daemon,
                None => continue,
            };
            match daemon.list_pool_files(pool_id, path).await {
                Ok(entries) => return Ok(entries),
                Err(e) => {
                    warn!(pool_id = pool_id, node_id = %node_id, error = %e, "file listing failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(Error::Unavailable(format!(
            "no node could list files for pool {}: {}",
            pool.name,
            last_error.unwrap_or_else(|| "no connected nodes".to_string())
        )))
    }
}
