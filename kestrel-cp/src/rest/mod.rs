//! REST API.
//!
//! Thin handlers over the services; errors map onto the taxonomy's HTTP
//! codes via the `{error, code}` envelope. Watch endpoints stream SSE.

mod images;
mod misc;
mod nodes;
mod pools;
mod vms;
mod volumes;
mod watch;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use kestrel_coord::CoordStore;

use crate::alerts::AlertService;
use crate::bus::EventBus;
use crate::cache::{Cache, RateLimiter};
use crate::cluster::ClusterService;
use crate::downloads::DownloadManager;
use crate::ha::HaReconciler;
use crate::pools::PoolController;
use crate::tokens::TokenService;
use crate::vms::VmService;
use crate::volumes::VolumeService;
use crate::{Leadership, SharedRepository};

/// Shared application state.
pub struct AppState {
    pub repo: SharedRepository,
    pub vms: Arc<VmService>,
    pub volumes: Arc<VolumeService>,
    pub pools: Arc<PoolController>,
    pub downloads: Arc<DownloadManager>,
    pub clusters: Arc<ClusterService>,
    pub alerts: Arc<AlertService>,
    pub tokens: Arc<TokenService>,
    pub ha: Arc<HaReconciler>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<Cache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub coord: Arc<dyn CoordStore>,
    pub leadership: Arc<dyn Leadership>,
}

/// API error envelope.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<kestrel_types::Error> for ApiError {
    fn from(e: kestrel_types::Error) -> Self {
        ApiError {
            code: e.http_code(),
            error: e.to_string(),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Kestrel Control Plane",
        version = "0.1.0",
        description = "Declarative VM placement and reconciliation for KVM/libvirt clusters."
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "nodes", description = "Compute node registration and health"),
        (name = "vms", description = "Virtual machine lifecycle"),
        (name = "pools", description = "Storage pool management"),
        (name = "images", description = "Image catalog and downloads"),
        (name = "clusters", description = "Cluster policies and statistics"),
        (name = "alerts", description = "Operator alerts"),
        (name = "tokens", description = "Node registration tokens"),
        (name = "audit", description = "Audit trail")
    ),
    paths(
        misc::get_version,
        misc::get_leader,
        nodes::register_node,
        nodes::list_nodes,
        nodes::get_node,
        nodes::node_heartbeat,
        nodes::deregister_node,
        nodes::manual_failover,
        vms::create_vm,
        vms::list_vms,
        vms::get_vm,
        vms::update_vm_spec,
        vms::delete_vm,
        vms::start_vm,
        vms::stop_vm,
        pools::create_pool,
        pools::list_pools,
        pools::get_pool,
        pools::delete_pool,
        pools::assign_pool,
        pools::unassign_pool,
        pools::reconnect_pool,
        images::start_download,
        images::get_download,
        images::list_images,
    ),
    components(schemas(
        ApiError,
        misc::VersionInfo,
        nodes::RegisterNodeRequest,
        nodes::HeartbeatRequest,
        vms::CreateVmBody,
        vms::StartVmBody,
        vms::StopVmBody,
        pools::CreatePoolBody,
        images::StartDownloadBody,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // System
        .route("/version", get(misc::get_version))
        .route("/leader", get(misc::get_leader))
        // Nodes
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/register", post(nodes::register_node))
        .route("/nodes/watch", get(watch::watch_nodes))
        .route("/nodes/{id}", get(nodes::get_node))
        .route("/nodes/{id}", delete(nodes::deregister_node))
        .route("/nodes/{id}/heartbeat", post(nodes::node_heartbeat))
        .route("/nodes/{id}/failover", post(nodes::manual_failover))
        // VMs
        .route("/vms", get(vms::list_vms))
        .route("/vms", post(vms::create_vm))
        .route("/vms/watch", get(watch::watch_vms))
        .route("/vms/{id}", get(vms::get_vm))
        .route("/vms/{id}", put(vms::update_vm_spec))
        .route("/vms/{id}", delete(vms::delete_vm))
        .route("/vms/{id}/start", post(vms::start_vm))
        .route("/vms/{id}/stop", post(vms::stop_vm))
        .route("/vms/{id}/restart", post(vms::restart_vm))
        .route("/vms/{id}/pause", post(vms::pause_vm))
        .route("/vms/{id}/resume", post(vms::resume_vm))
        .route("/vms/{id}/migrate", post(vms::migrate_vm))
        .route("/vms/{id}/watch", get(watch::watch_vm))
        .route("/vms/{id}/snapshots", get(vms::list_snapshots))
        .route("/vms/{id}/snapshots", post(vms::create_snapshot))
        .route("/vms/{id}/snapshots/{snapshot_id}", delete(vms::delete_snapshot))
        .route(
            "/vms/{id}/snapshots/{snapshot_id}/revert",
            post(vms::revert_snapshot),
        )
        // Volumes
        .route("/volumes", get(volumes::list_volumes))
        .route("/volumes", post(volumes::create_volume))
        .route("/volumes/{id}", get(volumes::get_volume))
        .route("/volumes/{id}", delete(volumes::delete_volume))
        .route("/volumes/{id}/resize", post(volumes::resize_volume))
        .route("/volumes/{id}/attach", post(volumes::attach_volume))
        .route("/volumes/{id}/detach", post(volumes::detach_volume))
        // Storage pools
        .route("/pools", get(pools::list_pools))
        .route("/pools", post(pools::create_pool))
        .route("/pools/{id}", get(pools::get_pool))
        .route("/pools/{id}", delete(pools::delete_pool))
        .route("/pools/{id}/assign/{node_id}", post(pools::assign_pool))
        .route("/pools/{id}/unassign/{node_id}", post(pools::unassign_pool))
        .route("/pools/{id}/reconnect", post(pools::reconnect_pool))
        .route("/pools/{id}/files", get(pools::list_pool_files))
        // Images & downloads
        .route("/images", get(images::list_images))
        .route("/images/{id}", get(images::get_image))
        .route("/images/{id}", delete(images::delete_image))
        .route("/images/download", post(images::start_download))
        .route("/images/download/{job_id}", get(images::get_download))
        // Clusters
        .route("/clusters", get(misc::list_clusters))
        .route("/clusters", post(misc::create_cluster))
        .route("/clusters/{id}", get(misc::get_cluster))
        .route("/clusters/{id}/stats", get(misc::get_cluster_stats))
        // Alerts
        .route("/alerts", get(misc::list_alerts))
        .route("/alerts/watch", get(watch::watch_alerts))
        .route("/alerts/{id}/resolve", post(misc::resolve_alert))
        // Registration tokens
        .route("/tokens", get(misc::list_tokens))
        .route("/tokens", post(misc::create_token))
        .route("/tokens/{id}", delete(misc::revoke_token))
        // Audit
        .route("/audit", get(misc::list_audit));

    Router::new()
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .nest("/api/v1", api_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
