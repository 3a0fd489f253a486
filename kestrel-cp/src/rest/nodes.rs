//! Node registration and health endpoints.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use kestrel_coord::NodeState;
use kestrel_store::{NodeRepo, Repository};
use kestrel_types::{Node, NodeSpec, NodeStatus, Resources, SystemInfo};

use super::{ApiError, AppState};
use crate::bus::{Event, EventType};

/// Node registration payload, presented with a valid registration token.
#[derive(Deserialize, ToSchema)]
pub struct RegisterNodeRequest {
    pub token: String,
    pub hostname: String,
    pub management_ip: String,
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[schema(value_type = Object)]
    pub spec: NodeSpec,
    #[schema(value_type = Option<Object>)]
    pub system_info: Option<SystemInfo>,
}

/// Heartbeat payload pushed by the daemon.
#[derive(Deserialize, ToSchema)]
pub struct HeartbeatRequest {
    #[schema(value_type = Object)]
    pub allocated: Resources,
}

/// Register a compute node
#[utoipa::path(
    post,
    path = "/api/v1/nodes/register",
    request_body = RegisterNodeRequest,
    responses(
        (status = 200, description = "Node registered"),
        (status = 412, description = "Token invalid", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<Json<Node>, ApiError> {
    // Registration is the unauthenticated edge of the API; a sliding
    // window per hostname bounds token guessing.
    let decision = state
        .rate_limiter
        .check(
            &format!("register:{}", req.hostname),
            10,
            std::time::Duration::from_secs(60),
        )
        .await;
    if !decision.allowed {
        return Err(ApiError {
            error: format!("registration rate limit exceeded, retry at {}", decision.reset_at),
            code: 429,
        });
    }

    // Re-registration of a known hostname refreshes the existing row.
    let existing = state.repo.nodes().get_by_hostname(&req.hostname).await.ok();
    let node_id = existing
        .as_ref()
        .map(|n| n.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    state.tokens.validate_and_use(&req.token, &node_id).await?;

    let now = Utc::now();
    let allocatable = Resources {
        cpu_cores: req.spec.cpu_cores,
        memory_mib: req.spec.memory_mib,
    };
    let node = Node {
        id: node_id.clone(),
        hostname: req.hostname,
        management_ip: req.management_ip.clone(),
        cluster_id: req.cluster_id,
        labels: req.labels,
        spec: req.spec,
        status: NodeStatus {
            allocatable,
            allocated: existing
                .as_ref()
                .map(|n| n.status.allocated)
                .unwrap_or_default(),
            system_info: req.system_info,
            last_heartbeat: Some(now),
            ..Default::default()
        },
        created_at: existing.as_ref().map(|n| n.created_at).unwrap_or(now),
        updated_at: now,
    };

    if existing.is_some() {
        state.repo.nodes().update(&node).await?;
    } else {
        state.repo.nodes().create(&node).await?;
    }

    // Presence in the coordination store is lease-bound and best-effort;
    // the repository row is authoritative.
    let _ = state
        .coord
        .register_node(&NodeState {
            node_id: node_id.clone(),
            hostname: node.hostname.clone(),
            address: req.management_ip.clone(),
            registered_at: now,
            last_heartbeat: now,
        })
        .await;

    state.cache.invalidate_node(&node_id).await;
    state
        .bus
        .publish(Event::node(EventType::Created, &node));
    Ok(Json(node))
}

/// List nodes
#[utoipa::path(
    get,
    path = "/api/v1/nodes",
    responses((status = 200, description = "All registered nodes")),
    tag = "nodes"
)]
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let (nodes, _) = state
        .repo
        .nodes()
        .list(&Default::default(), 1000, 0)
        .await?;
    Ok(Json(nodes))
}

/// Get a node
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{id}",
    responses(
        (status = 200, description = "The node"),
        (status = 404, description = "Unknown node", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Node>, ApiError> {
    if let Some(node) = state.cache.get_node(&id).await {
        return Ok(Json(node));
    }
    let node = state.repo.nodes().get(&id).await?;
    state.cache.set_node(&node).await;
    Ok(Json(node))
}

/// Record a node heartbeat
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{id}/heartbeat",
    request_body = HeartbeatRequest,
    responses((status = 200, description = "Heartbeat recorded")),
    tag = "nodes"
)]
pub async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.repo.nodes().update_heartbeat(&id, req.allocated).await?;
    let _ = state.coord.update_node_heartbeat(&id).await;
    state.cache.invalidate_node(&id).await;
    Ok(Json(serde_json::json!({ "acknowledged": true })))
}

/// Deregister a node
#[utoipa::path(
    delete,
    path = "/api/v1/nodes/{id}",
    responses((status = 200, description = "Node removed")),
    tag = "nodes"
)]
pub async fn deregister_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let node = state.repo.nodes().get(&id).await?;
    state.repo.nodes().delete(&id).await?;
    let _ = state.coord.deregister_node(&id).await;
    state.cache.invalidate_node(&id).await;
    state.bus.publish(Event::node(EventType::Deleted, &node));
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Trigger failover for a node
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{id}/failover",
    responses((status = 200, description = "Failover executed")),
    tag = "nodes"
)]
pub async fn manual_failover(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.ha.manual_failover(&id).await?;
    Ok(Json(serde_json::json!({ "failover": id })))
}
