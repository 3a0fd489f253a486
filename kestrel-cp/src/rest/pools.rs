//! Storage pool endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use kestrel_daemon::PoolFileEntry;
use kestrel_types::{PoolBackend, StoragePool};

use super::{ApiError, AppState};
use crate::pools::CreatePoolRequest;

#[derive(Deserialize, ToSchema)]
pub struct CreatePoolBody {
    pub project_id: Option<String>,
    pub name: String,
    #[schema(value_type = Object)]
    pub backend: PoolBackend,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct ListPoolsQuery {
    pub project_id: Option<String>,
}

#[derive(Deserialize)]
pub struct DeletePoolQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Deserialize)]
pub struct FilesQuery {
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

/// Create a storage pool and initialize it on the cohort
#[utoipa::path(
    post,
    path = "/api/v1/pools",
    request_body = CreatePoolBody,
    responses(
        (status = 200, description = "Pool created; phase reflects the init outcome"),
        (status = 409, description = "Name already used", body = ApiError)
    ),
    tag = "pools"
)]
pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePoolBody>,
) -> Result<Json<StoragePool>, ApiError> {
    let pool = state
        .pools
        .create(CreatePoolRequest {
            project_id: body.project_id,
            name: body.name,
            backend: body.backend,
            labels: body.labels,
        })
        .await?;
    Ok(Json(pool))
}

/// List storage pools
#[utoipa::path(
    get,
    path = "/api/v1/pools",
    responses((status = 200, description = "All pools")),
    tag = "pools"
)]
pub async fn list_pools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListPoolsQuery>,
) -> Result<Json<Vec<StoragePool>>, ApiError> {
    Ok(Json(state.pools.list(query.project_id.as_deref()).await?))
}

/// Get a pool with fresh volume counts
#[utoipa::path(
    get,
    path = "/api/v1/pools/{id}",
    responses(
        (status = 200, description = "The pool"),
        (status = 404, description = "Unknown pool", body = ApiError)
    ),
    tag = "pools"
)]
pub async fn get_pool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoragePool>, ApiError> {
    Ok(Json(state.pools.get(&id).await?))
}

/// Delete a pool; rejected while volumes exist unless forced
#[utoipa::path(
    delete,
    path = "/api/v1/pools/{id}",
    responses(
        (status = 200, description = "Pool deleted"),
        (status = 412, description = "Volumes still exist", body = ApiError)
    ),
    tag = "pools"
)]
pub async fn delete_pool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeletePoolQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.pools.delete(&id, query.force).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Assign a pool to a node (idempotent)
#[utoipa::path(
    post,
    path = "/api/v1/pools/{id}/assign/{node_id}",
    responses((status = 200, description = "Updated pool")),
    tag = "pools"
)]
pub async fn assign_pool(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<Json<StoragePool>, ApiError> {
    Ok(Json(state.pools.assign_to_node(&id, &node_id).await?))
}

/// Remove a pool-to-node assignment (idempotent)
#[utoipa::path(
    post,
    path = "/api/v1/pools/{id}/unassign/{node_id}",
    responses((status = 200, description = "Updated pool")),
    tag = "pools"
)]
pub async fn unassign_pool(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<Json<StoragePool>, ApiError> {
    Ok(Json(state.pools.unassign_from_node(&id, &node_id).await?))
}

/// Re-run pool initialization on the connected nodes
#[utoipa::path(
    post,
    path = "/api/v1/pools/{id}/reconnect",
    responses((status = 200, description = "Pool after re-initialization")),
    tag = "pools"
)]
pub async fn reconnect_pool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoragePool>, ApiError> {
    Ok(Json(state.pools.reconnect(&id).await?))
}

pub async fn list_pool_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Vec<PoolFileEntry>>, ApiError> {
    Ok(Json(state.pools.list_files(&id, &query.path).await?))
}
