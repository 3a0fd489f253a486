//! Volume endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use kestrel_store::VolumeFilter;
use kestrel_types::{Volume, VolumeSpec};

use super::{ApiError, AppState};
use crate::volumes::CreateVolumeRequest;

#[derive(Deserialize)]
pub struct CreateVolumeBody {
    pub pool_id: String,
    #[serde(default)]
    pub project_id: String,
    pub name: String,
    pub spec: VolumeSpec,
}

#[derive(Deserialize)]
pub struct ListVolumesQuery {
    pub project_id: Option<String>,
    pub pool_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct ResizeBody {
    pub size_bytes: u64,
}

#[derive(Deserialize)]
pub struct AttachBody {
    pub vm_id: String,
    pub device_path: String,
}

#[derive(Deserialize)]
pub struct DeleteVolumeQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn create_volume(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateVolumeBody>,
) -> Result<Json<Volume>, ApiError> {
    let volume = state
        .volumes
        .create(CreateVolumeRequest {
            pool_id: body.pool_id,
            project_id: body.project_id,
            name: body.name,
            spec: body.spec,
        })
        .await?;
    Ok(Json(volume))
}

pub async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListVolumesQuery>,
) -> Result<Json<Vec<Volume>>, ApiError> {
    let filter = VolumeFilter {
        project_id: query.project_id,
        pool_id: query.pool_id,
    };
    let (volumes, _) = state
        .volumes
        .list(&filter, query.limit.unwrap_or(100), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(volumes))
}

pub async fn get_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Volume>, ApiError> {
    Ok(Json(state.volumes.get(&id).await?))
}

pub async fn resize_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<Json<Volume>, ApiError> {
    Ok(Json(state.volumes.resize(&id, body.size_bytes).await?))
}

pub async fn attach_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Result<Json<Volume>, ApiError> {
    Ok(Json(
        state
            .volumes
            .attach(&id, &body.vm_id, &body.device_path)
            .await?,
    ))
}

pub async fn detach_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Volume>, ApiError> {
    Ok(Json(state.volumes.detach(&id).await?))
}

pub async fn delete_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteVolumeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.volumes.delete(&id, query.force).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
