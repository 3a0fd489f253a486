//! Image and download endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use kestrel_store::{ImageFilter, ImageRepo, Repository};
use kestrel_types::{DownloadJob, Image};

use super::{ApiError, AppState};
use crate::downloads::StartDownloadRequest;

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadBody {
    pub catalog_id: String,
    pub name: String,
    pub url: String,
    pub pool_id: String,
    #[serde(default)]
    pub project_id: String,
    pub checksum: Option<String>,
}

#[derive(Deserialize)]
pub struct ListImagesQuery {
    pub project_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Download a catalog image into a pool
#[utoipa::path(
    post,
    path = "/api/v1/images/download",
    request_body = StartDownloadBody,
    responses(
        (status = 200, description = "Download job created"),
        (status = 409, description = "Catalog image already present", body = ApiError),
        (status = 412, description = "No connected nodes", body = ApiError)
    ),
    tag = "images"
)]
pub async fn start_download(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartDownloadBody>,
) -> Result<Json<DownloadJob>, ApiError> {
    let job = state
        .downloads
        .start_download_with_pool(StartDownloadRequest {
            catalog_id: body.catalog_id,
            name: body.name,
            url: body.url,
            pool_id: body.pool_id,
            project_id: body.project_id,
            checksum: body.checksum,
        })
        .await?;
    Ok(Json(job))
}

/// Get a download job
#[utoipa::path(
    get,
    path = "/api/v1/images/download/{job_id}",
    responses(
        (status = 200, description = "The job"),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "images"
)]
pub async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<DownloadJob>, ApiError> {
    Ok(Json(state.downloads.get_job(&job_id).await?))
}

/// List images
#[utoipa::path(
    get,
    path = "/api/v1/images",
    responses((status = 200, description = "Images page")),
    tag = "images"
)]
pub async fn list_images(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListImagesQuery>,
) -> Result<Json<Vec<Image>>, ApiError> {
    let filter = ImageFilter {
        project_id: query.project_id,
        phase: None,
    };
    let (images, _) = state
        .repo
        .images()
        .list(&filter, query.limit.unwrap_or(100), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(images))
}

pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    Ok(Json(state.repo.images().get(&id).await?))
}

pub async fn delete_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.repo.images().delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
