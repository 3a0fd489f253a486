//! System, cluster, alert, token and audit endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use kestrel_store::{AlertFilter, AlertRepo, AuditFilter, AuditRepo, ClusterRepo, Repository};
use kestrel_types::{
    Alert, AuditEntry, Cluster, ClusterWithStats, RegistrationToken,
};

use super::{ApiError, AppState};

/// Version information.
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/api/v1/version",
    responses((status = 200, description = "Service version", body = VersionInfo)),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Leadership of this instance
#[utoipa::path(
    get,
    path = "/api/v1/leader",
    responses((status = 200, description = "Whether this instance runs the reconcilers")),
    tag = "system"
)]
pub async fn get_leader(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "is_leader": state.leadership.is_leader() }))
}

// =============================================================================
// Clusters
// =============================================================================

#[derive(Deserialize)]
pub struct CreateClusterBody {
    pub name: String,
    #[serde(default)]
    pub ha: Option<kestrel_types::ClusterHaConfig>,
    #[serde(default)]
    pub drs: Option<kestrel_types::DrsConfig>,
}

pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateClusterBody>,
) -> Result<Json<Cluster>, ApiError> {
    let now = Utc::now();
    let cluster = Cluster {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        ha: body.ha.unwrap_or_default(),
        drs: body.drs.unwrap_or_default(),
        defaults: Default::default(),
        created_at: now,
        updated_at: now,
    };
    state.repo.clusters().create(&cluster).await?;
    Ok(Json(cluster))
}

pub async fn list_clusters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Cluster>>, ApiError> {
    Ok(Json(state.repo.clusters().list().await?))
}

pub async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Cluster>, ApiError> {
    Ok(Json(state.repo.clusters().get(&id).await?))
}

pub async fn get_cluster_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ClusterWithStats>, ApiError> {
    Ok(Json(state.clusters.get_with_stats(&id).await?))
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Deserialize)]
pub struct ListAlertsQuery {
    pub resolved: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let filter = AlertFilter {
        resolved: query.resolved,
        ..Default::default()
    };
    let (alerts, _) = state
        .repo
        .alerts()
        .list(&filter, query.limit.unwrap_or(100), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(alerts))
}

pub async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.alerts.resolve(&id).await?;
    Ok(Json(serde_json::json!({ "resolved": id })))
}

// =============================================================================
// Registration tokens
// =============================================================================

#[derive(Deserialize)]
pub struct CreateTokenBody {
    /// Seconds until expiry; omitted means no expiry.
    pub valid_for_secs: Option<u64>,
    #[serde(default)]
    pub max_uses: u32,
}

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTokenBody>,
) -> Result<Json<RegistrationToken>, ApiError> {
    let valid_for = body
        .valid_for_secs
        .map(|secs| chrono::Duration::seconds(secs as i64));
    Ok(Json(state.tokens.create(valid_for, body.max_uses).await?))
}

pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RegistrationToken>>, ApiError> {
    Ok(Json(state.tokens.list().await?))
}

pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.tokens.revoke(&id).await?;
    Ok(Json(serde_json::json!({ "revoked": id })))
}

// =============================================================================
// Audit
// =============================================================================

#[derive(Deserialize)]
pub struct ListAuditQuery {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub actor: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListAuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let filter = AuditFilter {
        resource_type: query.resource_type,
        resource_id: query.resource_id,
        actor: query.actor,
        ..Default::default()
    };
    let (entries, _) = state
        .repo
        .audit()
        .list(&filter, query.limit.unwrap_or(100), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(entries))
}
