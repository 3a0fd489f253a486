//! VM lifecycle endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use kestrel_store::VmFilter;
use kestrel_types::{Snapshot, VirtualMachine, VmSpec, VmState};

use super::{ApiError, AppState};
use crate::vms::CreateVmRequest;

#[derive(Deserialize, ToSchema)]
pub struct CreateVmBody {
    #[serde(default)]
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[schema(value_type = Object)]
    pub spec: VmSpec,
    pub created_by: Option<String>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct StartVmBody {
    pub node_id: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct StopVmBody {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

fn default_graceful() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ListVmsQuery {
    pub project_id: Option<String>,
    pub node_id: Option<String>,
    /// Comma-separated states, e.g. "Running,Starting".
    pub states: Option<String>,
    pub name_contains: Option<String>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Serialize)]
pub struct VmListPage {
    pub items: Vec<VirtualMachine>,
    pub next_cursor: Option<String>,
    pub total: u64,
}

#[derive(Deserialize)]
pub struct SnapshotBody {
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct MigrateBody {
    pub node_id: Option<String>,
}

fn parse_states(raw: &str) -> Result<Vec<VmState>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
                ApiError::from(kestrel_types::Error::InvalidArgument(format!(
                    "unknown vm state {:?}",
                    s
                )))
            })
        })
        .collect()
}

/// Create a VM
#[utoipa::path(
    post,
    path = "/api/v1/vms",
    request_body = CreateVmBody,
    responses(
        (status = 200, description = "VM created"),
        (status = 409, description = "Name already used in project", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateVmBody>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let vm = state
        .vms
        .create(CreateVmRequest {
            project_id: body.project_id,
            name: body.name,
            description: body.description,
            labels: body.labels,
            spec: body.spec,
            created_by: body.created_by,
        })
        .await?;
    Ok(Json(vm))
}

/// List VMs with cursor pagination
#[utoipa::path(
    get,
    path = "/api/v1/vms",
    responses((status = 200, description = "Page of VMs, newest first")),
    tag = "vms"
)]
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListVmsQuery>,
) -> Result<Json<VmListPage>, ApiError> {
    let states = match &query.states {
        Some(raw) => Some(parse_states(raw)?),
        None => None,
    };
    let filter = VmFilter {
        project_id: query.project_id,
        node_id: query.node_id,
        states,
        name_contains: query.name_contains,
    };
    let page = state
        .vms
        .list(&filter, query.limit.unwrap_or(50), query.cursor.as_deref())
        .await?;
    Ok(Json(VmListPage {
        items: page.items,
        next_cursor: page.next_cursor,
        total: page.total,
    }))
}

/// Get a VM
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}",
    responses(
        (status = 200, description = "The VM"),
        (status = 404, description = "Unknown VM", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.vms.get(&id).await?))
}

/// Replace a VM's spec
#[utoipa::path(
    put,
    path = "/api/v1/vms/{id}",
    request_body(content = Object, description = "New VM spec"),
    responses((status = 200, description = "Spec updated")),
    tag = "vms"
)]
pub async fn update_vm_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<VmSpec>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.vms.update_spec(&id, spec).await?))
}

/// Delete a VM (cascades to snapshots)
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}",
    responses((status = 200, description = "VM deleted")),
    tag = "vms"
)]
pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.vms.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Start a VM
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/start",
    request_body = StartVmBody,
    responses(
        (status = 200, description = "VM starting"),
        (status = 412, description = "No feasible host", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn start_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StartVmBody>>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let target = body.and_then(|Json(b)| b.node_id);
    Ok(Json(state.vms.start(&id, target).await?))
}

/// Stop a VM
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/stop",
    request_body = StopVmBody,
    responses((status = 200, description = "VM stopped")),
    tag = "vms"
)]
pub async fn stop_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StopVmBody>>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let graceful = body.map(|Json(b)| b.graceful).unwrap_or(true);
    Ok(Json(state.vms.stop(&id, graceful).await?))
}

pub async fn restart_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.vms.restart(&id).await?))
}

pub async fn pause_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.vms.pause(&id).await?))
}

pub async fn resume_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.vms.resume(&id).await?))
}

pub async fn migrate_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<MigrateBody>>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let target = body.and_then(|Json(b)| b.node_id);
    Ok(Json(state.vms.migrate(&id, target).await?))
}

pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    Ok(Json(state.vms.list_snapshots(&id).await?))
}

pub async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(
        state
            .vms
            .create_snapshot(&id, &body.name, body.parent_id)
            .await?,
    ))
}

pub async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path((id, snapshot_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.vms.delete_snapshot(&id, &snapshot_id).await?;
    Ok(Json(serde_json::json!({ "deleted": snapshot_id })))
}

pub async fn revert_snapshot(
    State(state): State<Arc<AppState>>,
    Path((id, snapshot_id)): Path<(String, String)>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.vms.revert_snapshot(&id, &snapshot_id).await?))
}
