//! Server-streaming watch endpoints (SSE).
//!
//! Every stream first delivers the current state, then forwards live
//! events, so clients converge without a read-then-subscribe race.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;

use kestrel_store::{AlertFilter, AlertRepo, NodeRepo, Repository};

use super::{ApiError, AppState};
use crate::bus::{EventFilter, ResourceType};

#[derive(Deserialize)]
pub struct WatchVmsQuery {
    pub project_id: Option<String>,
}

fn sse_json<T: serde::Serialize>(kind: &str, value: &T) -> Option<SseEvent> {
    SseEvent::default().event(kind).json_data(value).ok()
}

/// Watch a single VM: current value first, then live events.
pub async fn watch_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let (current, mut sub) = state.vms.watch_vm(&id).await?;

    let stream = async_stream::stream! {
        if let Some(event) = sse_json("initial", &current) {
            yield Ok(event);
        }
        while let Some(event) = sub.recv().await {
            if let Some(event) = sse_json("update", &event) {
                yield Ok(event);
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Watch all VMs, optionally scoped to a project.
pub async fn watch_vms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WatchVmsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let (current, mut sub) = state.vms.watch_vms(query.project_id).await?;

    let stream = async_stream::stream! {
        if let Some(event) = sse_json("initial", &current) {
            yield Ok(event);
        }
        while let Some(event) = sub.recv().await {
            if let Some(event) = sse_json("update", &event) {
                yield Ok(event);
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Watch node state changes.
pub async fn watch_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let mut sub = state.bus.subscribe(EventFilter::all(ResourceType::Node));
    let (nodes, _) = state.repo.nodes().list(&Default::default(), 1000, 0).await?;

    let stream = async_stream::stream! {
        if let Some(event) = sse_json("initial", &nodes) {
            yield Ok(event);
        }
        while let Some(event) = sub.recv().await {
            if let Some(event) = sse_json("update", &event) {
                yield Ok(event);
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Watch alerts; the initial burst carries unresolved alerts.
pub async fn watch_alerts(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let mut sub = state.bus.subscribe(EventFilter::all(ResourceType::Alert));
    let (alerts, _) = state
        .repo
        .alerts()
        .list(
            &AlertFilter {
                resolved: Some(false),
                ..Default::default()
            },
            1000,
            0,
        )
        .await?;

    let stream = async_stream::stream! {
        if let Some(event) = sse_json("initial", &alerts) {
            yield Ok(event);
        }
        while let Some(event) = sub.recv().await {
            if let Some(event) = sse_json("update", &event) {
                yield Ok(event);
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
