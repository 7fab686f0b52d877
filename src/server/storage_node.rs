//! Storage node: a bounded in-memory block map served over HTTP.
//!
//! - `PUT /v1/blocks/{key}`: store the raw body (204, or 507 when full)
//! - `GET /v1/blocks/{key}`: raw bytes (200) or 404
//! - `HEAD /v1/blocks/{key}`: existence check
//! - `GET /health`
//!
//! The node registers with the controller on startup and then heartbeats on
//! a fixed interval. Missing heartbeats are the controller's only failure
//! signal.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::cluster::node::StorageNode;
use crate::cluster::store::{BlockStore, StoreStats};
use crate::cluster::topology::{HttpTopologyClient, TopologyError};

pub struct StorageNodeState {
    pub node_id: String,
    pub store: Arc<BlockStore>,
}

pub fn build_router(state: Arc<StorageNodeState>) -> Router {
    Router::new()
        .route(
            "/v1/blocks/{key}",
            get(get_block).put(put_block).head(head_block),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn put_block(
    State(state): State<Arc<StorageNodeState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let size = body.len();
    match state.store.put(&key, body) {
        Ok(()) => {
            debug!(key, size, "Stored block");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!(key, error = %e, "Rejected block");
            StatusCode::INSUFFICIENT_STORAGE
        }
    }
}

async fn get_block(
    State(state): State<Arc<StorageNodeState>>,
    Path(key): Path<String>,
) -> Result<Bytes, StatusCode> {
    state.store.get(&key).ok_or(StatusCode::NOT_FOUND)
}

async fn head_block(
    State(state): State<Arc<StorageNodeState>>,
    Path(key): Path<String>,
) -> StatusCode {
    if state.store.contains(&key) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Serialize)]
struct NodeHealthResponse {
    status: &'static str,
    node_id: String,
    #[serde(flatten)]
    store: StoreStats,
}

async fn health(State(state): State<Arc<StorageNodeState>>) -> Json<NodeHealthResponse> {
    Json(NodeHealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        store: state.store.stats(),
    })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Register `node` with the controller, then heartbeat every `interval`
/// until `cancel` fires. A controller that has forgotten the node (404)
/// triggers a fresh registration.
pub async fn run_heartbeat_loop(
    client: HttpTopologyClient,
    node: StorageNode,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut registered = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(node = %node, controller = client.base_url(), "Heartbeat loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !registered {
            match client.register(&node).await {
                Ok(()) => {
                    info!(node = %node, "Registered with controller");
                    registered = true;
                }
                Err(e) => {
                    warn!(error = %e, "Registration failed, retrying next tick");
                    continue;
                }
            }
        }

        match client.heartbeat(&node.node_id, unix_millis()).await {
            Ok(()) => debug!(node_id = %node.node_id, "Heartbeat sent"),
            Err(TopologyError::UnknownNode(_)) => {
                warn!(node_id = %node.node_id, "Controller does not know this node, re-registering");
                registered = false;
            }
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }
    info!("Heartbeat loop stopped");
}
