//! Cache API facade served by the sidecar.
//!
//! Translates wire requests into [`TieredCacheManager`] calls and nothing
//! more; tiering decisions stay in the manager.
//! - POST /v1/kv/offload
//! - POST /v1/kv/fetch
//! - POST /v1/kv/query
//! - POST /v1/kv/l1-space
//! - GET /v1/cache/stats
//! - GET /health

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::cache::block::{BlockReference, CacheKey};
use crate::cache::manager::{ManagerStats, TieredCacheManager};
use crate::status::{Status, StatusCode as TierCode};

/// Application state shared across handlers.
pub struct AppState {
    pub manager: Arc<TieredCacheManager>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(manager: Arc<TieredCacheManager>) -> Self {
        Self {
            manager,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all facade routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/kv/offload", post(offload))
        .route("/v1/kv/fetch", post(fetch))
        .route("/v1/kv/query", post(query))
        .route("/v1/kv/l1-space", post(request_l1_space))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct OffloadRequest {
    pub key: String,
    pub device_id: usize,
    pub memory_address: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: String,
    pub dest_device_id: usize,
    pub dest_memory_address: u64,
    pub dest_size_bytes: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub key: String,
    pub available: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct L1SpaceRequest {
    pub needed_size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub ring_nodes: usize,
}

/// Negative outcomes (miss, capacity, unavailable) are ordinary answers;
/// only malformed requests get a 4xx.
fn respond(status: Status) -> (StatusCode, Json<Status>) {
    let http = match status.code {
        TierCode::InvalidArgument => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (http, Json(status))
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn offload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OffloadRequest>,
) -> (StatusCode, Json<Status>) {
    let span = info_span!("offload", request_id = %Uuid::new_v4(), key = %req.key);
    async move {
        let block = BlockReference::new(req.device_id, req.memory_address, req.size_bytes);
        let status = state
            .manager
            .offload(
                &CacheKey::new(&req.key),
                &block,
                req.timeout_ms.map(Duration::from_millis),
            )
            .await;
        debug!(success = status.success, message = %status.message, "Offload handled");
        respond(status)
    }
    .instrument(span)
    .await
}

async fn fetch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchRequest>,
) -> (StatusCode, Json<Status>) {
    let span = info_span!("fetch", request_id = %Uuid::new_v4(), key = %req.key);
    async move {
        let dest = BlockReference::new(
            req.dest_device_id,
            req.dest_memory_address,
            req.dest_size_bytes,
        );
        let status = state
            .manager
            .fetch(
                &CacheKey::new(&req.key),
                &dest,
                req.timeout_ms.map(Duration::from_millis),
            )
            .await;
        debug!(success = status.success, message = %status.message, "Fetch handled");
        respond(status)
    }
    .instrument(span)
    .await
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Json<QueryResponse> {
    let span = info_span!("query", request_id = %Uuid::new_v4(), key = %req.key);
    async move {
        let available = state
            .manager
            .check_global_availability(&CacheKey::new(&req.key))
            .await;
        Json(QueryResponse {
            key: req.key,
            available,
        })
    }
    .instrument(span)
    .await
}

async fn request_l1_space(
    State(state): State<Arc<AppState>>,
    Json(req): Json<L1SpaceRequest>,
) -> (StatusCode, Json<Status>) {
    let span = info_span!("l1_space", request_id = %Uuid::new_v4(), needed = req.needed_size_bytes);
    async move { respond(state.manager.request_l1_space(req.needed_size_bytes).await) }
        .instrument(span)
        .await
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<ManagerStats> {
    Json(state.manager.stats().await)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        ring_nodes: state.manager.l2().ring().len(),
    })
}
