//! Controller HTTP surface.
//!
//! - GET /v1/cluster/map (UP nodes only)
//! - GET /v1/cluster/nodes (all nodes, for diagnostics)
//! - POST /v1/cluster/heartbeat
//! - POST /v1/cluster/register
//! - GET /health

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cluster::controller::{Controller, NodeStatus};
use crate::cluster::node::StorageNode;
use crate::cluster::topology::{
    ClusterMapResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
};

pub fn build_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/v1/cluster/map", get(cluster_map))
        .route("/v1/cluster/nodes", get(nodes))
        .route("/v1/cluster/heartbeat", post(heartbeat))
        .route("/v1/cluster/register", post(register))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

#[derive(Debug, Serialize)]
struct NodesResponse {
    nodes: Vec<NodeStatus>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    status: &'static str,
    new_node: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_nodes: usize,
}

async fn cluster_map(State(controller): State<Arc<Controller>>) -> Json<ClusterMapResponse> {
    Json(ClusterMapResponse {
        nodes: controller.get_cluster_map(),
    })
}

async fn nodes(State(controller): State<Arc<Controller>>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: controller.node_statuses(),
    })
}

async fn heartbeat(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, StatusCode> {
    match controller.heartbeat(&req.node_id, req.timestamp_ms) {
        // Stale heartbeats are acknowledged too; they just don't refresh liveness.
        Ok(_) => Ok(Json(HeartbeatResponse {
            status: "ACK".to_string(),
        })),
        Err(e) => {
            warn!(error = %e, "Rejected heartbeat");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

async fn register(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let new_node = controller.register(StorageNode::new(req.node_id, req.host, req.port));
    Json(RegisterResponse {
        status: "REGISTERED",
        new_node,
    })
}

async fn health(State(controller): State<Arc<Controller>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_nodes: controller.get_cluster_map().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_heartbeat_and_map() {
        let app = build_router(Arc::new(Controller::new(Duration::from_secs(10))));

        let (code, _) = send(
            &app,
            post("/v1/cluster/heartbeat", serde_json::json!({"node_id": "redis-0", "timestamp_ms": 1})),
        )
        .await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (_, body) = send(
            &app,
            post(
                "/v1/cluster/register",
                serde_json::json!({"node_id": "redis-0", "host": "10.1.1.10", "port": 6379}),
            ),
        )
        .await;
        assert_eq!(body["new_node"], true);

        let (code, body) = send(
            &app,
            post("/v1/cluster/heartbeat", serde_json::json!({"node_id": "redis-0", "timestamp_ms": 2})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ACK");

        let (_, body) = send(&app, Request::get("/v1/cluster/map").body(Body::empty()).unwrap()).await;
        let nodes = body["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["node_id"], "redis-0");
        assert_eq!(nodes[0]["port"], 6379);
    }
}
