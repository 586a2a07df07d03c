//! Axum HTTP API over the shared application context.

use crate::App;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use nopea_shared::DeploySpec;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/deploy", post(deploy))
        .route("/api/context/:service", get(context))
        .route("/api/history/:service", get(history))
        .route("/api/memory", get(memory_stats))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Binds the listener and serves until the process stops.
pub async fn serve(app: Arc<App>, port: u16) -> std::io::Result<()> {
    let router = build_router(app);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "nopea::gateway", %addr, "API listening");
    axum::serve(listener, router).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ready" }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not_found" })),
    )
}

/// POST /api/deploy with body `{service, namespace?, manifests?, strategy?}`.
async fn deploy(
    State(app): State<Arc<App>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(service) = body
        .get("service")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "service is required" })),
        );
    };

    let mut spec = DeploySpec::new(&service);
    if let Some(namespace) = body.get("namespace").and_then(|v| v.as_str()) {
        spec.namespace = namespace.to_string();
    }
    if let Some(manifests) = body.get("manifests").and_then(|v| v.as_array()) {
        spec.manifests = manifests.clone();
    }
    if let Some(strategy) = body.get("strategy").and_then(|v| v.as_str()) {
        spec.strategy = Some(nopea_core::orchestrator::parse_strategy_lenient(strategy));
    }
    if let Some(options) = body.get("options") {
        if let Ok(options) = serde_json::from_value(options.clone()) {
            spec.options = options;
        }
    }

    let result = app.supervisor.deploy(&service, spec).await;
    let summary = serde_json::json!({
        "deploy_id": result.deploy_id,
        "service": result.service,
        "namespace": result.namespace,
        "status": result.status,
        "strategy": result.strategy,
        "manifest_count": result.manifest_count,
        "duration_ms": result.duration_ms,
        "verified": result.verified,
        "error": result.error,
    });
    (StatusCode::OK, Json(summary))
}

/// GET /api/context/{service}?namespace=…
async fn context(
    State(app): State<Arc<App>>,
    Path(service): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let namespace = params
        .get("namespace")
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    let context = app.memory.get_deploy_context(&service, &namespace).await;
    Json(serde_json::to_value(&context).unwrap_or_default())
}

/// GET /api/history/{service}
async fn history(State(app): State<Arc<App>>, Path(service): Path<String>) -> Json<serde_json::Value> {
    let state = app.cache.get_service_state(&service);
    let deployments = app.cache.list_deployments(&service);
    Json(serde_json::json!({
        "service": service,
        "state": state,
        "deployments": deployments,
    }))
}

/// GET /api/memory: knowledge-graph statistics.
async fn memory_stats(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let stats = app.memory.stats().await;
    let telemetry = app.orchestrator.telemetry().snapshot();
    Json(serde_json::json!({
        "nodes": stats.nodes,
        "relationships": stats.relationships,
        "telemetry": telemetry,
    }))
}
