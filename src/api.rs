//! Health & metrics HTTP endpoints
//!
//! - GET /health/live  - liveness probe (always healthy while serving)
//! - GET /health/ready - readiness; degraded until the worker's event loop runs
//! - GET /health       - compact readiness summary
//! - GET /metrics      - Prometheus metrics
//!
//! Readiness is reported in the body only; the HTTP status stays 200 so
//! probes can distinguish "unreachable" from "not ready".

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{SecondsFormat, Utc};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use crate::metrics;

const SERVICE_NAME: &str = "nitewatch";

/// State shared between the service tasks and the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub worker_ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    dependencies: BTreeMap<&'static str, DepCheck>,
}

#[derive(Serialize)]
struct DepCheck {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

fn health_response(status: &'static str) -> HealthResponse {
    HealthResponse {
        status,
        service: SERVICE_NAME,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        dependencies: BTreeMap::new(),
    }
}

/// Liveness probe handler
async fn liveness() -> Json<HealthResponse> {
    Json(health_response("healthy"))
}

/// Readiness probe handler
async fn readiness(State(state): State<AppState>) -> Json<HealthResponse> {
    let ready = state.worker_ready.load(Ordering::SeqCst);
    let mut response = health_response(if ready { "healthy" } else { "degraded" });
    response.dependencies.insert(
        "worker",
        if ready {
            DepCheck {
                status: "healthy",
                error: None,
            }
        } else {
            DepCheck {
                status: "degraded",
                error: Some("worker not ready"),
            }
        },
    );
    Json(response)
}

/// Compact health summary handler
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ready = state.worker_ready.load(Ordering::SeqCst);
    Json(json!({
        "status": if ready { "healthy" } else { "degraded" },
        "worker": ready,
    }))
}

/// Prometheus metrics handler
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

/// Serve the health endpoints until the shutdown channel fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: mpsc::Receiver<()>,
) -> Result<()> {
    metrics::UP.set(1.0);

    let app = Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
