//! HTTP surface: channel upgrade, metrics/analytics pull, admin queue ops

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use cardhub_cluster::FanoutBus;
use cardhub_core::models::{DeliveryJob, JobKind};
use cardhub_core::service::call::CallCoordinator;
use cardhub_core::service::delivery::DeliveryQueue;
use cardhub_core::service::TokenValidator;
use cardhub_core::metrics;

use crate::channel;
use crate::orchestrator::MessageOrchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub validator: TokenValidator,
    pub bus: Arc<FanoutBus>,
    pub orchestrator: Arc<MessageOrchestrator>,
    pub coordinator: CallCoordinator,
    pub queue: DeliveryQueue,
}

/// HTTP error with status code
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(channel::websocket_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/analytics", get(analytics_handler))
        .route("/admin/queue", get(queue_status_handler))
        .route(
            "/admin/dead-letters",
            get(dead_letters_handler).delete(clear_dead_letters_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler() -> Result<String, AppError> {
    metrics::gather_metrics().map_err(|e| AppError::internal(format!("Metrics encoding: {e}")))
}

async fn analytics_handler() -> Json<metrics::AnalyticsSnapshot> {
    Json(metrics::snapshot())
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    depth: HashMap<JobKind, usize>,
    failure_rate: f64,
    dead_letters: usize,
}

async fn queue_status_handler(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(QueueStatus {
        depth: state.queue.queue_depth(),
        failure_rate: state.queue.failure_rate(),
        dead_letters: state.queue.dead_letters().len(),
    })
}

async fn dead_letters_handler(State(state): State<AppState>) -> Json<Vec<DeliveryJob>> {
    Json(state.queue.dead_letters())
}

#[derive(Debug, Serialize)]
struct ClearedResponse {
    cleared: usize,
}

async fn clear_dead_letters_handler(State(state): State<AppState>) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        cleared: state.queue.clear_dead_letters(),
    })
}
