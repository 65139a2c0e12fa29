//! Ops Routes
//!
//! Health and metrics endpoints. The ledger itself has no HTTP surface.

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::AppResult;
use crate::jobs::{ReconciliationScheduler, SchedulerStatus};
use crate::metrics::PrometheusMetrics;

/// Shared state of the ops router
#[derive(Clone)]
pub struct OpsState {
    pub metrics: Arc<PrometheusMetrics>,
    pub scheduler: Arc<ReconciliationScheduler>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler: SchedulerStatus,
}

pub fn create_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<OpsState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        scheduler: state.scheduler.status(),
    })
}

async fn metrics(State(state): State<OpsState>) -> AppResult<impl IntoResponse> {
    let body = state.metrics.encode()?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
