use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use latency_aggregator::PairTally;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) prometheus: PrometheusHandle,
    pub(super) tally: Arc<PairTally>,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
}

pub(super) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/pairs", get(pairs))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResp { status: "ok" })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn pairs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tally.snapshot())
}
