//! API route definitions.

use super::state::AppState;
use crate::engine::{Phase, StatsSnapshot};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_ALERT_LIMIT: usize = 20;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/machines", get(list_machines))
        .route("/machines/{id}", get(machine_detail))
        .route("/machines/{id}/readings", get(machine_readings))
        .route("/alerts", get(list_alerts))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn not_found(what: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": { "code": "not_found", "message": format!("unknown {} '{}'", what, id) },
            "meta": meta()
        })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.started_at.elapsed().as_secs()
        },
        "meta": meta()
    }))
}

#[derive(Serialize)]
struct StatsView {
    #[serde(flatten)]
    engine: StatsSnapshot,
    machines_trained: usize,
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let statuses = state.coordinator.statuses().await;
    let view = StatsView {
        engine: state.coordinator.stats().await,
        machines_trained: statuses.iter().filter(|s| s.phase == Phase::Trained).count(),
    };
    Json(json!({ "data": view, "meta": meta() }))
}

async fn list_machines(State(state): State<AppState>) -> Json<Value> {
    let machines: Vec<Value> = state
        .coordinator
        .statuses()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "machine_id": s.machine_id,
                "phase": s.phase,
                "sample_count": s.sample_count,
                "baseline_samples": s.baseline_samples,
                "alerts": s.alerts,
                "last_reading": s.last_reading
            })
        })
        .collect();
    let total = machines.len();
    Json(json!({
        "data": machines,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

async fn machine_detail(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.coordinator.status(&id).await {
        Some(status) => Json(json!({ "data": status, "meta": meta() })).into_response(),
        None => not_found("machine", &id),
    }
}

async fn machine_readings(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.coordinator.history(&id).await {
        Some(readings) => {
            let total = readings.len();
            Json(json!({ "data": readings, "meta": { "total": total } })).into_response()
        }
        None => not_found("machine", &id),
    }
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
}

async fn list_alerts(State(state): State<AppState>, Query(q): Query<AlertQuery>) -> Json<Value> {
    let limit = q.limit.unwrap_or(DEFAULT_ALERT_LIMIT).min(state.feed.capacity());
    let alerts = state.feed.recent(limit).await;
    let returned = alerts.len();
    let retained = state.feed.len().await;
    Json(json!({
        "data": alerts,
        "meta": { "returned": returned, "retained": retained, "limit": limit }
    }))
}
