use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dedup_engine::collector::{DetectionMetrics, HealthReport, HealthState};
use serde::Serialize;
use tracing::{info, warn};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub metrics: DetectionMetrics,
    pub health: HealthReport,
    pub cache: CacheStats,
    /// `None` when the store could not be reached.
    pub store_total: Option<i64>,
}

pub async fn get(State(state): State<AppState>) -> Json<StatsResponse> {
    let store_total = match state.engine.store_count().await {
        Ok(total) => Some(total),
        Err(error) => {
            warn!("could not count stored records: {}", error);
            None
        }
    };

    Json(StatsResponse {
        metrics: state.engine.get_metrics(),
        health: state.engine.get_health_status(),
        cache: CacheStats {
            entries: state.engine.cache().len(),
            max_size: state.engine.cache().max_size(),
        },
        store_total,
    })
}

/// Unhealthy maps to 503 so load balancers stop routing imports here.
pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.engine.get_health_status();
    let status = match report.status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(report)).into_response()
}

pub async fn reset(State(state): State<AppState>) -> StatusCode {
    state.engine.reset_metrics();
    state.engine.cache().clear();
    info!("detection metrics and query cache reset");

    StatusCode::NO_CONTENT
}
