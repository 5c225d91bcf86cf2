use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{routing, Router};
use dedup_engine::DuplicateDetectionEngine;
use tower_http::trace::TraceLayer;

use super::{duplicates, records, stats};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DuplicateDetectionEngine>,
}

pub fn app(engine: Arc<DuplicateDetectionEngine>, max_body_size: usize) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route("/_health", routing::get(stats::health))
        .route("/stats", routing::get(stats::get))
        .route("/stats/reset", routing::post(stats::reset))
        .route("/duplicates/check", routing::post(duplicates::check))
        .route("/duplicates/filter", routing::post(duplicates::filter))
        .route("/duplicates/report", routing::post(duplicates::report))
        .route("/duplicates/:id", routing::get(duplicates::get_id))
        .route("/records/details", routing::post(records::details))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn index() -> &'static str {
    "dedup api"
}
