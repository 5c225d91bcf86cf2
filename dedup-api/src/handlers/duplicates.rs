use axum::extract::{Path, State};
use axum::Json;
use dedup_common::record::Record;
use dedup_engine::report::DuplicateReport;
use dedup_engine::{CheckOptions, DetectionMode, DetectionResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::AppState;
use crate::api::ApiError;

/// Rows as they come out of the spreadsheet import, in any supported shape.
#[derive(Debug, Deserialize, Serialize)]
pub struct RecordsBody {
    pub records: Vec<Value>,
    #[serde(default)]
    pub mode: DetectionMode,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FilterResponse {
    pub records: Vec<Record>,
    pub count: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IdResponse {
    pub id: String,
    pub duplicate: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReportBody {
    pub duplicates: Vec<Value>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "import".to_owned()
}

#[instrument(skip_all, fields(records = body.records.len()))]
pub async fn check(
    State(state): State<AppState>,
    Json(body): Json<RecordsBody>,
) -> Result<Json<DetectionResult>, ApiError> {
    let records = Record::from_json_rows(body.records)?;

    let result = state
        .engine
        .check_with_options(&records, CheckOptions::with_mode(body.mode))
        .await?;

    debug!(summary = %result.summary(), "check request served");
    Ok(Json(result))
}

#[instrument(skip_all, fields(records = body.records.len()))]
pub async fn filter(
    State(state): State<AppState>,
    Json(body): Json<RecordsBody>,
) -> Result<Json<FilterResponse>, ApiError> {
    let records = Record::from_json_rows(body.records)?;

    let fresh = state.engine.filter_new_records(&records).await?;

    Ok(Json(FilterResponse {
        count: fresh.len(),
        records: fresh,
    }))
}

pub async fn get_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IdResponse>, ApiError> {
    let duplicate = state.engine.is_duplicate_id(&id).await?;

    Ok(Json(IdResponse { id, duplicate }))
}

#[instrument(skip_all, fields(duplicates = body.duplicates.len(), source = %body.source))]
pub async fn report(
    State(state): State<AppState>,
    Json(body): Json<ReportBody>,
) -> Result<Json<DuplicateReport>, ApiError> {
    let duplicates = Record::from_json_rows(body.duplicates)?;

    let report = state
        .engine
        .generate_duplicate_report(&duplicates, &body.source)
        .await?;

    Ok(Json(report))
}
