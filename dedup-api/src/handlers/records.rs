use axum::extract::State;
use axum::Json;
use dedup_common::record::RecordDetail;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::api::ApiError;

#[derive(Debug, Deserialize, Serialize)]
pub struct DetailsBody {
    pub ids: Vec<String>,
}

pub async fn details(
    State(state): State<AppState>,
    Json(body): Json<DetailsBody>,
) -> Result<Json<Vec<RecordDetail>>, ApiError> {
    let details = state.engine.get_existing_record_details(&body.ids).await?;

    Ok(Json(details))
}
