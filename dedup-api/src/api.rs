use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dedup_common::record::RecordShapeError;
use dedup_engine::{DetectionError, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("records are malformed: {0}")]
    MalformedRecords(#[from] RecordShapeError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::MalformedRecords(_) => ErrorKind::MalformedInput,
            ApiError::Detection(error) => error.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::MalformedInput => StatusCode::BAD_REQUEST,
            ErrorKind::AuthorizationDenied => StatusCode::FORBIDDEN,
            ErrorKind::ConnectionUnavailable | ErrorKind::OperationTimeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::MemoryExhausted | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
                kind,
            }),
        )
            .into_response()
    }
}
