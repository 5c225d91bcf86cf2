use dedup_common::store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::result::DetectionResult;

/// Classification of a failure, as reported to callers and in `ErrorHandlingInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionUnavailable,
    AuthorizationDenied,
    OperationTimeout,
    MemoryExhausted,
    MalformedInput,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionUnavailable => "connection_unavailable",
            ErrorKind::AuthorizationDenied => "authorization_denied",
            ErrorKind::OperationTimeout => "operation_timeout",
            ErrorKind::MemoryExhausted => "memory_exhausted",
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&StoreError> for ErrorKind {
    fn from(error: &StoreError) -> Self {
        match error {
            StoreError::ConnectionError(_) => ErrorKind::ConnectionUnavailable,
            StoreError::AuthError(_) => ErrorKind::AuthorizationDenied,
            StoreError::TimeoutError(_) => ErrorKind::OperationTimeout,
            StoreError::DataError(_) => ErrorKind::Unknown,
        }
    }
}

/// Errors returned by the public engine operations.
///
/// Ordinary dataset problems never end up here: they are absorbed into the result. Only an
/// empty request, a cancelled run, or a store failure with graceful degradation disabled do.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("no records were submitted for duplicate detection")]
    EmptyInput,
    #[error("duplicate detection failed for {record_count} records ({kind}): {cause}")]
    DetectionFailed {
        record_count: usize,
        kind: ErrorKind,
        cause: String,
    },
    #[error("duplicate detection was cancelled after {} records", partial.total_records)]
    Cancelled { partial: Box<DetectionResult> },
}

impl DetectionError {
    pub fn failed(record_count: usize, error: &StoreError) -> Self {
        DetectionError::DetectionFailed {
            record_count,
            kind: ErrorKind::from(error),
            cause: error.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectionError::EmptyInput => ErrorKind::MalformedInput,
            DetectionError::DetectionFailed { kind, .. } => *kind,
            DetectionError::Cancelled { .. } => ErrorKind::Unknown,
        }
    }
}
