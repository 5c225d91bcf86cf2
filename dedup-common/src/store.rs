//! Access to the persistent record store.
//!
//! The detection engine only ever asks membership questions ("which of these ids exist?"),
//! so `RecordStore` is deliberately small. `PgRecordStore` answers them from a Postgres table
//! with parameterized `ANY($1)` lookups; `MemoryRecordStore` answers them from a map and lets
//! callers count calls and inject failures.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::time::timeout;

use crate::record::RecordDetail;

/// Enumeration of errors surfaced by a `RecordStore`.
/// Every failure is classified so callers can decide whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record store connection failed: {0}")]
    ConnectionError(String),
    #[error("record store denied access: {0}")]
    AuthError(String),
    #[error("record store query timed out: {0}")]
    TimeoutError(String),
    #[error("record store returned unusable data: {0}")]
    DataError(String),
}

impl StoreError {
    /// Connection drops and timeouts are usually transient, everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionError(_) | StoreError::TimeoutError(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        let message = error.to_string();
        match &error {
            sqlx::Error::PoolTimedOut => StoreError::TimeoutError(message),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StoreError::ConnectionError(message),
            sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
                // invalid_authorization_specification and invalid_password live in class 28.
                Some(code) if code.starts_with("28") || code == "42501" => {
                    StoreError::AuthError(message)
                }
                Some(code) if code.starts_with("08") => StoreError::ConnectionError(message),
                Some("57014") => StoreError::TimeoutError(message),
                _ => StoreError::DataError(message),
            },
            _ => StoreError::DataError(message),
        }
    }
}

/// The existence-check contract the detection engine depends on.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Return the subset of `ids` that already exist.
    async fn batch_exists(&self, ids: &[String]) -> Result<Vec<String>, StoreError>;

    async fn single_exists(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_record_details(&self, ids: &[String]) -> Result<Vec<RecordDetail>, StoreError>;

    /// Total number of stored records.
    async fn count(&self) -> Result<i64, StoreError>;
}

/// A `RecordStore` backed by a PostgreSQL table with `id`, `phone` and `created_at` columns.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
    query_timeout: Duration,
}

impl PgRecordStore {
    /// Connect to PostgreSQL and serve lookups from `table`.
    pub async fn new(
        url: &str,
        table: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect(url)
            .await?;

        Ok(Self::new_from_pool(pool, table, query_timeout))
    }

    pub fn new_from_pool(pool: PgPool, table: &str, query_timeout: Duration) -> Self {
        Self {
            pool,
            table: table.to_owned(),
            query_timeout,
        }
    }

    async fn with_timeout<T, F>(&self, query: &str, future: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match timeout(self.query_timeout, future).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::TimeoutError(format!(
                "{} query exceeded {}ms",
                query,
                self.query_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn batch_exists(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!("SELECT id FROM {} WHERE id = ANY($1)", self.table);
        self.with_timeout(
            "batch_exists",
            sqlx::query_scalar::<_, String>(&query)
                .bind(ids)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn single_exists(&self, id: &str) -> Result<bool, StoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            self.table
        );
        self.with_timeout(
            "single_exists",
            sqlx::query_scalar::<_, bool>(&query)
                .bind(id)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_record_details(&self, ids: &[String]) -> Result<Vec<RecordDetail>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT id, phone, created_at FROM {} WHERE id = ANY($1)",
            self.table
        );
        self.with_timeout(
            "get_record_details",
            sqlx::query_as::<_, RecordDetail>(&query)
                .bind(ids)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) FROM {}", self.table);
        self.with_timeout(
            "count",
            sqlx::query_scalar::<_, i64>(&query).fetch_one(&self.pool),
        )
        .await
    }
}

/// Which store calls an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    All,
    BatchOnly,
    SingleOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Batch,
    Single,
    Details,
    Count,
}

impl FailureScope {
    fn covers(self, kind: CallKind) -> bool {
        match self {
            FailureScope::All => true,
            FailureScope::BatchOnly => kind == CallKind::Batch,
            FailureScope::SingleOnly => kind == CallKind::Single,
        }
    }
}

struct InjectedFailure {
    error: StoreError,
    scope: FailureScope,
    /// `None` fails forever, `Some(n)` fails the next n covered calls.
    remaining: Option<usize>,
}

/// An in-memory `RecordStore`.
///
/// Besides serving small deployments and local runs, it counts every call and can be told to
/// fail, which is what the engine's retry and fallback paths are tested against.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, RecordDetail>>,
    failure: Mutex<Option<InjectedFailure>>,
    latency: Mutex<Duration>,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    details_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store that already contains `ids`, with empty phone numbers.
    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for id in ids {
            store.insert(id, "");
        }
        store
    }

    pub fn insert(&self, id: impl Into<String>, phone: impl Into<String>) {
        let id = id.into();
        let detail = RecordDetail {
            id: id.clone(),
            phone: phone.into(),
            created_at: Utc::now(),
        };
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, detail);
    }

    /// Fail every covered call with `error` until `clear_failure` is called.
    pub fn fail_always(&self, error: StoreError, scope: FailureScope) {
        self.set_failure(InjectedFailure {
            error,
            scope,
            remaining: None,
        });
    }

    /// Fail the next `times` covered calls with `error`, then behave normally.
    pub fn fail_times(&self, times: usize, error: StoreError, scope: FailureScope) {
        self.set_failure(InjectedFailure {
            error,
            scope,
            remaining: Some(times),
        });
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Delay every call by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn details_calls(&self) -> usize {
        self.details_calls.load(Ordering::SeqCst)
    }

    /// Size of every `batch_exists` request received so far, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total number of ids received through `batch_exists`.
    pub fn queried_ids(&self) -> usize {
        self.batch_sizes().iter().sum()
    }

    fn set_failure(&self, failure: InjectedFailure) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
    }

    async fn before_call(&self, kind: CallKind) -> Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(failure) = guard.as_mut() else {
            return Ok(());
        };
        if !failure.scope.covers(kind) {
            return Ok(());
        }

        let remaining = failure.remaining;
        match remaining {
            None => Err(failure.error.clone()),
            Some(0) => {
                *guard = None;
                Ok(())
            }
            Some(n) => {
                failure.remaining = Some(n - 1);
                Err(failure.error.clone())
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn batch_exists(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ids.len());
        self.before_call(CallKind::Batch).await?;

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids
            .iter()
            .filter(|id| records.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn single_exists(&self, id: &str) -> Result<bool, StoreError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(CallKind::Single).await?;

        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id))
    }

    async fn get_record_details(&self, ids: &[String]) -> Result<Vec<RecordDetail>, StoreError> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(CallKind::Details).await?;

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id.as_str()).cloned())
            .collect())
    }

    async fn count(&self) -> Result<i64, StoreError> {
        self.before_call(CallKind::Count).await?;

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.len() as i64)
    }
}
