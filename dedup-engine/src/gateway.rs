use std::sync::Arc;
use std::time::Instant;

use dedup_common::record::RecordDetail;
use dedup_common::store::{RecordStore, StoreError};
use tracing::warn;

use crate::collector::MetricsCollector;
use crate::error::ErrorKind;
use crate::metrics_consts::{STORE_QUERY_DURATION_HISTOGRAM, STORE_QUERY_ERRORS_COUNTER};

/// The only component that talks to the record store.
///
/// Splits requests that exceed the store's per-query id limit, times every query for the
/// batch planner, and hands errors back untouched so the retry controller can classify them.
#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn RecordStore>,
    collector: Arc<MetricsCollector>,
    max_ids_per_query: usize,
}

impl StoreGateway {
    pub fn new(
        store: Arc<dyn RecordStore>,
        collector: Arc<MetricsCollector>,
        max_ids_per_query: usize,
    ) -> Self {
        Self {
            store,
            collector,
            max_ids_per_query: max_ids_per_query.max(1),
        }
    }

    /// Return the subset of `ids` that exist in the store.
    pub async fn batch_exists(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let mut existing = Vec::new();
        for sub_batch in ids.chunks(self.max_ids_per_query) {
            let found = self
                .timed("batch_exists", self.store.batch_exists(sub_batch))
                .await?;
            existing.extend(found);
        }
        Ok(existing)
    }

    pub async fn single_exists(&self, id: &str) -> Result<bool, StoreError> {
        self.timed("single_exists", self.store.single_exists(id))
            .await
    }

    pub async fn record_details(&self, ids: &[String]) -> Result<Vec<RecordDetail>, StoreError> {
        let mut details = Vec::with_capacity(ids.len());
        for sub_batch in ids.chunks(self.max_ids_per_query) {
            let found = self
                .timed("get_record_details", self.store.get_record_details(sub_batch))
                .await?;
            details.extend(found);
        }
        Ok(details)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        self.timed("count", self.store.count()).await
    }

    async fn timed<T, F>(&self, operation: &'static str, query: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();
        let result = query.await;
        let elapsed = start.elapsed();

        self.collector.record_query_latency(elapsed);
        metrics::histogram!(STORE_QUERY_DURATION_HISTOGRAM, "operation" => operation)
            .record(elapsed.as_secs_f64());

        if let Err(error) = &result {
            let kind = ErrorKind::from(error);
            metrics::counter!(
                STORE_QUERY_ERRORS_COUNTER,
                "operation" => operation,
                "kind" => kind.as_str()
            )
            .increment(1);
            warn!(operation, %kind, "record store query failed: {}", error);
        }

        result
    }
}
