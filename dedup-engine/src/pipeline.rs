use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dedup_common::record::Record;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::collector::MetricsCollector;
use crate::fallback::{FallbackError, RetryFallbackController};
use crate::metrics_consts::PLANNED_BATCH_SIZE_HISTOGRAM;
use crate::planner::BatchPlanner;
use crate::result::{DetectionResult, ErrorHandlingInfo};

/// An identifier that is safe to send to the store: trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedId(String);

impl ValidatedId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Ids extracted from a slice of records.
#[derive(Debug, Default)]
pub struct ExtractedIds {
    /// Validated id of each record, by position. `None` for records that have none.
    pub per_record: Vec<Option<ValidatedId>>,
    /// Distinct validated ids, in first-seen order.
    pub unique: Vec<String>,
    pub excluded: usize,
}

pub fn extract_ids(records: &[Record]) -> ExtractedIds {
    let mut extracted = ExtractedIds {
        per_record: Vec::with_capacity(records.len()),
        ..Default::default()
    };
    let mut seen = HashSet::with_capacity(records.len());

    for (position, record) in records.iter().enumerate() {
        match ValidatedId::parse(&record.id) {
            Some(id) => {
                if seen.insert(id.as_str().to_owned()) {
                    extracted.unique.push(id.as_str().to_owned());
                }
                extracted.per_record.push(Some(id));
            }
            None => {
                debug!(position, "record has no usable id");
                extracted.excluded += 1;
                extracted.per_record.push(None);
            }
        }
    }

    if extracted.excluded > 0 {
        warn!(
            excluded = extracted.excluded,
            records = records.len(),
            "records without a usable id are counted as new"
        );
    }

    extracted
}

/// Split `records` according to which of their ids exist.
fn partition(
    records: &[Record],
    ids: Vec<Option<ValidatedId>>,
    existing: &HashSet<String>,
) -> DetectionResult {
    let mut result = DetectionResult {
        total_records: records.len(),
        chunks_processed: 1,
        ..Default::default()
    };

    for (record, id) in records.iter().zip(ids) {
        match id {
            Some(id) if existing.contains(id.as_str()) => {
                result.duplicates.push(record.clone());
                result.duplicate_ids.push(id.into_inner());
            }
            Some(id) => {
                result.new_records.push(record.clone());
                result.new_record_ids.push(id.into_inner());
            }
            None => {
                result.new_records.push(record.clone());
                result.excluded_count += 1;
            }
        }
    }

    result.duplicate_count = result.duplicates.len();
    result.new_record_count = result.new_records.len();
    result
}

/// Detection over one in-memory slice of records: cache, then batched store lookups.
pub struct DetectionPipeline {
    cache: Arc<QueryCache>,
    collector: Arc<MetricsCollector>,
    planner: BatchPlanner,
    controller: RetryFallbackController,
}

impl DetectionPipeline {
    pub fn new(
        cache: Arc<QueryCache>,
        collector: Arc<MetricsCollector>,
        planner: BatchPlanner,
        controller: RetryFallbackController,
    ) -> Self {
        Self {
            cache,
            collector,
            planner,
            controller,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Partition `records` into duplicates and new records.
    ///
    /// `dataset_size` is the size of the whole request this slice belongs to; the planner
    /// uses it to decide whether bigger batches are worth it.
    pub async fn detect(
        &self,
        records: &[Record],
        dataset_size: usize,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, FallbackError> {
        let start = Instant::now();
        let extracted = extract_ids(records);

        self.cache.adapt_capacity(dataset_size.max(extracted.unique.len()));
        let lookup = self.cache.lookup_many(&extracted.unique);
        self.collector
            .record_cache_lookup(lookup.hits.len(), lookup.misses.len());

        let mut existing: HashSet<String> = lookup
            .hits
            .iter()
            .filter(|(_, exists)| **exists)
            .map(|(id, _)| id.clone())
            .collect();
        let mut error_handling = ErrorHandlingInfo::default();

        if !lookup.misses.is_empty() {
            let batch_size = self.planner.plan_batch_size(
                dataset_size.max(lookup.misses.len()),
                self.collector.recent_average_latency_ms(),
            );
            metrics::histogram!(PLANNED_BATCH_SIZE_HISTOGRAM).record(batch_size as f64);
            debug!(
                misses = lookup.misses.len(),
                cache_hits = lookup.hits.len(),
                batch_size,
                "querying record store"
            );

            for batch in lookup.misses.chunks(batch_size) {
                if cancel.is_cancelled() {
                    return Err(FallbackError::Cancelled);
                }

                let resolved = match self.controller.resolve(batch, cancel).await {
                    Ok(resolved) => resolved,
                    Err(FallbackError::Exhausted(error)) => {
                        self.collector.record_failed_batch();
                        return Err(FallbackError::Exhausted(error));
                    }
                    Err(FallbackError::Cancelled) => return Err(FallbackError::Cancelled),
                };
                self.collector.record_batch(&resolved.error_handling);

                // Assumed answers must not outlive this call.
                let unresolved: HashSet<&str> =
                    resolved.unresolved.iter().map(String::as_str).collect();
                self.cache.put_many(
                    batch
                        .iter()
                        .filter(|id| !unresolved.contains(id.as_str()))
                        .map(|id| (id.as_str(), resolved.existing.contains(id))),
                );

                existing.extend(resolved.existing);
                error_handling.merge(resolved.error_handling);
            }
        }

        let mut result = partition(records, extracted.per_record, &existing);
        result.cache_hits = lookup.hits.len();
        result.error_handling = error_handling;
        result.check_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dedup_common::store::{FailureScope, MemoryRecordStore, StoreError};

    use super::*;
    use crate::config::EngineConfig;
    use crate::gateway::StoreGateway;

    fn records(ids: &[&str]) -> Vec<Record> {
        ids.iter().map(|id| Record::new(*id, "555-0100")).collect()
    }

    fn pipeline(store: Arc<MemoryRecordStore>, config: &EngineConfig) -> DetectionPipeline {
        let collector = Arc::new(MetricsCollector::new());
        let gateway = StoreGateway::new(store, collector.clone(), config.max_ids_per_query);
        DetectionPipeline::new(
            Arc::new(QueryCache::from_config(config)),
            collector,
            BatchPlanner::new(config.batch_size),
            RetryFallbackController::new(gateway, config),
        )
    }

    #[test]
    fn test_validated_id() {
        assert_eq!(ValidatedId::parse("  A1 ").unwrap().as_str(), "A1");
        assert!(ValidatedId::parse("").is_none());
        assert!(ValidatedId::parse(" \t ").is_none());
    }

    #[test]
    fn test_extract_ids_dedupes_in_order() {
        let extracted = extract_ids(&records(&["B", "A", " B ", "", "C"]));

        assert_eq!(extracted.unique, vec!["B", "A", "C"]);
        assert_eq!(extracted.excluded, 1);
        assert_eq!(extracted.per_record.len(), 5);
        assert!(extracted.per_record[3].is_none());
    }

    #[test]
    fn test_extract_ids_mostly_blank_sheet() {
        let mut ids = vec![""; 5000];
        ids[17] = "A1";
        let extracted = extract_ids(&records(&ids));

        assert_eq!(extracted.unique, vec!["A1"]);
        assert_eq!(extracted.excluded, 4999);
        assert_eq!(extracted.per_record.len(), 5000);
        assert!(extracted.per_record[17].is_some());
    }

    #[tokio::test]
    async fn test_detect_partitions_records() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1", "A2"]));
        let pipeline = pipeline(store.clone(), &EngineConfig::default_for_test());

        let result = pipeline
            .detect(&records(&["A1", "A2", "A3", "A4"]), 4, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.duplicate_ids, vec!["A1", "A2"]);
        assert_eq!(result.new_record_ids, vec!["A3", "A4"]);
        assert_eq!(result.duplicate_count, 2);
        assert_eq!(result.new_record_count, 2);
        assert_eq!(result.total_records, 4);
        assert!(result.error_handling.is_clean());
    }

    #[tokio::test]
    async fn test_repeated_ids_are_queried_once() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1"]));
        let pipeline = pipeline(store.clone(), &EngineConfig::default_for_test());

        let result = pipeline
            .detect(&records(&["A1", "A1", "A2"]), 3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.queried_ids(), 2);
        assert_eq!(result.duplicate_count, 2);
        assert_eq!(result.duplicate_ids, vec!["A1", "A1"]);
    }

    #[tokio::test]
    async fn test_blank_ids_are_new_and_never_queried() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1"]));
        let pipeline = pipeline(store.clone(), &EngineConfig::default_for_test());
        let input = vec![Record::new("", "123"), Record::new("A1", "456")];

        let result = pipeline
            .detect(&input, 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.queried_ids(), 1);
        assert_eq!(result.new_records, vec![Record::new("", "123")]);
        assert!(result.new_record_ids.is_empty());
        assert_eq!(result.excluded_count, 1);
        assert_eq!(result.duplicate_count + result.new_record_count, result.total_records);
    }

    #[tokio::test]
    async fn test_only_cache_misses_reach_the_store() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1", "A2"]));
        let pipeline = pipeline(store.clone(), &EngineConfig::default_for_test());
        let input = records(&["A1", "A2", "A3"]);

        pipeline
            .detect(&input, 3, &CancellationToken::new())
            .await
            .unwrap();
        let second = pipeline
            .detect(&input, 3, &CancellationToken::new())
            .await
            .unwrap();

        // Positive answers were cached, A3 is re-checked.
        assert_eq!(store.batch_sizes(), vec![3, 1]);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.duplicate_count, 2);
    }

    #[tokio::test]
    async fn test_batches_follow_the_planner() {
        let store = Arc::new(MemoryRecordStore::new());
        let config = EngineConfig {
            batch_size: 4,
            ..EngineConfig::default_for_test()
        };
        let pipeline = pipeline(store.clone(), &config);
        let ids: Vec<String> = (0..10).map(|i| format!("id-{i}")).collect();
        let input: Vec<Record> = ids.iter().map(|id| Record::new(id.as_str(), "")).collect();

        pipeline
            .detect(&input, input.len(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.batch_sizes(), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_degraded_answers_are_not_cached() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1"]));
        store.fail_always(
            StoreError::TimeoutError("slow".to_owned()),
            FailureScope::All,
        );
        let pipeline = pipeline(store.clone(), &EngineConfig::default_for_test());

        let result = pipeline
            .detect(&records(&["A1"]), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.error_handling.graceful_degradation);
        assert_eq!(result.new_record_count, 1);
        assert!(pipeline.cache().is_empty());

        store.clear_failure();
        let result = pipeline
            .detect(&records(&["A1"]), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.duplicate_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_querying() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_latency(Duration::from_millis(1));
        let pipeline = pipeline(store.clone(), &EngineConfig::default_for_test());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .detect(&records(&["A1"]), 1, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FallbackError::Cancelled));
        assert_eq!(store.batch_calls(), 0);
    }
}
