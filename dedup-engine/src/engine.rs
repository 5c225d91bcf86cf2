use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dedup_common::record::{Record, RecordDetail};
use dedup_common::store::RecordStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::QueryCache;
use crate::collector::{DetectionMetrics, HealthReport, MetricsCollector};
use crate::config::EngineConfig;
use crate::error::DetectionError;
use crate::fallback::{FallbackError, RetryFallbackController};
use crate::gateway::StoreGateway;
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::metrics_consts::{
    CHECK_DURATION_HISTOGRAM, CHECK_FAILURES_COUNTER, DUPLICATE_CHECKS_TOTAL_COUNTER,
    DUPLICATE_RECORDS_TOTAL_COUNTER, EXCLUDED_RECORDS_TOTAL_COUNTER, NEW_RECORDS_TOTAL_COUNTER,
};
use crate::pipeline::{DetectionPipeline, ValidatedId};
use crate::planner::BatchPlanner;
use crate::report::DuplicateReport;
use crate::result::DetectionResult;
use crate::streaming::{DetectionMode, StreamingProcessor};

/// Per-call options for `check_with_options`.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub mode: DetectionMode,
    /// Cancelling stops the check at the next chunk, batch or backoff boundary.
    pub cancel: CancellationToken,
}

impl CheckOptions {
    pub fn with_mode(mode: DetectionMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}

/// Decides which incoming records already exist in the record store.
///
/// The engine owns no process-wide state of its own: the cache is injected so the application
/// decides its lifetime, and the metrics collector lives as long as the engine.
pub struct DuplicateDetectionEngine {
    config: EngineConfig,
    cache: Arc<QueryCache>,
    collector: Arc<MetricsCollector>,
    gateway: StoreGateway,
    pipeline: Arc<DetectionPipeline>,
    streaming: StreamingProcessor,
}

impl DuplicateDetectionEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn RecordStore>, cache: Arc<QueryCache>) -> Self {
        let collector = Arc::new(MetricsCollector::new());
        let gateway = StoreGateway::new(store, collector.clone(), config.max_ids_per_query);
        let pipeline = Arc::new(DetectionPipeline::new(
            cache.clone(),
            collector.clone(),
            BatchPlanner::new(config.batch_size),
            RetryFallbackController::new(gateway.clone(), &config),
        ));
        let streaming =
            StreamingProcessor::new(pipeline.clone(), Arc::new(ProcessMemoryProbe::new()), &config);

        Self {
            config,
            cache,
            collector,
            gateway,
            pipeline,
            streaming,
        }
    }

    /// Replace the probe used to detect memory pressure.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.streaming = StreamingProcessor::new(self.pipeline.clone(), probe, &self.config);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub async fn check_for_duplicates(
        &self,
        records: &[Record],
    ) -> Result<DetectionResult, DetectionError> {
        self.check_with_options(records, CheckOptions::default())
            .await
    }

    /// Partition `records` into duplicates and new records.
    ///
    /// Store trouble is absorbed into `error_handling` unless graceful degradation is off.
    #[instrument(skip_all, fields(records = records.len(), mode = ?options.mode))]
    pub async fn check_with_options(
        &self,
        records: &[Record],
        options: CheckOptions,
    ) -> Result<DetectionResult, DetectionError> {
        if records.is_empty() {
            return Err(self.check_failed(DetectionError::EmptyInput));
        }

        let start = Instant::now();
        let streamed = self.should_stream(records.len(), options.mode);
        let path = if streamed { "streaming" } else { "standard" };

        let outcome = if streamed {
            self.streaming
                .process(records, options.mode, &options.cancel)
                .await
        } else {
            self.pipeline
                .detect(records, records.len(), &options.cancel)
                .await
                .map_err(|error| match error {
                    FallbackError::Cancelled => DetectionError::Cancelled {
                        partial: Box::default(),
                    },
                    FallbackError::Exhausted(cause) => {
                        DetectionError::failed(records.len(), &cause)
                    }
                })
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(error) => return Err(self.check_failed(error)),
        };

        let elapsed = start.elapsed();
        result.check_time_ms = elapsed.as_millis() as u64;
        self.collector.record_check(&result, elapsed);

        metrics::counter!(DUPLICATE_CHECKS_TOTAL_COUNTER, "path" => path).increment(1);
        metrics::counter!(DUPLICATE_RECORDS_TOTAL_COUNTER).increment(result.duplicate_count as u64);
        metrics::counter!(NEW_RECORDS_TOTAL_COUNTER).increment(result.new_record_count as u64);
        metrics::counter!(EXCLUDED_RECORDS_TOTAL_COUNTER).increment(result.excluded_count as u64);
        metrics::histogram!(CHECK_DURATION_HISTOGRAM, "path" => path)
            .record(elapsed.as_secs_f64());

        if result.error_handling.graceful_degradation {
            warn!(path, summary = %result.summary(), "duplicate check completed degraded");
        } else {
            info!(path, summary = %result.summary(), "duplicate check completed");
        }

        Ok(result)
    }

    /// Whether a single id exists. A blank id never does.
    #[instrument(skip(self))]
    pub async fn is_duplicate_id(&self, id: &str) -> Result<bool, DetectionError> {
        let Some(id) = ValidatedId::parse(id) else {
            return Ok(false);
        };

        if let Some(exists) = self.cache.lookup(id.as_str()) {
            self.collector.record_cache_lookup(1, 0);
            return Ok(exists);
        }
        self.collector.record_cache_lookup(0, 1);

        match self.gateway.single_exists(id.as_str()).await {
            Ok(exists) => {
                self.cache.put(id.as_str(), exists);
                Ok(exists)
            }
            Err(error) if self.config.graceful_degradation => {
                warn!("single id lookup failed, assuming it is new: {}", error);
                Ok(false)
            }
            Err(error) => Err(DetectionError::failed(1, &error)),
        }
    }

    /// Only the records that do not exist yet. Fails open: with graceful degradation on, any
    /// failure returns the input unchanged.
    pub async fn filter_new_records(
        &self,
        records: &[Record],
    ) -> Result<Vec<Record>, DetectionError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        match self.check_for_duplicates(records).await {
            Ok(result) => Ok(result.new_records),
            Err(error) if self.config.graceful_degradation => {
                warn!(
                    records = records.len(),
                    "filtering failed, keeping every record: {}", error
                );
                Ok(records.to_vec())
            }
            Err(error) => Err(error),
        }
    }

    #[instrument(skip_all, fields(ids = ids.len()))]
    pub async fn get_existing_record_details(
        &self,
        ids: &[String],
    ) -> Result<Vec<RecordDetail>, DetectionError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .iter()
            .filter_map(|id| ValidatedId::parse(id))
            .map(ValidatedId::into_inner)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        match self.gateway.record_details(&ids).await {
            Ok(details) => Ok(details),
            Err(error) if self.config.graceful_degradation => {
                warn!("record details lookup failed, returning none: {}", error);
                Ok(Vec::new())
            }
            Err(error) => Err(DetectionError::failed(ids.len(), &error)),
        }
    }

    /// Describe `duplicates` (usually `DetectionResult::duplicates`) against what is stored.
    #[instrument(skip(self, duplicates), fields(duplicates = duplicates.len()))]
    pub async fn generate_duplicate_report(
        &self,
        duplicates: &[Record],
        source_label: &str,
    ) -> Result<DuplicateReport, DetectionError> {
        let ids: Vec<String> = duplicates.iter().map(|record| record.id.clone()).collect();
        let details = self.get_existing_record_details(&ids).await?;

        let store_total = match self.gateway.count().await {
            Ok(total) => Some(total),
            Err(error) => {
                warn!("could not count stored records for the report: {}", error);
                None
            }
        };

        Ok(DuplicateReport::build(
            source_label,
            duplicates,
            details,
            store_total,
        ))
    }

    pub async fn store_count(&self) -> Result<i64, DetectionError> {
        self.gateway
            .count()
            .await
            .map_err(|error| DetectionError::failed(0, &error))
    }

    pub fn get_metrics(&self) -> DetectionMetrics {
        self.collector.snapshot()
    }

    pub fn get_health_status(&self) -> HealthReport {
        self.collector.health_status()
    }

    pub fn reset_metrics(&self) {
        self.collector.reset();
    }

    fn should_stream(&self, record_count: usize, mode: DetectionMode) -> bool {
        if self.streaming.should_stream(record_count) {
            return true;
        }
        mode == DetectionMode::HighDuplicate && record_count > self.streaming.chunk_size(mode)
    }

    fn check_failed(&self, error: DetectionError) -> DetectionError {
        self.collector.record_failed_check();
        metrics::counter!(CHECK_FAILURES_COUNTER, "kind" => error.kind().as_str()).increment(1);
        match &error {
            DetectionError::Cancelled { .. } => info!("{}", error),
            _ => warn!("{}", error),
        }
        error
    }
}
