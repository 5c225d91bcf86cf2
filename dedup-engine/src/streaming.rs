//! Chunked processing for inputs too large (or a process too full) to check in one go.
//!
//! Standard mode walks the chunks strictly in order, so at most one chunk's store traffic is in
//! flight. High-duplicate mode uses smaller chunks and lets up to `max_concurrent_chunks` of
//! them run at once behind a semaphore. Partial results are merged as chunks complete; the merge
//! is commutative so completion order does not change the aggregate counts.
use std::sync::Arc;
use std::time::Duration;

use dedup_common::record::Record;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{DetectionError, ErrorKind};
use crate::fallback::FallbackError;
use crate::memory::MemoryProbe;
use crate::metrics_consts::{
    MEMORY_PRESSURE_PAUSES_COUNTER, STREAMING_CHUNKS_COUNTER, STREAMING_CHUNK_FAILURES_COUNTER,
};
use crate::pipeline::DetectionPipeline;
use crate::result::{DetectionResult, ErrorHandlingInfo, ErrorRecord, ErrorStage};
use crate::time::pause;

/// Workload hint supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Sequential chunks of `chunk_size`.
    #[default]
    Standard,
    /// Most records are expected to exist already: smaller chunks, bounded concurrency.
    HighDuplicate,
}

pub struct StreamingProcessor {
    pipeline: Arc<DetectionPipeline>,
    memory: Arc<dyn MemoryProbe>,
    streaming_threshold: usize,
    chunk_size: usize,
    high_duplicate_chunk_size: usize,
    max_concurrent_chunks: usize,
    memory_ceiling_bytes: u64,
    memory_pressure_bytes: u64,
    memory_check_interval: usize,
    memory_settle_delay: Duration,
    pacing_delay: Duration,
    graceful_degradation: bool,
}

impl StreamingProcessor {
    pub fn new(
        pipeline: Arc<DetectionPipeline>,
        memory: Arc<dyn MemoryProbe>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pipeline,
            memory,
            streaming_threshold: config.streaming_threshold,
            chunk_size: config.chunk_size.max(1),
            high_duplicate_chunk_size: config.high_duplicate_chunk_size.max(1),
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
            memory_ceiling_bytes: config.memory_ceiling_bytes,
            memory_pressure_bytes: config.memory_pressure_bytes(),
            memory_check_interval: config.memory_check_interval,
            memory_settle_delay: config.memory_settle_delay.0,
            pacing_delay: config.pacing_delay.0,
            graceful_degradation: config.graceful_degradation,
        }
    }

    /// Stream when the input is above the threshold, or when the process is already using
    /// more than the pressure share of the memory ceiling.
    pub fn should_stream(&self, record_count: usize) -> bool {
        if record_count > self.streaming_threshold {
            return true;
        }
        match self.memory.used_bytes() {
            Some(used) if used > self.memory_pressure_bytes => {
                info!(
                    used_bytes = used,
                    pressure_bytes = self.memory_pressure_bytes,
                    "memory pressure, streaming a small input"
                );
                true
            }
            _ => false,
        }
    }

    pub fn chunk_size(&self, mode: DetectionMode) -> usize {
        match mode {
            DetectionMode::Standard => self.chunk_size,
            DetectionMode::HighDuplicate => self.high_duplicate_chunk_size,
        }
    }

    pub async fn process(
        &self,
        records: &[Record],
        mode: DetectionMode,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectionError> {
        let chunk_size = self.chunk_size(mode);
        info!(
            records = records.len(),
            chunk_size,
            ?mode,
            "streaming duplicate check"
        );

        match mode {
            DetectionMode::Standard => self.process_sequential(records, chunk_size, cancel).await,
            DetectionMode::HighDuplicate => {
                self.process_concurrent(records, chunk_size, cancel).await
            }
        }
    }

    async fn process_sequential(
        &self,
        records: &[Record],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectionError> {
        let mut total = DetectionResult::default();

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            if index > 0 && !self.between_chunks(index, cancel).await {
                return Err(cancelled(total));
            }
            if cancel.is_cancelled() {
                return Err(cancelled(total));
            }

            let outcome = self.pipeline.detect(chunk, records.len(), cancel).await;
            match outcome {
                Ok(partial) => {
                    metrics::counter!(STREAMING_CHUNKS_COUNTER).increment(1);
                    debug!(chunk = index, summary = %partial.summary(), "chunk done");
                    total.merge(partial);
                }
                Err(FallbackError::Cancelled) => return Err(cancelled(total)),
                Err(FallbackError::Exhausted(cause)) => {
                    let failed = self.chunk_failed(
                        index,
                        chunk,
                        ErrorKind::from(&cause),
                        cause.to_string(),
                        records.len(),
                    )?;
                    total.merge(failed);
                }
            }
        }

        Ok(total)
    }

    async fn process_concurrent(
        &self,
        records: &[Record],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectionError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_chunks));
        let mut tasks: JoinSet<(usize, ChunkOutcome)> = JoinSet::new();
        let mut total = DetectionResult::default();
        let mut interrupted = false;
        // Workers are detached from the join set, so stop them if this run returns early.
        let workers_cancel = cancel.child_token();
        let _stop_workers = workers_cancel.clone().drop_guard();

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            if index > 0 && !self.between_chunks(index, cancel).await {
                interrupted = true;
                break;
            }

            // Merge whatever finishes while waiting for a free slot.
            let permit = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.absorb(joined, records, chunk_size, &mut total)?;
                    }
                    permit = semaphore.clone().acquire_owned() => break permit.ok(),
                }
            };
            let Some(permit) = permit else {
                interrupted = true;
                break;
            };

            let pipeline = self.pipeline.clone();
            let chunk = chunk.to_vec();
            let dataset_size = records.len();
            let cancel = workers_cancel.clone();
            let worker =
                tokio::spawn(async move { pipeline.detect(&chunk, dataset_size, &cancel).await });
            // The outer task keeps the chunk index even when the worker panics.
            tasks.spawn(async move {
                let outcome = worker.await;
                drop(permit);
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.absorb(joined, records, chunk_size, &mut total)?;
        }

        if interrupted || cancel.is_cancelled() {
            return Err(cancelled(total));
        }
        Ok(total)
    }

    /// Fold one finished chunk task into `total`.
    fn absorb(
        &self,
        joined: Result<(usize, ChunkOutcome), JoinError>,
        records: &[Record],
        chunk_size: usize,
        total: &mut DetectionResult,
    ) -> Result<(), DetectionError> {
        // The outer task only awaits its worker, so it fails only when the runtime shuts down.
        let (index, outcome) = joined.map_err(|error| {
            error!("chunk task did not complete: {}", error);
            DetectionError::DetectionFailed {
                record_count: records.len(),
                kind: ErrorKind::Unknown,
                cause: error.to_string(),
            }
        })?;

        let start = index * chunk_size;
        let end = (start + chunk_size).min(records.len());
        let chunk = &records[start..end];

        match outcome {
            Ok(Ok(partial)) => {
                metrics::counter!(STREAMING_CHUNKS_COUNTER).increment(1);
                debug!(chunk = index, summary = %partial.summary(), "chunk done");
                total.merge(partial);
                Ok(())
            }
            // Only chunks that fully completed count towards the partial result.
            Ok(Err(FallbackError::Cancelled)) => Ok(()),
            Ok(Err(FallbackError::Exhausted(cause))) => {
                let failed = self.chunk_failed(
                    index,
                    chunk,
                    ErrorKind::from(&cause),
                    cause.to_string(),
                    records.len(),
                )?;
                total.merge(failed);
                Ok(())
            }
            Err(error) => {
                let failed = self.chunk_failed(
                    index,
                    chunk,
                    self.crashed_chunk_kind(),
                    format!("chunk task did not complete: {error}"),
                    records.len(),
                )?;
                total.merge(failed);
                Ok(())
            }
        }
    }

    /// A chunk task that died while the process sat above its memory ceiling is reported as
    /// memory exhaustion.
    fn crashed_chunk_kind(&self) -> ErrorKind {
        match self.memory.used_bytes() {
            Some(used) if used > self.memory_ceiling_bytes => ErrorKind::MemoryExhausted,
            _ => ErrorKind::Unknown,
        }
    }

    /// A chunk that could not be checked. Its records are counted as new when degradation
    /// is allowed, otherwise the whole run fails.
    fn chunk_failed(
        &self,
        index: usize,
        chunk: &[Record],
        kind: ErrorKind,
        cause: String,
        record_count: usize,
    ) -> Result<DetectionResult, DetectionError> {
        metrics::counter!(STREAMING_CHUNK_FAILURES_COUNTER, "kind" => kind.as_str()).increment(1);

        if !self.graceful_degradation {
            error!(chunk = index, %kind, "chunk failed, aborting: {}", cause);
            return Err(DetectionError::DetectionFailed {
                record_count,
                kind,
                cause,
            });
        }

        warn!(chunk = index, %kind, "chunk failed, counting its records as new: {}", cause);
        let info = ErrorHandlingInfo {
            graceful_degradation: true,
            errors: vec![ErrorRecord {
                stage: ErrorStage::Chunk,
                kind,
                message: cause,
                ids_affected: chunk.len(),
            }],
            ..Default::default()
        };
        Ok(DetectionResult::all_new(chunk, info))
    }

    /// Pacing and memory checks before chunk `index`. Returns false if cancelled meanwhile.
    async fn between_chunks(&self, index: usize, cancel: &CancellationToken) -> bool {
        if !pause(self.pacing_delay, cancel).await {
            return false;
        }

        if self.memory_check_interval == 0 || index % self.memory_check_interval != 0 {
            return true;
        }

        match self.memory.used_bytes() {
            Some(used) if used > self.memory_ceiling_bytes => {
                warn!(
                    used_bytes = used,
                    ceiling_bytes = self.memory_ceiling_bytes,
                    chunk = index,
                    "memory above ceiling, pausing between chunks"
                );
                metrics::counter!(MEMORY_PRESSURE_PAUSES_COUNTER).increment(1);
                self.memory.release_hint();
                pause(self.memory_settle_delay, cancel).await
            }
            _ => true,
        }
    }
}

type ChunkOutcome = Result<Result<DetectionResult, FallbackError>, JoinError>;

fn cancelled(partial: DetectionResult) -> DetectionError {
    info!(
        completed_chunks = partial.chunks_processed,
        records = partial.total_records,
        "duplicate check cancelled"
    );
    DetectionError::Cancelled {
        partial: Box::new(partial),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use dedup_common::record::RecordDetail;
    use dedup_common::store::{FailureScope, MemoryRecordStore, RecordStore, StoreError};

    use super::*;
    use crate::cache::QueryCache;
    use crate::collector::MetricsCollector;
    use crate::fallback::RetryFallbackController;
    use crate::gateway::StoreGateway;
    use crate::memory::FixedMemoryProbe;
    use crate::planner::BatchPlanner;

    fn processor(
        store: Arc<dyn RecordStore>,
        memory: Arc<FixedMemoryProbe>,
        config: &EngineConfig,
    ) -> StreamingProcessor {
        let collector = Arc::new(MetricsCollector::new());
        let gateway = StoreGateway::new(store, collector.clone(), config.max_ids_per_query);
        let pipeline = DetectionPipeline::new(
            Arc::new(QueryCache::from_config(config)),
            collector,
            BatchPlanner::new(config.batch_size),
            RetryFallbackController::new(gateway, config),
        );
        StreamingProcessor::new(Arc::new(pipeline), memory, config)
    }

    fn records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record::new(format!("id-{i}"), format!("555-{i:04}")))
            .collect()
    }

    fn store_with_every_third(count: usize) -> Arc<MemoryRecordStore> {
        Arc::new(MemoryRecordStore::with_ids(
            (0..count).step_by(3).map(|i| format!("id-{i}")),
        ))
    }

    /// Wraps a memory store to track concurrent `batch_exists` calls, and optionally panic
    /// on the n-th one like a buggy adapter would.
    struct InstrumentedStore {
        inner: Arc<MemoryRecordStore>,
        panic_on_call: Option<usize>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InstrumentedStore {
        fn new(inner: Arc<MemoryRecordStore>, panic_on_call: Option<usize>) -> Self {
            Self {
                inner,
                panic_on_call,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecordStore for InstrumentedStore {
        async fn batch_exists(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on_call == Some(call) {
                panic!("store adapter bug");
            }

            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(in_flight, Ordering::SeqCst);
            let result = self.inner.batch_exists(ids).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn single_exists(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.single_exists(id).await
        }

        async fn get_record_details(
            &self,
            ids: &[String],
        ) -> Result<Vec<RecordDetail>, StoreError> {
            self.inner.get_record_details(ids).await
        }

        async fn count(&self) -> Result<i64, StoreError> {
            self.inner.count().await
        }
    }

    fn high_duplicate_config() -> EngineConfig {
        EngineConfig {
            high_duplicate_chunk_size: 100,
            max_concurrent_chunks: 3,
            ..EngineConfig::default_for_test()
        }
    }

    #[test]
    fn test_should_stream() {
        let memory = Arc::new(FixedMemoryProbe::new(0));
        let config = EngineConfig::default_for_test();
        let processor = processor(Arc::new(MemoryRecordStore::new()), memory.clone(), &config);

        assert!(!processor.should_stream(5000));
        assert!(processor.should_stream(5001));

        memory.set(config.memory_pressure_bytes() + 1);
        assert!(processor.should_stream(10));
    }

    #[tokio::test]
    async fn test_sequential_chunks_merge() {
        let store = store_with_every_third(25);
        let config = EngineConfig {
            chunk_size: 10,
            ..EngineConfig::default_for_test()
        };
        let processor = processor(store.clone(), Arc::new(FixedMemoryProbe::new(0)), &config);

        let result = processor
            .process(&records(25), DetectionMode::Standard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.chunks_processed, 3);
        assert_eq!(result.total_records, 25);
        assert_eq!(result.duplicate_count, 9);
        assert_eq!(result.new_record_count, 16);
        assert_eq!(store.batch_sizes(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_concurrent_mode_matches_sequential() {
        let store = store_with_every_third(2000);
        let config = EngineConfig {
            chunk_size: 300,
            high_duplicate_chunk_size: 100,
            ..EngineConfig::default_for_test()
        };
        let processor = processor(store.clone(), Arc::new(FixedMemoryProbe::new(0)), &config);
        let input = records(2000);

        let concurrent = processor
            .process(&input, DetectionMode::HighDuplicate, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(concurrent.chunks_processed, 20);

        let fresh = self::processor(store, Arc::new(FixedMemoryProbe::new(0)), &config);
        let sequential = fresh
            .process(&input, DetectionMode::Standard, &CancellationToken::new())
            .await
            .unwrap();

        let as_set = |ids: &[String]| ids.iter().cloned().collect::<HashSet<_>>();
        assert_eq!(concurrent.duplicate_count, sequential.duplicate_count);
        assert_eq!(
            as_set(&concurrent.duplicate_ids),
            as_set(&sequential.duplicate_ids)
        );
        assert_eq!(concurrent.total_records, 2000);
    }

    #[tokio::test]
    async fn test_memory_pressure_triggers_release_hint() {
        let memory = Arc::new(FixedMemoryProbe::new(u64::MAX));
        let config = EngineConfig {
            chunk_size: 10,
            memory_check_interval: 2,
            ..EngineConfig::default_for_test()
        };
        let processor = processor(Arc::new(MemoryRecordStore::new()), memory.clone(), &config);

        let result = processor
            .process(&records(60), DetectionMode::Standard, &CancellationToken::new())
            .await
            .unwrap();

        // Checked before chunks 2 and 4.
        assert_eq!(memory.release_hints(), 2);
        assert_eq!(result.new_record_count, 60);
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_without_degradation() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(
            StoreError::ConnectionError("refused".to_owned()),
            FailureScope::All,
        );
        let config = EngineConfig {
            chunk_size: 10,
            graceful_degradation: false,
            ..EngineConfig::default_for_test()
        };
        let processor = processor(store.clone(), Arc::new(FixedMemoryProbe::new(0)), &config);

        let err = processor
            .process(&records(30), DetectionMode::Standard, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DetectionError::DetectionFailed {
                record_count, kind, ..
            } => {
                assert_eq!(record_count, 30);
                assert_eq!(kind, ErrorKind::ConnectionUnavailable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_chunks_respect_limit() {
        let inner = store_with_every_third(1000);
        inner.set_latency(Duration::from_millis(20));
        let store = Arc::new(InstrumentedStore::new(inner, None));
        let config = high_duplicate_config();
        let processor = processor(store.clone(), Arc::new(FixedMemoryProbe::new(0)), &config);

        let result = processor
            .process(&records(1000), DetectionMode::HighDuplicate, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.chunks_processed, 10);
        assert_eq!(result.duplicate_count, 334);
        assert!(store.peak() <= config.max_concurrent_chunks);
        assert!(store.peak() > 1);
    }

    #[tokio::test]
    async fn test_crashed_chunk_counts_records_as_new() {
        let store = Arc::new(InstrumentedStore::new(store_with_every_third(1000), Some(3)));
        let processor = processor(
            store,
            Arc::new(FixedMemoryProbe::new(0)),
            &high_duplicate_config(),
        );

        let result = processor
            .process(&records(1000), DetectionMode::HighDuplicate, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.chunks_processed, 10);
        assert_eq!(result.total_records, 1000);
        assert_eq!(result.duplicate_count + result.new_record_count, 1000);
        // One chunk of 100 holds at least 33 of the 334 stored ids.
        assert!(result.duplicate_count <= 301);
        assert!(result.error_handling.graceful_degradation);
        assert_eq!(result.error_handling.errors.len(), 1);
        let error = &result.error_handling.errors[0];
        assert_eq!(error.stage, ErrorStage::Chunk);
        assert_eq!(error.kind, ErrorKind::Unknown);
        assert_eq!(error.ids_affected, 100);
    }

    #[tokio::test]
    async fn test_crashed_chunk_above_memory_ceiling_aborts() {
        let store = Arc::new(InstrumentedStore::new(store_with_every_third(1000), Some(3)));
        let config = EngineConfig {
            graceful_degradation: false,
            ..high_duplicate_config()
        };
        let processor = processor(store, Arc::new(FixedMemoryProbe::new(u64::MAX)), &config);

        let err = processor
            .process(&records(1000), DetectionMode::HighDuplicate, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DetectionError::DetectionFailed {
                record_count, kind, ..
            } => {
                assert_eq!(record_count, 1000);
                assert_eq!(kind, ErrorKind::MemoryExhausted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_chunks() {
        let store = Arc::new(MemoryRecordStore::new());
        let config = EngineConfig {
            chunk_size: 10,
            pacing_delay: crate::config::EnvMsDuration::from_millis(50),
            ..EngineConfig::default_for_test()
        };
        let processor = processor(store, Arc::new(FixedMemoryProbe::new(0)), &config);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            canceller.cancel();
        });

        let err = processor
            .process(&records(100), DetectionMode::Standard, &cancel)
            .await
            .unwrap_err();

        let DetectionError::Cancelled { partial } = err else {
            panic!("expected cancellation");
        };
        assert!(partial.chunks_processed >= 1);
        assert!(partial.chunks_processed < 10);
        assert_eq!(partial.total_records, partial.chunks_processed * 10);
        assert_eq!(
            partial.duplicate_count + partial.new_record_count,
            partial.total_records
        );
    }
}
