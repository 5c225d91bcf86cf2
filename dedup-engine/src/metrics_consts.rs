// ==== Detection outcome metrics ====
/// Counter for calls to the duplicate check entry points, labelled by path (standard/streaming)
pub const DUPLICATE_CHECKS_TOTAL_COUNTER: &str = "dedup_checks_total";

/// Counter for records found to already exist in the store
pub const DUPLICATE_RECORDS_TOTAL_COUNTER: &str = "dedup_duplicate_records_total";

/// Counter for records found to be new
pub const NEW_RECORDS_TOTAL_COUNTER: &str = "dedup_new_records_total";

/// Counter for records whose id could not be extracted
pub const EXCLUDED_RECORDS_TOTAL_COUNTER: &str = "dedup_excluded_records_total";

/// Histogram for end-to-end duplicate check duration
pub const CHECK_DURATION_HISTOGRAM: &str = "dedup_check_duration_seconds";

/// Counter for checks that failed outright, labelled by error kind
pub const CHECK_FAILURES_COUNTER: &str = "dedup_check_failures_total";

// ==== Cache metrics ====
pub const CACHE_HITS_COUNTER: &str = "dedup_cache_hits_total";

pub const CACHE_MISSES_COUNTER: &str = "dedup_cache_misses_total";

/// Counter for entries removed by cleanup, labelled by reason (expired/capacity)
pub const CACHE_EVICTIONS_COUNTER: &str = "dedup_cache_evictions_total";

/// Gauge for the number of cached ids
pub const CACHE_SIZE_GAUGE: &str = "dedup_cache_entries";

// ==== Store metrics ====
/// Histogram for store query duration, labelled by operation
pub const STORE_QUERY_DURATION_HISTOGRAM: &str = "dedup_store_query_duration_seconds";

/// Counter for store query errors, labelled by operation and error kind
pub const STORE_QUERY_ERRORS_COUNTER: &str = "dedup_store_query_errors_total";

/// Histogram for the batch size chosen by the planner
pub const PLANNED_BATCH_SIZE_HISTOGRAM: &str = "dedup_planned_batch_size";

// ==== Recovery metrics ====
pub const RETRIES_COUNTER: &str = "dedup_batch_retries_total";

pub const FALLBACKS_COUNTER: &str = "dedup_individual_fallbacks_total";

pub const DEGRADATIONS_COUNTER: &str = "dedup_graceful_degradations_total";

// ==== Streaming metrics ====
pub const STREAMING_CHUNKS_COUNTER: &str = "dedup_streaming_chunks_total";

/// Counter for chunks that failed and were counted as new, labelled by error kind
pub const STREAMING_CHUNK_FAILURES_COUNTER: &str = "dedup_streaming_chunk_failures_total";

/// Counter for pauses taken because memory usage was above the ceiling
pub const MEMORY_PRESSURE_PAUSES_COUNTER: &str = "dedup_memory_pressure_pauses_total";
