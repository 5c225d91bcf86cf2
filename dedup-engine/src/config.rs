use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Tuning for the duplicate detection engine.
///
/// Every option can be overridden independently from the environment; `Default` returns the
/// same values without reading it.
#[derive(Envconfig, Clone, Debug)]
pub struct EngineConfig {
    /// Identifiers per store query before latency-based adjustment.
    #[envconfig(default = "1000")]
    pub batch_size: usize,

    /// Batch query attempts before falling back to per-id lookups.
    #[envconfig(default = "3")]
    pub max_retries: u32,

    /// Base of the linear backoff between attempts.
    #[envconfig(default = "1000")]
    pub retry_delay: EnvMsDuration,

    #[envconfig(default = "300000")]
    pub cache_ttl: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub max_cache_size: usize,

    /// Ceiling the cache may grow to when a single call carries more ids than `max_cache_size`.
    #[envconfig(default = "50000")]
    pub adaptive_max_cache_size: usize,

    /// Also cache "does not exist" answers. Saves store round-trips for re-submitted new
    /// records, at the price of missing rows inserted elsewhere for up to `cache_ttl`.
    #[envconfig(default = "false")]
    pub cache_negative_results: bool,

    /// Record count above which input is processed in sequential chunks.
    #[envconfig(default = "5000")]
    pub streaming_threshold: usize,

    #[envconfig(default = "1000")]
    pub chunk_size: usize,

    /// Chunk size used for workloads known to be mostly duplicates.
    #[envconfig(default = "500")]
    pub high_duplicate_chunk_size: usize,

    #[envconfig(default = "3")]
    pub max_concurrent_chunks: usize,

    #[envconfig(default = "104857600")]
    pub memory_ceiling_bytes: u64,

    /// Fraction of `memory_ceiling_bytes` above which streaming is forced.
    #[envconfig(default = "0.7")]
    pub memory_pressure_ratio: f64,

    /// Check memory usage every this many chunks while streaming.
    #[envconfig(default = "5")]
    pub memory_check_interval: usize,

    #[envconfig(default = "100")]
    pub memory_settle_delay: EnvMsDuration,

    /// Cooperative pause between chunks and between fallback sub-batches. Zero disables it.
    #[envconfig(default = "10")]
    pub pacing_delay: EnvMsDuration,

    /// Ids looked up concurrently during individual fallback.
    #[envconfig(default = "10")]
    pub fallback_batch_size: usize,

    /// Upper bound on ids sent in a single store query.
    #[envconfig(default = "10000")]
    pub max_ids_per_query: usize,

    #[envconfig(default = "true")]
    pub graceful_degradation: bool,

    #[envconfig(default = "true")]
    pub fallback_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_retries: 3,
            retry_delay: EnvMsDuration::from_millis(1000),
            cache_ttl: EnvMsDuration::from_millis(300_000),
            max_cache_size: 10_000,
            adaptive_max_cache_size: 50_000,
            cache_negative_results: false,
            streaming_threshold: 5000,
            chunk_size: 1000,
            high_duplicate_chunk_size: 500,
            max_concurrent_chunks: 3,
            memory_ceiling_bytes: 100 * 1024 * 1024,
            memory_pressure_ratio: 0.7,
            memory_check_interval: 5,
            memory_settle_delay: EnvMsDuration::from_millis(100),
            pacing_delay: EnvMsDuration::from_millis(10),
            fallback_batch_size: 10,
            max_ids_per_query: 10_000,
            graceful_degradation: true,
            fallback_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Defaults with every delay removed, so tests don't sleep.
    pub fn default_for_test() -> Self {
        Self {
            retry_delay: EnvMsDuration::from_millis(0),
            memory_settle_delay: EnvMsDuration::from_millis(0),
            pacing_delay: EnvMsDuration::from_millis(0),
            ..Self::default()
        }
    }

    /// Memory usage above which streaming is forced regardless of record count.
    pub fn memory_pressure_bytes(&self) -> u64 {
        (self.memory_ceiling_bytes as f64 * self.memory_pressure_ratio) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

impl EnvMsDuration {
    pub const fn from_millis(ms: u64) -> Self {
        EnvMsDuration(time::Duration::from_millis(ms))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
