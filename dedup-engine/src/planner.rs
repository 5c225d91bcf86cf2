/// Average store latency above which batches shrink.
pub const SLOW_LATENCY_MS: f64 = 5000.0;
/// Average store latency below which large datasets get bigger batches.
pub const FAST_LATENCY_MS: f64 = 1000.0;
/// Dataset size from which bigger batches are worth it.
pub const LARGE_DATASET_IDS: usize = 5000;

const REDUCED_BATCH_SIZE: usize = 500;
const INCREASED_BATCH_SIZE: usize = 2000;

/// Picks how many ids go into one store query.
///
/// A pure function of its inputs: the caller supplies the recent average latency from the
/// metrics collector, so the planner can be shared freely.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    base_batch_size: usize,
}

impl BatchPlanner {
    pub fn new(base_batch_size: usize) -> Self {
        Self {
            base_batch_size: base_batch_size.max(1),
        }
    }

    pub fn base_batch_size(&self) -> usize {
        self.base_batch_size
    }

    pub fn plan_batch_size(&self, total_ids: usize, recent_average_latency_ms: f64) -> usize {
        if recent_average_latency_ms > SLOW_LATENCY_MS {
            REDUCED_BATCH_SIZE.min(self.base_batch_size)
        } else if recent_average_latency_ms < FAST_LATENCY_MS && total_ids > LARGE_DATASET_IDS {
            INCREASED_BATCH_SIZE.min(self.base_batch_size * 2)
        } else {
            self.base_batch_size
        }
    }
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::new(1000)
    }
}
