use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::result::{DetectionResult, ErrorHandlingInfo};

/// Number of store query latencies averaged for batch planning.
const LATENCY_WINDOW: usize = 20;

const UNHEALTHY_ERROR_RATE: f64 = 0.25;
const DEGRADED_ERROR_RATE: f64 = 0.05;
const DEGRADED_FALLBACK_RATE: f64 = 0.10;

/// Snapshot of engine activity since start (or the last reset).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMetrics {
    pub total_checks: u64,
    pub failed_checks: u64,
    pub records_checked: u64,
    pub duplicates_found: u64,
    pub average_check_time_ms: f64,
    pub cache_hit_rate: f64,
    pub batch_checks: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub degradations: u64,
    pub recent_average_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthState,
    pub error_rate: f64,
    pub fallback_rate: f64,
    pub batch_checks: u64,
}

#[derive(Default)]
struct CollectorState {
    total_checks: u64,
    failed_checks: u64,
    records_checked: u64,
    duplicates_found: u64,
    total_check_time_ms: u64,
    batch_checks: u64,
    failed_batch_checks: u64,
    retries: u64,
    fallbacks: u64,
    degradations: u64,
    cache_hits: u64,
    cache_misses: u64,
    recent_latencies_ms: VecDeque<f64>,
}

/// Process-wide aggregation of detection outcomes.
///
/// Feeds `getMetrics`/`getHealthStatus` and the batch planner. Prometheus export is done
/// separately at the call sites, this only keeps what the engine itself needs to read back.
#[derive(Default)]
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed call to one of the check entry points.
    pub fn record_check(&self, result: &DetectionResult, elapsed: Duration) {
        let mut state = self.lock();
        state.total_checks += 1;
        state.records_checked += result.total_records as u64;
        state.duplicates_found += result.duplicate_count as u64;
        state.total_check_time_ms += elapsed.as_millis() as u64;
    }

    pub fn record_failed_check(&self) {
        let mut state = self.lock();
        state.total_checks += 1;
        state.failed_checks += 1;
    }

    pub fn record_cache_lookup(&self, hits: usize, misses: usize) {
        let mut state = self.lock();
        state.cache_hits += hits as u64;
        state.cache_misses += misses as u64;
    }

    /// Record the outcome of resolving one batch of ids.
    pub fn record_batch(&self, info: &ErrorHandlingInfo) {
        let mut state = self.lock();
        state.batch_checks += 1;
        state.retries += u64::from(info.retry_attempts);
        if info.fallback_used {
            state.fallbacks += 1;
        }
        if info.graceful_degradation {
            state.degradations += 1;
        }
        if info.fallback_used || info.graceful_degradation {
            state.failed_batch_checks += 1;
        }
    }

    /// Record a batch that exhausted every recovery path without degrading.
    pub fn record_failed_batch(&self) {
        let mut state = self.lock();
        state.batch_checks += 1;
        state.failed_batch_checks += 1;
    }

    pub fn record_query_latency(&self, latency: Duration) {
        let mut state = self.lock();
        if state.recent_latencies_ms.len() == LATENCY_WINDOW {
            state.recent_latencies_ms.pop_front();
        }
        state
            .recent_latencies_ms
            .push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Mean of the most recent store query latencies, 0 when nothing was recorded yet.
    pub fn recent_average_latency_ms(&self) -> f64 {
        let state = self.lock();
        Self::average_latency(&state)
    }

    pub fn snapshot(&self) -> DetectionMetrics {
        let state = self.lock();
        let successful_checks = state.total_checks - state.failed_checks;

        DetectionMetrics {
            total_checks: state.total_checks,
            failed_checks: state.failed_checks,
            records_checked: state.records_checked,
            duplicates_found: state.duplicates_found,
            average_check_time_ms: ratio(state.total_check_time_ms, successful_checks),
            cache_hit_rate: ratio(state.cache_hits, state.cache_hits + state.cache_misses),
            batch_checks: state.batch_checks,
            retries: state.retries,
            fallbacks: state.fallbacks,
            degradations: state.degradations,
            recent_average_latency_ms: Self::average_latency(&state),
        }
    }

    pub fn health_status(&self) -> HealthReport {
        let state = self.lock();
        let error_rate = ratio(state.failed_batch_checks, state.batch_checks);
        let fallback_rate = ratio(state.fallbacks, state.batch_checks);

        let status = if error_rate > UNHEALTHY_ERROR_RATE {
            HealthState::Unhealthy
        } else if error_rate > DEGRADED_ERROR_RATE || fallback_rate > DEGRADED_FALLBACK_RATE {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthReport {
            status,
            error_rate,
            fallback_rate,
            batch_checks: state.batch_checks,
        }
    }

    pub fn reset(&self) {
        *self.lock() = CollectorState::default();
    }

    fn average_latency(state: &CollectorState) -> f64 {
        if state.recent_latencies_ms.is_empty() {
            return 0.0;
        }
        state.recent_latencies_ms.iter().sum::<f64>() / state.recent_latencies_ms.len() as f64
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
