//! Recovery chain for a batch existence query.
//!
//! ```text
//! Attempting(1) --ok--> Done
//!      | err, retryable, attempts left: sleep retry_delay * n
//!      v
//! Attempting(n) --ok--> Done
//!      | attempts exhausted (or data error)        | auth error, or fallback disabled
//!      v                                           v
//! FallbackIndividual --some ids resolved--> Done   GracefulDegrade / Fatal
//!      | no id could be resolved
//!      v
//! GracefulDegrade (assume new) --> Done    or    Fatal (degradation disabled)
//! ```
//!
//! The state machine is a plain loop over `BatchState`; the only suspension points are store
//! calls and backoff/pacing sleeps, all of which observe the cancellation token.
use std::collections::HashSet;
use std::time::Duration;

use dedup_common::store::StoreError;
use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::gateway::StoreGateway;
use crate::metrics_consts::{DEGRADATIONS_COUNTER, FALLBACKS_COUNTER, RETRIES_COUNTER};
use crate::result::{ErrorHandlingInfo, ErrorRecord, ErrorStage};
use crate::retry::RetryPolicy;
use crate::time::pause;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("every recovery path failed: {0}")]
    Exhausted(StoreError),
    #[error("batch resolution was cancelled")]
    Cancelled,
}

/// Answer for one batch of ids, with how it was obtained.
#[derive(Debug, Default)]
pub struct ResolvedBatch {
    pub existing: HashSet<String>,
    /// Ids for which no answer could be obtained; they are treated as new.
    pub unresolved: Vec<String>,
    pub error_handling: ErrorHandlingInfo,
}

#[derive(Debug)]
enum BatchState {
    Attempting { attempt: u32 },
    FallbackIndividual { cause: StoreError },
    GracefulDegrade,
    Fatal(StoreError),
    Done,
}

struct IndividualOutcome {
    existing: Vec<String>,
    failed: Vec<String>,
    last_error: Option<StoreError>,
}

pub struct RetryFallbackController {
    gateway: StoreGateway,
    policy: RetryPolicy,
    fallback_enabled: bool,
    graceful_degradation: bool,
    fallback_batch_size: usize,
    pacing_delay: Duration,
}

impl RetryFallbackController {
    pub fn new(gateway: StoreGateway, config: &EngineConfig) -> Self {
        Self {
            gateway,
            policy: RetryPolicy::new(config.max_retries, config.retry_delay.0),
            fallback_enabled: config.fallback_enabled,
            graceful_degradation: config.graceful_degradation,
            fallback_batch_size: config.fallback_batch_size.max(1),
            pacing_delay: config.pacing_delay.0,
        }
    }

    pub fn graceful_degradation(&self) -> bool {
        self.graceful_degradation
    }

    /// Find which of `ids` exist, recovering from store failures as configured.
    pub async fn resolve(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<ResolvedBatch, FallbackError> {
        let mut resolved = ResolvedBatch::default();
        if ids.is_empty() {
            return Ok(resolved);
        }

        let mut state = BatchState::Attempting { attempt: 1 };
        loop {
            state = match state {
                BatchState::Attempting { attempt } => {
                    if cancel.is_cancelled() {
                        return Err(FallbackError::Cancelled);
                    }
                    self.attempt_batch(ids, attempt, &mut resolved, cancel)
                        .await?
                }
                BatchState::FallbackIndividual { cause } => {
                    resolved.error_handling.fallback_used = true;
                    metrics::counter!(FALLBACKS_COUNTER).increment(1);
                    info!(
                        ids = ids.len(),
                        "falling back to individual lookups after: {}", cause
                    );

                    let outcome = self.lookup_individually(ids, &mut resolved, cancel).await?;
                    let nothing_resolved = outcome.existing.is_empty()
                        && outcome.failed.len() == ids.len();

                    resolved.existing.extend(outcome.existing);
                    resolved.unresolved = outcome.failed;

                    match (nothing_resolved, outcome.last_error) {
                        (true, Some(error)) => self.give_up(error),
                        _ => BatchState::Done,
                    }
                }
                BatchState::GracefulDegrade => {
                    resolved.error_handling.graceful_degradation = true;
                    resolved.existing.clear();
                    resolved.unresolved = ids.to_vec();
                    metrics::counter!(DEGRADATIONS_COUNTER).increment(1);
                    warn!(
                        ids = ids.len(),
                        "record store unavailable, assuming no duplicates for this batch"
                    );
                    BatchState::Done
                }
                BatchState::Fatal(cause) => {
                    error!(ids = ids.len(), "duplicate check failed: {}", cause);
                    return Err(FallbackError::Exhausted(cause));
                }
                BatchState::Done => return Ok(resolved),
            };
        }
    }

    async fn attempt_batch(
        &self,
        ids: &[String],
        attempt: u32,
        resolved: &mut ResolvedBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchState, FallbackError> {
        let error = match self.gateway.batch_exists(ids).await {
            Ok(existing) => {
                resolved.existing.extend(existing);
                return Ok(BatchState::Done);
            }
            Err(error) => error,
        };

        resolved.error_handling.errors.push(ErrorRecord {
            stage: ErrorStage::BatchQuery,
            kind: ErrorKind::from(&error),
            message: error.to_string(),
            ids_affected: ids.len(),
        });

        if error.is_retryable() && self.policy.allows_another(attempt) {
            let delay = self.policy.delay_after(attempt);
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "batch existence query failed, retrying: {}",
                error
            );
            resolved.error_handling.retry_attempts += 1;
            metrics::counter!(RETRIES_COUNTER).increment(1);

            if !pause(delay, cancel).await {
                return Err(FallbackError::Cancelled);
            }
            return Ok(BatchState::Attempting {
                attempt: attempt + 1,
            });
        }

        // Per-id queries hit the same credentials, they cannot do better.
        let next = match error {
            StoreError::AuthError(_) => self.give_up(error),
            _ if !self.fallback_enabled => self.give_up(error),
            cause => BatchState::FallbackIndividual { cause },
        };
        Ok(next)
    }

    async fn lookup_individually(
        &self,
        ids: &[String],
        resolved: &mut ResolvedBatch,
        cancel: &CancellationToken,
    ) -> Result<IndividualOutcome, FallbackError> {
        let mut outcome = IndividualOutcome {
            existing: Vec::new(),
            failed: Vec::new(),
            last_error: None,
        };

        for (index, sub_batch) in ids.chunks(self.fallback_batch_size).enumerate() {
            if index > 0 && !pause(self.pacing_delay, cancel).await {
                return Err(FallbackError::Cancelled);
            }
            if cancel.is_cancelled() {
                return Err(FallbackError::Cancelled);
            }

            let answers = join_all(
                sub_batch
                    .iter()
                    .map(|id| async move { (id, self.gateway.single_exists(id).await) }),
            )
            .await;

            let mut failures = 0;
            let mut first_error = None;
            for (id, answer) in answers {
                match answer {
                    Ok(true) => outcome.existing.push(id.clone()),
                    Ok(false) => {}
                    Err(error) => {
                        failures += 1;
                        outcome.failed.push(id.clone());
                        if first_error.is_none() {
                            first_error = Some(error.clone());
                        }
                        outcome.last_error = Some(error);
                    }
                }
            }

            if let Some(error) = first_error {
                resolved.error_handling.errors.push(ErrorRecord {
                    stage: ErrorStage::IndividualLookup,
                    kind: ErrorKind::from(&error),
                    message: error.to_string(),
                    ids_affected: failures,
                });
            }
        }

        Ok(outcome)
    }

    fn give_up(&self, error: StoreError) -> BatchState {
        if self.graceful_degradation {
            BatchState::GracefulDegrade
        } else {
            BatchState::Fatal(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dedup_common::store::{FailureScope, MemoryRecordStore};

    use super::*;
    use crate::collector::MetricsCollector;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn controller_for(
        store: Arc<MemoryRecordStore>,
        config: &EngineConfig,
    ) -> RetryFallbackController {
        let gateway = StoreGateway::new(store, Arc::new(MetricsCollector::new()), 1000);
        RetryFallbackController::new(gateway, config)
    }

    fn connection_error() -> StoreError {
        StoreError::ConnectionError("connection reset".to_owned())
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1", "A2"]));
        let controller = controller_for(store.clone(), &EngineConfig::default_for_test());

        let resolved = controller
            .resolve(&ids(&["A1", "A2", "A3"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.existing, HashSet::from(["A1".to_owned(), "A2".to_owned()]));
        assert!(resolved.unresolved.is_empty());
        assert!(resolved.error_handling.is_clean());
        assert_eq!(store.batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1"]));
        store.fail_times(2, connection_error(), FailureScope::BatchOnly);
        let controller = controller_for(store.clone(), &EngineConfig::default_for_test());

        let resolved = controller
            .resolve(&ids(&["A1", "A2"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.existing, HashSet::from(["A1".to_owned()]));
        assert_eq!(resolved.error_handling.retry_attempts, 2);
        assert_eq!(resolved.error_handling.errors.len(), 2);
        assert!(!resolved.error_handling.fallback_used);
        assert_eq!(store.batch_calls(), 3);
        assert_eq!(store.single_calls(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_individual_lookups() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1", "A3"]));
        store.fail_always(connection_error(), FailureScope::BatchOnly);
        let config = EngineConfig {
            fallback_batch_size: 2,
            ..EngineConfig::default_for_test()
        };
        let controller = controller_for(store.clone(), &config);

        let resolved = controller
            .resolve(&ids(&["A1", "A2", "A3"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.existing, HashSet::from(["A1".to_owned(), "A3".to_owned()]));
        assert!(resolved.error_handling.fallback_used);
        assert!(!resolved.error_handling.graceful_degradation);
        assert_eq!(resolved.error_handling.retry_attempts, 2);
        assert_eq!(store.batch_calls(), 3);
        assert_eq!(store.single_calls(), 3);
    }

    #[tokio::test]
    async fn test_partial_fallback_failures_are_tolerated() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1", "A2", "A3"]));
        store.fail_always(
            StoreError::DataError("bad row".to_owned()),
            FailureScope::BatchOnly,
        );
        let controller = controller_for(store.clone(), &EngineConfig::default_for_test());

        // Data errors are not retried but individual lookups are still tried.
        let resolved = controller
            .resolve(&ids(&["A1", "A2", "A3"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.batch_calls(), 1);
        assert_eq!(resolved.existing.len(), 3);

        // Three failed batch attempts, then the first individual lookup fails too.
        let store = Arc::new(MemoryRecordStore::with_ids(["A1", "A2", "A3"]));
        store.fail_times(4, connection_error(), FailureScope::All);
        let controller = controller_for(store, &EngineConfig::default_for_test());
        let resolved = controller
            .resolve(&ids(&["A1", "A2", "A3"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.existing.len(), 2);
        assert_eq!(resolved.unresolved.len(), 1);
        assert!(resolved.error_handling.fallback_used);
        assert!(!resolved.error_handling.graceful_degradation);
        assert!(resolved
            .error_handling
            .errors
            .iter()
            .any(|e| e.stage == ErrorStage::IndividualLookup && e.ids_affected == 1));
    }

    #[tokio::test]
    async fn test_total_failure_degrades_gracefully() {
        let store = Arc::new(MemoryRecordStore::with_ids(["A1"]));
        store.fail_always(connection_error(), FailureScope::All);
        let controller = controller_for(store.clone(), &EngineConfig::default_for_test());

        let resolved = controller
            .resolve(&ids(&["A1", "A2"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(resolved.existing.is_empty());
        assert_eq!(resolved.unresolved, ids(&["A1", "A2"]));
        assert!(resolved.error_handling.fallback_used);
        assert!(resolved.error_handling.graceful_degradation);
    }

    #[tokio::test]
    async fn test_total_failure_is_fatal_without_degradation() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(connection_error(), FailureScope::All);
        let config = EngineConfig {
            graceful_degradation: false,
            ..EngineConfig::default_for_test()
        };
        let controller = controller_for(store, &config);

        let err = controller
            .resolve(&ids(&["A1"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FallbackError::Exhausted(StoreError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_auth_errors_skip_retries_and_fallback() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(StoreError::AuthError("denied".to_owned()), FailureScope::All);
        let controller = controller_for(store.clone(), &EngineConfig::default_for_test());

        let resolved = controller
            .resolve(&ids(&["A1", "A2"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(resolved.error_handling.graceful_degradation);
        assert!(!resolved.error_handling.fallback_used);
        assert_eq!(resolved.error_handling.retry_attempts, 0);
        assert_eq!(store.batch_calls(), 1);
        assert_eq!(store.single_calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_disabled_goes_straight_to_degradation() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(connection_error(), FailureScope::BatchOnly);
        let config = EngineConfig {
            fallback_enabled: false,
            max_retries: 2,
            ..EngineConfig::default_for_test()
        };
        let controller = controller_for(store.clone(), &config);

        let resolved = controller
            .resolve(&ids(&["A1"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(resolved.error_handling.graceful_degradation);
        assert_eq!(store.batch_calls(), 2);
        assert_eq!(store.single_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(connection_error(), FailureScope::All);
        let config = EngineConfig {
            retry_delay: crate::config::EnvMsDuration::from_millis(60_000),
            ..EngineConfig::default_for_test()
        };
        let controller = controller_for(store, &config);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = controller
            .resolve(&ids(&["A1"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Cancelled));
    }
}
