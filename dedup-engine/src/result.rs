use dedup_common::record::Record;
use serde::Serialize;

use crate::error::ErrorKind;

/// Where in the pipeline a recorded error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    BatchQuery,
    IndividualLookup,
    Chunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub stage: ErrorStage,
    pub kind: ErrorKind,
    pub message: String,
    /// Number of identifiers whose answer was affected.
    pub ids_affected: usize,
}

/// How much recovery was needed to produce a result.
///
/// Anything other than the default means the result was produced with reduced confidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlingInfo {
    pub fallback_used: bool,
    pub graceful_degradation: bool,
    pub retry_attempts: u32,
    pub errors: Vec<ErrorRecord>,
}

impl ErrorHandlingInfo {
    pub fn merge(&mut self, other: ErrorHandlingInfo) {
        self.fallback_used |= other.fallback_used;
        self.graceful_degradation |= other.graceful_degradation;
        self.retry_attempts += other.retry_attempts;
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        *self == ErrorHandlingInfo::default()
    }
}

/// Partition of a set of records into those already stored and those that are new.
///
/// `duplicate_count + new_record_count == total_records` always holds. Records whose id
/// could not be extracted are counted in `excluded_count` and always land in `new_records`,
/// but their (unusable) ids are not listed in `new_record_ids`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub duplicates: Vec<Record>,
    pub new_records: Vec<Record>,
    pub duplicate_ids: Vec<String>,
    pub new_record_ids: Vec<String>,
    pub total_records: usize,
    pub duplicate_count: usize,
    pub new_record_count: usize,
    pub excluded_count: usize,
    /// Ids answered from the cache rather than the store.
    pub cache_hits: usize,
    pub chunks_processed: usize,
    #[serde(rename = "checkTime")]
    pub check_time_ms: u64,
    pub error_handling: ErrorHandlingInfo,
}

impl DetectionResult {
    /// Fold a chunk's result into this running aggregate. Order of merging does not affect
    /// the counts.
    pub fn merge(&mut self, other: DetectionResult) {
        self.duplicates.extend(other.duplicates);
        self.new_records.extend(other.new_records);
        self.duplicate_ids.extend(other.duplicate_ids);
        self.new_record_ids.extend(other.new_record_ids);
        self.total_records += other.total_records;
        self.duplicate_count += other.duplicate_count;
        self.new_record_count += other.new_record_count;
        self.excluded_count += other.excluded_count;
        self.cache_hits += other.cache_hits;
        self.chunks_processed += other.chunks_processed;
        self.check_time_ms += other.check_time_ms;
        self.error_handling.merge(other.error_handling);
    }

    /// Result for records that could not be checked at all: everything is new.
    pub fn all_new(records: &[Record], error_handling: ErrorHandlingInfo) -> Self {
        let new_record_ids = records
            .iter()
            .map(|record| record.id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let excluded_count = records.len() - new_record_ids.len();

        Self {
            new_records: records.to_vec(),
            new_record_ids,
            total_records: records.len(),
            new_record_count: records.len(),
            excluded_count,
            chunks_processed: 1,
            error_handling,
            ..Default::default()
        }
    }

    /// Fraction of records found to be duplicates (0.0 - 1.0).
    pub fn duplicate_ratio(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        self.duplicate_count as f64 / self.total_records as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "{} total | {} duplicates ({:.1}%) | {} new | {} excluded | {}ms",
            self.total_records,
            self.duplicate_count,
            self.duplicate_ratio() * 100.0,
            self.new_record_count,
            self.excluded_count,
            self.check_time_ms,
        )
    }
}
