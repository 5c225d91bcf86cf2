use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dedup_common::record::{Record, RecordDetail};
use serde::Serialize;

/// One incoming record that already exists, next to what the store holds for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateEntry {
    pub id: String,
    pub incoming_phone: String,
    /// `None` when the stored row could not be fetched.
    pub stored_phone: Option<String>,
    pub stored_created_at: Option<DateTime<Utc>>,
    pub phone_matches: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub source: String,
    pub generated_at: DateTime<Utc>,
    pub total_duplicates: usize,
    /// Number of records in the store when the report was generated.
    pub store_total: Option<i64>,
    pub phone_mismatches: usize,
    pub entries: Vec<DuplicateEntry>,
    pub summary: String,
}

impl DuplicateReport {
    pub fn build(
        source: &str,
        duplicates: &[Record],
        details: Vec<RecordDetail>,
        store_total: Option<i64>,
    ) -> Self {
        let stored: HashMap<String, RecordDetail> = details
            .into_iter()
            .map(|detail| (detail.id.clone(), detail))
            .collect();

        let entries: Vec<DuplicateEntry> = duplicates
            .iter()
            .map(|record| {
                let id = record.id.trim();
                let detail = stored.get(id);
                DuplicateEntry {
                    id: id.to_owned(),
                    incoming_phone: record.phone.clone(),
                    stored_phone: detail.map(|d| d.phone.clone()),
                    stored_created_at: detail.map(|d| d.created_at),
                    phone_matches: detail
                        .map(|d| normalize_phone(&d.phone) == normalize_phone(&record.phone))
                        .unwrap_or(false),
                }
            })
            .collect();

        let phone_mismatches = entries
            .iter()
            .filter(|entry| entry.stored_phone.is_some() && !entry.phone_matches)
            .count();

        let summary = match store_total {
            Some(total) => format!(
                "{} duplicate records found in {} ({} with a different phone number), store holds {} records",
                entries.len(),
                source,
                phone_mismatches,
                total
            ),
            None => format!(
                "{} duplicate records found in {} ({} with a different phone number)",
                entries.len(),
                source,
                phone_mismatches
            ),
        };

        Self {
            source: source.to_owned(),
            generated_at: Utc::now(),
            total_duplicates: entries.len(),
            store_total,
            phone_mismatches,
            entries,
            summary,
        }
    }
}

/// Digits only, so "555-0100" and "(555) 0100" compare equal.
fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}
