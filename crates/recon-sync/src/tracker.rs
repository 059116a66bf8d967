//! Per-row outcomes and run statistics.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    New,
    Updated,
    Unchanged,
    Error,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::New => "NEW",
            OutcomeKind::Updated => "UPDATED",
            OutcomeKind::Unchanged => "UNCHANGED",
            OutcomeKind::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEntry {
    /// 1-based position of the row in the input batch.
    pub row: usize,
    pub outcome: OutcomeKind,
    pub key: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_processed: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    /// (new + updated) / max(total, 1) as a percentage, 2 decimals.
    pub success_rate: Decimal,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeBuckets {
    pub new: Vec<OutcomeEntry>,
    pub updated: Vec<OutcomeEntry>,
    pub errors: Vec<OutcomeEntry>,
}

#[derive(Debug)]
pub struct OutcomeTracker {
    started: Instant,
    started_at: DateTime<Utc>,
    buckets: OutcomeBuckets,
    unchanged: usize,
}

impl Default for OutcomeTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn success_rate(new: usize, updated: usize, total: usize) -> Decimal {
    let effective = Decimal::from(new + updated);
    let total = Decimal::from(total.max(1));
    (effective / total * Decimal::ONE_HUNDRED).round_dp(2)
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            buckets: OutcomeBuckets::default(),
            unchanged: 0,
        }
    }

    pub fn record(&mut self, entry: OutcomeEntry) {
        match entry.outcome {
            OutcomeKind::New => self.buckets.new.push(entry),
            OutcomeKind::Updated => self.buckets.updated.push(entry),
            OutcomeKind::Error => self.buckets.errors.push(entry),
            OutcomeKind::Unchanged => self.unchanged += 1,
        }
    }

    pub fn total_processed(&self) -> usize {
        self.buckets.new.len()
            + self.buckets.updated.len()
            + self.buckets.errors.len()
            + self.unchanged
    }

    pub fn summary(&self) -> RunSummary {
        let new = self.buckets.new.len();
        let updated = self.buckets.updated.len();
        let total = self.total_processed();
        RunSummary {
            total_processed: total,
            new,
            updated,
            unchanged: self.unchanged,
            errors: self.buckets.errors.len(),
            success_rate: success_rate(new, updated, total),
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn buckets(&self) -> &OutcomeBuckets {
        &self.buckets
    }

    pub fn into_buckets(self) -> OutcomeBuckets {
        self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn entry(row: usize, outcome: OutcomeKind) -> OutcomeEntry {
        OutcomeEntry {
            row,
            outcome,
            key: BTreeMap::new(),
            fact_id: None,
            changed_fields: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn empty_run_has_zero_rate() {
        let summary = OutcomeTracker::new().summary();
        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.success_rate, Decimal::ZERO);
    }

    #[test]
    fn counters_add_up_and_rate_rounds() {
        let mut tracker = OutcomeTracker::new();
        tracker.record(entry(1, OutcomeKind::New));
        tracker.record(entry(2, OutcomeKind::Unchanged));
        tracker.record(entry(3, OutcomeKind::Error));
        let s = tracker.summary();
        assert_eq!(s.total_processed, s.new + s.updated + s.unchanged + s.errors);
        assert_eq!(s.total_processed, 3);
        assert_eq!(s.success_rate, Decimal::from_str("33.33").unwrap());
        assert_eq!(tracker.buckets().errors.len(), 1);
    }

    #[test]
    fn outcome_labels_serialize_upper_case() {
        assert_eq!(serde_json::to_string(&OutcomeKind::Unchanged).unwrap(), "\"UNCHANGED\"");
        assert_eq!(success_rate(2, 1, 3), Decimal::ONE_HUNDRED);
    }
}
