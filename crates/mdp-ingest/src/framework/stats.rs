//! Run statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Record counters of one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub fetched: u64,
    /// Records that came out of transformation
    pub transformed: u64,
    pub transform_failures: u64,
    pub valid: u64,
    pub repaired: u64,
    /// All quarantined records, transformation failures included
    pub quarantined: u64,
    pub stored: u64,
    pub retries: u64,
    pub elapsed_ms: u64,
}

impl ChunkStats {
    /// Records eligible for storage
    pub fn accepted(&self) -> u64 {
        self.valid + self.repaired
    }

    /// Conservation of records through the pipeline:
    ///
    /// - `transformed + transform_failures == fetched`
    /// - `valid + repaired + validation quarantines == transformed`
    /// - `stored` is zero (nothing committed) or exactly `valid + repaired`
    pub fn is_balanced(&self) -> bool {
        let Some(validation_quarantined) = self.quarantined.checked_sub(self.transform_failures) else {
            return false;
        };
        self.transformed + self.transform_failures == self.fetched
            && self.accepted() + validation_quarantined == self.transformed
            && (self.stored == 0 || self.stored == self.accepted())
    }

    /// Counters as numeric metrics for progress listeners
    pub fn metrics(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("fetched", self.fetched as f64),
            ("transformed", self.transformed as f64),
            ("transform_failures", self.transform_failures as f64),
            ("valid", self.valid as f64),
            ("repaired", self.repaired as f64),
            ("quarantined", self.quarantined as f64),
            ("stored", self.stored as f64),
            ("retries", self.retries as f64),
        ])
    }
}

/// Job-wide counters, owned by the orchestrator while the job runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub chunks_total: u64,
    /// Completed with at least one record
    pub chunks_completed: u64,
    pub chunks_completed_empty: u64,
    pub chunks_failed: u64,
    pub chunks_cancelled: u64,
    /// Already done by an earlier run
    pub chunks_skipped: u64,
    pub records_fetched: u64,
    pub records_transformed: u64,
    pub transform_failures: u64,
    pub records_valid: u64,
    pub records_repaired: u64,
    pub records_quarantined: u64,
    pub records_stored: u64,
    /// Failed attempts and failed chunks
    pub errors_encountered: u64,
    pub retries: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl PipelineStats {
    pub fn new(chunks_total: u64) -> Self {
        Self {
            chunks_total,
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Add one chunk's record counters
    pub fn absorb(&mut self, chunk: &ChunkStats) {
        self.records_fetched += chunk.fetched;
        self.records_transformed += chunk.transformed;
        self.transform_failures += chunk.transform_failures;
        self.records_valid += chunk.valid;
        self.records_repaired += chunk.repaired;
        self.records_quarantined += chunk.quarantined;
        self.records_stored += chunk.stored;
        self.retries += chunk.retries;
        self.errors_encountered += chunk.retries;
    }

    /// Chunks that reached a terminal state in this run or an earlier one
    pub fn chunks_finished(&self) -> u64 {
        self.chunks_completed
            + self.chunks_completed_empty
            + self.chunks_failed
            + self.chunks_cancelled
            + self.chunks_skipped
    }

    pub fn complete(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(start) = self.started_at {
            self.elapsed_ms = u64::try_from((now - start).num_milliseconds()).unwrap_or(0);
        }
    }

    pub fn records_per_second(&self) -> f64 {
        if self.elapsed_ms > 0 {
            self.records_fetched as f64 / (self.elapsed_ms as f64 / 1000.0)
        } else {
            0.0
        }
    }
}
