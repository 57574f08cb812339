//! Job reports and status snapshots

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

use super::stats::{ChunkStats, PipelineStats};
use super::types::{Chunk, ChunkId, ChunkStatus};
use crate::error::{ChunkError, ChunkErrorKind};

/// Final state of one chunk in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub chunk: ChunkId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub status: ChunkStatus,
    pub stats: ChunkStats,
    pub error: Option<ChunkError>,
    /// Done by an earlier run and not reprocessed
    pub skipped: bool,
}

/// Enough context to retry one failed chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk: ChunkId,
    pub kind: ChunkErrorKind,
    pub message: String,
    pub attempts: usize,
}

/// Result of running a job, produced even when chunks failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub stats: PipelineStats,
    /// Ordered by chunk index
    pub outcomes: Vec<ChunkOutcome>,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl JobReport {
    pub fn failed_chunk_ids(&self) -> Vec<ChunkId> {
        self.failed_chunks.iter().map(|f| f.chunk).collect()
    }

    /// Every chunk of the job is done
    pub fn is_complete(&self) -> bool {
        self.stats.chunks_total > 0
            && self.stats.chunks_completed + self.stats.chunks_completed_empty + self.stats.chunks_skipped
                == self.stats.chunks_total
    }

    /// Chunks left pending because dispatch stopped
    pub fn undispatched(&self) -> u64 {
        self.stats.chunks_total.saturating_sub(self.stats.chunks_finished())
    }

    /// Plain-text summary with per-chunk outcomes
    pub fn summary(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Job {}: {} chunks ({} completed, {} empty, {} failed, {} cancelled, {} skipped, {} not dispatched)",
            self.job_id,
            s.chunks_total,
            s.chunks_completed,
            s.chunks_completed_empty,
            s.chunks_failed,
            s.chunks_cancelled,
            s.chunks_skipped,
            self.undispatched()
        );
        let _ = writeln!(
            out,
            "Records: {} fetched, {} stored, {} repaired, {} quarantined ({} failed transformation)",
            s.records_fetched, s.records_stored, s.records_repaired, s.records_quarantined, s.transform_failures
        );
        let _ = writeln!(
            out,
            "Retries: {}, errors: {}, elapsed: {:.1}s",
            s.retries,
            s.errors_encountered,
            s.elapsed_ms as f64 / 1000.0
        );

        for outcome in &self.outcomes {
            let _ = write!(
                out,
                "  #{:<4} {} .. {}  {:<15}",
                outcome.chunk.index,
                outcome.start,
                outcome.end,
                if outcome.skipped { "skipped" } else { outcome.status.as_str() }
            );
            if !outcome.skipped {
                let _ = write!(
                    out,
                    " stored={} quarantined={}",
                    outcome.stats.stored, outcome.stats.quarantined
                );
            }
            if let Some(ref error) = outcome.error {
                let _ = write!(out, " [{}] {}", error.kind, error.message);
            }
            out.push('\n');
        }

        if !self.failed_chunks.is_empty() {
            let ids = self
                .failed_chunks
                .iter()
                .map(|f| f.chunk.index.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "Failed chunks: {}", ids);
        }
        out
    }
}

/// Chunk counts of a job as recorded in the state store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    pub job_id: Uuid,
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub completed_empty: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStatusSnapshot {
    pub fn from_chunks(job_id: Uuid, chunks: &[Chunk]) -> Self {
        let mut snapshot = Self {
            job_id,
            total: chunks.len() as u64,
            ..Default::default()
        };
        for chunk in chunks {
            match chunk.status {
                ChunkStatus::Pending => snapshot.pending += 1,
                ChunkStatus::InProgress => snapshot.in_progress += 1,
                ChunkStatus::Completed => snapshot.completed += 1,
                ChunkStatus::CompletedEmpty => snapshot.completed_empty += 1,
                ChunkStatus::Failed => snapshot.failed += 1,
                ChunkStatus::Cancelled => snapshot.cancelled += 1,
            }
        }
        snapshot
    }

    pub fn done(&self) -> u64 {
        self.completed + self.completed_empty
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done() as f64 * 100.0 / self.total as f64
        }
    }
}

impl std::fmt::Display for JobStatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} done ({:.1}%), {} pending, {} in progress, {} failed, {} cancelled",
            self.job_id,
            self.done(),
            self.total,
            self.percent_complete(),
            self.pending,
            self.in_progress,
            self.failed,
            self.cancelled
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn chunk(index: u32, status: ChunkStatus) -> Chunk {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        Chunk {
            job_id: Uuid::nil(),
            index,
            start: day,
            end: day.succ_opt().unwrap(),
            status,
        }
    }

    #[test]
    fn test_snapshot_counts() {
        let chunks = vec![
            chunk(0, ChunkStatus::Completed),
            chunk(1, ChunkStatus::CompletedEmpty),
            chunk(2, ChunkStatus::Failed),
            chunk(3, ChunkStatus::Pending),
        ];
        let snapshot = JobStatusSnapshot::from_chunks(Uuid::nil(), &chunks);
        assert_eq!(snapshot.done(), 2);
        assert_eq!(snapshot.percent_complete(), 50.0);
        assert!(snapshot.to_string().contains("2/4 done"));
    }

    #[test]
    fn test_summary_lists_failures_and_quarantine() {
        let id = ChunkId {
            job_id: Uuid::nil(),
            index: 3,
        };
        let error = ChunkError::new(ChunkErrorKind::Storage, "disk full");
        let report = JobReport {
            job_id: Uuid::nil(),
            stats: PipelineStats {
                chunks_total: 2,
                chunks_completed: 1,
                chunks_failed: 1,
                records_quarantined: 7,
                ..Default::default()
            },
            outcomes: vec![ChunkOutcome {
                chunk: id,
                start: NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                status: ChunkStatus::Failed,
                stats: ChunkStats::default(),
                error: Some(error.clone()),
                skipped: false,
            }],
            failed_chunks: vec![ChunkFailure {
                chunk: id,
                kind: error.kind,
                message: error.message,
                attempts: 1,
            }],
        };

        let summary = report.summary();
        assert!(summary.contains("7 quarantined"));
        assert!(summary.contains("[storage] disk full"));
        assert!(summary.contains("Failed chunks: 3"));
        assert_eq!(report.failed_chunk_ids(), vec![id]);
        assert!(!report.is_complete());
    }
}
