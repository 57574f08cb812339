//! Progress reporting
//!
//! The orchestrator is handed a reporter explicitly and calls it on every
//! chunk state transition. Closures implement [`ProgressReporter`] directly.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ChunkId, ChunkStage};

/// One state-machine transition
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub chunk: ChunkId,
    pub stage: ChunkStage,
    /// Chunks finished so far, including chunks skipped as already done
    pub completed: u64,
    pub total: u64,
    /// Counters of the chunk at this point
    pub metrics: BTreeMap<&'static str, f64>,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards events
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Logs events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, event: &ProgressEvent) {
        let metric = |name: &str| event.metrics.get(name).copied().unwrap_or(0.0) as u64;
        match event.stage {
            ChunkStage::Completed | ChunkStage::CompletedEmpty => info!(
                chunk = %event.chunk,
                stage = %event.stage,
                completed = event.completed,
                total = event.total,
                stored = metric("stored"),
                quarantined = metric("quarantined"),
                "Chunk finished ({:.1}%)",
                event.percent()
            ),
            ChunkStage::Failed | ChunkStage::Cancelled => warn!(
                chunk = %event.chunk,
                stage = %event.stage,
                completed = event.completed,
                total = event.total,
                "Chunk did not complete"
            ),
            _ => debug!(chunk = %event.chunk, stage = %event.stage, "Chunk stage"),
        }
    }
}
