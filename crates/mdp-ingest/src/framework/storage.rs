//! Storage interfaces consumed by the orchestrator
//!
//! Three seams, each swappable per deployment:
//!
//! - [`StorageWriter`]: atomic, idempotent upsert of canonical records
//! - [`JobStateStore`]: per-chunk status rows that make jobs resumable
//! - [`QuarantineSink`]: durable side channel for rejected records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdp_common::fingerprint::fingerprint_json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stats::ChunkStats;
use super::types::{CanonicalRecord, Chunk, ChunkId, ChunkStatus};
use super::validation::QuarantineKind;
use crate::error::{ChunkError, StorageError, ValidationFailure};

/// Durable record store
#[async_trait]
pub trait StorageWriter: Send + Sync {
    /// Upsert `records` into `target` under their natural keys.
    ///
    /// All-or-nothing: on error nothing from the batch is visible. Re-submitting
    /// a stored record updates it in place. Returns the number of records
    /// written.
    async fn upsert_batch(&self, target: &str, records: &[CanonicalRecord]) -> Result<usize, StorageError>;
}

/// Persisted chunk status with its last counters and error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub stats: ChunkStats,
    pub error: Option<ChunkError>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk-level job state
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Chunks of a job ordered by index; empty for an unknown job
    async fn load_chunks(&self, job_id: Uuid) -> Result<Vec<Chunk>, StorageError>;

    /// Insert planned chunks. Chunks that already exist keep their state.
    async fn register_chunks(&self, chunks: &[Chunk]) -> Result<(), StorageError>;

    /// Persist a status change together with the chunk's counters and error.
    ///
    /// Rejects transitions not allowed by [`ChunkStatus::can_transition_to`].
    async fn save_chunk_status(
        &self,
        chunk: ChunkId,
        status: ChunkStatus,
        stats: &ChunkStats,
        error: Option<&ChunkError>,
    ) -> Result<(), StorageError>;

    /// Full chunk rows for inspection tooling
    async fn chunk_details(&self, job_id: Uuid) -> Result<Vec<ChunkRecord>, StorageError>;
}

/// Dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    /// Provider record exactly as extracted
    pub original_record: serde_json::Value,
    pub error_kind: QuarantineKind,
    pub rule: String,
    pub error_message: String,
    pub job_id: Uuid,
    pub chunk_id: u32,
    /// Position of the record in the chunk's extraction order
    #[serde(default)]
    pub record_index: u32,
    pub timestamp: DateTime<Utc>,
    /// Content hash of record and rule; with `record_index`, unique within a chunk
    pub fingerprint: String,
}

impl QuarantinedRecord {
    pub fn new(
        chunk: ChunkId,
        record_index: u32,
        original: impl Into<serde_json::Value>,
        kind: QuarantineKind,
        failure: ValidationFailure,
    ) -> Result<Self, StorageError> {
        let original_record = original.into();
        let fingerprint = fingerprint_json(&serde_json::json!({
            "record": &original_record,
            "rule": &failure.rule,
        }))
        .map_err(|e| StorageError::Backend(format!("Failed to fingerprint record: {}", e)))?;

        Ok(Self {
            original_record,
            error_kind: kind,
            rule: failure.rule,
            error_message: failure.message,
            job_id: chunk.job_id,
            chunk_id: chunk.index,
            record_index,
            timestamp: Utc::now(),
            fingerprint,
        })
    }
}

/// Dead-letter side channel
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    /// Persist entries; returns how many were written
    async fn write(&self, records: &[QuarantinedRecord]) -> Result<usize, StorageError>;

    /// Entries of a job in write order
    async fn load(&self, job_id: Uuid) -> Result<Vec<QuarantinedRecord>, StorageError>;
}
