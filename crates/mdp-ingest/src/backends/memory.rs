//! In-process store
//!
//! Implements every storage seam over in-memory maps. Used for dry runs and
//! tests; the semantics (natural-key upsert, transition checks, dead-letter
//! de-duplication) match the SQLite backend.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ChunkError, StorageError};
use crate::framework::stats::ChunkStats;
use crate::framework::storage::{
    ChunkRecord, JobStateStore, QuarantineSink, QuarantinedRecord, StorageWriter,
};
use crate::framework::types::{CanonicalRecord, Chunk, ChunkId, ChunkStatus, NaturalKey};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<(String, NaturalKey), CanonicalRecord>,
    chunks: BTreeMap<ChunkId, ChunkRecord>,
    quarantine: Vec<QuarantinedRecord>,
    quarantine_keys: HashSet<(Uuid, u32, u32, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    upsert_calls: AtomicUsize,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct stored records in `target`
    pub async fn record_count(&self, target: &str) -> usize {
        let state = self.state.lock().await;
        state.records.keys().filter(|(t, _)| t == target).count()
    }

    /// Stored records of `target` in natural-key order
    pub async fn records(&self, target: &str) -> Vec<CanonicalRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|((t, _), _)| t == target)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageWriter for MemoryStore {
    async fn upsert_batch(&self, target: &str, records: &[CanonicalRecord]) -> Result<usize, StorageError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        // resolve every key before touching state so a bad record writes nothing
        let keyed = records
            .iter()
            .map(|r| r.natural_key().map(|k| ((target.to_string(), k), r.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock().await;
        state.records.extend(keyed);
        Ok(records.len())
    }
}

#[async_trait]
impl JobStateStore for MemoryStore {
    async fn load_chunks(&self, job_id: Uuid) -> Result<Vec<Chunk>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .chunks
            .values()
            .filter(|c| c.chunk.job_id == job_id)
            .map(|c| c.chunk.clone())
            .collect())
    }

    async fn register_chunks(&self, chunks: &[Chunk]) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        for chunk in chunks {
            state.chunks.entry(chunk.id()).or_insert_with(|| ChunkRecord {
                chunk: chunk.clone(),
                stats: ChunkStats::default(),
                error: None,
                updated_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn save_chunk_status(
        &self,
        chunk: ChunkId,
        status: ChunkStatus,
        stats: &ChunkStats,
        error: Option<&ChunkError>,
    ) -> Result<(), StorageError> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let row = state
            .chunks
            .get_mut(&chunk)
            .ok_or(StorageError::UnknownChunk(chunk))?;

        let from = row.chunk.status;
        if !from.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                chunk,
                from,
                to: status,
            });
        }

        row.chunk.status = status;
        row.stats = stats.clone();
        row.error = error.cloned();
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn chunk_details(&self, job_id: Uuid) -> Result<Vec<ChunkRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .chunks
            .values()
            .filter(|c| c.chunk.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuarantineSink for MemoryStore {
    async fn write(&self, records: &[QuarantinedRecord]) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for record in records {
            let key = (record.job_id, record.chunk_id, record.record_index, record.fingerprint.clone());
            if state.quarantine_keys.insert(key) {
                state.quarantine.push(record.clone());
            }
            written += 1;
        }
        Ok(written)
    }

    async fn load(&self, job_id: Uuid) -> Result<Vec<QuarantinedRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .quarantine
            .iter()
            .filter(|q| q.job_id == job_id)
            .cloned()
            .collect())
    }
}
