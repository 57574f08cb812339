//! Test helpers for MDP ingest integration tests
//!
//! This module provides:
//! - Tracing setup for test output
//! - A scripted extractor with per-chunk records, injected failures and call counts
//! - A storage writer that fails for selected days
//! - Record and job fixtures

#![allow(dead_code, clippy::unwrap_used)]

pub mod fixtures;

use async_trait::async_trait;
use chrono::NaiveDate;
use mdp_ingest::backends::MemoryStore;
use mdp_ingest::error::{ExtractError, StorageError};
use mdp_ingest::framework::{
    record_stream, CanonicalRecord, Chunk, Extractor, FieldValue, RawRecord, RecordStream,
    StorageWriter,
};
use mdp_ingest::JobConfig;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// Re-export fixtures for convenience
pub use fixtures::*;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mdp_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Extractor driven by a script instead of a provider.
///
/// By default every chunk yields [`ScriptedExtractor::bars_per_day`] valid OHLCV
/// bars per day. Individual chunks can be given explicit records, and a queue of
/// errors returned before the records.
pub struct ScriptedExtractor {
    bars_per_day: u32,
    records: Mutex<BTreeMap<u32, Vec<RawRecord>>>,
    failures: Mutex<HashMap<u32, VecDeque<ExtractError>>>,
    calls: Mutex<HashMap<u32, usize>>,
}

impl ScriptedExtractor {
    pub fn new(bars_per_day: u32) -> Self {
        Self {
            bars_per_day,
            records: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Serve `records` for chunk `index` instead of generated bars
    pub fn with_records(self, index: u32, records: Vec<RawRecord>) -> Self {
        self.records.lock().unwrap().insert(index, records);
        self
    }

    /// Fail the next `errors.len()` fetches of chunk `index`, in order
    pub fn with_failures(self, index: u32, errors: Vec<ExtractError>) -> Self {
        self.failures.lock().unwrap().insert(index, errors.into());
        self
    }

    pub fn calls(&self, index: u32) -> usize {
        self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Chunk indexes fetched at least once, sorted
    pub fn fetched_chunks(&self) -> Vec<u32> {
        let mut chunks: Vec<u32> = self.calls.lock().unwrap().keys().copied().collect();
        chunks.sort_unstable();
        chunks
    }

    fn generated(&self, chunk: &Chunk) -> Vec<RawRecord> {
        let mut out = Vec::new();
        let mut day = chunk.start;
        while day < chunk.end {
            for instrument in 1..=self.bars_per_day {
                out.push(ohlcv_bar(i64::from(instrument), day, 100));
            }
            day = day.succ_opt().unwrap();
        }
        out
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn fetch(&self, chunk: &Chunk, _job: &JobConfig) -> Result<RecordStream, ExtractError> {
        *self.calls.lock().unwrap().entry(chunk.index).or_default() += 1;

        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&chunk.index)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let scripted = self.records.lock().unwrap().get(&chunk.index).cloned();
        Ok(record_stream(scripted.unwrap_or_else(|| self.generated(chunk))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Storage writer that rejects any batch touching one of `fail_days`
pub struct FailingStorage {
    pub inner: Arc<MemoryStore>,
    fail_days: HashSet<NaiveDate>,
    pub rejected: AtomicUsize,
}

impl FailingStorage {
    pub fn new(inner: Arc<MemoryStore>, fail_days: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            inner,
            fail_days: fail_days.into_iter().collect(),
            rejected: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageWriter for FailingStorage {
    async fn upsert_batch(&self, target: &str, records: &[CanonicalRecord]) -> Result<usize, StorageError> {
        let hits = records.iter().any(|r| match r.get("ts_event") {
            Some(FieldValue::Timestamp(ts)) => self.fail_days.contains(&ts.date_naive()),
            _ => false,
        });
        if hits {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend("simulated deadlock, transaction rolled back".to_string()));
        }
        self.inner.upsert_batch(target, records).await
    }
}
