//! Storage backends

pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use jsonl::JsonlQuarantineSink;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StorageError;
use crate::framework::storage::{QuarantineSink, QuarantinedRecord};

/// Writes dead letters to several sinks; reads from the first
pub struct FanoutQuarantine {
    sinks: Vec<Arc<dyn QuarantineSink>>,
}

impl FanoutQuarantine {
    pub fn new(sinks: Vec<Arc<dyn QuarantineSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl QuarantineSink for FanoutQuarantine {
    async fn write(&self, records: &[QuarantinedRecord]) -> Result<usize, StorageError> {
        let mut written = 0;
        for sink in &self.sinks {
            written = sink.write(records).await?;
        }
        Ok(written)
    }

    async fn load(&self, job_id: Uuid) -> Result<Vec<QuarantinedRecord>, StorageError> {
        match self.sinks.first() {
            Some(sink) => sink.load(job_id).await,
            None => Ok(Vec::new()),
        }
    }
}
