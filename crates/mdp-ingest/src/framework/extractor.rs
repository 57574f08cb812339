//! Extraction adapter interface

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::types::{Chunk, RawRecord};
use crate::config::JobConfig;
use crate::error::ExtractError;

/// One item read from the provider
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Record(RawRecord),
    /// A line that could not be decoded into a record; quarantined, never fatal
    Undecodable { line: String, reason: String },
}

impl From<RawRecord> for Extracted {
    fn from(record: RawRecord) -> Self {
        Extracted::Record(record)
    }
}

/// Lazy sequence of extracted items; errors may surface mid-stream
pub type RecordStream = BoxStream<'static, Result<Extracted, ExtractError>>;

/// Source of raw provider records for one chunk
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Open the record sequence of `chunk`.
    ///
    /// Failures are classified as retryable or fatal, both when opening and
    /// while the stream is consumed.
    async fn fetch(&self, chunk: &Chunk, job: &JobConfig) -> Result<RecordStream, ExtractError>;

    /// Short name for logs
    fn name(&self) -> &str {
        "extractor"
    }
}

/// Stream over records already in memory
pub fn record_stream(records: Vec<RawRecord>) -> RecordStream {
    stream::iter(records.into_iter().map(|r| Ok(Extracted::Record(r)))).boxed()
}
