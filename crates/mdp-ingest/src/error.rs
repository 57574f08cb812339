//! Error taxonomy for the ingestion pipeline
//!
//! Errors are scoped by how far they are allowed to travel:
//!
//! - record level: [`TransformationError`], [`ValidationFailure`]; recovered
//!   locally by routing the record to quarantine
//! - chunk level: [`FatalError`] from extraction, [`StorageError`]; the chunk is
//!   marked failed and the job moves on
//! - job level: [`ConfigError`], [`RuleSetError`], and state-store failures,
//!   surfaced as [`IngestError`] before or instead of a job report

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::framework::types::{ChunkId, ChunkStatus};

/// Why a remote call may succeed if repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    Timeout,
    Network,
    ServerError,
    RateLimited,
}

/// Why a remote call will not succeed if repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Auth,
    MalformedRequest,
    InvalidSchema,
    Decode,
    RetriesExhausted,
}

impl FatalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalKind::Auth => "auth",
            FatalKind::MalformedRequest => "malformed_request",
            FatalKind::InvalidSchema => "invalid_schema",
            FatalKind::Decode => "decode",
            FatalKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient failure of a remote call
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct RetryableError {
    pub kind: RetryableKind,
    pub message: String,
    /// Provider-supplied wait hint; preferred over computed backoff
    pub retry_after: Option<Duration>,
}

/// One failed attempt, kept for logging after the retry loop gives up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub retryable: bool,
    /// Wait applied before the next attempt, if there was one
    pub delay_ms: Option<u64>,
    pub used_retry_after: bool,
}

/// Permanent failure of a remote call, with the attempts that led to it
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct FatalError {
    pub kind: FatalKind,
    pub message: String,
    pub attempts: Vec<AttemptRecord>,
}

impl FatalError {
    pub fn new(kind: FatalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: Vec::new(),
        }
    }

    /// Number of attempts made before giving up (at least one)
    pub fn attempt_count(&self) -> usize {
        self.attempts.len().max(1)
    }
}

/// Error raised by an extraction adapter
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("retryable: {0}")]
    Retryable(#[from] RetryableError),

    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
}

impl ExtractError {
    fn retryable(kind: RetryableKind, message: impl Into<String>) -> Self {
        ExtractError::Retryable(RetryableError {
            kind,
            message: message.into(),
            retry_after: None,
        })
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::retryable(RetryableKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::retryable(RetryableKind::Network, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::retryable(
            RetryableKind::ServerError,
            format!("HTTP {}: {}", status, message.into()),
        )
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        ExtractError::Retryable(RetryableError {
            kind: RetryableKind::RateLimited,
            message: message.into(),
            retry_after,
        })
    }

    pub fn auth(message: impl Into<String>) -> Self {
        ExtractError::Fatal(FatalError::new(FatalKind::Auth, message))
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        ExtractError::Fatal(FatalError::new(FatalKind::MalformedRequest, message))
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        ExtractError::Fatal(FatalError::new(FatalKind::InvalidSchema, message))
    }

    pub fn decode(message: impl Into<String>) -> Self {
        ExtractError::Fatal(FatalError::new(FatalKind::Decode, message))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::Retryable(_))
    }
}

/// A required canonical field could not be produced from a raw record
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rule '{rule}' failed: {message} (record: {context})")]
pub struct TransformationError {
    pub rule: String,
    pub message: String,
    /// Truncated rendering of the raw record
    pub context: String,
}

/// A canonical record violated a structural or business rule
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("rule '{rule}' violated: {message}")]
pub struct ValidationFailure {
    pub rule: String,
    pub message: String,
}

/// Failure of a storage backend (record store, state store, or quarantine)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record has no usable natural key: {0}")]
    MissingKey(String),

    #[error("Unknown chunk {0}")]
    UnknownChunk(ChunkId),

    #[error("Chunk {chunk} cannot move from {from} to {to}")]
    InvalidTransition {
        chunk: ChunkId,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("Corrupt stored value in {column}: {value}")]
    Corrupt { column: String, value: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Invalid job configuration; aborts the job before any chunk runs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("Invalid date range: end {end} is before start {start}")]
    InvalidDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("chunk_days must be at least 1")]
    ZeroChunkSize,

    #[error("Invalid symbol {0:?}")]
    InvalidSymbol(String),

    #[error("Unknown schema {0:?}")]
    UnknownSchema(String),

    #[error("Invalid target store identifier {0:?}: use letters, digits, '_', '-' or '.'")]
    InvalidTarget(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error(
        "Job names {count} symbols but no instrument-id to symbol map; records that carry only an \
         instrument id cannot be attributed. Provide a symbol map or run one symbol per job"
    )]
    AmbiguousSymbols { count: usize },

    #[error("Symbol map assigns instrument {instrument_id} to {symbol:?}, which is not one of the requested symbols")]
    UnrequestedMappedSymbol { instrument_id: i64, symbol: String },

    #[error("Invalid date {value:?}: {reason}")]
    InvalidDate { value: String, reason: String },
}

/// A mapping specification or validation rule set is internally inconsistent
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Rule set for schema {schema} is invalid at '{rule}': {message}")]
pub struct RuleSetError {
    pub schema: String,
    pub rule: String,
    pub message: String,
}

/// Job-level failure returned by the orchestrator
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid job configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RuleSet(#[from] RuleSetError),

    #[error("Job state store failed: {0}")]
    StateStore(#[source] StorageError),

    #[error(
        "Stored chunk plan for job {job_id} does not match the configuration \
         ({stored} stored chunks, {planned} planned)"
    )]
    PlanMismatch {
        job_id: Uuid,
        stored: usize,
        planned: usize,
    },
}

/// Chunk-level failure category persisted with failed chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkErrorKind {
    Extraction,
    Storage,
    Quarantine,
    Cancelled,
}

impl ChunkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkErrorKind::Extraction => "extraction",
            ChunkErrorKind::Storage => "storage",
            ChunkErrorKind::Quarantine => "quarantine",
            ChunkErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ChunkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error persisted with a failed or cancelled chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkError {
    pub kind: ChunkErrorKind,
    pub message: String,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl ChunkError {
    pub fn new(kind: ChunkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: Vec::new(),
        }
    }
}

impl From<FatalError> for ChunkError {
    fn from(err: FatalError) -> Self {
        Self {
            kind: ChunkErrorKind::Extraction,
            message: err.to_string(),
            attempts: err.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_classify() {
        assert!(ExtractError::timeout("slow").is_retryable());
        assert!(ExtractError::server(503, "unavailable").is_retryable());
        assert!(ExtractError::rate_limited("429", Some(Duration::from_secs(2))).is_retryable());
        assert!(!ExtractError::auth("bad key").is_retryable());
        assert!(!ExtractError::malformed("bad symbol").is_retryable());
        assert!(!ExtractError::invalid_schema("nope").is_retryable());
    }

    #[test]
    fn test_fatal_into_chunk_error_keeps_history() {
        let mut fatal = FatalError::new(FatalKind::RetriesExhausted, "gave up");
        fatal.attempts.push(AttemptRecord {
            attempt: 1,
            error: "timeout".to_string(),
            retryable: true,
            delay_ms: Some(500),
            used_retry_after: false,
        });
        let chunk_error: ChunkError = fatal.into();
        assert_eq!(chunk_error.kind, ChunkErrorKind::Extraction);
        assert_eq!(chunk_error.attempts.len(), 1);
        assert!(chunk_error.message.contains("retries_exhausted"));
    }

    #[test]
    fn test_ambiguous_symbols_message_is_actionable() {
        let msg = ConfigError::AmbiguousSymbols { count: 3 }.to_string();
        assert!(msg.contains("3 symbols"));
        assert!(msg.contains("symbol map"));
    }
}
