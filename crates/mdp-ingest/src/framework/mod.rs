//! Market-data ingestion framework
//!
//! Chunked, resumable, idempotent ETL for provider time series. Job state lives
//! in a [`JobStateStore`] so a job survives restarts at chunk granularity.

pub mod types;
pub mod schema;
pub mod planner;
pub mod retry;
pub mod rules;
pub mod mappings;
pub mod transform;
pub mod validation;
pub mod stats;
pub mod storage;
pub mod extractor;
pub mod progress;
pub mod report;
pub mod orchestrator;

// Re-export commonly used types
pub use types::{
    CanonicalRecord, Chunk, ChunkId, ChunkStage, ChunkStatus, FieldKind, FieldValue, NaturalKey,
    RawRecord,
};
pub use schema::{FieldSpec, Schema};
pub use planner::{plan_chunks, plan_job};
pub use retry::{Retried, RetryController, MAX_RETRY_AFTER};
pub use rules::{Check, CmpOp, Derivation, MappingSpec, Operand, Predicate, Rule, RuleSet};
pub use mappings::{mapping_for, rules_for};
pub use transform::{SymbolResolver, TransformEngine};
pub use validation::{QuarantineKind, Repair, ValidationOutcome, Validator};
pub use stats::{ChunkStats, PipelineStats};
pub use storage::{ChunkRecord, JobStateStore, QuarantineSink, QuarantinedRecord, StorageWriter};
pub use extractor::{record_stream, Extracted, Extractor, RecordStream};
pub use progress::{LogProgress, NoProgress, ProgressEvent, ProgressReporter};
pub use report::{ChunkFailure, ChunkOutcome, JobReport, JobStatusSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
