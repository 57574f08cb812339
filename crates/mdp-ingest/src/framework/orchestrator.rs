//! Job orchestrator
//!
//! Drives every chunk of a job through the pipeline:
//! 1. Fetch: extract the chunk's raw records under the retry controller
//! 2. Transform and validate: map records to canonical form, split out rejects
//! 3. Store: upsert accepted records while rejects go to the quarantine sink
//!
//! Chunk status is persisted on entry and on exit, so a job interrupted at any
//! point resumes at the first chunk that is not done. A failed chunk never
//! stops the job; only configuration and state-store failures do.

use futures::{future, stream, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::extractor::{Extracted, Extractor};
use super::planner::plan_job;
use super::progress::{LogProgress, ProgressEvent, ProgressReporter};
use super::report::{ChunkFailure, ChunkOutcome, JobReport, JobStatusSnapshot};
use super::retry::RetryController;
use super::rules::{MappingSpec, RuleSet};
use super::stats::{ChunkStats, PipelineStats};
use super::storage::{ChunkRecord, JobStateStore, QuarantineSink, QuarantinedRecord, StorageWriter};
use super::transform::{SymbolResolver, TransformEngine};
use super::types::{CanonicalRecord, Chunk, ChunkId, ChunkStage, ChunkStatus};
use super::validation::{ValidationOutcome, Validator};
use crate::config::JobConfig;
use crate::error::{ChunkError, ChunkErrorKind, ExtractError, IngestError, RuleSetError, StorageError};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Chunks processed at once; 1 runs the job strictly in order
    pub concurrency: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Per-run state shared by the chunk pipelines of one job
struct RunContext<'a> {
    job: &'a JobConfig,
    job_id: Uuid,
    engine: &'a TransformEngine,
    validator: &'a Validator,
    retry: &'a RetryController,
    total: u64,
    finished: &'a AtomicU64,
}

pub struct Orchestrator {
    extractor: Arc<dyn Extractor>,
    storage: Arc<dyn StorageWriter>,
    state: Arc<dyn JobStateStore>,
    quarantine: Arc<dyn QuarantineSink>,
    progress: Arc<dyn ProgressReporter>,
    options: OrchestratorOptions,
    mapping: Option<MappingSpec>,
    rules: Option<RuleSet>,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        storage: Arc<dyn StorageWriter>,
        state: Arc<dyn JobStateStore>,
        quarantine: Arc<dyn QuarantineSink>,
    ) -> Self {
        Self {
            extractor,
            storage,
            state,
            quarantine,
            progress: Arc::new(LogProgress),
            options: OrchestratorOptions::default(),
            mapping: None,
            rules: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the built-in mapping of the job's schema
    pub fn with_mapping(mut self, mapping: MappingSpec) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Replace the built-in validation rules of the job's schema
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Run a job to completion or cancellation.
    ///
    /// Configuration and rule-set errors abort before any chunk runs. Chunk
    /// failures are reported in the returned [`JobReport`]. Chunks already done
    /// by an earlier run are skipped.
    pub async fn run(&self, config: &JobConfig, cancel: &CancellationToken) -> Result<JobReport, IngestError> {
        config.validate()?;
        let (engine, validator) = self.build_pipeline(config)?;
        let job_id = config.job_id();

        let chunks = self.prepare_chunks(config, job_id).await?;
        let total = chunks.len() as u64;
        let mut stats = PipelineStats::new(total);
        let mut outcomes = Vec::with_capacity(chunks.len());
        let mut failed_chunks = Vec::new();

        let (done, pending): (Vec<Chunk>, Vec<Chunk>) = chunks.into_iter().partition(|c| c.status.is_done());
        for chunk in done {
            debug!(chunk = %chunk.id(), status = %chunk.status, "Skipping chunk done by an earlier run");
            stats.chunks_skipped += 1;
            outcomes.push(ChunkOutcome {
                chunk: chunk.id(),
                start: chunk.start,
                end: chunk.end,
                status: chunk.status,
                stats: ChunkStats::default(),
                error: None,
                skipped: true,
            });
        }

        let concurrency = self.options.concurrency.max(1);
        info!(
            job_id = %job_id,
            dataset = %config.dataset,
            schema = %config.schema,
            target = %config.target,
            total,
            pending = pending.len(),
            skipped = stats.chunks_skipped,
            concurrency,
            "Starting ingestion job"
        );

        let retry = RetryController::new(config.retry.clone());
        let finished = AtomicU64::new(stats.chunks_skipped);
        let ctx = RunContext {
            job: config,
            job_id,
            engine: &engine,
            validator: &validator,
            retry: &retry,
            total,
            finished: &finished,
        };

        // Cancellation is checked as each chunk is dispatched. The first chunk
        // dispatched after the signal is marked cancelled and nothing else is
        // started; chunks already running finish normally.
        let stopped = AtomicBool::new(false);
        let mut results = stream::iter(pending)
            .take_while(|_| future::ready(!stopped.load(Ordering::SeqCst)))
            .map(|chunk| {
                let cancelled = cancel.is_cancelled();
                if cancelled {
                    stopped.store(true, Ordering::SeqCst);
                }
                let ctx = &ctx;
                async move {
                    if cancelled {
                        self.cancel_chunk(chunk, ctx).await
                    } else {
                        self.process_chunk(chunk, ctx).await
                    }
                }
            })
            .buffer_unordered(concurrency);

        while let Some(outcome) = results.next().await {
            let outcome = outcome?;
            stats.absorb(&outcome.stats);
            match outcome.status {
                ChunkStatus::Completed => stats.chunks_completed += 1,
                ChunkStatus::CompletedEmpty => stats.chunks_completed_empty += 1,
                ChunkStatus::Cancelled => stats.chunks_cancelled += 1,
                _ => {
                    stats.chunks_failed += 1;
                    stats.errors_encountered += 1;
                    if let Some(ref error) = outcome.error {
                        failed_chunks.push(ChunkFailure {
                            chunk: outcome.chunk,
                            kind: error.kind,
                            message: error.message.clone(),
                            attempts: error.attempts.len().max(1),
                        });
                    }
                },
            }
            outcomes.push(outcome);
        }

        stats.complete();
        outcomes.sort_by_key(|o| o.chunk.index);
        failed_chunks.sort_by_key(|f| f.chunk.index);

        info!(
            job_id = %job_id,
            completed = stats.chunks_completed,
            completed_empty = stats.chunks_completed_empty,
            failed = stats.chunks_failed,
            cancelled = stats.chunks_cancelled,
            skipped = stats.chunks_skipped,
            stored = stats.records_stored,
            quarantined = stats.records_quarantined,
            elapsed_ms = stats.elapsed_ms,
            "Ingestion job finished"
        );

        Ok(JobReport {
            job_id,
            stats,
            outcomes,
            failed_chunks,
        })
    }

    /// Chunk counts of a job as currently persisted
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusSnapshot, IngestError> {
        let chunks = self.state.load_chunks(job_id).await.map_err(IngestError::StateStore)?;
        Ok(JobStatusSnapshot::from_chunks(job_id, &chunks))
    }

    /// Persisted chunk rows of a job, with their counters and errors
    pub async fn chunk_details(&self, job_id: Uuid) -> Result<Vec<ChunkRecord>, IngestError> {
        self.state.chunk_details(job_id).await.map_err(IngestError::StateStore)
    }

    fn build_pipeline(&self, config: &JobConfig) -> Result<(TransformEngine, Validator), IngestError> {
        let engine = match &self.mapping {
            Some(spec) => TransformEngine::new(spec.clone(), SymbolResolver::from_job(config))?,
            None => TransformEngine::for_job(config)?,
        };
        let validator = match &self.rules {
            Some(rules) => Validator::new(rules.clone())?,
            None => Validator::for_schema(config.schema)?,
        };

        for (name, schema) in [("mapping", engine.spec().schema), ("rules", validator.rules().schema)] {
            if schema != config.schema {
                return Err(RuleSetError {
                    schema: schema.to_string(),
                    rule: name.to_string(),
                    message: format!("job schema is {}", config.schema),
                }
                .into());
            }
        }
        Ok((engine, validator))
    }

    /// Register a fresh plan, or check a stored one against the configuration
    async fn prepare_chunks(&self, config: &JobConfig, job_id: Uuid) -> Result<Vec<Chunk>, IngestError> {
        let planned = plan_job(config)?;
        let stored = self.state.load_chunks(job_id).await.map_err(IngestError::StateStore)?;

        if stored.is_empty() {
            self.state
                .register_chunks(&planned)
                .await
                .map_err(IngestError::StateStore)?;
            info!(job_id = %job_id, chunks = planned.len(), "Registered chunk plan");
            return Ok(planned);
        }

        let matches = stored.len() == planned.len() && stored.iter().zip(&planned).all(|(s, p)| s.same_bounds(p));
        if !matches {
            return Err(IngestError::PlanMismatch {
                job_id,
                stored: stored.len(),
                planned: planned.len(),
            });
        }

        info!(
            job_id = %job_id,
            done = stored.iter().filter(|c| c.status.is_done()).count(),
            total = stored.len(),
            "Resuming job"
        );
        Ok(stored)
    }

    async fn process_chunk(&self, chunk: Chunk, ctx: &RunContext<'_>) -> Result<ChunkOutcome, IngestError> {
        let span = info_span!(
            "chunk",
            job_id = %ctx.job_id,
            chunk = chunk.index,
            start = %chunk.start,
            end = %chunk.end
        );
        self.drive_chunk(chunk, ctx).instrument(span).await
    }

    async fn drive_chunk(&self, chunk: Chunk, ctx: &RunContext<'_>) -> Result<ChunkOutcome, IngestError> {
        let id = chunk.id();
        let started = Instant::now();
        let mut stats = ChunkStats::default();

        self.persist(id, ChunkStatus::InProgress, &stats, None).await?;
        self.emit(ctx, id, ChunkStage::Fetching, &stats);

        let operation = format!("fetch chunk {}", chunk.index);
        let (chunk_ref, job) = (&chunk, ctx.job);
        let records = match ctx.retry.run(&operation, |_| self.fetch_all(chunk_ref, job)).await {
            Ok(retried) => {
                stats.retries = retried.retries() as u64;
                retried.value
            },
            Err(fatal) => {
                stats.retries = fatal.attempts.iter().filter(|a| a.delay_ms.is_some()).count() as u64;
                warn!(error = %fatal, attempts = fatal.attempt_count(), "Extraction failed");
                let error = ChunkError::from(fatal);
                return self.finish(ctx, &chunk, ChunkStage::Failed, stats, Some(error), started).await;
            },
        };

        if records.is_empty() {
            info!("Chunk has no records");
            return self.finish(ctx, &chunk, ChunkStage::CompletedEmpty, stats, None, started).await;
        }
        stats.fetched = records.len() as u64;

        self.emit(ctx, id, ChunkStage::Transforming, &stats);
        let batch = ctx.engine.transform_batch(records);
        stats.transformed = batch.transformed_count() as u64;
        stats.transform_failures = batch.failure_count() as u64;

        self.emit(ctx, id, ChunkStage::Validating, &stats);
        let mut accepted: Vec<CanonicalRecord> = Vec::new();
        let mut rejected = Vec::new();
        for (index, outcome) in ctx.validator.validate_batch(batch).into_iter().enumerate() {
            match outcome {
                ValidationOutcome::Valid(record) => {
                    stats.valid += 1;
                    accepted.push(record);
                },
                ValidationOutcome::Repaired(record, repairs) => {
                    stats.repaired += 1;
                    debug!(repairs = ?repairs.iter().map(ToString::to_string).collect::<Vec<_>>(), "Record repaired");
                    accepted.push(record);
                },
                ValidationOutcome::Quarantined { original, kind, failure } => {
                    stats.quarantined += 1;
                    rejected.push((index as u32, original, kind, failure));
                },
            }
        }

        let dead_letters = match rejected
            .into_iter()
            .map(|(index, original, kind, failure)| QuarantinedRecord::new(id, index, original, kind, failure))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(entries) => entries,
            Err(e) => {
                let error = ChunkError::new(ChunkErrorKind::Quarantine, e.to_string());
                return self.finish(ctx, &chunk, ChunkStage::Failed, stats, Some(error), started).await;
            },
        };

        self.emit(ctx, id, ChunkStage::Storing, &stats);
        let (stored, quarantined) = tokio::join!(
            self.store(&ctx.job.target, &accepted),
            self.write_quarantine(&dead_letters)
        );

        let error = match (stored, quarantined) {
            (Ok(count), Ok(_)) => {
                stats.stored = count as u64;
                None
            },
            (Err(e), Ok(_)) => Some(ChunkError::new(ChunkErrorKind::Storage, e.to_string())),
            (Err(e), Err(q)) => Some(ChunkError::new(
                ChunkErrorKind::Storage,
                format!("{}; quarantine write also failed: {}", e, q),
            )),
            (Ok(count), Err(q)) => {
                stats.stored = count as u64;
                Some(ChunkError::new(ChunkErrorKind::Quarantine, q.to_string()))
            },
        };

        if !stats.is_balanced() {
            warn!(?stats, "Chunk counters do not balance");
        }

        match error {
            None => self.finish(ctx, &chunk, ChunkStage::Completed, stats, None, started).await,
            Some(error) => {
                warn!(kind = %error.kind, error = %error.message, "Chunk failed");
                self.finish(ctx, &chunk, ChunkStage::Failed, stats, Some(error), started).await
            },
        }
    }

    async fn fetch_all(&self, chunk: &Chunk, job: &JobConfig) -> Result<Vec<Extracted>, ExtractError> {
        let stream = self.extractor.fetch(chunk, job).await?;
        stream.try_collect().await
    }

    async fn store(&self, target: &str, records: &[CanonicalRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.storage.upsert_batch(target, records).await
    }

    async fn write_quarantine(&self, entries: &[QuarantinedRecord]) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.quarantine.write(entries).await
    }

    async fn cancel_chunk(&self, chunk: Chunk, ctx: &RunContext<'_>) -> Result<ChunkOutcome, IngestError> {
        info!(job_id = %ctx.job_id, chunk = chunk.index, "Job cancelled, not dispatching further chunks");
        let error = ChunkError::new(ChunkErrorKind::Cancelled, "job cancelled before the chunk started");
        self.finish(ctx, &chunk, ChunkStage::Cancelled, ChunkStats::default(), Some(error), Instant::now())
            .await
    }

    async fn finish(
        &self,
        ctx: &RunContext<'_>,
        chunk: &Chunk,
        stage: ChunkStage,
        mut stats: ChunkStats,
        error: Option<ChunkError>,
        started: Instant,
    ) -> Result<ChunkOutcome, IngestError> {
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        let status = stage.status();
        self.persist(chunk.id(), status, &stats, error.as_ref()).await?;
        let finished = ctx.finished.fetch_add(1, Ordering::SeqCst) + 1;
        self.report(ctx, chunk.id(), stage, finished, &stats);

        Ok(ChunkOutcome {
            chunk: chunk.id(),
            start: chunk.start,
            end: chunk.end,
            status,
            stats,
            error,
            skipped: false,
        })
    }

    async fn persist(
        &self,
        chunk: ChunkId,
        status: ChunkStatus,
        stats: &ChunkStats,
        error: Option<&ChunkError>,
    ) -> Result<(), IngestError> {
        self.state
            .save_chunk_status(chunk, status, stats, error)
            .await
            .map_err(IngestError::StateStore)
    }

    /// Report a non-terminal stage
    fn emit(&self, ctx: &RunContext<'_>, chunk: ChunkId, stage: ChunkStage, stats: &ChunkStats) {
        self.report(ctx, chunk, stage, ctx.finished.load(Ordering::SeqCst), stats);
    }

    fn report(
        &self,
        ctx: &RunContext<'_>,
        chunk: ChunkId,
        stage: ChunkStage,
        completed: u64,
        stats: &ChunkStats,
    ) {
        self.progress.report(&ProgressEvent {
            job_id: ctx.job_id,
            chunk,
            stage,
            completed,
            total: ctx.total,
            metrics: stats.metrics(),
        });
    }
}
