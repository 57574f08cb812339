//! SQLite backend tests
//!
//! Each test opens a fresh database file in a temporary directory.

mod helpers;

use anyhow::Result;
use chrono::DateTime;
use helpers::*;
use mdp_ingest::backends::SqliteStore;
use mdp_ingest::error::{StorageError, ValidationFailure};
use mdp_ingest::framework::{
    CanonicalRecord, ChunkId, ChunkStage, ChunkStats, ChunkStatus, FieldValue, JobStateStore,
    NoProgress, ProgressEvent, QuarantineKind, QuarantineSink, QuarantinedRecord, RawRecord, Schema,
    StorageWriter,
};
use mdp_ingest::Orchestrator;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn open_store(dir: &TempDir) -> Result<SqliteStore> {
    let store = SqliteStore::open(dir.path().join("mdp.db"), 4).await?;
    store.migrate().await?;
    Ok(store)
}

fn trade(instrument_id: i64, sequence: i64, price: i64) -> CanonicalRecord {
    CanonicalRecord::new(Schema::Trades)
        .with("ts_event", FieldValue::Timestamp(DateTime::from_timestamp_nanos(1_709_251_200_000_000_000)))
        .with("instrument_id", FieldValue::Integer(instrument_id))
        .with("symbol", FieldValue::text("ESM4"))
        .with("price", FieldValue::Decimal(Decimal::from(price)))
        .with("size", FieldValue::Integer(1))
        .with("side", FieldValue::text("B"))
        .with("sequence", FieldValue::Integer(sequence))
}

#[tokio::test]
async fn test_migrate_is_repeatable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir).await?;
    store.migrate().await?;
    assert_eq!(store.record_count("any").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_upsert_is_keyed_by_natural_key() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir).await?;

    // same instrument and time, different sequence: two trades
    store.upsert_batch("trades", &[trade(1, 10, 100), trade(1, 11, 101)]).await?;
    assert_eq!(store.record_count("trades").await?, 2);

    // re-submitting updates in place
    store.upsert_batch("trades", &[trade(1, 10, 105)]).await?;
    assert_eq!(store.record_count("trades").await?, 2);

    let fields: String = sqlx::query_scalar(
        "SELECT fields FROM market_records WHERE target = 'trades' AND discriminator = '10'",
    )
    .fetch_one(store.pool())
    .await?;
    let fields: serde_json::Value = serde_json::from_str(&fields)?;
    assert_eq!(fields["price"], json!("105"));

    // targets are separate namespaces
    store.upsert_batch("trades_copy", &[trade(1, 10, 100)]).await?;
    assert_eq!(store.record_count("trades").await?, 2);
    assert_eq!(store.record_count("trades_copy").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_batch_commits_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir).await?;

    let mut broken = trade(2, 1, 100);
    broken.fields.remove("sequence");
    let err = store
        .upsert_batch("trades", &[trade(1, 1, 100), broken])
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::MissingKey(_)));
    assert_eq!(store.record_count("trades").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_chunk_state_round_trip_and_transitions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir).await?;
    let job = ohlcv_job(3, 1);
    let chunks = mdp_ingest::framework::plan_job(&job)?;
    store.register_chunks(&chunks).await?;

    let loaded = store.load_chunks(job.job_id()).await?;
    assert_eq!(loaded, chunks);

    let stats = ChunkStats {
        fetched: 4,
        transformed: 4,
        valid: 4,
        stored: 4,
        ..Default::default()
    };
    let id = chunks[1].id();
    store.save_chunk_status(id, ChunkStatus::InProgress, &ChunkStats::default(), None).await?;
    store.save_chunk_status(id, ChunkStatus::Completed, &stats, None).await?;

    // completed chunks never move again
    let err = store
        .save_chunk_status(id, ChunkStatus::InProgress, &ChunkStats::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::InvalidTransition {
            from: ChunkStatus::Completed,
            to: ChunkStatus::InProgress,
            ..
        }
    ));

    // pending chunks cannot complete without running
    let err = store
        .save_chunk_status(chunks[2].id(), ChunkStatus::Completed, &stats, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));

    let unknown = ChunkId {
        job_id: Uuid::new_v4(),
        index: 0,
    };
    let err = store
        .save_chunk_status(unknown, ChunkStatus::InProgress, &stats, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UnknownChunk(_)));

    // registering the plan again keeps progress
    store.register_chunks(&chunks).await?;
    let details = store.chunk_details(job.job_id()).await?;
    assert_eq!(details[1].chunk.status, ChunkStatus::Completed);
    assert_eq!(details[1].stats, stats);
    assert_eq!(details[0].chunk.status, ChunkStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_quarantine_is_deduplicated_per_chunk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir).await?;
    let job_id = Uuid::new_v4();
    let entry = |index: u32, position: u32| {
        QuarantinedRecord::new(
            ChunkId { job_id, index },
            position,
            RawRecord::from_value(json!({"size": -1, "price": 1})).unwrap(),
            QuarantineKind::BusinessRule,
            ValidationFailure {
                rule: "size_non_negative".to_string(),
                message: "size >= 0 does not hold (size=-1)".to_string(),
            },
        )
        .unwrap()
    };

    store.write(&[entry(0, 0), entry(1, 0)]).await?;
    store.write(&[entry(0, 0)]).await?;

    let loaded = store.load(job_id).await?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].chunk_id, 0);
    assert_eq!(loaded[0].error_kind, QuarantineKind::BusinessRule);
    assert_eq!(loaded[0].original_record, json!({"size": -1, "price": 1}));
    assert!(store.load(Uuid::new_v4()).await?.is_empty());

    // the same payload at two positions of one chunk is two dead letters
    store.write(&[entry(2, 4), entry(2, 9)]).await?;
    store.write(&[entry(2, 4), entry(2, 9)]).await?;
    let chunk_two: Vec<u32> = store
        .load(job_id)
        .await?
        .iter()
        .filter(|q| q.chunk_id == 2)
        .map(|q| q.record_index)
        .collect();
    assert_eq!(chunk_two, vec![4, 9]);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_bad_records_in_one_chunk_are_all_quarantined() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(open_store(&dir).await?);
    let job = ohlcv_job(1, 1);
    let extractor = Arc::new(ScriptedExtractor::new(1).with_records(
        0,
        vec![inverted_bar(2, day(0)), ohlcv_bar(1, day(0), 100), inverted_bar(2, day(0))],
    ));

    let report = Orchestrator::new(extractor, store.clone(), store.clone(), store.clone())
        .with_progress(Arc::new(NoProgress))
        .run(&job, &CancellationToken::new())
        .await?;

    assert_eq!(report.stats.records_quarantined, 2);
    let dead = store.load(job.job_id()).await?;
    assert_eq!(dead.iter().map(|q| q.record_index).collect::<Vec<_>>(), vec![0, 2]);
    Ok(())
}

#[tokio::test]
async fn test_job_resumes_after_restart() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let job = ohlcv_job(6, 1);
    let extractor = Arc::new(ScriptedExtractor::new(2).with_records(
        0,
        vec![ohlcv_bar(1, day(0), 100), inverted_bar(2, day(0))],
    ));

    {
        let store = Arc::new(open_store(&dir).await?);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let report = Orchestrator::new(extractor.clone(), store.clone(), store.clone(), store.clone())
            .with_progress(Arc::new(move |e: &ProgressEvent| {
                if e.stage == ChunkStage::Completed && e.chunk.index == 1 {
                    trigger.cancel();
                }
            }))
            .run(&job, &cancel)
            .await?;
        assert_eq!(report.stats.chunks_completed, 2);
        assert_eq!(report.stats.chunks_cancelled, 1);
    }

    // a new process opens the same database
    let store = Arc::new(open_store(&dir).await?);
    let report = Orchestrator::new(extractor.clone(), store.clone(), store.clone(), store.clone())
        .with_progress(Arc::new(NoProgress))
        .run(&job, &CancellationToken::new())
        .await?;

    assert_eq!(report.stats.chunks_skipped, 2);
    assert_eq!(report.stats.chunks_completed, 4);
    assert_eq!(extractor.fetched_chunks(), (0..6).collect::<Vec<_>>());
    assert!((0..6).all(|i| extractor.calls(i) == 1));

    assert_eq!(store.record_count("futures_daily").await?, 1 + 5 * 2);
    let dead = store.load(job.job_id()).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].rule, "high_ge_low");

    let statuses: Vec<ChunkStatus> = store.load_chunks(job.job_id()).await?.iter().map(|c| c.status).collect();
    assert!(statuses.iter().all(|s| *s == ChunkStatus::Completed));
    Ok(())
}
