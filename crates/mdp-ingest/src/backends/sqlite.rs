//! SQLite backend
//!
//! One connection pool backs the record store, the job state store and the
//! quarantine table. The pool's connection limit bounds the number of
//! transactions open at once across concurrent chunk pipelines.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ChunkError, StorageError};
use crate::framework::stats::ChunkStats;
use crate::framework::storage::{
    ChunkRecord, JobStateStore, QuarantineSink, QuarantinedRecord, StorageWriter,
};
use crate::framework::types::{format_timestamp, CanonicalRecord, Chunk, ChunkId, ChunkStatus};
use crate::framework::validation::QuarantineKind;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS market_records (
        target TEXT NOT NULL,
        schema TEXT NOT NULL,
        instrument_id INTEGER NOT NULL,
        ts_event TEXT NOT NULL,
        discriminator TEXT NOT NULL DEFAULT '',
        symbol TEXT,
        fields TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (target, schema, instrument_id, ts_event, discriminator)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingest_chunks (
        job_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        status TEXT NOT NULL,
        stats TEXT NOT NULL DEFAULT '{}',
        error TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (job_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quarantined_records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        record_index INTEGER NOT NULL DEFAULT 0,
        fingerprint TEXT NOT NULL,
        error_kind TEXT NOT NULL,
        rule TEXT NOT NULL,
        error_message TEXT NOT NULL,
        original_record TEXT NOT NULL,
        quarantined_at TEXT NOT NULL,
        UNIQUE (job_id, chunk_index, record_index, fingerprint)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ingest_chunks_status ON ingest_chunks (job_id, status)",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url` (e.g. `sqlite://mdp.db`), creating the file if needed
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options, max_connections).await
    }

    /// Open a database file, creating it if needed
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(options, max_connections).await
    }

    async fn connect_with(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, StorageError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(max_connections = max_connections.max(1), "SQLite store connected");
        Ok(Self { pool })
    }

    /// Create tables; safe to run repeatedly
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Distinct stored records in `target`
    pub async fn record_count(&self, target: &str) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM market_records WHERE target = ?1")
            .bind(target)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn chunk_status(&self, chunk: ChunkId) -> Result<Option<ChunkStatus>, StorageError> {
        let row = sqlx::query("SELECT status FROM ingest_chunks WHERE job_id = ?1 AND chunk_index = ?2")
            .bind(chunk.job_id.to_string())
            .bind(i64::from(chunk.index))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_status(&r.try_get::<String, _>("status")?)).transpose()
    }
}

fn corrupt(column: &str, value: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        column: column.to_string(),
        value: value.into(),
    }
}

fn parse_status(raw: &str) -> Result<ChunkStatus, StorageError> {
    raw.parse().map_err(|_| corrupt("status", raw))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|_| corrupt("job_id", raw))
}

fn parse_date(column: &str, raw: &str) -> Result<NaiveDate, StorageError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| corrupt(column, raw))
}

fn parse_time(column: &str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| corrupt(column, raw))
}

fn parse_index(column: &str, raw: i64) -> Result<u32, StorageError> {
    u32::try_from(raw).map_err(|_| corrupt(column, raw.to_string()))
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord, StorageError> {
    let job_id: String = row.try_get("job_id")?;
    let index: i64 = row.try_get("chunk_index")?;
    let start: String = row.try_get("start_date")?;
    let end: String = row.try_get("end_date")?;
    let status: String = row.try_get("status")?;
    let stats: String = row.try_get("stats")?;
    let error: Option<String> = row.try_get("error")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ChunkRecord {
        chunk: Chunk {
            job_id: parse_uuid(&job_id)?,
            index: parse_index("chunk_index", index)?,
            start: parse_date("start_date", &start)?,
            end: parse_date("end_date", &end)?,
            status: parse_status(&status)?,
        },
        stats: serde_json::from_str(&stats)?,
        error: error.map(|e| serde_json::from_str(&e)).transpose()?,
        updated_at: parse_time("updated_at", &updated_at)?,
    })
}

#[async_trait]
impl StorageWriter for SqliteStore {
    async fn upsert_batch(&self, target: &str, records: &[CanonicalRecord]) -> Result<usize, StorageError> {
        let keyed = records
            .iter()
            .map(|r| r.natural_key().map(|key| (key, r)))
            .collect::<Result<Vec<_>, _>>()?;

        let now = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        for (key, record) in &keyed {
            sqlx::query(
                r#"
                INSERT INTO market_records (
                    target, schema, instrument_id, ts_event, discriminator, symbol, fields, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(target, schema, instrument_id, ts_event, discriminator) DO UPDATE SET
                    symbol = excluded.symbol,
                    fields = excluded.fields,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(target)
            .bind(key.schema.as_str())
            .bind(key.instrument_id)
            .bind(format_timestamp(&key.ts_event))
            .bind(&key.discriminator)
            .bind(record.symbol())
            .bind(record.fields_json().to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(keyed.len())
    }
}

#[async_trait]
impl JobStateStore for SqliteStore {
    async fn load_chunks(&self, job_id: Uuid) -> Result<Vec<Chunk>, StorageError> {
        Ok(self
            .chunk_details(job_id)
            .await?
            .into_iter()
            .map(|record| record.chunk)
            .collect())
    }

    async fn register_chunks(&self, chunks: &[Chunk]) -> Result<(), StorageError> {
        let now = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO ingest_chunks (job_id, chunk_index, start_date, end_date, status, stats, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, '{}', ?6)
                ON CONFLICT(job_id, chunk_index) DO NOTHING
                "#,
            )
            .bind(chunk.job_id.to_string())
            .bind(i64::from(chunk.index))
            .bind(chunk.start.format(DATE_FORMAT).to_string())
            .bind(chunk.end.format(DATE_FORMAT).to_string())
            .bind(chunk.status.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_chunk_status(
        &self,
        chunk: ChunkId,
        status: ChunkStatus,
        stats: &ChunkStats,
        error: Option<&ChunkError>,
    ) -> Result<(), StorageError> {
        let allowed_from: Vec<&str> = [
            ChunkStatus::Pending,
            ChunkStatus::InProgress,
            ChunkStatus::Completed,
            ChunkStatus::CompletedEmpty,
            ChunkStatus::Failed,
            ChunkStatus::Cancelled,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(status))
        .map(|from| from.as_str())
        .collect();

        let stats_json = serde_json::to_string(stats)?;
        let error_json = error.map(serde_json::to_string).transpose()?;

        // the transition check and the write are one statement
        let placeholders = (0..allowed_from.len())
            .map(|i| format!("?{}", i + 7))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE ingest_chunks
            SET status = ?1, stats = ?2, error = ?3, updated_at = ?4
            WHERE job_id = ?5 AND chunk_index = ?6 AND status IN ({})
            "#,
            if placeholders.is_empty() { "NULL".to_string() } else { placeholders }
        );

        let mut query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(stats_json)
            .bind(error_json)
            .bind(format_timestamp(&Utc::now()))
            .bind(chunk.job_id.to_string())
            .bind(i64::from(chunk.index));
        for from in &allowed_from {
            query = query.bind(*from);
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.chunk_status(chunk).await? {
            None => Err(StorageError::UnknownChunk(chunk)),
            Some(from) => Err(StorageError::InvalidTransition {
                chunk,
                from,
                to: status,
            }),
        }
    }

    async fn chunk_details(&self, job_id: Uuid) -> Result<Vec<ChunkRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, chunk_index, start_date, end_date, status, stats, error, updated_at
            FROM ingest_chunks
            WHERE job_id = ?1
            ORDER BY chunk_index
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }
}

#[async_trait]
impl QuarantineSink for SqliteStore {
    async fn write(&self, records: &[QuarantinedRecord]) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO quarantined_records (
                    job_id, chunk_index, record_index, fingerprint, error_kind, rule,
                    error_message, original_record, quarantined_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(job_id, chunk_index, record_index, fingerprint) DO NOTHING
                "#,
            )
            .bind(record.job_id.to_string())
            .bind(i64::from(record.chunk_id))
            .bind(i64::from(record.record_index))
            .bind(&record.fingerprint)
            .bind(record.error_kind.as_str())
            .bind(&record.rule)
            .bind(&record.error_message)
            .bind(record.original_record.to_string())
            .bind(format_timestamp(&record.timestamp))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    async fn load(&self, job_id: Uuid) -> Result<Vec<QuarantinedRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, chunk_index, record_index, fingerprint, error_kind, rule,
                   error_message, original_record, quarantined_at
            FROM quarantined_records
            WHERE job_id = ?1
            ORDER BY seq
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<QuarantinedRecord, StorageError> {
                let job_id: String = row.try_get("job_id")?;
                let chunk_index: i64 = row.try_get("chunk_index")?;
                let record_index: i64 = row.try_get("record_index")?;
                let error_kind: String = row.try_get("error_kind")?;
                let original: String = row.try_get("original_record")?;
                let quarantined_at: String = row.try_get("quarantined_at")?;

                Ok(QuarantinedRecord {
                    original_record: serde_json::from_str(&original)?,
                    error_kind: serde_json::from_value::<QuarantineKind>(serde_json::Value::String(
                        error_kind,
                    ))?,
                    rule: row.try_get("rule")?,
                    error_message: row.try_get("error_message")?,
                    job_id: parse_uuid(&job_id)?,
                    chunk_id: parse_index("chunk_index", chunk_index)?,
                    record_index: parse_index("record_index", record_index)?,
                    timestamp: parse_time("quarantined_at", &quarantined_at)?,
                    fingerprint: row.try_get("fingerprint")?,
                })
            })
            .collect()
    }
}
