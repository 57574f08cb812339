//! JSON-lines quarantine file
//!
//! Append-only: one dead letter per line, flushed after every batch so an
//! operator can tail the file while a job runs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StorageError;
use crate::framework::storage::{QuarantineSink, QuarantinedRecord};

pub struct JsonlQuarantineSink {
    path: PathBuf,
    // serializes appends from concurrent chunks
    lock: Mutex<()>,
}

impl JsonlQuarantineSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QuarantineSink for JsonlQuarantineSink {
    async fn write(&self, records: &[QuarantinedRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;

        Ok(records.len())
    }

    async fn load(&self, job_id: Uuid) -> Result<Vec<QuarantinedRecord>, StorageError> {
        let _guard = self.lock.lock().await;
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record: QuarantinedRecord = serde_json::from_str(line)?;
            if record.job_id == job_id {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ValidationFailure;
    use crate::framework::types::{ChunkId, RawRecord};
    use crate::framework::validation::QuarantineKind;
    use serde_json::json;

    fn entry(job_id: Uuid, index: u32) -> QuarantinedRecord {
        QuarantinedRecord::new(
            ChunkId { job_id, index },
            0,
            RawRecord::from_value(json!({"size": -1, "index": index})).unwrap(),
            QuarantineKind::BusinessRule,
            ValidationFailure {
                rule: "size_non_negative".to_string(),
                message: "size >= 0 does not hold".to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_load_by_job() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlQuarantineSink::new(dir.path().join("nested").join("dead.jsonl"));
        let job = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(sink.load(job).await.unwrap().is_empty());
        sink.write(&[entry(job, 0), entry(other, 0)]).await.unwrap();
        sink.write(&[entry(job, 1)]).await.unwrap();

        let loaded = sink.load(job).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].chunk_id, 1);
        assert_eq!(loaded[0].rule, "size_non_negative");

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }
}
