//! MDP Ingest Library
//!
//! Chunked, resumable ingestion of market-data time series: extraction with
//! retry, declarative transformation, validation with repair and quarantine,
//! and idempotent storage.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mdp_ingest::backends::MemoryStore;
//! use mdp_ingest::framework::{Orchestrator, Schema};
//! use mdp_ingest::{HttpExtractor, JobConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let job = JobConfig::new(
//!         "GLBX.MDP3",
//!         Schema::Ohlcv1d,
//!         vec!["ESM4".to_string()],
//!         JobConfig::parse_date("2024-03-01")?,
//!         JobConfig::parse_date("2024-03-31")?,
//!     );
//!     let store = Arc::new(MemoryStore::new());
//!     let extractor = Arc::new(HttpExtractor::new("https://provider.example", None, std::time::Duration::from_secs(60))?);
//!     let report = Orchestrator::new(extractor, store.clone(), store.clone(), store)
//!         .run(&job, &CancellationToken::new())
//!         .await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod backends;
pub mod config;
pub mod error;
pub mod framework;
pub mod http;

pub use config::{JobConfig, PipelineSettings, RetryPolicy};
pub use error::{ChunkError, ConfigError, ExtractError, IngestError, StorageError};
pub use framework::{JobReport, Orchestrator, OrchestratorOptions};
pub use http::HttpExtractor;
