//! MDP Ingest - market-data ingestion tool

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mdp_common::logging::{init_logging, LogConfig, LogLevel};
use mdp_ingest::backends::{FanoutQuarantine, JsonlQuarantineSink, MemoryStore, SqliteStore};
use mdp_ingest::framework::{
    plan_job, JobStateStore, LogProgress, Orchestrator, OrchestratorOptions, QuarantineSink, Schema,
};
use mdp_ingest::{HttpExtractor, JobConfig, PipelineSettings, RetryPolicy};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mdp-ingest")]
#[command(author, version, about = "MDP market-data ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) an ingestion job
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Chunks processed at once (overrides MDP_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Keep everything in memory instead of the configured database
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the chunk plan of a job without running it
    Plan {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Show chunk statuses of a job
    Status {
        /// Job id printed by `run` or `plan`
        job_id: Uuid,
    },

    /// List quarantined records of a job
    Quarantine {
        job_id: Uuid,

        /// Maximum entries to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Args, Debug, Clone)]
struct JobArgs {
    /// Provider dataset, e.g. GLBX.MDP3
    #[arg(long)]
    dataset: String,

    /// ohlcv-1d, ohlcv-1h, ohlcv-1m, trades or statistics
    #[arg(long)]
    schema: Schema,

    /// Comma-separated symbols
    #[arg(long, value_delimiter = ',', required = true)]
    symbols: Vec<String>,

    /// First day, YYYY-MM-DD
    #[arg(long)]
    start: String,

    /// Last day (inclusive), YYYY-MM-DD
    #[arg(long)]
    end: String,

    #[arg(long, default_value_t = 1)]
    chunk_days: u32,

    /// Destination inside the record store
    #[arg(long, default_value = "default")]
    target: String,

    /// Instrument id to symbol, as ID=SYMBOL; repeatable
    #[arg(long = "map", value_parser = parse_mapping)]
    symbol_map: Vec<(i64, String)>,

    #[arg(long)]
    max_retries: Option<u32>,
}

impl JobArgs {
    fn to_config(&self) -> Result<JobConfig> {
        let mut retry = RetryPolicy::default();
        if let Some(max_retries) = self.max_retries {
            retry.max_retries = max_retries;
        }

        let config = JobConfig::new(
            self.dataset.clone(),
            self.schema,
            self.symbols.clone(),
            JobConfig::parse_date(&self.start)?,
            JobConfig::parse_date(&self.end)?,
        )
        .with_chunk_days(self.chunk_days)
        .with_target(self.target.clone())
        .with_retry(retry)
        .with_symbol_map(self.symbol_map.iter().cloned().collect::<BTreeMap<_, _>>());

        config.validate()?;
        Ok(config)
    }
}

fn parse_mapping(raw: &str) -> std::result::Result<(i64, String), String> {
    let (id, symbol) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=SYMBOL, got {:?}", raw))?;
    let id = id
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid instrument id {:?}: {}", id, e))?;
    Ok((id, symbol.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("mdp-ingest".to_string())
        .filter_directives("mdp_ingest=debug,sqlx=warn,hyper=info".to_string())
        .build();

    // Environment variables take precedence; invalid ones are skipped
    let (log_config, env_errors) = log_config.overlay(|key| std::env::var(key).ok());
    let _guard = init_logging(&log_config)?;
    for err in env_errors {
        warn!(error = %err, "Ignoring invalid logging setting");
    }

    let settings = PipelineSettings::from_env().context("Failed to read MDP_* settings")?;

    match cli.command {
        Command::Run {
            job,
            concurrency,
            dry_run,
        } => run_job(&settings, &job, concurrency, dry_run).await,
        Command::Plan { job } => {
            let config = job.to_config()?;
            let chunks = plan_job(&config)?;
            println!("Job {} ({} chunks)", config.job_id(), chunks.len());
            for chunk in chunks {
                println!("  #{:<4} {} .. {}", chunk.index, chunk.start, chunk.end);
            }
            Ok(())
        },
        Command::Status { job_id } => {
            let store = open_store(&settings).await?;
            let details = store.chunk_details(job_id).await.context("Failed to load chunk state")?;
            if details.is_empty() {
                bail!("No chunks recorded for job {}", job_id);
            }
            let chunks: Vec<_> = details.iter().map(|d| d.chunk.clone()).collect();
            println!("{}", mdp_ingest::framework::JobStatusSnapshot::from_chunks(job_id, &chunks));
            for row in details {
                print!(
                    "  #{:<4} {} .. {}  {:<15} stored={} quarantined={} retries={}",
                    row.chunk.index,
                    row.chunk.start,
                    row.chunk.end,
                    row.chunk.status.as_str(),
                    row.stats.stored,
                    row.stats.quarantined,
                    row.stats.retries
                );
                if let Some(error) = row.error {
                    print!(" [{}] {}", error.kind, error.message);
                }
                println!();
            }
            Ok(())
        },
        Command::Quarantine { job_id, limit } => {
            let store = open_store(&settings).await?;
            let entries = store.load(job_id).await.context("Failed to load quarantine")?;
            println!("{} quarantined records for job {}", entries.len(), job_id);
            for entry in entries.iter().take(limit) {
                println!(
                    "  chunk {:<4} {:<15} {:<28} {}  {}",
                    entry.chunk_id,
                    entry.error_kind.as_str(),
                    entry.rule,
                    entry.error_message,
                    entry.original_record
                );
            }
            Ok(())
        },
    }
}

async fn open_store(settings: &PipelineSettings) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&settings.database_url, settings.db_pool_size)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database_url))?;
    store.migrate().await.context("Failed to migrate database")?;
    Ok(Arc::new(store))
}

async fn run_job(
    settings: &PipelineSettings,
    args: &JobArgs,
    concurrency: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let config = args.to_config()?;
    let extractor = Arc::new(HttpExtractor::from_settings(settings).context("Failed to build HTTP client")?);
    let options = OrchestratorOptions {
        concurrency: concurrency.unwrap_or(settings.concurrency).max(1),
    };

    let orchestrator = if dry_run {
        info!("Dry run: records and job state stay in memory");
        let store = Arc::new(MemoryStore::new());
        Orchestrator::new(extractor, store.clone(), store.clone(), store)
    } else {
        let store = open_store(settings).await?;
        let quarantine: Arc<dyn QuarantineSink> = match settings.quarantine_file {
            Some(ref path) => Arc::new(FanoutQuarantine::new(vec![
                store.clone() as Arc<dyn QuarantineSink>,
                Arc::new(JsonlQuarantineSink::new(path.clone())),
            ])),
            None => store.clone(),
        };
        Orchestrator::new(extractor, store.clone(), store, quarantine)
    };
    let orchestrator = orchestrator
        .with_options(options)
        .with_progress(Arc::new(LogProgress));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing running chunks");
            on_signal.cancel();
        }
    });

    let report = orchestrator.run(&config, &cancel).await?;
    println!("{}", report.summary());

    if !report.failed_chunks.is_empty() {
        bail!(
            "{} chunks failed; re-run the same command to retry them",
            report.failed_chunks.len()
        );
    }
    Ok(())
}
