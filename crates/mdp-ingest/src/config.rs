//! Job configuration and runtime settings
//!
//! A [`JobConfig`] is the resolved, immutable description of one ingestion job.
//! Its identity fields hash to a stable job id, so running the same
//! configuration again resumes the same job instead of starting a new one.
//! [`PipelineSettings`] hold process-level knobs that do not affect identity.

use chrono::NaiveDate;
use mdp_common::error::env_parse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::framework::schema::Schema;

/// Namespace for deterministic job ids
const JOB_NAMESPACE: Uuid = Uuid::from_u128(0x6d64_7069_6e67_6573_742d_6a6f_6273_0001);

/// Backoff parameters for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added at random, 0.0..=1.0
    pub jitter: f64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.1,
            attempt_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > 20 {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "max_retries {} exceeds 20",
                self.max_retries
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "multiplier {} must be at least 1.0",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "jitter {} must be within 0.0..=1.0",
                self.jitter
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "base delay {}ms exceeds max delay {}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "attempt timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved configuration of one ingestion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Provider dataset identifier, e.g. "GLBX.MDP3"
    pub dataset: String,
    pub schema: Schema,
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    /// Inclusive
    pub end: NaiveDate,
    pub chunk_days: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Logical destination inside the record store
    pub target: String,
    /// Instrument id to symbol resolution for records that carry no symbol
    #[serde(default)]
    pub symbol_map: BTreeMap<i64, String>,
}

impl JobConfig {
    pub fn new(
        dataset: impl Into<String>,
        schema: Schema,
        symbols: Vec<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            schema,
            symbols,
            start,
            end,
            chunk_days: 1,
            retry: RetryPolicy::default(),
            target: "default".to_string(),
            symbol_map: BTreeMap::new(),
        }
    }

    pub fn with_chunk_days(mut self, chunk_days: u32) -> Self {
        self.chunk_days = chunk_days;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_symbol_map(mut self, symbol_map: BTreeMap<i64, String>) -> Self {
        self.symbol_map = symbol_map;
        self
    }

    /// Reject configurations that cannot run; nothing is executed on error
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::Empty("dataset"));
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::Empty("symbols"));
        }
        if let Some(bad) = self
            .symbols
            .iter()
            .find(|s| s.trim().is_empty() || s.trim() != s.as_str() || s.contains(','))
        {
            return Err(ConfigError::InvalidSymbol(bad.clone()));
        }
        if self.end < self.start {
            return Err(ConfigError::InvalidDateRange {
                start: self.start,
                end: self.end,
            });
        }
        if self.chunk_days == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.target.is_empty()
            || !self
                .target
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ConfigError::InvalidTarget(self.target.clone()));
        }
        self.retry.validate()?;

        let symbols = self.sorted_symbols();
        if symbols.len() > 1 && self.symbol_map.is_empty() {
            return Err(ConfigError::AmbiguousSymbols { count: symbols.len() });
        }
        if let Some((instrument_id, symbol)) = self
            .symbol_map
            .iter()
            .find(|(_, symbol)| symbols.binary_search(symbol).is_err())
        {
            return Err(ConfigError::UnrequestedMappedSymbol {
                instrument_id: *instrument_id,
                symbol: symbol.clone(),
            });
        }
        Ok(())
    }

    /// Symbols sorted and de-duplicated
    pub fn sorted_symbols(&self) -> Vec<String> {
        let mut symbols = self.symbols.clone();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Deterministic id over the fields that define the work to be done
    pub fn job_id(&self) -> Uuid {
        let identity = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.dataset,
            self.schema,
            self.sorted_symbols().join(","),
            self.start,
            self.end,
            self.chunk_days,
            self.target
        );
        Uuid::new_v5(&JOB_NAMESPACE, identity.as_bytes())
    }

    /// Parse a `YYYY-MM-DD` date
    pub fn parse_date(value: &str) -> Result<NaiveDate, ConfigError> {
        NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| ConfigError::InvalidDate {
            value: value.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Process-level settings read from `MDP_*` environment variables
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub provider_url: String,
    pub api_key: Option<String>,
    pub database_url: String,
    /// Upper bound on concurrently open storage transactions
    pub db_pool_size: u32,
    /// Chunks processed at once; 1 is sequential
    pub concurrency: usize,
    /// Append dead letters to this file in addition to the database
    pub quarantine_file: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            provider_url: "http://localhost:8080".to_string(),
            api_key: None,
            database_url: "sqlite://mdp.db".to_string(),
            db_pool_size: 4,
            concurrency: 1,
            quarantine_file: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl PipelineSettings {
    /// Defaults overlaid with `MDP_PROVIDER_URL`, `MDP_API_KEY`,
    /// `MDP_DATABASE_URL`, `MDP_DB_POOL_SIZE`, `MDP_CONCURRENCY`,
    /// `MDP_QUARANTINE_FILE`, and `MDP_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> mdp_common::Result<Self> {
        let mut settings = Self::default();

        if let Some(url) = env_parse::<String>("MDP_PROVIDER_URL")? {
            settings.provider_url = url;
        }
        settings.api_key = env_parse::<String>("MDP_API_KEY")?;
        if let Some(url) = env_parse::<String>("MDP_DATABASE_URL")? {
            settings.database_url = url;
        }
        if let Some(size) = env_parse::<u32>("MDP_DB_POOL_SIZE")? {
            if size == 0 {
                return Err(mdp_common::MdpError::invalid_setting(
                    "MDP_DB_POOL_SIZE",
                    "0",
                    "must be at least 1",
                ));
            }
            settings.db_pool_size = size;
        }
        if let Some(concurrency) = env_parse::<usize>("MDP_CONCURRENCY")? {
            settings.concurrency = concurrency.max(1);
        }
        settings.quarantine_file = env_parse::<PathBuf>("MDP_QUARANTINE_FILE")?;
        if let Some(secs) = env_parse::<u64>("MDP_REQUEST_TIMEOUT_SECS")? {
            settings.request_timeout = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        JobConfig::parse_date(s).unwrap()
    }

    fn config() -> JobConfig {
        JobConfig::new(
            "GLBX.MDP3",
            Schema::Ohlcv1d,
            vec!["ESH4".to_string()],
            date("2024-01-01"),
            date("2024-01-10"),
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_range() {
        let mut cfg = config();
        cfg.end = date("2023-12-31");
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidDateRange { .. })));
    }

    #[test]
    fn test_rejects_zero_chunk() {
        assert_eq!(config().with_chunk_days(0).validate(), Err(ConfigError::ZeroChunkSize));
    }

    #[test]
    fn test_rejects_bad_target_and_symbols() {
        assert!(matches!(
            config().with_target("drop table").validate(),
            Err(ConfigError::InvalidTarget(_))
        ));
        let mut cfg = config();
        cfg.symbols = vec![" ".to_string()];
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidSymbol(_))));
        cfg.symbols.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::Empty("symbols")));
    }

    #[test]
    fn test_multi_symbol_requires_map() {
        let mut cfg = config();
        cfg.symbols = vec!["ESH4".to_string(), "NQH4".to_string()];
        assert_eq!(cfg.validate(), Err(ConfigError::AmbiguousSymbols { count: 2 }));

        let map = BTreeMap::from([(1, "ESH4".to_string()), (2, "NQH4".to_string())]);
        assert!(cfg.with_symbol_map(map).validate().is_ok());
    }

    #[test]
    fn test_symbol_map_must_name_requested_symbols() {
        let mut cfg = config();
        cfg.symbols = vec!["ESH4".to_string(), "NQH4".to_string()];
        let map = BTreeMap::from([(1, "ESH4".to_string()), (2, "CLH4".to_string())]);
        assert_eq!(
            cfg.clone().with_symbol_map(map).validate(),
            Err(ConfigError::UnrequestedMappedSymbol {
                instrument_id: 2,
                symbol: "CLH4".to_string()
            })
        );

        // a partial map is allowed; unmapped instruments are quarantined later
        let partial = BTreeMap::from([(1, "ESH4".to_string())]);
        assert!(cfg.clone().with_symbol_map(partial).validate().is_ok());

        // single-symbol jobs are checked too
        let single = config().with_symbol_map(BTreeMap::from([(9, "ZNH4".to_string())]));
        assert!(matches!(
            single.validate(),
            Err(ConfigError::UnrequestedMappedSymbol { instrument_id: 9, .. })
        ));
    }

    #[test]
    fn test_duplicate_symbols_are_one_symbol() {
        let mut cfg = config();
        cfg.symbols = vec!["ESH4".to_string(), "ESH4".to_string()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_job_id_is_stable_and_order_insensitive() {
        let mut a = config();
        a.symbols = vec!["A".to_string(), "B".to_string()];
        let mut b = config();
        b.symbols = vec!["B".to_string(), "A".to_string()];
        assert_eq!(a.job_id(), b.job_id());

        // retry tuning is not part of the job identity
        let c = a.clone().with_retry(RetryPolicy {
            max_retries: 5,
            ..RetryPolicy::default()
        });
        assert_eq!(a.job_id(), c.job_id());

        assert_ne!(a.job_id(), a.clone().with_chunk_days(2).job_id());
    }

    #[test]
    fn test_retry_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = RetryPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_parse_date_error() {
        assert!(matches!(
            JobConfig::parse_date("2024-13-01"),
            Err(ConfigError::InvalidDate { .. })
        ));
    }
}
