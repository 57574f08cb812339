//! Logging configuration and initialization
//!
//! Every MDP component logs through `tracing`. This module installs the global
//! subscriber: console and/or daily-rotated file output, text or JSON, with an
//! `EnvFilter` built from the configured level plus extra directives.
//!
//! Use structured fields rather than interpolated strings:
//!
//! ```rust,ignore
//! info!(job_id = %job_id, chunk = %chunk.id(), records = n, "Chunk stored");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mdp_common::logging::{init_logging, LogConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = LogConfig::from_env()?;
//! let _guard = init_logging(&config)?;
//! tracing::info!("pipeline starting");
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated log files (file output only)
    pub log_dir: PathBuf,
    /// File name prefix, e.g. "mdp-ingest" -> "mdp-ingest.2024-01-18"
    pub log_file_prefix: String,
    /// Extra filter directives, e.g. "sqlx=warn,reqwest=info"
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "mdp".to_string(),
            filter_directives: Some("sqlx=warn".to_string()),
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Load configuration from `MDP_LOG_*` environment variables
    ///
    /// - `MDP_LOG_LEVEL`: trace, debug, info, warn, error
    /// - `MDP_LOG_OUTPUT`: console, file, both
    /// - `MDP_LOG_FORMAT`: text, json
    /// - `MDP_LOG_DIR`: directory for log files
    /// - `MDP_LOG_FILTER`: additional filter directives
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay any `MDP_LOG_*` variables that are set onto this configuration
    pub fn merge_env(self) -> Result<Self> {
        let (config, errors) = self.overlay(|key| std::env::var(key).ok());
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(config),
        }
    }

    /// Apply every `MDP_LOG_*` value `lookup` returns, skipping the ones that
    /// do not parse. Skipped values are returned alongside the configuration.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> (Self, Vec<anyhow::Error>) {
        let mut errors = Vec::new();

        if let Some(level) = lookup("MDP_LOG_LEVEL") {
            match level.parse() {
                Ok(level) => self.level = level,
                Err(e) => errors.push(e.context("MDP_LOG_LEVEL")),
            }
        }
        if let Some(output) = lookup("MDP_LOG_OUTPUT") {
            match output.parse() {
                Ok(output) => self.output = output,
                Err(e) => errors.push(e.context("MDP_LOG_OUTPUT")),
            }
        }
        if let Some(format) = lookup("MDP_LOG_FORMAT") {
            match format.parse() {
                Ok(format) => self.format = format,
                Err(e) => errors.push(e.context("MDP_LOG_FORMAT")),
            }
        }
        if let Some(dir) = lookup("MDP_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup("MDP_LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        (self, errors)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter =
            EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());

        if let Some(ref directives) = self.filter_directives {
            for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                filter = filter.add_directive(
                    directive
                        .parse()
                        .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
                );
            }
        }

        Ok(filter)
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when file output is enabled; keep it alive
/// for the lifetime of the process or buffered lines are lost on exit.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_output_targets() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::Console.file());
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
    }

    #[test]
    fn test_builder_and_filter() {
        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .format(LogFormat::Json)
            .log_file_prefix("mdp-test")
            .filter_directives("sqlx=warn, reqwest=info")
            .build();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_file_prefix, "mdp-test");
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_overlay_keeps_base_when_a_value_is_invalid() {
        let base = LogConfig::builder()
            .level(LogLevel::Debug)
            .log_file_prefix("mdp-ingest")
            .filter_directives("sqlx=warn")
            .build();
        let (config, errors) = base.overlay(|key| match key {
            "MDP_LOG_LEVEL" => Some("loud".to_string()),
            "MDP_LOG_FORMAT" => Some("json".to_string()),
            _ => None,
        });

        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("MDP_LOG_LEVEL"));
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_file_prefix, "mdp-ingest");
        assert_eq!(config.filter_directives.as_deref(), Some("sqlx=warn"));
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LogConfig::builder().filter_directives("sqlx=notalevel").build();
        assert!(config.env_filter().is_err());
    }
}
