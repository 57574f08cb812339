//! HTTP extraction adapter
//!
//! Fetches a chunk's records from the provider's time-series range endpoint
//! as JSON lines and decodes them lazily while the body streams in.
//!
//! Response classification:
//!
//! | Status            | Classification                       |
//! |-------------------|--------------------------------------|
//! | 401, 403          | fatal, auth                          |
//! | 400, 404, 422     | fatal, malformed request             |
//! | 429               | retryable, honours `Retry-After`     |
//! | 5xx               | retryable                            |
//! | transport failure | retryable (timeout or network)       |
//!
//! A body line that is not a JSON object does not fail the fetch; it is
//! passed on as [`Extracted::Undecodable`] and quarantined downstream.

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::{JobConfig, PipelineSettings};
use crate::error::ExtractError;
use crate::framework::extractor::{Extracted, Extractor, RecordStream};
use crate::framework::types::{Chunk, RawRecord};

/// Upper bound on one encoded record
const MAX_LINE_BYTES: usize = 1024 * 1024;
/// Error bodies are cut to this many characters
const MAX_ERROR_BODY: usize = 512;
const RANGE_PATH: &str = "v0/timeseries.get_range";

pub struct HttpExtractor {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpExtractor {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mdp-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    pub fn from_settings(settings: &PipelineSettings) -> Result<Self, reqwest::Error> {
        Self::new(
            settings.provider_url.clone(),
            settings.api_key.clone(),
            settings.request_timeout,
        )
    }

    fn range_url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), RANGE_PATH)
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn fetch(&self, chunk: &Chunk, job: &JobConfig) -> Result<RecordStream, ExtractError> {
        let query = [
            ("dataset", job.dataset.clone()),
            ("schema", job.schema.to_string()),
            ("symbols", job.sorted_symbols().join(",")),
            ("start", chunk.start_time().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", chunk.end_time().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("encoding", "json".to_string()),
        ];

        debug!(chunk = %chunk.id(), url = %self.range_url(), "Requesting chunk");

        let mut request = self.client.get(self.range_url()).query(&query);
        if let Some(ref key) = self.api_key {
            request = request.basic_auth(key, Some(""));
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, truncate(&body), retry_after));
        }

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );

        let records = lines.filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(Ok(decode_line(line))),
                // the codec stops after an error, so the rest of the body would be lost
                Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(ExtractError::decode(format!(
                    "record exceeds {} bytes",
                    MAX_LINE_BYTES
                )))),
                Err(LinesCodecError::Io(e)) => {
                    Some(Err(ExtractError::network(format!("reading response body: {}", e))))
                },
            }
        });

        Ok(records.boxed())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Decode one JSON line; a bad line is handed on for quarantine
fn decode_line(line: String) -> Extracted {
    match serde_json::from_str::<serde_json::Value>(&line) {
        Ok(value) => match RawRecord::from_value(value) {
            Some(record) => Extracted::Record(record),
            None => Extracted::Undecodable {
                line,
                reason: "record is not a JSON object".to_string(),
            },
        },
        Err(e) => Extracted::Undecodable {
            line,
            reason: format!("invalid JSON record: {}", e),
        },
    }
}

fn transport_error(err: reqwest::Error) -> ExtractError {
    if err.is_timeout() {
        ExtractError::timeout(err.to_string())
    } else {
        ExtractError::network(err.to_string())
    }
}

/// Map a non-success status to an extraction error
pub fn classify_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> ExtractError {
    match status.as_u16() {
        401 | 403 => ExtractError::auth(format!("HTTP {}: {}", status.as_u16(), body)),
        400 | 404 | 422 => ExtractError::malformed(format!("HTTP {}: {}", status.as_u16(), body)),
        429 => ExtractError::rate_limited(format!("HTTP 429: {}", body), retry_after),
        code if status.is_server_error() => ExtractError::server(code, body),
        code => ExtractError::malformed(format!("unexpected HTTP {}: {}", code, body)),
    }
}

/// `Retry-After` in delta-seconds form
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new(), None).is_retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new(), None).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new(), None).is_retryable());
        match classify_status(StatusCode::TOO_MANY_REQUESTS, String::new(), Some(Duration::from_secs(3))) {
            ExtractError::Retryable(e) => assert_eq!(e.retry_after, Some(Duration::from_secs(3))),
            other => panic!("expected retryable, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_decode_line() {
        assert!(matches!(decode_line(r#"{"hd": {"instrument_id": 1}}"#.to_string()), Extracted::Record(_)));
        match decode_line("[1, 2]".to_string()) {
            Extracted::Undecodable { line, reason } => {
                assert_eq!(line, "[1, 2]");
                assert!(reason.contains("not a JSON object"));
            },
            other => panic!("expected undecodable, got {:?}", other),
        }
        assert!(matches!(decode_line("{oops".to_string()), Extracted::Undecodable { .. }));
    }
}
