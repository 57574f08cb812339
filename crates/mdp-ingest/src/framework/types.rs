//! Core types for the ingestion framework

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use super::schema::Schema;
use crate::error::StorageError;

/// Canonical field names shared by every schema
pub mod fields {
    pub const TS_EVENT: &str = "ts_event";
    pub const INSTRUMENT_ID: &str = "instrument_id";
    pub const SYMBOL: &str = "symbol";
}

/// Stable identity of a chunk: the owning job plus its position in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub job_id: Uuid,
    pub index: u32,
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.job_id, self.index)
    }
}

/// Persisted chunk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    CompletedEmpty,
    Failed,
    Cancelled,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::CompletedEmpty => "completed_empty",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal for the current run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChunkStatus::Pending | ChunkStatus::InProgress)
    }

    /// Work is durable and the chunk is skipped on every later run
    pub fn is_done(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::CompletedEmpty)
    }

    /// Allowed persisted transitions.
    ///
    /// `InProgress -> InProgress` covers resuming after a crash; failed and
    /// cancelled chunks may be picked up again; done chunks never change.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        match self {
            Pending => matches!(next, InProgress | Cancelled),
            InProgress => next != Pending,
            Failed | Cancelled => matches!(next, InProgress | Cancelled),
            Completed | CompletedEmpty => false,
        }
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "in_progress" => Ok(ChunkStatus::InProgress),
            "completed" => Ok(ChunkStatus::Completed),
            "completed_empty" => Ok(ChunkStatus::CompletedEmpty),
            "failed" => Ok(ChunkStatus::Failed),
            "cancelled" => Ok(ChunkStatus::Cancelled),
            other => Err(format!("unknown chunk status '{}'", other)),
        }
    }
}

/// In-memory pipeline stage of a chunk, reported to progress listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStage {
    Pending,
    Fetching,
    Transforming,
    Validating,
    Storing,
    Completed,
    CompletedEmpty,
    Failed,
    Cancelled,
}

impl ChunkStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStage::Pending => "pending",
            ChunkStage::Fetching => "fetching",
            ChunkStage::Transforming => "transforming",
            ChunkStage::Validating => "validating",
            ChunkStage::Storing => "storing",
            ChunkStage::Completed => "completed",
            ChunkStage::CompletedEmpty => "completed_empty",
            ChunkStage::Failed => "failed",
            ChunkStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkStage::Completed
                | ChunkStage::CompletedEmpty
                | ChunkStage::Failed
                | ChunkStage::Cancelled
        )
    }

    /// Persisted status corresponding to this stage
    pub fn status(&self) -> ChunkStatus {
        match self {
            ChunkStage::Pending => ChunkStatus::Pending,
            ChunkStage::Fetching
            | ChunkStage::Transforming
            | ChunkStage::Validating
            | ChunkStage::Storing => ChunkStatus::InProgress,
            ChunkStage::Completed => ChunkStatus::Completed,
            ChunkStage::CompletedEmpty => ChunkStatus::CompletedEmpty,
            ChunkStage::Failed => ChunkStatus::Failed,
            ChunkStage::Cancelled => ChunkStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for ChunkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded time window of a job. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub job_id: Uuid,
    pub index: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        ChunkId {
            job_id: self.job_id,
            index: self.index,
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end.and_time(NaiveTime::MIN).and_utc()
    }

    /// Same window and identity, ignoring status
    pub fn same_bounds(&self, other: &Chunk) -> bool {
        self.job_id == other.job_id
            && self.index == other.index
            && self.start == other.start
            && self.end == other.end
    }
}

/// Raw provider record: an opaque JSON object in the provider's own shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(serde_json::Map<String, serde_json::Value>);

impl RawRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value; only objects are records
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Look up a field by dotted path, e.g. `hd.ts_event`
    pub fn get_path(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn as_map(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.0
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.0)
    }

    /// Compact rendering for error context, cut at `limit` characters
    pub fn excerpt(&self, limit: usize) -> String {
        let rendered = serde_json::Value::Object(self.0.clone()).to_string();
        if rendered.chars().count() <= limit {
            rendered
        } else {
            let cut: String = rendered.chars().take(limit).collect();
            format!("{}...", cut)
        }
    }
}

impl From<RawRecord> for serde_json::Value {
    fn from(record: RawRecord) -> Self {
        record.into_value()
    }
}

/// Declared primitive type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Decimal,
    Text,
    Timestamp,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Text => "text",
            FieldKind::Timestamp => "timestamp",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a canonical field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Integer(i64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Convert a JSON scalar without interpreting it against a declared kind
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Text(b.to_string()),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Integer(i)
                } else {
                    let s = n.to_string();
                    Decimal::from_str_exact(&s)
                        .or_else(|_| Decimal::from_scientific(&s))
                        .map(FieldValue::Decimal)
                        .unwrap_or(FieldValue::Text(s))
                }
            },
            Value::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        }
    }

    /// JSON form used for storage and quarantine output
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Decimal(d) => Value::String(d.normalize().to_string()),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
        }
    }

    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(_) => Some(FieldKind::Integer),
            FieldValue::Decimal(_) => Some(FieldKind::Decimal),
            FieldValue::Text(_) => Some(FieldKind::Text),
            FieldValue::Timestamp(_) => Some(FieldKind::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Decimal(d) if d.fract().is_zero() => i64::try_from(*d).ok(),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Numeric view; numeric text is read as a number
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Integer(i) => Some(Decimal::from(*i)),
            FieldValue::Decimal(d) => Some(*d),
            FieldValue::Text(s) => Decimal::from_str_exact(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Convert to `kind`, or `None` when the value cannot represent it.
    ///
    /// Integers used as timestamps are nanoseconds since the Unix epoch.
    pub fn coerce_to(&self, kind: FieldKind) -> Option<FieldValue> {
        match (self, kind) {
            (FieldValue::Null, _) => None,
            (v, k) if v.kind() == Some(k) => Some(v.clone()),
            (FieldValue::Integer(i), FieldKind::Decimal) => Some(FieldValue::Decimal(Decimal::from(*i))),
            (FieldValue::Integer(i), FieldKind::Timestamp) => {
                Some(FieldValue::Timestamp(DateTime::from_timestamp_nanos(*i)))
            },
            (FieldValue::Integer(i), FieldKind::Text) => Some(FieldValue::Text(i.to_string())),
            (FieldValue::Decimal(d), FieldKind::Integer) if d.fract().is_zero() => {
                i64::try_from(*d).ok().map(FieldValue::Integer)
            },
            (FieldValue::Decimal(d), FieldKind::Text) => {
                Some(FieldValue::Text(d.normalize().to_string()))
            },
            (FieldValue::Text(s), FieldKind::Integer) => s.trim().parse().ok().map(FieldValue::Integer),
            (FieldValue::Text(s), FieldKind::Decimal) => {
                Decimal::from_str_exact(s.trim()).ok().map(FieldValue::Decimal)
            },
            (FieldValue::Text(s), FieldKind::Timestamp) => parse_timestamp(s).map(FieldValue::Timestamp),
            (FieldValue::Timestamp(ts), FieldKind::Text) => Some(FieldValue::Text(format_timestamp(ts))),
            _ => None,
        }
    }

    /// Ordering across compatible values; numbers compare numerically
    /// regardless of representation. `None` when not comparable.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Null, _) | (_, FieldValue::Null) => None,
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_decimal(), b.as_decimal()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Decimal(d) => write!(f, "{}", d.normalize()),
            FieldValue::Text(s) => write!(f, "{:?}", s),
            FieldValue::Timestamp(ts) => f.write_str(&format_timestamp(ts)),
        }
    }
}

/// Fixed-width RFC 3339 rendering (nanosecond precision, `Z` suffix) so that
/// stored timestamps sort lexically in time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse nanoseconds-since-epoch digits or an RFC 3339 string
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse::<i64>().ok().map(DateTime::from_timestamp_nanos);
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.with_timezone(&Utc))
}

/// Identity under which a record is upserted
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub schema: Schema,
    pub instrument_id: i64,
    pub ts_event: DateTime<Utc>,
    /// Schema-specific tie breaker, empty when the schema has none
    pub discriminator: String,
}

/// Standardized record with the schema's fixed field set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub schema: Schema,
    pub fields: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.set(field, value);
        self
    }

    pub fn symbol(&self) -> Option<&str> {
        self.get(fields::SYMBOL).and_then(FieldValue::as_str)
    }

    /// Natural key; requires validated `ts_event` and `instrument_id`
    pub fn natural_key(&self) -> Result<NaturalKey, StorageError> {
        let ts_event = self
            .get(fields::TS_EVENT)
            .and_then(FieldValue::as_timestamp)
            .ok_or_else(|| StorageError::MissingKey(format!("{} is not a timestamp", fields::TS_EVENT)))?;
        let instrument_id = self
            .get(fields::INSTRUMENT_ID)
            .and_then(|v| match v {
                FieldValue::Integer(i) => Some(*i),
                _ => None,
            })
            .ok_or_else(|| {
                StorageError::MissingKey(format!("{} is not an integer", fields::INSTRUMENT_ID))
            })?;

        let mut parts = Vec::new();
        for name in self.schema.discriminator_fields() {
            let value = self
                .get(name)
                .ok_or_else(|| StorageError::MissingKey(format!("discriminator {} is missing", name)))?;
            parts.push(value.to_json().to_string());
        }

        Ok(NaturalKey {
            schema: self.schema,
            instrument_id,
            ts_event,
            discriminator: parts.join("|"),
        })
    }

    /// All fields as a JSON object
    pub fn fields_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use ChunkStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!CompletedEmpty.can_transition_to(Failed));
        assert!(!InProgress.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ChunkStatus::Pending,
            ChunkStatus::InProgress,
            ChunkStatus::Completed,
            ChunkStatus::CompletedEmpty,
            ChunkStatus::Failed,
            ChunkStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ChunkStatus>(), Ok(status));
        }
        assert!("done".parse::<ChunkStatus>().is_err());
    }

    #[test]
    fn test_raw_record_dotted_path() {
        let raw = RawRecord::from_value(json!({"hd": {"ts_event": "1700000000000000000"}, "open": 1}))
            .unwrap();
        assert_eq!(raw.get_path("hd.ts_event"), Some(&json!("1700000000000000000")));
        assert_eq!(raw.get_path("open"), Some(&json!(1)));
        assert!(raw.get_path("hd.missing").is_none());
        assert!(raw.get_path("open.deeper").is_none());
    }

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(FieldValue::from_json(&json!(42)), FieldValue::Integer(42));
        assert_eq!(
            FieldValue::from_json(&json!(101.25)),
            FieldValue::Decimal(Decimal::new(10125, 2))
        );
        assert_eq!(FieldValue::from_json(&json!("abc")), FieldValue::text("abc"));
        assert_eq!(FieldValue::from_json(&json!(null)), FieldValue::Null);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(
            FieldValue::text("101.5").coerce_to(FieldKind::Decimal),
            Some(FieldValue::Decimal(Decimal::new(1015, 1)))
        );
        assert_eq!(FieldValue::text("17").coerce_to(FieldKind::Integer), Some(FieldValue::Integer(17)));
        assert_eq!(FieldValue::text("abc").coerce_to(FieldKind::Decimal), None);
        assert_eq!(
            FieldValue::Integer(1_700_000_000_000_000_000).coerce_to(FieldKind::Timestamp),
            Some(FieldValue::Timestamp(DateTime::from_timestamp_nanos(1_700_000_000_000_000_000)))
        );
        assert_eq!(
            FieldValue::text("2024-01-02T00:00:00Z").coerce_to(FieldKind::Timestamp),
            Some(FieldValue::Timestamp(
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_time(NaiveTime::MIN).and_utc()
            ))
        );
        assert_eq!(FieldValue::Null.coerce_to(FieldKind::Text), None);
    }

    #[test]
    fn test_numeric_compare_across_representations() {
        let int = FieldValue::Integer(10);
        let dec = FieldValue::Decimal(Decimal::new(100, 1));
        let txt = FieldValue::text("9.5");
        assert_eq!(int.compare(&dec), Some(Ordering::Equal));
        assert_eq!(txt.compare(&int), Some(Ordering::Less));
        assert_eq!(int.compare(&FieldValue::Null), None);
        assert_eq!(FieldValue::text("a").compare(&FieldValue::text("b")), Some(Ordering::Less));
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = format_timestamp(&DateTime::from_timestamp_nanos(1_700_000_000_000_000_000));
        let b = format_timestamp(&DateTime::from_timestamp_nanos(1_700_000_000_123_456_789));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn test_chunk_times() {
        let chunk = Chunk {
            job_id: Uuid::nil(),
            index: 0,
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            status: ChunkStatus::Pending,
        };
        assert_eq!(chunk.days(), 2);
        assert_eq!(chunk.start_time().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(chunk.id().to_string(), format!("{}#0", Uuid::nil()));
    }
}
