//! Provider schemas and their canonical field sets

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::types::FieldKind;
use crate::error::ConfigError;

/// Record schema offered by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Schema {
    #[serde(rename = "ohlcv-1d")]
    Ohlcv1d,
    #[serde(rename = "ohlcv-1h")]
    Ohlcv1h,
    #[serde(rename = "ohlcv-1m")]
    Ohlcv1m,
    #[serde(rename = "trades")]
    Trades,
    #[serde(rename = "statistics")]
    Statistics,
}

/// Declaration of one canonical field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

impl Schema {
    pub const ALL: [Schema; 5] = [
        Schema::Ohlcv1d,
        Schema::Ohlcv1h,
        Schema::Ohlcv1m,
        Schema::Trades,
        Schema::Statistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Ohlcv1d => "ohlcv-1d",
            Schema::Ohlcv1h => "ohlcv-1h",
            Schema::Ohlcv1m => "ohlcv-1m",
            Schema::Trades => "trades",
            Schema::Statistics => "statistics",
        }
    }

    pub fn is_ohlcv(&self) -> bool {
        matches!(self, Schema::Ohlcv1d | Schema::Ohlcv1h | Schema::Ohlcv1m)
    }

    /// Fields that, with instrument and event time, identify a record
    pub fn discriminator_fields(&self) -> &'static [&'static str] {
        match self {
            Schema::Ohlcv1d | Schema::Ohlcv1h | Schema::Ohlcv1m => &[],
            Schema::Trades => &["sequence"],
            Schema::Statistics => &["stat_type"],
        }
    }

    /// Canonical field set
    pub fn fields(&self) -> Vec<FieldSpec> {
        use FieldKind::*;
        let mut fields = vec![
            FieldSpec::required("ts_event", Timestamp),
            FieldSpec::required("instrument_id", Integer),
            FieldSpec::required("symbol", Text),
        ];
        match self {
            Schema::Ohlcv1d | Schema::Ohlcv1h | Schema::Ohlcv1m => fields.extend([
                FieldSpec::required("open", Decimal),
                FieldSpec::required("high", Decimal),
                FieldSpec::required("low", Decimal),
                FieldSpec::required("close", Decimal),
                FieldSpec::required("volume", Integer),
            ]),
            Schema::Trades => fields.extend([
                FieldSpec::required("price", Decimal),
                FieldSpec::required("size", Integer),
                FieldSpec::required("side", Text),
                FieldSpec::required("sequence", Integer),
            ]),
            Schema::Statistics => fields.extend([
                FieldSpec::required("stat_type", Integer),
                FieldSpec::required("value", Decimal),
                FieldSpec::required("value_kind", Text),
                FieldSpec::optional("ts_ref", Timestamp),
            ]),
        }
        fields
    }

    pub fn field(&self, name: &str) -> Option<FieldSpec> {
        self.fields().into_iter().find(|f| f.name == name)
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Schema {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Schema::ALL
            .into_iter()
            .find(|schema| schema.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownSchema(s.to_string()))
    }
}

/// Provider statistic type codes whose value is a quantity rather than a price
pub mod stat_types {
    pub const OPENING_PRICE: i64 = 1;
    pub const SETTLEMENT_PRICE: i64 = 3;
    pub const CLEARED_VOLUME: i64 = 6;
    pub const OPEN_INTEREST: i64 = 9;

    pub const QUANTITY: [i64; 2] = [CLEARED_VOLUME, OPEN_INTEREST];
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema_names() {
        assert_eq!("ohlcv-1d".parse::<Schema>(), Ok(Schema::Ohlcv1d));
        assert_eq!(" Trades ".parse::<Schema>(), Ok(Schema::Trades));
        assert_eq!(
            "mbo".parse::<Schema>(),
            Err(ConfigError::UnknownSchema("mbo".to_string()))
        );
        for schema in Schema::ALL {
            assert_eq!(schema.as_str().parse::<Schema>(), Ok(schema));
        }
    }

    #[test]
    fn test_discriminators() {
        assert!(Schema::Ohlcv1m.discriminator_fields().is_empty());
        assert_eq!(Schema::Trades.discriminator_fields(), &["sequence"]);
        assert_eq!(Schema::Statistics.discriminator_fields(), &["stat_type"]);
    }

    #[test]
    fn test_every_schema_has_key_fields() {
        for schema in Schema::ALL {
            for key in ["ts_event", "instrument_id", "symbol"] {
                assert!(schema.field(key).is_some_and(|f| f.required), "{} lacks {}", schema, key);
            }
            for d in schema.discriminator_fields() {
                assert!(schema.field(d).is_some());
            }
        }
    }

    #[test]
    fn test_serde_uses_provider_names() {
        let json = serde_json::to_string(&Schema::Ohlcv1h).unwrap();
        assert_eq!(json, "\"ohlcv-1h\"");
    }
}
