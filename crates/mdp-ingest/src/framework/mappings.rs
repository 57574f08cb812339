//! Built-in mapping specifications and validation rule sets
//!
//! Raw records follow the provider's JSON encoding: a record header under `hd`
//! (event time as nanosecond digits, instrument id), prices either as 1e-9
//! fixed-point integers or as decimal strings, and an optional `symbol` when
//! symbology mapping was requested upstream. Flat records without `hd` are
//! accepted as well.

use super::rules::{dec, Check, CmpOp, Derivation, MappingSpec, Predicate, Rule, RuleSet};
use super::schema::{stat_types, Schema};
use super::types::FieldValue;

/// Provider fixed-point price scale (1e-9)
pub const PRICE_SCALE: u32 = 9;

fn header_rules() -> Vec<Rule> {
    vec![
        Rule::derive(
            "ts_event",
            Derivation::NanosToTimestamp {
                source: vec!["hd.ts_event".to_string(), "ts_event".to_string()],
            },
        ),
        Rule::rename(&["hd.instrument_id", "instrument_id"], "instrument_id"),
        Rule::rename(&["symbol", "raw_symbol"], "symbol"),
        Rule::ResolveSymbol {
            instrument_field: "instrument_id".to_string(),
        },
    ]
}

fn price(field: &str, sources: &[&str]) -> Rule {
    Rule::derive(
        field,
        Derivation::FixedPointPrice {
            source: sources.iter().map(|s| s.to_string()).collect(),
            scale: PRICE_SCALE,
        },
    )
}

fn header_checks() -> Vec<Check> {
    vec![Check::new(
        "instrument_id_positive",
        Predicate::value("instrument_id", CmpOp::Gt, FieldValue::Integer(0)),
    )]
}

/// Transformation specification for `schema`
pub fn mapping_for(schema: Schema) -> MappingSpec {
    let mut rules = header_rules();
    let required: &[&str] = match schema {
        Schema::Ohlcv1d | Schema::Ohlcv1h | Schema::Ohlcv1m => {
            rules.extend([
                price("open", &["open"]),
                price("high", &["high"]),
                price("low", &["low"]),
                price("close", &["close"]),
                Rule::rename(&["volume"], "volume"),
            ]);
            &["ts_event", "instrument_id", "symbol", "open", "high", "low", "close", "volume"]
        },
        Schema::Trades => {
            rules.extend([
                price("price", &["price"]),
                Rule::rename(&["size"], "size"),
                Rule::rename(&["side"], "side"),
                Rule::default_value("side", FieldValue::text("N")),
                Rule::rename(&["sequence"], "sequence"),
            ]);
            &["ts_event", "instrument_id", "symbol", "price", "size", "side", "sequence"]
        },
        Schema::Statistics => {
            rules.extend([
                Rule::rename(&["stat_type"], "stat_type"),
                Rule::Conditional {
                    name: "stat_value".to_string(),
                    when: Predicate::one_of(
                        "stat_type",
                        stat_types::QUANTITY.iter().map(|t| FieldValue::Integer(*t)).collect(),
                    ),
                    then: vec![
                        Rule::rename(&["quantity"], "value"),
                        Rule::default_value("value_kind", FieldValue::text("quantity")),
                    ],
                    otherwise: vec![
                        price("value", &["price"]),
                        Rule::default_value("value_kind", FieldValue::text("price")),
                    ],
                },
                Rule::derive(
                    "ts_ref",
                    Derivation::NanosToTimestamp {
                        source: vec!["ts_ref".to_string()],
                    },
                ),
            ]);
            &["ts_event", "instrument_id", "symbol", "stat_type", "value", "value_kind"]
        },
    };

    MappingSpec {
        schema,
        rules,
        required: required.iter().map(|s| s.to_string()).collect(),
        checks: header_checks(),
    }
}

/// Validation rule set for `schema`
pub fn rules_for(schema: Schema) -> RuleSet {
    let checks = match schema {
        Schema::Ohlcv1d | Schema::Ohlcv1h | Schema::Ohlcv1m => vec![
            Check::new("high_ge_low", Predicate::fields("high", CmpOp::Ge, "low")),
            Check::new("high_ge_open", Predicate::fields("high", CmpOp::Ge, "open")),
            Check::new("high_ge_close", Predicate::fields("high", CmpOp::Ge, "close")),
            Check::new("low_le_open", Predicate::fields("low", CmpOp::Le, "open")),
            Check::new("low_le_close", Predicate::fields("low", CmpOp::Le, "close")),
            Check::new(
                "volume_non_negative",
                Predicate::value("volume", CmpOp::Ge, FieldValue::Integer(0)),
            ),
        ],
        Schema::Trades => vec![
            Check::new(
                "size_non_negative",
                Predicate::value("size", CmpOp::Ge, FieldValue::Integer(0)),
            ),
            Check::new(
                "side_known",
                Predicate::one_of(
                    "side",
                    vec![FieldValue::text("A"), FieldValue::text("B"), FieldValue::text("N")],
                ),
            ),
            Check::new(
                "sequence_non_negative",
                Predicate::value("sequence", CmpOp::Ge, FieldValue::Integer(0)),
            ),
        ],
        Schema::Statistics => vec![
            Check::new(
                "stat_type_positive",
                Predicate::value("stat_type", CmpOp::Gt, FieldValue::Integer(0)),
            ),
            Check::new(
                "value_kind_known",
                Predicate::one_of(
                    "value_kind",
                    vec![FieldValue::text("price"), FieldValue::text("quantity")],
                ),
            ),
            Check::new(
                "quantity_non_negative",
                Predicate::Any(vec![
                    Predicate::value("value_kind", CmpOp::Eq, FieldValue::text("quantity")).negate(),
                    Predicate::value("value", CmpOp::Ge, dec(0)),
                ]),
            ),
        ],
    };

    RuleSet {
        schema,
        fields: schema.fields(),
        checks,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_specs_are_consistent() {
        for schema in Schema::ALL {
            mapping_for(schema).validate().unwrap();
            rules_for(schema).validate().unwrap();
        }
    }

    #[test]
    fn test_every_required_field_is_required_by_mapping() {
        for schema in Schema::ALL {
            let mapping = mapping_for(schema);
            for field in schema.fields().into_iter().filter(|f| f.required) {
                assert!(
                    mapping.required.contains(&field.name),
                    "{} mapping does not require {}",
                    schema,
                    field.name
                );
            }
        }
    }
}
