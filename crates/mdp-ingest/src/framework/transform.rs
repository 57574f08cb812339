//! Transformation rule engine
//!
//! Interprets a [`MappingSpec`] to turn raw provider records into canonical
//! records. The engine is immutable after construction and is shared by all
//! chunk pipelines of a job.

use chrono::DateTime;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;

use super::extractor::Extracted;
use super::mappings::mapping_for;
use super::rules::{Derivation, FieldLookup, MappingSpec, Rule};
use super::types::{fields, parse_timestamp, CanonicalRecord, FieldValue, RawRecord};
use super::validation::{QuarantineKind, Repair};
use crate::config::JobConfig;
use crate::error::{RuleSetError, TransformationError};

const CONTEXT_LIMIT: usize = 240;

/// Attributes instrument ids to symbols for records that carry no symbol.
///
/// The explicit map wins; a single-symbol job attributes everything to its
/// symbol; anything else is unresolved.
#[derive(Debug, Clone, Default)]
pub struct SymbolResolver {
    map: BTreeMap<i64, String>,
    single: Option<String>,
}

impl SymbolResolver {
    pub fn new(map: BTreeMap<i64, String>, single: Option<String>) -> Self {
        Self { map, single }
    }

    pub fn from_job(config: &JobConfig) -> Self {
        let symbols = config.sorted_symbols();
        let single = match symbols.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        };
        Self::new(config.symbol_map.clone(), single)
    }

    pub fn resolve(&self, instrument_id: Option<i64>) -> Option<&str> {
        instrument_id
            .and_then(|id| self.map.get(&id))
            .or(self.single.as_ref())
            .map(String::as_str)
    }
}

/// A successfully transformed record and the raw record it came from
#[derive(Debug, Clone)]
pub struct Transformed {
    pub original: RawRecord,
    pub record: CanonicalRecord,
    /// Coercions applied while deriving fields
    pub repairs: Vec<Repair>,
}

impl Transformed {
    pub fn new(original: RawRecord, record: CanonicalRecord) -> Self {
        Self {
            original,
            record,
            repairs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformFailure {
    /// Provider content as received: the record object, or the raw line
    pub original: Value,
    pub kind: QuarantineKind,
    pub error: TransformationError,
}

/// Result of transforming a batch, one item per input in input order
#[derive(Debug, Default)]
pub struct BatchTransform {
    pub items: Vec<Result<Transformed, TransformFailure>>,
}

impl BatchTransform {
    pub fn attempted(&self) -> usize {
        self.items.len()
    }

    pub fn transformed_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_err()).count()
    }

    pub fn transformed(&self) -> impl Iterator<Item = &Transformed> {
        self.items.iter().filter_map(|item| item.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TransformFailure> {
        self.items.iter().filter_map(|item| item.as_ref().err())
    }
}

#[derive(Debug, Clone)]
pub struct TransformEngine {
    spec: MappingSpec,
    resolver: SymbolResolver,
}

impl TransformEngine {
    /// Build an engine; the specification is checked once here
    pub fn new(spec: MappingSpec, resolver: SymbolResolver) -> Result<Self, RuleSetError> {
        spec.validate()?;
        Ok(Self { spec, resolver })
    }

    /// Engine with the built-in mapping of the job's schema
    pub fn for_job(config: &JobConfig) -> Result<Self, RuleSetError> {
        Self::new(mapping_for(config.schema), SymbolResolver::from_job(config))
    }

    pub fn spec(&self) -> &MappingSpec {
        &self.spec
    }

    /// Map one raw record, failing when a required field cannot be produced
    pub fn transform(&self, raw: &RawRecord) -> Result<CanonicalRecord, TransformationError> {
        self.transform_with_repairs(raw).map(|(record, _)| record)
    }

    /// Like [`TransformEngine::transform`], also returning the coercions made
    /// while deriving fields
    pub fn transform_with_repairs(
        &self,
        raw: &RawRecord,
    ) -> Result<(CanonicalRecord, Vec<Repair>), TransformationError> {
        let mut out = CanonicalRecord::new(self.spec.schema);
        let mut repairs = Vec::new();
        self.apply(&self.spec.rules, raw, &mut out, &mut repairs)?;

        for field in &self.spec.required {
            if out.get(field).is_none() {
                return Err(self.error(
                    raw,
                    &self.producer_of(field),
                    format!("required field '{}' could not be produced", field),
                ));
            }
        }

        for check in &self.spec.checks {
            if !check.predicate.evaluate(&out) {
                return Err(self.error(raw, &check.name, format!("check failed: {}", check.predicate)));
            }
        }

        Ok((out, repairs))
    }

    /// Map a batch; one record's failure never affects another record.
    ///
    /// Undecodable items fail with rule `decode` and keep their raw line.
    pub fn transform_batch<I>(&self, items: I) -> BatchTransform
    where
        I: IntoIterator,
        I::Item: Into<Extracted>,
    {
        let items = items
            .into_iter()
            .map(|item| match item.into() {
                Extracted::Record(original) => match self.transform_with_repairs(&original) {
                    Ok((record, repairs)) => Ok(Transformed {
                        original,
                        record,
                        repairs,
                    }),
                    Err(error) => Err(TransformFailure {
                        original: original.into_value(),
                        kind: QuarantineKind::Transformation,
                        error,
                    }),
                },
                Extracted::Undecodable { line, reason } => Err(TransformFailure {
                    error: TransformationError {
                        rule: "decode".to_string(),
                        message: reason,
                        context: excerpt(&line, CONTEXT_LIMIT),
                    },
                    original: Value::String(line),
                    kind: QuarantineKind::Decode,
                }),
            })
            .collect();
        BatchTransform { items }
    }

    fn apply(
        &self,
        rules: &[Rule],
        raw: &RawRecord,
        out: &mut CanonicalRecord,
        repairs: &mut Vec<Repair>,
    ) -> Result<(), TransformationError> {
        for rule in rules {
            match rule {
                Rule::Rename { from, to } => {
                    if let Some(value) = from.iter().find_map(|path| raw.lookup(path)) {
                        out.set(to.as_str(), value);
                    }
                },
                Rule::Default { field, value } => {
                    if out.get(field).is_none() {
                        out.set(field.as_str(), value.clone());
                    }
                },
                Rule::Conditional {
                    when, then, otherwise, ..
                } => {
                    let branch = if when.evaluate(raw) { then } else { otherwise };
                    self.apply(branch, raw, out, repairs)?;
                },
                Rule::Derive { field, derivation } => match derive(derivation, raw) {
                    Ok(Some(Derived { value, coerced_from })) => {
                        if let Some(from) = coerced_from {
                            repairs.push(Repair {
                                field: field.clone(),
                                from,
                                to: value.clone(),
                            });
                        }
                        out.set(field.as_str(), value);
                    },
                    Ok(None) => {},
                    Err(message) => return Err(self.error(raw, &rule.name(), message)),
                },
                Rule::ResolveSymbol { instrument_field } => {
                    if out.symbol().is_none() {
                        let instrument_id = out.get(instrument_field).and_then(FieldValue::as_i64);
                        match self.resolver.resolve(instrument_id) {
                            Some(symbol) => out.set(fields::SYMBOL, FieldValue::text(symbol)),
                            None => {
                                let id = instrument_id.map_or("none".to_string(), |id| id.to_string());
                                return Err(self.error(
                                    raw,
                                    &rule.name(),
                                    format!("cannot attribute instrument_id {} to a job symbol", id),
                                ));
                            },
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn producer_of(&self, field: &str) -> String {
        fn find(rules: &[Rule], field: &str) -> Option<String> {
            rules.iter().find_map(|rule| match rule {
                Rule::Conditional { then, otherwise, .. } => {
                    find(then, field).or_else(|| find(otherwise, field)).map(|_| rule.name())
                },
                _ if rule.targets().contains(&field) => Some(rule.name()),
                _ => None,
            })
        }
        find(&self.spec.rules, field).unwrap_or_else(|| format!("required:{}", field))
    }

    fn error(&self, raw: &RawRecord, rule: &str, message: String) -> TransformationError {
        TransformationError {
            rule: rule.to_string(),
            message,
            context: raw.excerpt(CONTEXT_LIMIT),
        }
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

/// Value produced by a derivation; `coerced_from` is set when the source had
/// to be reinterpreted to get there
struct Derived {
    value: FieldValue,
    coerced_from: Option<FieldValue>,
}

impl Derived {
    fn exact(value: FieldValue) -> Self {
        Self {
            value,
            coerced_from: None,
        }
    }

    fn coerced(value: FieldValue, source: &Value) -> Self {
        Self {
            value,
            coerced_from: Some(FieldValue::from_json(source)),
        }
    }
}

fn first_present<'a>(raw: &'a RawRecord, paths: &'a [String]) -> Option<(&'a str, &'a Value)> {
    paths
        .iter()
        .find_map(|p| raw.get_path(p).filter(|v| !v.is_null()).map(|v| (p.as_str(), v)))
}

fn derive(derivation: &Derivation, raw: &RawRecord) -> Result<Option<Derived>, String> {
    match derivation {
        Derivation::Constant(value) => Ok(Some(Derived::exact(value.clone()))),
        Derivation::FixedPointPrice { source, scale } => {
            let Some((path, value)) = first_present(raw, source) else {
                return Ok(None);
            };
            let price = match value {
                Value::Number(n) => match n.as_i64() {
                    Some(units) => fixed_point(units, *scale).map(|d| d.map(Derived::exact)),
                    None => decimal_text(&n.to_string()).map(|d| Some(Derived::coerced(d, value))),
                },
                // digits only: fixed-point units sent as text; otherwise a decimal price
                Value::String(s) => match s.trim().parse::<i64>() {
                    Ok(units) => fixed_point(units, *scale).map(|d| d.map(|d| Derived::coerced(d, value))),
                    Err(_) => decimal_text(s.trim()).map(|d| Some(Derived::coerced(d, value))),
                },
                other => return Err(format!("{} is not a price: {}", path, other)),
            };
            price.map_err(|e| format!("{} is not a price: {}", path, e))
        },
        Derivation::NanosToTimestamp { source } => {
            let Some((path, value)) = first_present(raw, source) else {
                return Ok(None);
            };
            let parsed = match value {
                Value::Number(n) => n.as_i64().map(DateTime::from_timestamp_nanos),
                Value::String(s) => parse_timestamp(s),
                _ => None,
            };
            parsed
                .map(|ts| Some(Derived::exact(FieldValue::Timestamp(ts))))
                .ok_or_else(|| format!("{} is not a timestamp: {}", path, value))
        },
    }
}

/// Scale integer units; `i64::MAX` marks an undefined price
fn fixed_point(units: i64, scale: u32) -> Result<Option<FieldValue>, String> {
    if units == i64::MAX {
        return Ok(None);
    }
    Decimal::try_new(units, scale)
        .map(|d| Some(FieldValue::Decimal(d)))
        .map_err(|e| e.to_string())
}

fn decimal_text(text: &str) -> Result<FieldValue, String> {
    Decimal::from_str_exact(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map(FieldValue::Decimal)
        .map_err(|_| format!("{:?}", text))
}
