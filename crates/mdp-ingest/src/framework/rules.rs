//! Declarative mapping and validation rules
//!
//! Rules are plain data: a closed set of variants that an interpreter walks.
//! There is no expression language; a predicate is a tree of comparisons over
//! named fields. The same [`Predicate`] type selects conditional mappings (over
//! raw provider records) and expresses checks (over canonical records).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use super::schema::{FieldSpec, Schema};
use super::types::{CanonicalRecord, FieldValue, RawRecord};
use crate::error::RuleSetError;

/// Field access shared by raw and canonical records
pub trait FieldLookup {
    fn lookup(&self, path: &str) -> Option<FieldValue>;
}

impl FieldLookup for RawRecord {
    fn lookup(&self, path: &str) -> Option<FieldValue> {
        self.get_path(path).map(FieldValue::from_json).filter(|v| !v.is_null())
    }
}

impl FieldLookup for CanonicalRecord {
    fn lookup(&self, path: &str) -> Option<FieldValue> {
        self.get(path).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Field(String),
    Value(FieldValue),
}

impl Operand {
    fn resolve<R: FieldLookup + ?Sized>(&self, record: &R) -> Option<FieldValue> {
        match self {
            Operand::Field(path) => record.lookup(path),
            Operand::Value(v) => Some(v.clone()),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Field(path) => f.write_str(path),
            Operand::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Pure boolean predicate over a record's fields.
///
/// A comparison against a missing or incomparable field is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Present(String),
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    In {
        field: String,
        values: Vec<FieldValue>,
    },
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn present(field: &str) -> Self {
        Predicate::Present(field.to_string())
    }

    /// `field op other_field`
    pub fn fields(left: &str, op: CmpOp, right: &str) -> Self {
        Predicate::Compare {
            left: Operand::Field(left.to_string()),
            op,
            right: Operand::Field(right.to_string()),
        }
    }

    /// `field op value`
    pub fn value(field: &str, op: CmpOp, value: FieldValue) -> Self {
        Predicate::Compare {
            left: Operand::Field(field.to_string()),
            op,
            right: Operand::Value(value),
        }
    }

    pub fn one_of(field: &str, values: Vec<FieldValue>) -> Self {
        Predicate::In {
            field: field.to_string(),
            values,
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn evaluate<R: FieldLookup + ?Sized>(&self, record: &R) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Present(path) => record.lookup(path).is_some(),
            Predicate::Compare { left, op, right } => {
                match (left.resolve(record), right.resolve(record)) {
                    (Some(l), Some(r)) => l.compare(&r).is_some_and(|o| op.holds(o)),
                    _ => false,
                }
            },
            Predicate::In { field, values } => record.lookup(field).is_some_and(|v| {
                values
                    .iter()
                    .any(|candidate| v.compare(candidate) == Some(Ordering::Equal))
            }),
            Predicate::Not(inner) => !inner.evaluate(record),
            Predicate::All(parts) => parts.iter().all(|p| p.evaluate(record)),
            Predicate::Any(parts) => parts.iter().any(|p| p.evaluate(record)),
        }
    }

    /// Every field path this predicate reads
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Always => {},
            Predicate::Present(path) => out.push(path),
            Predicate::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Field(path) = operand {
                        out.push(path);
                    }
                }
            },
            Predicate::In { field, .. } => out.push(field),
            Predicate::Not(inner) => inner.collect_fields(out),
            Predicate::All(parts) | Predicate::Any(parts) => {
                for p in parts {
                    p.collect_fields(out);
                }
            },
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join = |parts: &[Predicate], sep: &str| {
            parts
                .iter()
                .map(|p| format!("({})", p))
                .collect::<Vec<_>>()
                .join(sep)
        };
        match self {
            Predicate::Always => f.write_str("true"),
            Predicate::Present(path) => write!(f, "present({})", path),
            Predicate::Compare { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Predicate::In { field, values } => {
                let list = values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                write!(f, "{} in [{}]", field, list)
            },
            Predicate::Not(inner) => write!(f, "not ({})", inner),
            Predicate::All(parts) => f.write_str(&join(parts, " and ")),
            Predicate::Any(parts) => f.write_str(&join(parts, " or ")),
        }
    }
}

/// Named predicate that must hold for a record to be accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub predicate: Predicate,
}

impl Check {
    pub fn new(name: &str, predicate: Predicate) -> Self {
        Self {
            name: name.to_string(),
            predicate,
        }
    }
}

/// How a derived field is computed from the raw record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    /// Integer price in units of `10^-scale`; decimal text and floats are
    /// taken as already-scaled prices
    FixedPointPrice { source: Vec<String>, scale: u32 },
    /// Integer or digit-string nanoseconds since the Unix epoch, or RFC 3339
    NanosToTimestamp { source: Vec<String> },
    Constant(FieldValue),
}

/// One mapping step. Rules run in order; later rules see earlier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Copy the first present source path into `to`
    Rename { from: Vec<String>, to: String },
    /// Set `field` when no earlier rule produced it
    Default { field: String, value: FieldValue },
    /// Choose a rule list by a predicate over the raw record
    Conditional {
        name: String,
        when: Predicate,
        then: Vec<Rule>,
        otherwise: Vec<Rule>,
    },
    Derive { field: String, derivation: Derivation },
    /// Fill `symbol` from the job's symbol resolution when the record has none
    ResolveSymbol { instrument_field: String },
}

impl Rule {
    pub fn rename(from: &[&str], to: &str) -> Self {
        Rule::Rename {
            from: from.iter().map(|s| s.to_string()).collect(),
            to: to.to_string(),
        }
    }

    pub fn default_value(field: &str, value: FieldValue) -> Self {
        Rule::Default {
            field: field.to_string(),
            value,
        }
    }

    pub fn derive(field: &str, derivation: Derivation) -> Self {
        Rule::Derive {
            field: field.to_string(),
            derivation,
        }
    }

    /// Name used in error reports
    pub fn name(&self) -> String {
        match self {
            Rule::Rename { to, .. } => format!("rename:{}", to),
            Rule::Default { field, .. } => format!("default:{}", field),
            Rule::Conditional { name, .. } => name.clone(),
            Rule::Derive { field, .. } => format!("derive:{}", field),
            Rule::ResolveSymbol { .. } => "resolve_symbol".to_string(),
        }
    }

    /// Canonical fields this rule may write
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Rule::Rename { to, .. } => vec![to.as_str()],
            Rule::Default { field, .. } | Rule::Derive { field, .. } => vec![field.as_str()],
            Rule::Conditional { then, otherwise, .. } => {
                then.iter().chain(otherwise).flat_map(Rule::targets).collect()
            },
            Rule::ResolveSymbol { .. } => vec!["symbol"],
        }
    }
}

/// Transformation specification for one schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSpec {
    pub schema: Schema,
    pub rules: Vec<Rule>,
    /// Fields that must be produced or the record fails transformation
    pub required: Vec<String>,
    /// Post-mapping checks; a failure is a transformation error
    pub checks: Vec<Check>,
}

impl MappingSpec {
    pub fn validate(&self) -> Result<(), RuleSetError> {
        let fields: HashSet<String> = self.schema.fields().into_iter().map(|f| f.name).collect();
        let err = |rule: &str, message: String| RuleSetError {
            schema: self.schema.to_string(),
            rule: rule.to_string(),
            message,
        };

        if self.rules.is_empty() {
            return Err(err("mapping", "no rules declared".to_string()));
        }
        for rule in &self.rules {
            validate_rule(rule, &fields, &err)?;
        }
        let produced: HashSet<&str> = self.rules.iter().flat_map(Rule::targets).collect();
        for required in &self.required {
            if !produced.contains(required.as_str()) {
                return Err(err(
                    "required",
                    format!("required field '{}' is not produced by any rule", required),
                ));
            }
        }
        validate_checks(&self.checks, &fields, &err)
    }
}

fn validate_rule(
    rule: &Rule,
    fields: &HashSet<String>,
    err: &dyn Fn(&str, String) -> RuleSetError,
) -> Result<(), RuleSetError> {
    match rule {
        Rule::Rename { from, .. } if from.is_empty() => {
            return Err(err(&rule.name(), "no source paths".to_string()));
        },
        Rule::Derive {
            derivation: Derivation::FixedPointPrice { source, scale },
            ..
        } => {
            if source.is_empty() {
                return Err(err(&rule.name(), "no source paths".to_string()));
            }
            if *scale > 28 {
                return Err(err(&rule.name(), format!("scale {} exceeds 28", scale)));
            }
        },
        Rule::Derive {
            derivation: Derivation::NanosToTimestamp { source },
            ..
        } if source.is_empty() => {
            return Err(err(&rule.name(), "no source paths".to_string()));
        },
        Rule::Conditional { name, then, otherwise, .. } => {
            if name.trim().is_empty() {
                return Err(err("conditional", "conditional rule needs a name".to_string()));
            }
            for inner in then.iter().chain(otherwise) {
                validate_rule(inner, fields, err)?;
            }
        },
        _ => {},
    }
    for target in rule.targets() {
        if !fields.contains(target) {
            return Err(err(&rule.name(), format!("'{}' is not a canonical field", target)));
        }
    }
    Ok(())
}

fn validate_checks(
    checks: &[Check],
    fields: &HashSet<String>,
    err: &dyn Fn(&str, String) -> RuleSetError,
) -> Result<(), RuleSetError> {
    let mut names = HashSet::new();
    for check in checks {
        if !names.insert(check.name.as_str()) {
            return Err(err(&check.name, "duplicate check name".to_string()));
        }
        for field in check.predicate.referenced_fields() {
            if !fields.contains(field) {
                return Err(err(&check.name, format!("references unknown field '{}'", field)));
            }
        }
    }
    Ok(())
}

/// Validation rule set for one schema: field declarations plus business checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub schema: Schema,
    pub fields: Vec<FieldSpec>,
    pub checks: Vec<Check>,
}

impl RuleSet {
    pub fn validate(&self) -> Result<(), RuleSetError> {
        let err = |rule: &str, message: String| RuleSetError {
            schema: self.schema.to_string(),
            rule: rule.to_string(),
            message,
        };
        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.clone()) {
                return Err(err(&field.name, "field declared twice".to_string()));
            }
        }
        for key in ["ts_event", "instrument_id"]
            .into_iter()
            .chain(self.schema.discriminator_fields().iter().copied())
        {
            if !self.fields.iter().any(|f| f.name == key && f.required) {
                return Err(err(key, "natural key field must be declared required".to_string()));
            }
        }
        validate_checks(&self.checks, &names, &err)
    }
}

/// Shorthand for decimal literals in rule definitions
pub(crate) fn dec(value: i64) -> FieldValue {
    FieldValue::Decimal(Decimal::from(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    #[test]
    fn test_compare_over_raw_paths() {
        let record = raw(json!({"hd": {"rtype": 35}, "stat_type": 6, "price": "10.5"}));
        assert!(Predicate::value("stat_type", CmpOp::Eq, FieldValue::Integer(6)).evaluate(&record));
        assert!(Predicate::value("hd.rtype", CmpOp::Ge, FieldValue::Integer(30)).evaluate(&record));
        assert!(Predicate::value("price", CmpOp::Gt, dec(10)).evaluate(&record));
        assert!(!Predicate::value("missing", CmpOp::Ne, dec(0)).evaluate(&record));
    }

    #[test]
    fn test_in_not_all_any() {
        let record = raw(json!({"side": "B", "size": 0}));
        let side = Predicate::one_of("side", vec![FieldValue::text("A"), FieldValue::text("B")]);
        let size = Predicate::value("size", CmpOp::Gt, FieldValue::Integer(0));
        assert!(side.evaluate(&record));
        assert!(!size.evaluate(&record));
        assert!(size.clone().negate().evaluate(&record));
        assert!(!Predicate::All(vec![side.clone(), size.clone()]).evaluate(&record));
        assert!(Predicate::Any(vec![side, size]).evaluate(&record));
    }

    #[test]
    fn test_predicate_display() {
        let p = Predicate::All(vec![
            Predicate::fields("high", CmpOp::Ge, "low"),
            Predicate::present("close"),
        ]);
        assert_eq!(p.to_string(), "(high >= low) and (present(close))");
    }

    #[test]
    fn test_mapping_spec_rejects_unknown_target() {
        let spec = MappingSpec {
            schema: Schema::Trades,
            rules: vec![Rule::rename(&["px"], "pxx")],
            required: vec![],
            checks: vec![],
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err.rule, "rename:pxx");
    }

    #[test]
    fn test_mapping_spec_rejects_unproduced_required() {
        let spec = MappingSpec {
            schema: Schema::Trades,
            rules: vec![Rule::rename(&["price"], "price")],
            required: vec!["size".to_string()],
            checks: vec![],
        };
        assert_eq!(spec.validate().unwrap_err().rule, "required");
    }

    #[test]
    fn test_rule_set_requires_key_fields() {
        let rule_set = RuleSet {
            schema: Schema::Trades,
            fields: Schema::Ohlcv1d.fields(),
            checks: vec![],
        };
        assert_eq!(rule_set.validate().unwrap_err().rule, "sequence");
    }

    #[test]
    fn test_rule_set_rejects_unknown_check_field() {
        let rule_set = RuleSet {
            schema: Schema::Ohlcv1d,
            fields: Schema::Ohlcv1d.fields(),
            checks: vec![Check::new("vwap_positive", Predicate::value("vwap", CmpOp::Gt, dec(0)))],
        };
        assert_eq!(rule_set.validate().unwrap_err().rule, "vwap_positive");
    }
}
