//! Two-stage validation with repair
//!
//! Stage one checks the canonical record's shape against the rule set's field
//! declarations, coercing a mistyped value once and recording the coercion as
//! a repair. Stage two evaluates the schema's business checks. Neither stage
//! raises for a bad record: every record yields a [`ValidationOutcome`].

use serde::{Deserialize, Serialize};

use super::mappings::rules_for;
use super::rules::RuleSet;
use super::schema::Schema;
use super::transform::{BatchTransform, TransformFailure, Transformed};
use super::types::{CanonicalRecord, FieldKind, FieldValue};
use crate::error::{RuleSetError, ValidationFailure};

/// One applied coercion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repair {
    pub field: String,
    pub from: FieldValue,
    pub to: FieldValue,
}

impl std::fmt::Display for Repair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.from, self.to)
    }
}

/// Stage at which a record was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineKind {
    /// Provider line that is not a JSON object
    Decode,
    Transformation,
    Structural,
    BusinessRule,
}

impl QuarantineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineKind::Decode => "decode",
            QuarantineKind::Transformation => "transformation",
            QuarantineKind::Structural => "structural",
            QuarantineKind::BusinessRule => "business_rule",
        }
    }
}

impl std::fmt::Display for QuarantineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Valid(CanonicalRecord),
    Repaired(CanonicalRecord, Vec<Repair>),
    Quarantined {
        /// Untransformed provider content, kept for review and replay
        original: serde_json::Value,
        kind: QuarantineKind,
        failure: ValidationFailure,
    },
}

impl ValidationOutcome {
    /// Route a record that never made it through transformation
    pub fn from_transform_failure(failure: TransformFailure) -> Self {
        ValidationOutcome::Quarantined {
            original: failure.original,
            kind: failure.kind,
            failure: ValidationFailure {
                rule: failure.error.rule,
                message: failure.error.message,
            },
        }
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self, ValidationOutcome::Quarantined { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    rules: RuleSet,
}

impl Validator {
    pub fn new(rules: RuleSet) -> Result<Self, RuleSetError> {
        rules.validate()?;
        Ok(Self { rules })
    }

    pub fn for_schema(schema: Schema) -> Result<Self, RuleSetError> {
        Self::new(rules_for(schema))
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Validate one transformed record
    pub fn validate(&self, item: Transformed) -> ValidationOutcome {
        let Transformed {
            original,
            mut record,
            mut repairs,
        } = item;

        match self.check_structure(&mut record) {
            Ok(structural) => repairs.extend(structural),
            Err(failure) => {
                return ValidationOutcome::Quarantined {
                    original: original.into_value(),
                    kind: QuarantineKind::Structural,
                    failure,
                };
            },
        }

        if let Some(failure) = self.check_business_rules(&record) {
            return ValidationOutcome::Quarantined {
                original: original.into_value(),
                kind: QuarantineKind::BusinessRule,
                failure,
            };
        }

        if repairs.is_empty() {
            ValidationOutcome::Valid(record)
        } else {
            ValidationOutcome::Repaired(record, repairs)
        }
    }

    /// Validate a transformed batch; outcome `i` belongs to input item `i`,
    /// transformation failures included
    pub fn validate_batch(&self, batch: BatchTransform) -> Vec<ValidationOutcome> {
        batch
            .items
            .into_iter()
            .map(|item| match item {
                Ok(transformed) => self.validate(transformed),
                Err(failure) => ValidationOutcome::from_transform_failure(failure),
            })
            .collect()
    }

    fn check_structure(&self, record: &mut CanonicalRecord) -> Result<Vec<Repair>, ValidationFailure> {
        if record.schema != self.rules.schema {
            return Err(ValidationFailure {
                rule: "schema".to_string(),
                message: format!("record schema {} does not match {}", record.schema, self.rules.schema),
            });
        }

        let mut repairs = Vec::new();
        for spec in &self.rules.fields {
            let Some(current) = record.get(&spec.name).cloned() else {
                if spec.required {
                    return Err(ValidationFailure {
                        rule: format!("required:{}", spec.name),
                        message: format!("required field '{}' is missing", spec.name),
                    });
                }
                continue;
            };

            if current.kind() == Some(spec.kind) {
                continue;
            }

            match current.coerce_to(spec.kind) {
                Some(coerced) => {
                    // integer to decimal widening keeps the numeric representation
                    let widening = matches!(current, FieldValue::Integer(_)) && spec.kind == FieldKind::Decimal;
                    if !widening {
                        repairs.push(Repair {
                            field: spec.name.clone(),
                            from: current,
                            to: coerced.clone(),
                        });
                    }
                    record.set(spec.name.as_str(), coerced);
                },
                None => {
                    return Err(ValidationFailure {
                        rule: format!("type:{}", spec.name),
                        message: format!("{} = {} cannot be read as {}", spec.name, current, spec.kind),
                    });
                },
            }
        }
        Ok(repairs)
    }

    fn check_business_rules(&self, record: &CanonicalRecord) -> Option<ValidationFailure> {
        self.rules
            .checks
            .iter()
            .find(|check| !check.predicate.evaluate(record))
            .map(|check| {
                let values = check
                    .predicate
                    .referenced_fields()
                    .into_iter()
                    .map(|f| {
                        let v = record.get(f).map_or("missing".to_string(), ToString::to_string);
                        format!("{}={}", f, v)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                ValidationFailure {
                    rule: check.name.clone(),
                    message: format!("{} does not hold ({})", check.predicate, values),
                }
            })
    }
}
