//! Constraint evaluation: typed operator dispatch against a single
//! candidate value.

use audience_core::value::{as_bool, as_instant, as_number, as_text, is_absent};
use audience_core::{AudienceError, AudienceResult, DataType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wire::ConstraintSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Is,
    IsNot,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    Between,
    Before,
    After,
    IsSet,
    IsNotSet,
}

impl Operator {
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name.trim() {
            "is" => Operator::Is,
            "is_not" => Operator::IsNot,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "greater_than" => Operator::GreaterThan,
            "less_than" => Operator::LessThan,
            "between" => Operator::Between,
            "before" => Operator::Before,
            "after" => Operator::After,
            "is_set" => Operator::IsSet,
            "is_not_set" => Operator::IsNotSet,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Is => "is",
            Operator::IsNot => "is_not",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::Between => "between",
            Operator::Before => "before",
            Operator::After => "after",
            Operator::IsSet => "is_set",
            Operator::IsNotSet => "is_not_set",
        }
    }
}

/// Operators each data type accepts.
pub fn legal_operators(data_type: DataType) -> &'static [Operator] {
    use Operator::*;
    match data_type {
        DataType::String => &[
            Is,
            IsNot,
            Contains,
            NotContains,
            StartsWith,
            EndsWith,
            IsSet,
            IsNotSet,
        ],
        DataType::Number | DataType::Duration => {
            &[Is, IsNot, GreaterThan, LessThan, Between, IsSet, IsNotSet]
        }
        DataType::Boolean => &[Is, IsNot],
        DataType::Date => &[Before, After, Between, IsSet, IsNotSet],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Is,
    IsNot,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumberTest {
    Is(Vec<f64>),
    IsNot(Vec<f64>),
    GreaterThan(f64),
    LessThan(f64),
    Between(f64, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateTest {
    Before(DateTime<Utc>),
    After(DateTime<Utc>),
    Between(DateTime<Utc>, DateTime<Utc>),
}

/// A constraint's operator and operands, already tagged by data type.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintTest {
    IsSet,
    IsNotSet,
    /// Needles are stored lower-cased; matching is case-insensitive.
    Text { op: TextOp, needles: Vec<String> },
    Number(NumberTest),
    Boolean { expected: bool, negate: bool },
    Date(DateTest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub field: String,
    pub data_type: DataType,
    pub operator: Operator,
    pub test: ConstraintTest,
}

impl Constraint {
    /// Validate a wire constraint into its typed form. Illegal operators,
    /// wrong arity and uncoercible operands are all validation errors.
    pub fn compile(spec: &ConstraintSpec) -> AudienceResult<Self> {
        let data_type: DataType = spec.data_type.parse()?;
        let operator = Operator::parse(&spec.operator).ok_or_else(|| {
            AudienceError::validation(format!("unknown operator '{}'", spec.operator))
        })?;
        if !legal_operators(data_type).contains(&operator) {
            return Err(AudienceError::validation(format!(
                "operator '{}' is not valid for {} field '{}'",
                operator.as_str(),
                data_type,
                spec.field
            )));
        }

        let test = match operator {
            Operator::IsSet => ConstraintTest::IsSet,
            Operator::IsNotSet => ConstraintTest::IsNotSet,
            _ => match data_type {
                DataType::String => compile_text(spec, operator)?,
                DataType::Number | DataType::Duration => compile_number(spec, operator)?,
                DataType::Boolean => compile_boolean(spec, operator)?,
                DataType::Date => compile_date(spec, operator)?,
            },
        };

        Ok(Self {
            field: spec.field.clone(),
            data_type,
            operator,
            test,
        })
    }

    /// Test one candidate value. `None` means the field is missing.
    pub fn matches(&self, candidate: Option<&serde_json::Value>) -> bool {
        let value = match (&self.test, candidate) {
            (ConstraintTest::IsSet, _) => return !is_absent(candidate),
            (ConstraintTest::IsNotSet, _) => return is_absent(candidate),
            (_, Some(value)) if !is_absent(candidate) => value,
            _ => return self.matches_absent(),
        };

        match &self.test {
            ConstraintTest::Text { op, needles } => {
                let hay = as_text(value).to_lowercase();
                let hit = |n: &String| match op {
                    TextOp::Is | TextOp::IsNot => hay == *n,
                    TextOp::Contains | TextOp::NotContains => hay.contains(n.as_str()),
                    TextOp::StartsWith => hay.starts_with(n.as_str()),
                    TextOp::EndsWith => hay.ends_with(n.as_str()),
                };
                let any = needles.iter().any(hit);
                match op {
                    TextOp::IsNot | TextOp::NotContains => !any,
                    _ => any,
                }
            }
            ConstraintTest::Number(test) => {
                let Some(n) = as_number(value) else {
                    return matches!(test, NumberTest::IsNot(_));
                };
                match test {
                    NumberTest::Is(values) => values.iter().any(|v| *v == n),
                    NumberTest::IsNot(values) => values.iter().all(|v| *v != n),
                    NumberTest::GreaterThan(v) => n > *v,
                    NumberTest::LessThan(v) => n < *v,
                    NumberTest::Between(lo, hi) => n >= *lo && n <= *hi,
                }
            }
            ConstraintTest::Boolean { expected, negate } => match as_bool(value) {
                Some(b) => (b == *expected) != *negate,
                None => *negate,
            },
            ConstraintTest::Date(test) => {
                let Some(at) = as_instant(value) else {
                    return false;
                };
                match test {
                    DateTest::Before(v) => at < *v,
                    DateTest::After(v) => at > *v,
                    DateTest::Between(lo, hi) => at >= *lo && at <= *hi,
                }
            }
            ConstraintTest::IsSet => true,
            ConstraintTest::IsNotSet => false,
        }
    }

    /// Negated operators hold for a missing value; everything else fails.
    fn matches_absent(&self) -> bool {
        match &self.test {
            ConstraintTest::Text { op, .. } => matches!(op, TextOp::IsNot | TextOp::NotContains),
            ConstraintTest::Number(NumberTest::IsNot(_)) => true,
            ConstraintTest::Boolean { negate, .. } => *negate,
            _ => false,
        }
    }
}

/// AND-combine constraints against a lookup function.
pub fn all_match<'a, F>(constraints: &[Constraint], mut lookup: F) -> bool
where
    F: FnMut(&str) -> Option<&'a serde_json::Value>,
{
    constraints.iter().all(|c| c.matches(lookup(&c.field)))
}

fn check_arity(spec: &ConstraintSpec, operator: Operator, expected: Arity) -> AudienceResult<()> {
    let n = spec.values.len();
    let ok = match expected {
        Arity::Exactly(k) => n == k,
        Arity::AtLeastOne => n >= 1,
    };
    if ok {
        return Ok(());
    }
    let wanted = match expected {
        Arity::Exactly(k) => format!("exactly {k}"),
        Arity::AtLeastOne => "at least one".to_string(),
    };
    Err(AudienceError::validation(format!(
        "operator '{}' on field '{}' requires {wanted} value(s), got {n}",
        operator.as_str(),
        spec.field
    )))
}

#[derive(Clone, Copy)]
enum Arity {
    Exactly(usize),
    AtLeastOne,
}

fn compile_text(spec: &ConstraintSpec, operator: Operator) -> AudienceResult<ConstraintTest> {
    check_arity(spec, operator, Arity::AtLeastOne)?;
    let op = match operator {
        Operator::Is => TextOp::Is,
        Operator::IsNot => TextOp::IsNot,
        Operator::Contains => TextOp::Contains,
        Operator::NotContains => TextOp::NotContains,
        Operator::StartsWith => TextOp::StartsWith,
        Operator::EndsWith => TextOp::EndsWith,
        other => return Err(illegal(other, DataType::String)),
    };
    let needles = spec
        .values
        .iter()
        .map(|v| as_text(v).to_lowercase())
        .collect();
    Ok(ConstraintTest::Text { op, needles })
}

fn compile_number(spec: &ConstraintSpec, operator: Operator) -> AudienceResult<ConstraintTest> {
    let numbers = || -> AudienceResult<Vec<f64>> {
        spec.values
            .iter()
            .map(|v| {
                as_number(v).ok_or_else(|| {
                    AudienceError::validation(format!(
                        "value {v} for field '{}' is not a number",
                        spec.field
                    ))
                })
            })
            .collect()
    };
    let test = match operator {
        Operator::Is | Operator::IsNot => {
            check_arity(spec, operator, Arity::AtLeastOne)?;
            if operator == Operator::Is {
                NumberTest::Is(numbers()?)
            } else {
                NumberTest::IsNot(numbers()?)
            }
        }
        Operator::GreaterThan | Operator::LessThan => {
            check_arity(spec, operator, Arity::Exactly(1))?;
            let v = numbers()?[0];
            if operator == Operator::GreaterThan {
                NumberTest::GreaterThan(v)
            } else {
                NumberTest::LessThan(v)
            }
        }
        Operator::Between => {
            check_arity(spec, operator, Arity::Exactly(2))?;
            let v = numbers()?;
            if v[0] > v[1] {
                return Err(AudienceError::validation(format!(
                    "between bounds for '{}' are inverted",
                    spec.field
                )));
            }
            NumberTest::Between(v[0], v[1])
        }
        other => return Err(illegal(other, DataType::Number)),
    };
    Ok(ConstraintTest::Number(test))
}

fn compile_boolean(spec: &ConstraintSpec, operator: Operator) -> AudienceResult<ConstraintTest> {
    check_arity(spec, operator, Arity::Exactly(1))?;
    let expected = as_bool(&spec.values[0]).ok_or_else(|| {
        AudienceError::validation(format!(
            "value {} for field '{}' is not a boolean",
            spec.values[0], spec.field
        ))
    })?;
    Ok(ConstraintTest::Boolean {
        expected,
        negate: operator == Operator::IsNot,
    })
}

fn compile_date(spec: &ConstraintSpec, operator: Operator) -> AudienceResult<ConstraintTest> {
    let instants = || -> AudienceResult<Vec<DateTime<Utc>>> {
        spec.values
            .iter()
            .map(|v| {
                as_instant(v).ok_or_else(|| {
                    AudienceError::validation(format!(
                        "value {v} for field '{}' is not a date",
                        spec.field
                    ))
                })
            })
            .collect()
    };
    let test = match operator {
        Operator::Before | Operator::After => {
            check_arity(spec, operator, Arity::Exactly(1))?;
            let at = instants()?[0];
            if operator == Operator::Before {
                DateTest::Before(at)
            } else {
                DateTest::After(at)
            }
        }
        Operator::Between => {
            check_arity(spec, operator, Arity::Exactly(2))?;
            let v = instants()?;
            if v[0] > v[1] {
                return Err(AudienceError::validation(format!(
                    "between bounds for '{}' are inverted",
                    spec.field
                )));
            }
            DateTest::Between(v[0], v[1])
        }
        other => return Err(illegal(other, DataType::Date)),
    };
    Ok(ConstraintTest::Date(test))
}

fn illegal(operator: Operator, data_type: DataType) -> AudienceError {
    AudienceError::validation(format!(
        "operator '{}' is not valid for {data_type}",
        operator.as_str()
    ))
}
