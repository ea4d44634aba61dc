//! Formula evaluation. Evaluation never fails: missing identifiers, type
//! mismatches and division by zero all degrade to `Null`.

use audience_core::value::{as_number, as_text, number_value, parse_instant};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;

use super::ast::{BinaryOp, Expr, Function};

/// Identifier lookup used during evaluation. Implementations may resolve
/// identifiers lazily (computed fields) and memoize.
pub trait Scope {
    fn resolve(&mut self, name: &str) -> Value;
}

impl Scope for std::collections::HashMap<String, Value> {
    fn resolve(&mut self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    /// Seconds.
    Duration(f64),
}

impl FormulaValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FormulaValue::Null,
            Value::Bool(b) => FormulaValue::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(FormulaValue::Null, FormulaValue::Number),
            Value::String(s) => FormulaValue::Text(s.clone()),
            other => FormulaValue::Text(other.to_string()),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            FormulaValue::Null => Value::Null,
            FormulaValue::Text(s) => Value::String(s),
            FormulaValue::Number(n) | FormulaValue::Duration(n) => number_value(n),
            FormulaValue::Bool(b) => Value::Bool(b),
            FormulaValue::Date(d) => Value::String(d.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            FormulaValue::Null => false,
            FormulaValue::Text(s) => !s.is_empty(),
            FormulaValue::Number(n) | FormulaValue::Duration(n) => *n != 0.0,
            FormulaValue::Bool(b) => *b,
            FormulaValue::Date(_) => true,
        }
    }

    fn display(&self) -> String {
        match self {
            FormulaValue::Null => String::new(),
            FormulaValue::Text(s) => s.clone(),
            FormulaValue::Number(n) | FormulaValue::Duration(n) => as_text(&number_value(*n)),
            FormulaValue::Bool(b) => b.to_string(),
            FormulaValue::Date(d) => d.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Plain,
    Math,
    Date,
}

pub fn evaluate(expr: &Expr, scope: &mut dyn Scope) -> FormulaValue {
    eval(expr, scope, Mode::Plain)
}

fn eval(expr: &Expr, scope: &mut dyn Scope, mode: Mode) -> FormulaValue {
    match expr {
        Expr::Ident(name) => coerce(FormulaValue::from_json(&scope.resolve(name)), mode),
        Expr::Str(s) => coerce(FormulaValue::Text(s.clone()), mode),
        Expr::Number(n) => FormulaValue::Number(*n),
        Expr::Duration(d) => FormulaValue::Duration(*d),
        Expr::Bool(b) => FormulaValue::Bool(*b),
        Expr::Null => FormulaValue::Null,
        Expr::Negate(inner) => match eval(inner, scope, mode) {
            FormulaValue::Number(n) => FormulaValue::Number(-n),
            FormulaValue::Duration(d) => FormulaValue::Duration(-d),
            _ => FormulaValue::Null,
        },
        Expr::Call { func, args } => call(*func, args, scope, mode),
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, scope, mode);
            let r = eval(rhs, scope, mode);
            if op.is_arithmetic() {
                arithmetic(*op, l, r)
            } else {
                compare(*op, l, r)
            }
        }
    }
}

fn call(func: Function, args: &[Expr], scope: &mut dyn Scope, mode: Mode) -> FormulaValue {
    match func {
        Function::Cat => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&eval(arg, scope, Mode::Plain).display());
            }
            FormulaValue::Text(out)
        }
        Function::If => {
            let [cond, then, otherwise] = args else {
                return FormulaValue::Null;
            };
            // Only the selected branch is evaluated.
            if eval(cond, scope, Mode::Plain).is_truthy() {
                eval(then, scope, mode)
            } else {
                eval(otherwise, scope, mode)
            }
        }
        Function::Math => match args.first().map(|a| eval(a, scope, Mode::Math)) {
            Some(FormulaValue::Number(n)) if n.is_finite() => FormulaValue::Number(n),
            _ => FormulaValue::Null,
        },
        Function::Date => match args.first().map(|a| eval(a, scope, Mode::Date)) {
            Some(v @ FormulaValue::Date(_)) => v,
            Some(FormulaValue::Duration(d)) if d.is_finite() => FormulaValue::Duration(d),
            _ => FormulaValue::Null,
        },
    }
}

fn coerce(value: FormulaValue, mode: Mode) -> FormulaValue {
    match (mode, value) {
        (Mode::Math, FormulaValue::Text(s)) => as_number(&Value::String(s))
            .map_or(FormulaValue::Null, FormulaValue::Number),
        (Mode::Math, FormulaValue::Bool(_)) => FormulaValue::Null,
        (Mode::Date, FormulaValue::Text(s)) => {
            parse_instant(&s).map_or(FormulaValue::Null, FormulaValue::Date)
        }
        (_, value) => value,
    }
}

fn shift(at: DateTime<Utc>, seconds: f64) -> FormulaValue {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return FormulaValue::Null;
    }
    Duration::try_milliseconds(millis as i64)
        .and_then(|d| at.checked_add_signed(d))
        .map_or(FormulaValue::Null, FormulaValue::Date)
}

fn arithmetic(op: BinaryOp, l: FormulaValue, r: FormulaValue) -> FormulaValue {
    use FormulaValue::{Date, Duration as Dur, Number};
    match (op, l, r) {
        (BinaryOp::Div, Number(_), Number(b)) | (BinaryOp::Div, Dur(_), Number(b))
            if b == 0.0 =>
        {
            FormulaValue::Null
        }
        (BinaryOp::Div, Dur(_), Dur(b)) if b == 0.0 => FormulaValue::Null,

        (BinaryOp::Add, Number(a), Number(b)) => Number(a + b),
        (BinaryOp::Sub, Number(a), Number(b)) => Number(a - b),
        (BinaryOp::Mul, Number(a), Number(b)) => Number(a * b),
        (BinaryOp::Div, Number(a), Number(b)) => Number(a / b),

        (BinaryOp::Add, Date(d), Dur(s)) | (BinaryOp::Add, Dur(s), Date(d)) => shift(d, s),
        (BinaryOp::Sub, Date(d), Dur(s)) => shift(d, -s),
        (BinaryOp::Sub, Date(a), Date(b)) => {
            Dur((a - b).num_milliseconds() as f64 / 1000.0)
        }

        (BinaryOp::Add, Dur(a), Dur(b)) => Dur(a + b),
        (BinaryOp::Sub, Dur(a), Dur(b)) => Dur(a - b),
        (BinaryOp::Mul, Dur(a), Number(b)) | (BinaryOp::Mul, Number(b), Dur(a)) => Dur(a * b),
        (BinaryOp::Div, Dur(a), Number(b)) => Dur(a / b),
        (BinaryOp::Div, Dur(a), Dur(b)) => Number(a / b),

        _ => FormulaValue::Null,
    }
}

fn compare(op: BinaryOp, l: FormulaValue, r: FormulaValue) -> FormulaValue {
    use std::cmp::Ordering;
    use FormulaValue as V;

    let ordering: Option<Ordering> = match (&l, &r) {
        (V::Null, _) | (_, V::Null) => return V::Null,
        (V::Number(a), V::Number(b)) | (V::Duration(a), V::Duration(b)) => a.partial_cmp(b),
        (V::Date(a), V::Date(b)) => Some(a.cmp(b)),
        (V::Bool(a), V::Bool(b)) => Some(a.cmp(b)),
        (V::Text(a), V::Text(b)) => Some(a.cmp(b)),
        (V::Number(a), V::Text(b)) => as_number(&Value::String(b.clone())).and_then(|b| a.partial_cmp(&b)),
        (V::Text(a), V::Number(b)) => as_number(&Value::String(a.clone())).and_then(|a| a.partial_cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return match op {
            BinaryOp::NotEq => V::Bool(true),
            BinaryOp::Eq => V::Bool(false),
            _ => V::Null,
        };
    };
    let result = match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::NotEq => ordering != Ordering::Equal,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        _ => return V::Null,
    };
    V::Bool(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parse;
    use serde_json::json;
    use std::collections::HashMap;

    fn run(src: &str, vars: &[(&str, Value)]) -> FormulaValue {
        let mut scope: HashMap<String, Value> =
            vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        evaluate(&parse(src).unwrap(), &mut scope)
    }

    /// Records every identifier it is asked for.
    struct Tracking {
        seen: Vec<String>,
    }

    impl Scope for Tracking {
        fn resolve(&mut self, name: &str) -> Value {
            self.seen.push(name.to_string());
            Value::Null
        }
    }

    #[test]
    fn test_cat() {
        assert_eq!(run(r#"CAT("x", "y")"#, &[]), FormulaValue::Text("xy".into()));
        assert_eq!(
            run(r#"CAT(missingField, "y")"#, &[]),
            FormulaValue::Text("y".into())
        );
        assert_eq!(
            run(r#"CAT(n, "-", flag)"#, &[("n", json!(3.0)), ("flag", json!(true))]),
            FormulaValue::Text("3-true".into())
        );
    }

    #[test]
    fn test_if_only_evaluates_selected_branch() {
        let expr = parse(r#"IF(true, "A", B)"#).unwrap();
        let mut scope = Tracking { seen: vec![] };
        assert_eq!(evaluate(&expr, &mut scope), FormulaValue::Text("A".into()));
        assert!(scope.seen.is_empty());

        let expr = parse(r#"IF(flag, left, right)"#).unwrap();
        let mut scope = Tracking { seen: vec![] };
        evaluate(&expr, &mut scope);
        assert_eq!(scope.seen, vec!["flag".to_string(), "right".to_string()]);
    }

    #[test]
    fn test_if_truthiness() {
        assert_eq!(run(r#"IF(0, "a", "b")"#, &[]), FormulaValue::Text("b".into()));
        assert_eq!(run(r#"IF("", "a", "b")"#, &[]), FormulaValue::Text("b".into()));
        assert_eq!(run(r#"IF("x", "a", "b")"#, &[]), FormulaValue::Text("a".into()));
        assert_eq!(
            run(r#"IF(MATH(spend) > 100, "big", "small")"#, &[("spend", json!("250"))]),
            FormulaValue::Text("big".into())
        );
    }

    #[test]
    fn test_math() {
        assert_eq!(
            run("MATH((a + b) * 2 / 4)", &[("a", json!(3)), ("b", json!("5"))]),
            FormulaValue::Number(4.0)
        );
        assert_eq!(run("MATH(a / 0)", &[("a", json!(3))]), FormulaValue::Null);
        assert_eq!(run("MATH(missing + 1)", &[]), FormulaValue::Null);
        assert_eq!(run("MATH(-a)", &[("a", json!(2))]), FormulaValue::Number(-2.0));
    }

    #[test]
    fn test_date_arithmetic() {
        let v = run("DATE(signup + 7d)", &[("signup", json!("2024-01-01T00:00:00Z"))]);
        assert_eq!(v.into_json(), json!("2024-01-08T00:00:00Z"));

        let v = run(
            "DATE(renewal - signup)",
            &[
                ("signup", json!("2024-01-01")),
                ("renewal", json!("2024-01-03T12:00:00Z")),
            ],
        );
        assert_eq!(v, FormulaValue::Duration(216_000.0));

        assert_eq!(run("DATE(2d * 3)", &[]), FormulaValue::Duration(518_400.0));
        assert_eq!(run("DATE(unknown + 1d)", &[]), FormulaValue::Null);
        assert_eq!(run(r#"DATE("not a date")"#, &[]), FormulaValue::Null);
    }

    #[test]
    fn test_comparisons_with_null() {
        assert_eq!(run("a == 1", &[]), FormulaValue::Null);
        assert_eq!(run(r#"plan == "pro""#, &[("plan", json!("pro"))]), FormulaValue::Bool(true));
        assert_eq!(run(r#"n != "x""#, &[("n", json!(1))]), FormulaValue::Bool(true));
    }
}
