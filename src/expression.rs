use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::{Redaction, Value};

/// User variables visible to `$$name` references.
pub type Variables = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    And,
    Or,
    Not,
    Cond,
    IfNull,
    Concat,
    ToLower,
    ToUpper,
    Size,
    In,
    ArrayElemAt,
    SetIntersection,
}

enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Operator {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$add" => Operator::Add,
            "$subtract" => Operator::Subtract,
            "$multiply" => Operator::Multiply,
            "$divide" => Operator::Divide,
            "$mod" => Operator::Mod,
            "$abs" => Operator::Abs,
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$cmp" => Operator::Cmp,
            "$and" => Operator::And,
            "$or" => Operator::Or,
            "$not" => Operator::Not,
            "$cond" => Operator::Cond,
            "$ifNull" => Operator::IfNull,
            "$concat" => Operator::Concat,
            "$toLower" => Operator::ToLower,
            "$toUpper" => Operator::ToUpper,
            "$size" => Operator::Size,
            "$in" => Operator::In,
            "$arrayElemAt" => Operator::ArrayElemAt,
            "$setIntersection" => Operator::SetIntersection,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Add => "$add",
            Operator::Subtract => "$subtract",
            Operator::Multiply => "$multiply",
            Operator::Divide => "$divide",
            Operator::Mod => "$mod",
            Operator::Abs => "$abs",
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::Cmp => "$cmp",
            Operator::And => "$and",
            Operator::Or => "$or",
            Operator::Not => "$not",
            Operator::Cond => "$cond",
            Operator::IfNull => "$ifNull",
            Operator::Concat => "$concat",
            Operator::ToLower => "$toLower",
            Operator::ToUpper => "$toUpper",
            Operator::Size => "$size",
            Operator::In => "$in",
            Operator::ArrayElemAt => "$arrayElemAt",
            Operator::SetIntersection => "$setIntersection",
        }
    }

    fn arity(self) -> Arity {
        match self {
            Operator::Add
            | Operator::Multiply
            | Operator::And
            | Operator::Or
            | Operator::Concat
            | Operator::SetIntersection => Arity::AtLeast(0),
            Operator::IfNull => Arity::AtLeast(2),
            Operator::Abs | Operator::Not | Operator::ToLower | Operator::ToUpper | Operator::Size => {
                Arity::Exact(1)
            }
            Operator::Cond => Arity::Exact(3),
            _ => Arity::Exact(2),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Value),
    FieldRef(String),
    Variable { name: String, path: Option<String> },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Op { op: Operator, args: Vec<Expression> },
    RegexMatch { input: Box<Expression>, regex: Regex },
}

/// What an expression is evaluated against: `$$ROOT`, `$$CURRENT` (where
/// plain field references resolve) and user variables.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub root: &'a Document,
    pub current: &'a Document,
    pub vars: &'a Variables,
}

impl<'a> Scope<'a> {
    pub fn new(record: &'a Document, vars: &'a Variables) -> Self {
        Self {
            root: record,
            current: record,
            vars,
        }
    }

    pub fn with_current(&self, current: &'a Document) -> Self {
        Self { current, ..*self }
    }

    fn variable(&self, name: &str, path: Option<&str>) -> Result<Value> {
        let base = match name {
            "ROOT" => return Ok(resolve_in_document(self.root, path)),
            "CURRENT" => return Ok(resolve_in_document(self.current, path)),
            "KEEP" => return Ok(Value::Redaction(Redaction::Keep)),
            "PRUNE" => return Ok(Value::Redaction(Redaction::Prune)),
            "DESCEND" => return Ok(Value::Redaction(Redaction::Descend)),
            "REMOVE" => return Ok(Value::Missing),
            user => self
                .vars
                .get(user)
                .ok_or_else(|| Error::InvalidSpec(format!("undefined variable: $${user}")))?,
        };
        Ok(match (base, path) {
            (v, None) => v.clone(),
            (Value::Document(doc), Some(path)) => doc.resolve(path),
            (_, Some(_)) => Value::Missing,
        })
    }
}

fn resolve_in_document(doc: &Document, path: Option<&str>) -> Value {
    match path {
        Some(path) => doc.resolve(path),
        None => Value::Document(doc.clone()),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Expression {
    pub fn parse(json: &JsonValue) -> Result<Self> {
        match json {
            JsonValue::String(s) if s.starts_with("$$") => parse_variable(&s[2..]),
            JsonValue::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() {
                    return Err(Error::InvalidSpec("empty field path '$'".into()));
                }
                Ok(Expression::FieldRef(path.to_string()))
            }
            JsonValue::Array(items) => Ok(Expression::Array(
                items.iter().map(Expression::parse).collect::<Result<_>>()?,
            )),
            JsonValue::Object(map) => {
                let mut entries = map.iter();
                if let (Some((key, arg)), None) = (entries.next(), entries.next()) {
                    if key.starts_with('$') {
                        return parse_operator(key, arg, json);
                    }
                }
                if map.keys().any(|k| k.starts_with('$')) {
                    return Err(Error::InvalidSpec(
                        "an operator expression must be the only key in its object".into(),
                    ));
                }
                let fields = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expression::parse(v)?)))
                    .collect::<Result<_>>()?;
                Ok(Expression::Object(fields))
            }
            other => Ok(Expression::Literal(Value::from_json(other))),
        }
    }

    /// Field path if this expression is a plain `"$path"` reference.
    pub fn as_field_path(&self) -> Option<&str> {
        match self {
            Expression::FieldRef(path) => Some(path),
            _ => None,
        }
    }
}

fn parse_variable(body: &str) -> Result<Expression> {
    let (name, path) = match body.split_once('.') {
        Some((name, path)) => (name, Some(path.to_string())),
        None => (body, None),
    };
    if name.is_empty() {
        return Err(Error::InvalidSpec("empty variable name".into()));
    }
    Ok(Expression::Variable {
        name: name.to_string(),
        path,
    })
}

fn parse_operator(key: &str, arg: &JsonValue, whole: &JsonValue) -> Result<Expression> {
    match key {
        "$literal" => return Ok(Expression::Literal(Value::from_json(arg))),
        "$date" => return Ok(Expression::Literal(Value::from_json(whole))),
        "$regexMatch" => return parse_regex_match(arg),
        _ => {}
    }
    let op = Operator::from_name(key)
        .ok_or_else(|| Error::InvalidSpec(format!("unknown expression operator: {key}")))?;

    let args: Vec<Expression> = match (op, arg) {
        (Operator::Cond, JsonValue::Object(obj)) => ["if", "then", "else"]
            .iter()
            .map(|name| {
                let part = obj.get(*name).ok_or_else(|| {
                    Error::InvalidSpec(format!("$cond requires '{name}'"))
                })?;
                Expression::parse(part)
            })
            .collect::<Result<_>>()?,
        (_, JsonValue::Array(items)) => items.iter().map(Expression::parse).collect::<Result<_>>()?,
        (_, single) => vec![Expression::parse(single)?],
    };

    let ok = match op.arity() {
        Arity::Exact(n) => args.len() == n,
        Arity::AtLeast(n) => args.len() >= n,
    };
    if !ok {
        return Err(Error::InvalidSpec(format!(
            "{} given {} argument(s)",
            op.name(),
            args.len()
        )));
    }
    Ok(Expression::Op { op, args })
}

fn parse_regex_match(arg: &JsonValue) -> Result<Expression> {
    let obj = arg
        .as_object()
        .ok_or_else(|| Error::InvalidSpec("$regexMatch requires an object".into()))?;
    let input = obj
        .get("input")
        .ok_or_else(|| Error::InvalidSpec("$regexMatch requires 'input'".into()))?;
    let pattern = obj
        .get("regex")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidSpec("$regexMatch requires a string 'regex'".into()))?;
    let options = obj.get("options").and_then(|v| v.as_str()).unwrap_or("");
    Ok(Expression::RegexMatch {
        input: Box::new(Expression::parse(input)?),
        regex: build_regex(pattern, options)?,
    })
}

/// Compile a pattern with MongoDB-style option letters (`i`, `m`, `s`, `x`).
pub(crate) fn build_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::InvalidSpec(format!("unsupported regex option '{other}'")));
            }
        };
    }
    builder
        .build()
        .map_err(|e| Error::InvalidSpec(format!("invalid regex: {e}")))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expression {
    /// Evaluate against a single record with no user variables.
    pub fn evaluate(&self, record: &Document) -> Result<Value> {
        let vars = Variables::new();
        self.evaluate_in(&Scope::new(record, &vars))
    }

    pub fn evaluate_in(&self, scope: &Scope<'_>) -> Result<Value> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::FieldRef(path) => Ok(scope.current.resolve(path)),
            Expression::Variable { name, path } => scope.variable(name, path.as_deref()),
            Expression::Object(fields) => {
                let mut doc = Document::new();
                for (name, expr) in fields {
                    doc.insert(name.clone(), expr.evaluate_in(scope)?);
                }
                Ok(Value::Document(doc))
            }
            Expression::Array(items) => items
                .iter()
                .map(|e| e.evaluate_in(scope).map(null_if_missing))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expression::Op { op, args } => eval_op(*op, args, scope),
            Expression::RegexMatch { input, regex } => match input.evaluate_in(scope)? {
                Value::String(s) => Ok(Value::Bool(regex.is_match(&s))),
                v if v.is_nullish() => Ok(Value::Bool(false)),
                other => Err(mismatch("$regexMatch", "a string", &other)),
            },
        }
    }
}

fn null_if_missing(v: Value) -> Value {
    if v.is_missing() { Value::Null } else { v }
}

fn mismatch(op: &str, expected: &str, got: &Value) -> Error {
    Error::TypeMismatch(format!(
        "{op} expected {expected}, found {}",
        got.type_name()
    ))
}

fn eval_op(op: Operator, args: &[Expression], scope: &Scope<'_>) -> Result<Value> {
    // Short-circuiting operators evaluate their arguments lazily.
    match op {
        Operator::And => {
            for arg in args {
                if !arg.evaluate_in(scope)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            return Ok(Value::Bool(true));
        }
        Operator::Or => {
            for arg in args {
                if arg.evaluate_in(scope)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            return Ok(Value::Bool(false));
        }
        Operator::Cond => {
            let branch = if args[0].evaluate_in(scope)?.is_truthy() { &args[1] } else { &args[2] };
            return branch.evaluate_in(scope);
        }
        Operator::IfNull => {
            let (last, candidates) = args
                .split_last()
                .ok_or_else(|| Error::InvalidSpec("$ifNull without arguments".into()))?;
            for arg in candidates {
                let v = arg.evaluate_in(scope)?;
                if !v.is_nullish() {
                    return Ok(v);
                }
            }
            return last.evaluate_in(scope);
        }
        _ => {}
    }

    let values = args
        .iter()
        .map(|a| a.evaluate_in(scope))
        .collect::<Result<Vec<_>>>()?;

    match op {
        Operator::Add => eval_add(values),
        Operator::Subtract => eval_subtract(&values[0], &values[1]),
        Operator::Multiply => {
            let mut product = Value::Int(1);
            for v in &values {
                if v.is_nullish() {
                    return Ok(Value::Null);
                }
                product = product
                    .checked_mul(v)
                    .ok_or_else(|| mismatch("$multiply", "numbers", v))?;
            }
            Ok(product)
        }
        Operator::Divide => {
            let (a, b) = (&values[0], &values[1]);
            if a.is_nullish() || b.is_nullish() {
                return Ok(Value::Null);
            }
            let x = a.as_f64().ok_or_else(|| mismatch("$divide", "numbers", a))?;
            let y = b.as_f64().ok_or_else(|| mismatch("$divide", "numbers", b))?;
            Ok(if y == 0.0 { Value::Null } else { Value::Double(x / y) })
        }
        Operator::Mod => {
            let (a, b) = (&values[0], &values[1]);
            match (a, b) {
                _ if a.is_nullish() || b.is_nullish() => Ok(Value::Null),
                (Value::Int(x), Value::Int(y)) => Ok(x.checked_rem(*y).map(Value::Int).unwrap_or(Value::Null)),
                _ => {
                    let x = a.as_f64().ok_or_else(|| mismatch("$mod", "numbers", a))?;
                    let y = b.as_f64().ok_or_else(|| mismatch("$mod", "numbers", b))?;
                    Ok(if y == 0.0 { Value::Null } else { Value::Double(x % y) })
                }
            }
        }
        Operator::Abs => match &values[0] {
            v if v.is_nullish() => Ok(Value::Null),
            Value::Int(i) => Ok(i
                .checked_abs()
                .map(Value::Int)
                .unwrap_or(Value::Double((*i as f64).abs()))),
            Value::Double(d) => Ok(Value::Double(d.abs())),
            other => Err(mismatch("$abs", "a number", other)),
        },
        Operator::Eq => Ok(Value::Bool(values[0] == values[1])),
        Operator::Ne => Ok(Value::Bool(values[0] != values[1])),
        Operator::Gt => Ok(Value::Bool(values[0] > values[1])),
        Operator::Gte => Ok(Value::Bool(values[0] >= values[1])),
        Operator::Lt => Ok(Value::Bool(values[0] < values[1])),
        Operator::Lte => Ok(Value::Bool(values[0] <= values[1])),
        Operator::Cmp => Ok(Value::Int(values[0].cmp(&values[1]) as i64)),
        Operator::Not => Ok(Value::Bool(!values[0].is_truthy())),
        Operator::Concat => {
            let mut out = String::new();
            for v in &values {
                match v {
                    Value::String(s) => out.push_str(s),
                    v if v.is_nullish() => return Ok(Value::Null),
                    other => return Err(mismatch("$concat", "strings", other)),
                }
            }
            Ok(Value::String(out))
        }
        Operator::ToLower | Operator::ToUpper => {
            let text = match &values[0] {
                Value::String(s) => s.clone(),
                v if v.is_nullish() => String::new(),
                v @ (Value::Int(_) | Value::Double(_)) => v.to_string(),
                other => return Err(mismatch(op.name(), "a string", other)),
            };
            Ok(Value::String(if op == Operator::ToLower {
                text.to_lowercase()
            } else {
                text.to_uppercase()
            }))
        }
        Operator::Size => match &values[0] {
            Value::Array(items) => Ok(Value::Int(items.len() as i64)),
            other => Err(mismatch("$size", "an array", other)),
        },
        Operator::In => match &values[1] {
            Value::Array(items) => Ok(Value::Bool(items.contains(&values[0]))),
            other => Err(mismatch("$in", "an array as second argument", other)),
        },
        Operator::ArrayElemAt => {
            let items = match &values[0] {
                v if v.is_nullish() => return Ok(Value::Null),
                Value::Array(items) => items,
                other => return Err(mismatch("$arrayElemAt", "an array", other)),
            };
            let idx = values[1]
                .as_i64()
                .ok_or_else(|| mismatch("$arrayElemAt", "an integral index", &values[1]))?;
            let pos = if idx < 0 { items.len() as i64 + idx } else { idx };
            Ok(usize::try_from(pos)
                .ok()
                .and_then(|p| items.get(p))
                .cloned()
                .unwrap_or(Value::Missing))
        }
        Operator::SetIntersection => {
            let mut sets = Vec::with_capacity(values.len());
            for v in &values {
                match v {
                    Value::Array(items) => sets.push(items),
                    v if v.is_nullish() => return Ok(Value::Null),
                    other => return Err(mismatch("$setIntersection", "arrays", other)),
                }
            }
            let Some((first, rest)) = sets.split_first() else {
                return Ok(Value::Array(Vec::new()));
            };
            let mut out: Vec<Value> = Vec::new();
            for item in first.iter() {
                if !out.contains(item) && rest.iter().all(|set| set.contains(item)) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        Operator::And | Operator::Or | Operator::Cond | Operator::IfNull => {
            unreachable!("short-circuit operators are handled above")
        }
    }
}

fn eval_add(values: Vec<Value>) -> Result<Value> {
    let mut sum = Value::Int(0);
    let mut date = None;
    for v in values {
        match v {
            v if v.is_nullish() => return Ok(Value::Null),
            Value::Date(dt) => {
                if date.replace(dt).is_some() {
                    return Err(Error::TypeMismatch("$add accepts at most one date".into()));
                }
            }
            v => {
                sum = sum
                    .checked_add(&v)
                    .ok_or_else(|| mismatch("$add", "numbers or a date", &v))?;
            }
        }
    }
    match date {
        Some(dt) => shift_date("$add", dt, sum.as_f64().unwrap_or(0.0)).map(Value::Date),
        None => Ok(sum),
    }
}

/// Move `dt` by `millis` milliseconds, rounded to the nearest one.
fn shift_date(op: &str, dt: DateTime<Utc>, millis: f64) -> Result<DateTime<Utc>> {
    let out_of_range = || Error::OutOfRange(format!("{op}: date offset of {millis}ms is out of range"));
    let millis = millis.round();
    // 2^63: the first f64 that no longer fits an i64.
    if !millis.is_finite() || millis.abs() >= 9_223_372_036_854_775_808.0 {
        return Err(out_of_range());
    }
    let delta = TimeDelta::try_milliseconds(millis as i64).ok_or_else(out_of_range)?;
    dt.checked_add_signed(delta).ok_or_else(out_of_range)
}

fn eval_subtract(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        _ if a.is_nullish() || b.is_nullish() => Ok(Value::Null),
        (Value::Date(x), Value::Date(y)) => Ok(Value::Int((*x - *y).num_milliseconds())),
        (Value::Date(x), n) if n.is_number() => {
            shift_date("$subtract", *x, -n.as_f64().unwrap_or(0.0)).map(Value::Date)
        }
        _ => a.checked_sub(b).ok_or_else(|| {
            let bad = if a.is_number() { b } else { a };
            mismatch("$subtract", "numbers or dates", bad)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: JsonValue) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn eval(expr: JsonValue, record: JsonValue) -> Result<Value> {
        Expression::parse(&expr)?.evaluate(&doc(record))
    }

    #[test]
    fn expr_field_ref() {
        let v = eval(json!("$name"), json!({"name": "Alice", "age": 30})).unwrap();
        assert_eq!(v, Value::from("Alice"));
    }

    #[test]
    fn expr_nested_dot_notation() {
        let v = eval(json!("$user.address.city"), json!({"user": {"address": {"city": "NYC"}}}));
        assert_eq!(v.unwrap(), Value::from("NYC"));
    }

    #[test]
    fn expr_missing_field_is_missing_not_null() {
        let v = eval(json!("$missing"), json!({"name": "Alice"})).unwrap();
        assert!(v.is_missing());
    }

    #[test]
    fn expr_add_ints_stays_int() {
        let v = eval(json!({"$add": ["$a", "$b", 5]}), json!({"a": 10, "b": 20})).unwrap();
        assert!(matches!(v, Value::Int(35)));
    }

    #[test]
    fn expr_add_with_missing_is_null() {
        let v = eval(json!({"$add": ["$a", "$missing"]}), json!({"a": 10})).unwrap();
        assert!(matches!(v, Value::Null));
    }

    #[test]
    fn expr_add_string_is_type_mismatch() {
        let err = eval(json!({"$add": ["$a", "$s"]}), json!({"a": 1, "s": "x"})).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn expr_subtract_multiply_divide() {
        let record = json!({"a": 50, "b": 20});
        assert_eq!(eval(json!({"$subtract": ["$a", "$b"]}), record.clone()).unwrap(), Value::Int(30));
        assert_eq!(eval(json!({"$multiply": ["$a", 2]}), record.clone()).unwrap(), Value::Int(100));
        assert_eq!(eval(json!({"$divide": ["$a", 4]}), record).unwrap(), Value::Double(12.5));
    }

    #[test]
    fn expr_divide_by_zero_is_null() {
        let v = eval(json!({"$divide": ["$a", 0]}), json!({"a": 1})).unwrap();
        assert!(matches!(v, Value::Null));
    }

    #[test]
    fn expr_mod_and_abs() {
        assert_eq!(eval(json!({"$mod": [10, 3]}), json!({})).unwrap(), Value::Int(1));
        assert_eq!(eval(json!({"$abs": -4}), json!({})).unwrap(), Value::Int(4));
    }

    #[test]
    fn expr_date_arithmetic() {
        let record = json!({
            "start": {"$date": "2024-01-01T00:00:00Z"},
            "end": {"$date": "2024-01-02T00:00:00Z"}
        });
        let diff = eval(json!({"$subtract": ["$end", "$start"]}), record.clone()).unwrap();
        assert_eq!(diff, Value::Int(86_400_000));

        let later = eval(json!({"$add": ["$start", 86_400_000]}), record.clone()).unwrap();
        let end = doc(record).get("end").cloned().unwrap();
        assert_eq!(later, end);
    }

    #[test]
    fn expr_date_offset_overflow_is_out_of_range() {
        let record = json!({"at": {"$date": "2024-01-01T00:00:00Z"}});
        for expr in [
            json!({"$add": ["$at", 1e18]}),
            json!({"$add": ["$at", 1e300]}),
            json!({"$subtract": ["$at", -9.0e18]}),
            json!({"$subtract": ["$at", i64::MIN]}),
        ] {
            let err = eval(expr.clone(), record.clone()).unwrap_err();
            assert!(matches!(err, Error::OutOfRange(_)), "{expr} gave {err:?}");
        }
    }

    #[test]
    fn expr_comparisons_use_total_order() {
        let record = json!({"n": 5, "s": "5"});
        assert_eq!(eval(json!({"$gt": ["$s", "$n"]}), record.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval(json!({"$eq": ["$n", 5.0]}), record.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval(json!({"$cmp": ["$n", 7]}), record).unwrap(), Value::Int(-1));
    }

    #[test]
    fn expr_cond_both_forms() {
        let record = json!({"qty": 300});
        let obj_form = json!({"$cond": {"if": {"$gte": ["$qty", 250]}, "then": 30, "else": 20}});
        let arr_form = json!({"$cond": [{"$lt": ["$qty", 250]}, 30, 20]});
        assert_eq!(eval(obj_form, record.clone()).unwrap(), Value::Int(30));
        assert_eq!(eval(arr_form, record).unwrap(), Value::Int(20));
    }

    #[test]
    fn expr_cond_missing_branch_is_invalid() {
        let err = Expression::parse(&json!({"$cond": {"if": true, "then": 1}})).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn expr_if_null() {
        let v = eval(json!({"$ifNull": ["$desc", "Unspecified"]}), json!({})).unwrap();
        assert_eq!(v, Value::from("Unspecified"));
    }

    #[test]
    fn expr_boolean_ops() {
        let record = json!({"a": 1, "b": 0});
        assert_eq!(eval(json!({"$and": ["$a", "$b"]}), record.clone()).unwrap(), Value::Bool(false));
        assert_eq!(eval(json!({"$or": ["$a", "$b"]}), record.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval(json!({"$not": ["$b"]}), record).unwrap(), Value::Bool(true));
    }

    #[test]
    fn expr_strings() {
        let record = json!({"first": "Ada", "last": "Lovelace"});
        let v = eval(json!({"$concat": ["$first", " ", "$last"]}), record.clone()).unwrap();
        assert_eq!(v, Value::from("Ada Lovelace"));
        assert_eq!(eval(json!({"$toUpper": "$first"}), record.clone()).unwrap(), Value::from("ADA"));
        assert!(matches!(
            eval(json!({"$concat": ["$first", "$nope"]}), record).unwrap(),
            Value::Null
        ));
    }

    #[test]
    fn expr_regex_match() {
        let expr = json!({"$regexMatch": {"input": "$name", "regex": "^ad", "options": "i"}});
        assert_eq!(eval(expr.clone(), json!({"name": "Ada"})).unwrap(), Value::Bool(true));
        assert_eq!(eval(expr, json!({"name": "Bob"})).unwrap(), Value::Bool(false));
    }

    #[test]
    fn expr_arrays() {
        let record = json!({"tags": ["a", "b", "c"], "access": ["b", "c", "z"]});
        assert_eq!(eval(json!({"$size": "$tags"}), record.clone()).unwrap(), Value::Int(3));
        assert_eq!(eval(json!({"$in": ["b", "$tags"]}), record.clone()).unwrap(), Value::Bool(true));
        assert_eq!(
            eval(json!({"$arrayElemAt": ["$tags", -1]}), record.clone()).unwrap(),
            Value::from("c")
        );
        assert!(eval(json!({"$arrayElemAt": ["$tags", 9]}), record.clone()).unwrap().is_missing());
        assert_eq!(
            eval(json!({"$setIntersection": ["$tags", "$access"]}), record).unwrap(),
            Value::from_json(&json!(["b", "c"]))
        );
    }

    #[test]
    fn expr_size_of_non_array_fails() {
        let err = eval(json!({"$size": "$n"}), json!({"n": 3})).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn expr_object_drops_missing_fields() {
        let v = eval(json!({"a": "$a", "b": "$nope"}), json!({"a": 1})).unwrap();
        assert_eq!(v.to_json(), json!({"a": 1}));
    }

    #[test]
    fn expr_root_and_user_variables() {
        let record = doc(json!({"x": {"y": 2}}));
        let mut vars = Variables::new();
        vars.insert("limit".into(), Value::Int(10));
        let scope = Scope::new(&record, &vars);
        let root = Expression::parse(&json!("$$ROOT.x.y")).unwrap();
        assert_eq!(root.evaluate_in(&scope).unwrap(), Value::Int(2));
        let user = Expression::parse(&json!({"$add": ["$$limit", "$x.y"]})).unwrap();
        assert_eq!(user.evaluate_in(&scope).unwrap(), Value::Int(12));
    }

    #[test]
    fn expr_undefined_variable() {
        let err = eval(json!("$$nope"), json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn expr_literal_escapes_dollar() {
        let v = eval(json!({"$literal": "$notAField"}), json!({})).unwrap();
        assert_eq!(v, Value::from("$notAField"));
    }

    #[test]
    fn parse_rejects_unknown_operator_and_bad_arity() {
        assert!(matches!(
            Expression::parse(&json!({"$frobnicate": 1})),
            Err(Error::InvalidSpec(_))
        ));
        assert!(matches!(
            Expression::parse(&json!({"$subtract": [1]})),
            Err(Error::InvalidSpec(_))
        ));
    }
}
