use regex::Regex;
use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::{Expression, Scope, Variables, build_regex};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Filter AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    ElemMatch(Box<Filter>),
    Not(Vec<FieldOp>),
}

/// A `$match` predicate, also used as the key-match argument of
/// [`CollectionStore::find`](crate::store::CollectionStore::find).
#[derive(Debug, Clone)]
pub enum Filter {
    Field { path: String, op: FieldOp },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Expr(Expression),
    All, // match everything
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Filter
// ---------------------------------------------------------------------------

impl Filter {
    pub fn parse(query: &JsonValue) -> Result<Self> {
        let obj = query
            .as_object()
            .ok_or_else(|| Error::InvalidSpec("filter must be a JSON object".into()))?;

        let mut conditions: Vec<Filter> = Vec::new();

        for (key, value) in obj {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let arr = value
                        .as_array()
                        .filter(|a| !a.is_empty())
                        .ok_or_else(|| {
                            Error::InvalidSpec(format!("{key} must be a non-empty array"))
                        })?;
                    let subs = arr.iter().map(Filter::parse).collect::<Result<Vec<_>>>()?;
                    conditions.push(match key.as_str() {
                        "$and" => Filter::And(subs),
                        "$or" => Filter::Or(subs),
                        _ => Filter::Nor(subs),
                    });
                }
                "$expr" => conditions.push(Filter::Expr(Expression::parse(value)?)),
                op if op.starts_with('$') => {
                    return Err(Error::InvalidSpec(format!(
                        "unknown top-level operator: {op}"
                    )));
                }
                field => {
                    for op in parse_field_ops(value)? {
                        conditions.push(Filter::Field {
                            path: field.to_string(),
                            op,
                        });
                    }
                }
            }
        }

        match conditions.len() {
            0 => Ok(Filter::All),
            1 => Ok(conditions.remove(0)),
            _ => Ok(Filter::And(conditions)),
        }
    }

    /// Equality on a single field path.
    pub fn field_eq(path: impl Into<String>, value: Value) -> Self {
        Filter::Field {
            path: path.into(),
            op: FieldOp::Eq(value),
        }
    }

    /// Membership of a field path in a set of values.
    pub fn field_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::Field {
            path: path.into(),
            op: FieldOp::In(values),
        }
    }
}

/// Operators applied to one field. A plain value (or an object without
/// `$` keys) is shorthand for `$eq`.
fn parse_field_ops(value: &JsonValue) -> Result<Vec<FieldOp>> {
    let Some(ops) = value.as_object() else {
        return Ok(vec![FieldOp::Eq(Value::from_json(value))]);
    };
    if !ops.keys().any(|k| k.starts_with('$')) || ops.contains_key("$date") {
        return Ok(vec![FieldOp::Eq(Value::from_json(value))]);
    }
    let options = ops.get("$options").and_then(|v| v.as_str()).unwrap_or("");
    let mut parsed = Vec::with_capacity(ops.len());
    for (op_key, op_val) in ops {
        if op_key == "$options" {
            continue;
        }
        parsed.push(parse_op(op_key, op_val, options)?);
    }
    Ok(parsed)
}

fn value_list(op_key: &str, op_val: &JsonValue) -> Result<Vec<Value>> {
    let arr = op_val
        .as_array()
        .ok_or_else(|| Error::InvalidSpec(format!("{op_key} must be an array")))?;
    Ok(arr.iter().map(Value::from_json).collect())
}

fn parse_op(op_key: &str, op_val: &JsonValue, options: &str) -> Result<FieldOp> {
    match op_key {
        "$eq" => Ok(FieldOp::Eq(Value::from_json(op_val))),
        "$ne" => Ok(FieldOp::Ne(Value::from_json(op_val))),
        "$gt" => Ok(FieldOp::Gt(Value::from_json(op_val))),
        "$gte" => Ok(FieldOp::Gte(Value::from_json(op_val))),
        "$lt" => Ok(FieldOp::Lt(Value::from_json(op_val))),
        "$lte" => Ok(FieldOp::Lte(Value::from_json(op_val))),
        "$in" => Ok(FieldOp::In(value_list(op_key, op_val)?)),
        "$nin" => Ok(FieldOp::Nin(value_list(op_key, op_val)?)),
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidSpec("$exists must be a boolean".into()))?;
            Ok(FieldOp::Exists(b))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidSpec("$regex must be a string".into()))?;
            Ok(FieldOp::Regex(build_regex(pattern, options)?))
        }
        "$size" => {
            let n = op_val
                .as_u64()
                .ok_or_else(|| Error::InvalidSpec("$size must be a non-negative integer".into()))?;
            Ok(FieldOp::Size(n as usize))
        }
        "$elemMatch" => Ok(FieldOp::ElemMatch(Box::new(Filter::parse(op_val)?))),
        "$not" => {
            if !op_val.is_object() {
                return Err(Error::InvalidSpec("$not must be an operator object".into()));
            }
            Ok(FieldOp::Not(parse_field_ops(op_val)?))
        }
        _ => Err(Error::InvalidSpec(format!("unknown operator: {op_key}"))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Filter {
    pub fn matches(&self, doc: &Document) -> Result<bool> {
        let vars = Variables::new();
        self.matches_in(&Scope::new(doc, &vars))
    }

    /// Evaluate against a record. Only `$expr`, possibly nested under
    /// `$elemMatch`, can fail.
    pub fn matches_in(&self, scope: &Scope<'_>) -> Result<bool> {
        match self {
            Filter::All => Ok(true),
            Filter::Field { path, op } => {
                let val = scope.current.resolve(path);
                field_matches((!val.is_missing()).then_some(&val), op, scope)
            }
            Filter::And(subs) => {
                for s in subs {
                    if !s.matches_in(scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(subs) => {
                for s in subs {
                    if s.matches_in(scope)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Nor(subs) => {
                for s in subs {
                    if s.matches_in(scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Expr(expr) => Ok(expr.evaluate_in(scope)?.is_truthy()),
        }
    }
}

/// Range operators only compare values of the same type bracket.
fn comparable(a: &Value, b: &Value) -> bool {
    a.type_rank() == b.type_rank()
}

/// The value itself plus, for arrays, each element.
fn any_candidate(val: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    if pred(val) {
        return true;
    }
    match val {
        Value::Array(items) => items.iter().any(pred),
        _ => false,
    }
}

/// `$elemMatch` evaluates its sub-filter with each array element as
/// `$$CURRENT`, keeping the enclosing root and variables.
fn field_matches(field_val: Option<&Value>, op: &FieldOp, scope: &Scope<'_>) -> Result<bool> {
    match op {
        FieldOp::Exists(expected) => Ok(field_val.is_some() == *expected),
        FieldOp::Ne(v) => Ok(!field_matches(field_val, &FieldOp::Eq(v.clone()), scope)?),
        FieldOp::Nin(vals) => Ok(!field_matches(field_val, &FieldOp::In(vals.clone()), scope)?),
        FieldOp::Not(ops) => {
            for op in ops {
                if !field_matches(field_val, op, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => {
            let Some(val) = field_val else {
                // `{f: null}` and `{f: {$in: [null]}}` also match absent fields.
                return Ok(match op {
                    FieldOp::Eq(v) => v.is_nullish(),
                    FieldOp::In(vals) => vals.iter().any(Value::is_nullish),
                    _ => false,
                });
            };
            let matched = match op {
                FieldOp::Eq(v) => any_candidate(val, |c| c == v),
                FieldOp::Gt(v) => any_candidate(val, |c| comparable(c, v) && c > v),
                FieldOp::Gte(v) => any_candidate(val, |c| comparable(c, v) && c >= v),
                FieldOp::Lt(v) => any_candidate(val, |c| comparable(c, v) && c < v),
                FieldOp::Lte(v) => any_candidate(val, |c| comparable(c, v) && c <= v),
                FieldOp::In(vals) => any_candidate(val, |c| vals.contains(c)),
                FieldOp::Regex(re) => {
                    any_candidate(val, |c| c.as_str().is_some_and(|s| re.is_match(s)))
                }
                FieldOp::Size(n) => val.as_array().is_some_and(|items| items.len() == *n),
                FieldOp::ElemMatch(filter) => {
                    for item in val.as_array().unwrap_or_default() {
                        if let Value::Document(d) = item {
                            if filter.matches_in(&scope.with_current(d))? {
                                return Ok(true);
                            }
                        }
                    }
                    false
                }
                FieldOp::Exists(_) | FieldOp::Ne(_) | FieldOp::Nin(_) | FieldOp::Not(_) => {
                    unreachable!("handled above")
                }
            };
            Ok(matched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: JsonValue) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn check(filter: JsonValue, record: JsonValue) -> bool {
        Filter::parse(&filter).unwrap().matches(&doc(record)).unwrap()
    }

    #[test]
    fn parse_simple_eq() {
        assert!(check(json!({"name": "Alice"}), json!({"name": "Alice"})));
        assert!(!check(json!({"name": "Alice"}), json!({"name": "Bob"})));
    }

    #[test]
    fn parse_range() {
        let q = json!({"age": {"$gte": 18, "$lt": 65}});
        assert!(check(q.clone(), json!({"age": 30})));
        assert!(!check(q.clone(), json!({"age": 10})));
        assert!(!check(q, json!({"age": 70})));
    }

    #[test]
    fn range_ignores_other_types() {
        assert!(!check(json!({"age": {"$gt": 5}}), json!({"age": "old"})));
    }

    #[test]
    fn date_range() {
        let q = json!({"at": {"$gte": {"$date": "2024-01-01"}, "$lt": {"$date": "2025-01-01"}}});
        assert!(check(q.clone(), json!({"at": {"$date": "2024-06-15"}})));
        assert!(!check(q, json!({"at": {"$date": "2023-06-15"}})));
    }

    #[test]
    fn parse_or_and_nor() {
        let q = json!({"$or": [{"status": "active"}, {"priority": {"$gte": 5}}]});
        assert!(check(q.clone(), json!({"status": "active", "priority": 1})));
        assert!(check(q.clone(), json!({"status": "closed", "priority": 10})));
        assert!(!check(q, json!({"status": "closed", "priority": 1})));

        let nor = json!({"$nor": [{"a": 1}, {"b": 1}]});
        assert!(check(nor.clone(), json!({"a": 2, "b": 2})));
        assert!(!check(nor, json!({"a": 1})));
    }

    #[test]
    fn array_fields_match_any_element() {
        assert!(check(json!({"tags": "red"}), json!({"tags": ["blue", "red"]})));
        assert!(check(json!({"scores": {"$gt": 90}}), json!({"scores": [50, 95]})));
        assert!(check(json!({"tags": ["blue", "red"]}), json!({"tags": ["blue", "red"]})));
    }

    #[test]
    fn null_matches_missing() {
        assert!(check(json!({"x": null}), json!({"y": 1})));
        assert!(!check(json!({"x": {"$ne": null}}), json!({"y": 1})));
    }

    #[test]
    fn in_nin_exists() {
        assert!(check(json!({"s": {"$in": ["a", "b"]}}), json!({"s": "b"})));
        assert!(check(json!({"s": {"$nin": ["a", "b"]}}), json!({"s": "c"})));
        assert!(check(json!({"s": {"$exists": false}}), json!({})));
        assert!(!check(json!({"s": {"$exists": true}}), json!({})));
    }

    #[test]
    fn regex_size_elem_match_not() {
        assert!(check(json!({"name": {"$regex": "^al", "$options": "i"}}), json!({"name": "Alice"})));
        assert!(check(json!({"xs": {"$size": 2}}), json!({"xs": [1, 2]})));
        assert!(check(
            json!({"items": {"$elemMatch": {"qty": {"$gt": 5}, "sku": "a"}}}),
            json!({"items": [{"sku": "a", "qty": 1}, {"sku": "a", "qty": 9}]})
        ));
        assert!(check(json!({"n": {"$not": {"$gt": 5}}}), json!({"n": 3})));
    }

    #[test]
    fn expr_is_truthy_coerced() {
        assert!(check(json!({"$expr": {"$gt": ["$spent", "$budget"]}}), json!({"spent": 5, "budget": 3})));
        assert!(!check(json!({"$expr": "$flag"}), json!({"flag": 0})));
        assert!(check(json!({"$expr": "$flag"}), json!({"flag": "yes"})));
    }

    #[test]
    fn expr_errors_propagate() {
        let filter = Filter::parse(&json!({"$expr": {"$add": ["$a", "x"]}})).unwrap();
        assert!(matches!(filter.matches(&doc(json!({"a": 1}))), Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn elem_match_errors_propagate() {
        let filter =
            Filter::parse(&json!({"items": {"$elemMatch": {"$expr": {"$add": ["$v", 1]}}}})).unwrap();
        let result = filter.matches(&doc(json!({"items": [{"v": "text"}]})));
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn elem_match_sees_variables_and_root() {
        let filter = Filter::parse(&json!({"items": {"$elemMatch": {"$expr": {"$and": [
            {"$eq": ["$sku", "$$wanted"]},
            {"$eq": ["$$ROOT.owner", "ann"]}
        ]}}}}))
        .unwrap();
        let mut vars = Variables::new();
        vars.insert("wanted".to_string(), Value::from("b"));
        let record = doc(json!({"owner": "ann", "items": [{"sku": "a"}, {"sku": "b"}]}));
        assert!(filter.matches_in(&Scope::new(&record, &vars)).unwrap());

        let other = doc(json!({"owner": "bob", "items": [{"sku": "b"}]}));
        assert!(!filter.matches_in(&Scope::new(&other, &vars)).unwrap());
    }

    #[test]
    fn rejects_unknown_operators() {
        assert!(Filter::parse(&json!({"a": {"$near": 1}})).is_err());
        assert!(Filter::parse(&json!({"$where": "x"})).is_err());
        assert!(Filter::parse(&json!([1])).is_err());
    }
}
