use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::document::Document;

/// The `$$KEEP`, `$$PRUNE` and `$$DESCEND` system variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Redaction {
    Keep,
    Prune,
    Descend,
}

impl Redaction {
    pub fn name(self) -> &'static str {
        match self {
            Redaction::Keep => "$$KEEP",
            Redaction::Prune => "$$PRUNE",
            Redaction::Descend => "$$DESCEND",
        }
    }
}

/// A dynamically typed pipeline value.
///
/// `Missing` is what a field reference yields when the path does not exist.
/// It compares equal to `Null` but is never stored inside a [`Document`];
/// stages that write fields drop it instead.
///
/// `Redaction` only comes from the `$$KEEP`/`$$PRUNE`/`$$DESCEND`
/// variables, never from record data; it serializes as its variable name.
#[derive(Debug, Clone)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Document(Document),
    Date(DateTime<Utc>),
    Redaction(Redaction),
}

impl Value {
    /// Position of this value's type in the cross-type ordering:
    /// null < numbers < strings < arrays < documents < booleans < dates,
    /// with redaction markers last.
    pub fn type_rank(&self) -> u8 {
        match self {
            Value::Missing | Value::Null => 0,
            Value::Int(_) | Value::Double(_) => 1,
            Value::String(_) => 2,
            Value::Array(_) => 3,
            Value::Document(_) => 4,
            Value::Bool(_) => 5,
            Value::Date(_) => 6,
            Value::Redaction(_) => 7,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Document(_) => "document",
            Value::Date(_) => "date",
            Value::Redaction(_) => "redaction",
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// True for both `Null` and `Missing`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Missing | Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Integer view of a number; doubles qualify only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Predicate coercion: missing, null, false and numeric zero are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Double(d) => *d != 0.0,
            _ => true,
        }
    }

    /// Convert a JSON value. `{"$date": ...}` becomes a `Date`.
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    n.as_f64().map(Value::Double).unwrap_or(Value::Null)
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => {
                if map.len() == 1 {
                    if let Some(date) = map.get("$date").and_then(date_from_json) {
                        return Value::Date(date);
                    }
                }
                Value::Document(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Convert back to JSON. Dates use the `{"$date": "<rfc3339>"}` form.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Missing | Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(doc) => doc.to_json(),
            Value::Date(dt) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    "$date".to_string(),
                    JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                JsonValue::Object(map)
            }
            Value::Redaction(r) => JsonValue::String(r.name().to_string()),
        }
    }

    /// Parse the date spellings accepted inside `{"$date": "..."}`.
    pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
        // RFC 3339 with offset: "2024-01-15T10:30:00Z"
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        // No offset: "2024-01-15T10:30:00"
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return Some(dt.and_utc());
        }
        // Space separated: "2024-01-15 10:30:00"
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Some(dt.and_utc());
        }
        // Date only: "2024-01-15"
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    /// Numeric addition; ints stay ints until they overflow. `None` if
    /// either side is not a number.
    pub(crate) fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(
                a.checked_add(*b)
                    .map(Value::Int)
                    .unwrap_or(Value::Double(*a as f64 + *b as f64)),
            ),
            _ => Some(Value::Double(self.as_f64()? + other.as_f64()?)),
        }
    }

    pub(crate) fn checked_mul(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(
                a.checked_mul(*b)
                    .map(Value::Int)
                    .unwrap_or(Value::Double(*a as f64 * *b as f64)),
            ),
            _ => Some(Value::Double(self.as_f64()? * other.as_f64()?)),
        }
    }

    pub(crate) fn checked_sub(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(
                a.checked_sub(*b)
                    .map(Value::Int)
                    .unwrap_or(Value::Double(*a as f64 - *b as f64)),
            ),
            _ => Some(Value::Double(self.as_f64()? - other.as_f64()?)),
        }
    }
}

fn date_from_json(json: &JsonValue) -> Option<DateTime<Utc>> {
    match json {
        JsonValue::String(s) => Value::parse_date(s),
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    if a == b { Ordering::Equal } else { a.total_cmp(&b) }
}

/// Exact ordering of an integer against a double. Going through `as f64`
/// would merge distinct integers above 2^53 and break transitivity.
fn cmp_int_f64(a: i64, b: f64) -> Ordering {
    // 2^63: every double at or beyond this magnitude lies outside i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if b.is_nan() {
        return cmp_f64(a as f64, b);
    }
    if b >= LIMIT {
        return Ordering::Less;
    }
    if b < -LIMIT {
        return Ordering::Greater;
    }
    let whole = b.trunc();
    match a.cmp(&(whole as i64)) {
        Ordering::Equal => cmp_f64(0.0, b - whole),
        other => other,
    }
}

/// Bits used to hash a number so that `Int(1)` and `Double(1.0)` collide.
fn number_hash_bits(n: f64) -> u64 {
    if n == 0.0 { 0.0f64.to_bits() } else { n.to_bits() }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Double(b)) => cmp_int_f64(*a, *b),
            (Value::Double(a), Value::Int(b)) => cmp_int_f64(*b, *a).reverse(),
            (Value::Double(a), Value::Double(b)) => cmp_f64(*a, *b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Document(a), Value::Document(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Redaction(a), Value::Redaction(b)) => a.cmp(b),
            // Same rank, remaining pairs are null/missing.
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Missing | Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => number_hash_bits(*i as f64).hash(state),
            Value::Double(d) => number_hash_bits(*d).hash(state),
            Value::String(s) => s.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Document(doc) => doc.hash(state),
            Value::Date(dt) => dt.timestamp_micros().hash(state),
            Value::Redaction(r) => r.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => f.write_str("<missing>"),
            Value::Redaction(r) => f.write_str(r.name()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(|json| Value::from_json(&json))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::Date(dt)
    }
}

impl From<&JsonValue> for Value {
    fn from(json: &JsonValue) -> Self {
        Value::from_json(json)
    }
}
