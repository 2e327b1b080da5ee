use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::value::Value;

/// A record: field names mapped to values, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

fn split_first(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(data: &JsonValue) -> Result<Self> {
        match Value::from_json(data) {
            Value::Document(doc) => Ok(doc),
            _ => Err(Error::NotAnObject),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json());
        }
        JsonValue::Object(map)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Insert or overwrite a top-level field, keeping the position of an
    /// existing one. Inserting `Missing` removes the field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if value.is_missing() {
            return self.remove(&key);
        }
        match self.get_mut(&key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// Follow a dotted path. Numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Document(doc) => doc.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve a field path the way expressions see it: a non-numeric
    /// segment applied to an array maps over the array's documents.
    pub fn resolve(&self, path: &str) -> Value {
        let (head, rest) = split_first(path);
        match (self.get(head), rest) {
            (None, _) => Value::Missing,
            (Some(v), None) => v.clone(),
            (Some(v), Some(rest)) => resolve_in_value(v, rest),
        }
    }

    /// Set a dotted path, creating intermediate documents as needed.
    pub fn set_path(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            None => {
                self.insert(path, value);
            }
            Some((head, rest)) => {
                if !self.contains_key(head) {
                    if value.is_missing() {
                        return;
                    }
                    self.insert(head, Value::Document(Document::new()));
                }
                if let Some(child) = self.get_mut(head) {
                    set_in_value(child, rest, value);
                }
            }
        }
    }

    /// Remove a dotted path. Array elements that are documents each lose
    /// the remaining path.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head)? {
                Value::Document(doc) => doc.remove_path(rest),
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if let Value::Document(doc) = item {
                            doc.remove_path(rest);
                        }
                    }
                    None
                }
                _ => None,
            },
        }
    }

    /// Overwrite this document's fields with `other`'s, appending new ones.
    pub fn merge_from(&mut self, other: Document) {
        for (k, v) in other.fields {
            self.insert(k, v);
        }
    }
}

fn resolve_in_value(value: &Value, path: &str) -> Value {
    match value {
        Value::Document(doc) => doc.resolve(path),
        Value::Array(items) => {
            let (head, rest) = split_first(path);
            if let Ok(idx) = head.parse::<usize>() {
                return match (items.get(idx), rest) {
                    (None, _) => Value::Missing,
                    (Some(v), None) => v.clone(),
                    (Some(v), Some(rest)) => resolve_in_value(v, rest),
                };
            }
            Value::Array(
                items
                    .iter()
                    .filter_map(|item| item.as_document().map(|doc| doc.resolve(path)))
                    .filter(|v| !v.is_missing())
                    .collect(),
            )
        }
        _ => Value::Missing,
    }
}

fn set_in_value(target: &mut Value, path: &str, value: Value) {
    let (head, rest) = split_first(path);
    if let Value::Array(items) = target {
        if let Some(slot) = head.parse::<usize>().ok().and_then(|idx| items.get_mut(idx)) {
            match rest {
                None => *slot = value,
                Some(rest) => set_in_value(slot, rest, value),
            }
            return;
        }
    }
    if !matches!(target, Value::Document(_)) {
        *target = Value::Document(Document::new());
    }
    if let Value::Document(doc) = target {
        doc.set_path(path, value);
    }
}

impl Ord for Document {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((ka, va), (kb, vb)) in self.fields.iter().zip(other.fields.iter()) {
            let ord = ka.cmp(kb).then_with(|| va.cmp(vb));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }
}

impl PartialOrd for Document {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fields.hash(state);
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Document::from_json(&json).map_err(serde::de::Error::custom)
    }
}
