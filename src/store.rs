use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::query::Filter;
use crate::value::Value;

/// What `$merge` does when an incoming record matches an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WhenMatched {
    #[default]
    Merge,
    Replace,
    KeepExisting,
    Fail,
}

/// What `$merge` does when an incoming record has no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WhenNotMatched {
    #[default]
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub discarded: usize,
}

/// Named record collections that `$lookup`, `$graphLookup`, `$merge` and
/// `$out` read from and write to. Implementations are shared across
/// `$facet` threads and must tolerate concurrent reads.
pub trait CollectionStore: Send + Sync {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;

    fn write_merge(
        &self,
        collection: &str,
        records: Vec<Document>,
        on: &[String],
        when_matched: WhenMatched,
        when_not_matched: WhenNotMatched,
    ) -> Result<MergeStats>;

    /// Replace the whole collection in one step.
    fn write_replace(&self, collection: &str, records: Vec<Document>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// `CollectionStore` backed by a `RwLock` over a map of collections.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `{"collection": [documents...], ...}`.
    pub fn from_json(data: &JsonValue) -> Result<Self> {
        let obj = data.as_object().ok_or(Error::NotAnObject)?;
        let mut collections = HashMap::with_capacity(obj.len());
        for (name, docs) in obj {
            let arr = docs.as_array().ok_or_else(|| {
                Error::InvalidSpec(format!("collection '{name}' must be an array of documents"))
            })?;
            let docs = arr.iter().map(Document::from_json).collect::<Result<Vec<_>>>()?;
            collections.insert(name.clone(), docs);
        }
        Ok(Self {
            collections: RwLock::new(collections),
        })
    }

    /// Dump every collection, names sorted.
    pub fn to_json(&self) -> Result<JsonValue> {
        let cols = self.read("*")?;
        let mut names: Vec<&String> = cols.keys().collect();
        names.sort();
        let mut map = Map::with_capacity(names.len());
        for name in names {
            let docs = cols[name].iter().map(Document::to_json).collect();
            map.insert(name.clone(), JsonValue::Array(docs));
        }
        Ok(JsonValue::Object(map))
    }

    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        let mut cols = self.write(collection)?;
        cols.entry(collection.to_string()).or_default().extend(docs);
        Ok(())
    }

    /// Snapshot of one collection. Missing collections are empty.
    pub fn collection(&self, collection: &str) -> Result<Vec<Document>> {
        let cols = self.read(collection)?;
        Ok(cols.get(collection).cloned().unwrap_or_default())
    }

    pub fn collection_names(&self) -> Result<Vec<String>> {
        let cols = self.read("*")?;
        let mut names: Vec<String> = cols.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn read(&self, collection: &str) -> Result<RwLockReadGuard<'_, HashMap<String, Vec<Document>>>> {
        self.collections
            .read()
            .map_err(|_| Error::unavailable(collection, "store lock poisoned"))
    }

    fn write(
        &self,
        collection: &str,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, Vec<Document>>>> {
        self.collections
            .write()
            .map_err(|_| Error::unavailable(collection, "store lock poisoned"))
    }
}

fn merge_key(doc: &Document, on: &[String]) -> Vec<Value> {
    on.iter()
        .map(|path| doc.get_path(path).cloned().unwrap_or(Value::Null))
        .collect()
}

fn conflict(collection: &str, reason: impl Into<String>) -> Error {
    Error::WriteConflict {
        collection: collection.to_string(),
        reason: reason.into(),
    }
}

impl CollectionStore for MemoryStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let cols = self.read(collection)?;
        let Some(docs) = cols.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in docs {
            if filter.matches(doc)? {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }

    fn write_merge(
        &self,
        collection: &str,
        records: Vec<Document>,
        on: &[String],
        when_matched: WhenMatched,
        when_not_matched: WhenNotMatched,
    ) -> Result<MergeStats> {
        let mut cols = self.write(collection)?;
        // Work on a copy so a failing policy leaves the collection untouched.
        let mut target = cols.get(collection).cloned().unwrap_or_default();
        let mut stats = MergeStats::default();

        for record in records {
            let key = merge_key(&record, on);
            let existing = target.iter().position(|doc| merge_key(doc, on) == key);
            match (existing, when_matched, when_not_matched) {
                (Some(_), WhenMatched::Fail, _) => {
                    return Err(conflict(
                        collection,
                        format!("record matched an existing document on {on:?}"),
                    ));
                }
                (Some(_), WhenMatched::KeepExisting, _) => stats.unchanged += 1,
                (Some(pos), WhenMatched::Merge, _) => {
                    target[pos].merge_from(record);
                    stats.updated += 1;
                }
                (Some(pos), WhenMatched::Replace, _) => {
                    let mut replacement = record;
                    if !replacement.contains_key("_id") {
                        if let Some(id) = target[pos].get("_id").cloned() {
                            let mut with_id = Document::new();
                            with_id.insert("_id", id);
                            with_id.merge_from(replacement);
                            replacement = with_id;
                        }
                    }
                    target[pos] = replacement;
                    stats.updated += 1;
                }
                (None, _, WhenNotMatched::Insert) => {
                    target.push(record);
                    stats.inserted += 1;
                }
                (None, _, WhenNotMatched::Discard) => stats.discarded += 1,
                (None, _, WhenNotMatched::Fail) => {
                    return Err(conflict(
                        collection,
                        format!("record has no match on {on:?}"),
                    ));
                }
            }
        }

        cols.insert(collection.to_string(), target);
        Ok(stats)
    }

    fn write_replace(&self, collection: &str, records: Vec<Document>) -> Result<()> {
        let mut cols = self.write(collection)?;
        cols.insert(collection.to_string(), records);
        Ok(())
    }
}
