//! Property-based tests for pipeline composition laws:
//! 1. Match-only pipelines filter by the conjunction and commute
//! 2. limit(n) then limit(m) equals limit(min(n, m))
//! 3. Sort is stable with respect to input order

use proptest::prelude::*;
use serde_json::{Value as JsonValue, json};

use oxipipe::{Document, MemoryStore, Pipeline};

// ── Strategies ──────────────────────────────────────────────────────────

fn record_strategy() -> impl Strategy<Value = JsonValue> {
    (0i64..5, 0i64..100, prop::bool::ANY)
        .prop_map(|(k, n, flag)| json!({"k": k, "n": n, "flag": flag}))
}

fn records_strategy() -> impl Strategy<Value = Vec<JsonValue>> {
    prop::collection::vec(record_strategy(), 0..40)
}

fn predicate_strategy() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        (0i64..5).prop_map(|k| json!({"k": k})),
        (0i64..100).prop_map(|n| json!({"n": {"$gte": n}})),
        (0i64..100).prop_map(|n| json!({"n": {"$lt": n}})),
        prop::bool::ANY.prop_map(|b| json!({"flag": b})),
        prop::collection::vec(0i64..5, 1..3).prop_map(|ks| json!({"k": {"$in": ks}})),
    ]
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn execute(pipeline: JsonValue, input: &[JsonValue]) -> Vec<JsonValue> {
    let store = MemoryStore::new();
    let pipeline = Pipeline::parse(&pipeline).unwrap();
    let docs: Vec<Document> = input.iter().map(|d| Document::from_json(d).unwrap()).collect();
    pipeline
        .execute(docs, &store)
        .unwrap()
        .iter()
        .map(Document::to_json)
        .collect()
}

fn matches(pred: &JsonValue, rec: &JsonValue) -> bool {
    !execute(json!([{"$match": pred}]), std::slice::from_ref(rec)).is_empty()
}

// ── Match Properties ────────────────────────────────────────────────────

proptest! {
    /// Chained matches keep exactly the records every predicate accepts
    #[test]
    fn prop_match_chain_is_conjunction(
        records in records_strategy(),
        preds in prop::collection::vec(predicate_strategy(), 1..4),
    ) {
        let stages: Vec<JsonValue> = preds.iter().map(|p| json!({"$match": p})).collect();
        let out = execute(JsonValue::Array(stages), &records);
        let expected: Vec<JsonValue> = records
            .iter()
            .filter(|r| preds.iter().all(|p| matches(p, r)))
            .cloned()
            .collect();
        prop_assert_eq!(out, expected);
    }

    /// Reordering match stages does not change the output
    #[test]
    fn prop_match_commutes(
        records in records_strategy(),
        a in predicate_strategy(),
        b in predicate_strategy(),
    ) {
        let ab = execute(json!([{"$match": a.clone()}, {"$match": b.clone()}]), &records);
        let ba = execute(json!([{"$match": b}, {"$match": a}]), &records);
        prop_assert_eq!(ab, ba);
    }
}

// ── Limit Properties ────────────────────────────────────────────────────

proptest! {
    /// limit(n) · limit(m) == limit(min(n, m))
    #[test]
    fn prop_limit_composes(
        records in records_strategy(),
        n in 0u64..50,
        m in 0u64..50,
    ) {
        let chained = execute(json!([{"$limit": n}, {"$limit": m}]), &records);
        let single = execute(json!([{"$limit": n.min(m)}]), &records);
        prop_assert_eq!(chained.len() as u64, n.min(m).min(records.len() as u64));
        prop_assert_eq!(chained, single);
    }

    /// skip(n) then limit(m) is a window over the input
    #[test]
    fn prop_skip_limit_window(
        records in records_strategy(),
        n in 0usize..50,
        m in 0usize..50,
    ) {
        let out = execute(json!([{"$skip": n}, {"$limit": m}]), &records);
        let expected: Vec<JsonValue> = records.iter().skip(n).take(m).cloned().collect();
        prop_assert_eq!(out, expected);
    }
}

// ── Sort Properties ─────────────────────────────────────────────────────

proptest! {
    /// Records with equal keys keep their input order
    #[test]
    fn prop_sort_is_stable(records in records_strategy(), descending in prop::bool::ANY) {
        let tagged: Vec<JsonValue> = records
            .iter()
            .enumerate()
            .map(|(i, r)| json!({"k": r["k"], "seq": i}))
            .collect();
        let dir = if descending { -1 } else { 1 };
        let out = execute(json!([{"$sort": {"k": dir}}]), &tagged);

        prop_assert_eq!(out.len(), tagged.len());
        for pair in out.windows(2) {
            let (k1, k2) = (pair[0]["k"].as_i64().unwrap(), pair[1]["k"].as_i64().unwrap());
            if descending {
                prop_assert!(k1 >= k2);
            } else {
                prop_assert!(k1 <= k2);
            }
            if k1 == k2 {
                prop_assert!(pair[0]["seq"].as_u64().unwrap() < pair[1]["seq"].as_u64().unwrap());
            }
        }
    }
}
