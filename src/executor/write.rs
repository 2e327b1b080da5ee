use super::{ExecContext, RecordStream, blocking, drain};
use crate::stage::MergeSpec;

/// `$merge`: buffer the full result, then merge it into the target
/// collection. Emits nothing.
pub(crate) fn merge<'a>(
    spec: &'a MergeSpec,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let docs = drain(input, &ctx.cancel)?;
        ctx.cancel.check()?;
        log::debug!("$merge: writing {} record(s) into '{}'", docs.len(), spec.into);
        let stats = ctx.store.write_merge(
            &spec.into,
            docs,
            &spec.on,
            spec.when_matched,
            spec.when_not_matched,
        )?;
        log::debug!("$merge into '{}' finished: {stats:?}", spec.into);
        Ok(Vec::new())
    })
}

/// `$out`: replace the target collection with the full result.
pub(crate) fn out<'a>(
    collection: &'a str,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let docs = drain(input, &ctx.cancel)?;
        ctx.cancel.check()?;
        log::debug!("$out: replacing '{collection}' with {} record(s)", docs.len());
        ctx.store.write_replace(collection, docs)?;
        Ok(Vec::new())
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::error::Error;
    use crate::executor::test_support::run_stage;
    use crate::store::MemoryStore;

    #[test]
    fn out_replaces_collection() {
        let store = MemoryStore::from_json(&json!({"dest": [{"_id": "old"}]})).unwrap();
        let out = run_stage(json!({"$out": "dest"}), json!([{"_id": 1}, {"_id": 2}]), &store).unwrap();
        assert_eq!(out, json!([]));
        assert_eq!(store.to_json().unwrap()["dest"], json!([{"_id": 1}, {"_id": 2}]));
    }

    #[test]
    fn merge_applies_policies() {
        let store = MemoryStore::from_json(&json!({"totals": [{"_id": "X", "n": 1, "note": "keep"}]})).unwrap();
        run_stage(
            json!({"$merge": {"into": "totals", "whenMatched": "merge", "whenNotMatched": "insert"}}),
            json!([{"_id": "X", "n": 5}, {"_id": "Y", "n": 2}]),
            &store,
        )
        .unwrap();
        assert_eq!(
            store.to_json().unwrap()["totals"],
            json!([{"_id": "X", "n": 5, "note": "keep"}, {"_id": "Y", "n": 2}])
        );
    }

    #[test]
    fn merge_fail_policy_surfaces_conflict() {
        let store = MemoryStore::from_json(&json!({"t": [{"_id": 1}]})).unwrap();
        let err = run_stage(
            json!({"$merge": {"into": "t", "whenMatched": "fail"}}),
            json!([{"_id": 1}]),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err.root(), Error::WriteConflict { .. }));
    }
}
