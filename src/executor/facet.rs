use rayon::prelude::*;

use super::{ExecContext, RecordStream, blocking, build, drain};
use crate::document::Document;
use crate::error::Result;
use crate::stage::{Stage, StageKind};
use crate::value::Value;

/// `$facet`: every sub-pipeline runs over its own copy of the full input;
/// the single output record holds one array per facet.
pub(crate) fn facet<'a>(
    facets: &'a [(String, Vec<Stage>)],
    index: usize,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let docs = drain(input, &ctx.cancel)?;
        let parallel = ctx.parallel_facets && facets.len() > 1;
        log::debug!(
            "$facet: {} sub-pipeline(s) over {} record(s){}",
            facets.len(),
            docs.len(),
            if parallel { " in parallel" } else { "" }
        );

        let results: Vec<Result<Vec<Document>>> = if parallel {
            facets
                .par_iter()
                .map(|(_, stages)| run_facet(stages, &docs, &ctx))
                .collect()
        } else {
            facets
                .iter()
                .map(|(_, stages)| run_facet(stages, &docs, &ctx))
                .collect()
        };

        let mut out = Document::new();
        for ((name, _), result) in facets.iter().zip(results) {
            let records = result.map_err(|e| e.nested(index, StageKind::Facet))?;
            out.insert(
                name.clone(),
                Value::Array(records.into_iter().map(Value::Document).collect()),
            );
        }
        Ok(vec![out])
    })
}

fn run_facet(stages: &[Stage], input: &[Document], ctx: &ExecContext<'_>) -> Result<Vec<Document>> {
    let source: RecordStream<'_> = Box::new(input.iter().cloned().map(Ok));
    build(stages, source, ctx).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::error::Error;
    use crate::executor::test_support::{run, run_stage};
    use crate::store::MemoryStore;

    fn ten() -> serde_json::Value {
        json!((0..10).map(|i| json!({"i": i, "even": i % 2 == 0})).collect::<Vec<_>>())
    }

    #[test]
    fn sub_pipelines_see_full_input() {
        let out = run(
            json!({"$facet": {
                "firstThree": [{"$limit": 3}],
                "evens": [{"$match": {"even": true}}, {"$count": "n"}],
                "lastTwo": [{"$skip": 8}, {"$project": {"_id": 0, "i": 1}}]
            }}),
            ten(),
        )
        .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 1);
        assert_eq!(out[0]["firstThree"].as_array().unwrap().len(), 3);
        assert_eq!(out[0]["evens"], json!([{"n": 5}]));
        assert_eq!(out[0]["lastTwo"], json!([{"i": 8}, {"i": 9}]));
    }

    #[test]
    fn empty_input_still_emits_one_record() {
        let out = run(
            json!({"$facet": {"all": [{"$skip": 0}], "n": [{"$count": "n"}]}}),
            json!([]),
        )
        .unwrap();
        assert_eq!(out, json!([{"all": [], "n": []}]));
    }

    #[test]
    fn facet_can_write_snapshot() {
        let store = MemoryStore::new();
        run_stage(
            json!({"$facet": {"kept": [{"$limit": 2}, {"$out": "snapshot"}], "n": [{"$count": "n"}]}}),
            ten(),
            &store,
        )
        .unwrap();
        assert_eq!(store.collection("snapshot").unwrap().len(), 2);
    }

    #[test]
    fn errors_name_the_facet_stage() {
        let err = run(
            json!({"$facet": {"bad": [{"$bucket": {"groupBy": "$i", "boundaries": [0, 5]}}]}}),
            ten(),
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("stage 0 ($facet) failed: stage 0 ($bucket) failed: out of range")
        );
        assert!(matches!(err.root(), Error::OutOfRange(_)));
    }
}
