use std::cmp::Ordering;

use rand::seq::index;

use super::{ExecContext, RecordStream, blocking, drain};
use crate::document::Document;
use crate::stage::SortOrder;
use crate::value::Value;

/// `$sort`: stable multi-key sort. Missing fields sort as null.
pub(crate) fn sort<'a>(
    keys: &'a [(String, SortOrder)],
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let docs = drain(input, &ctx.cancel)?;
        log::debug!("$sort: ordering {} records by {} key(s)", docs.len(), keys.len());
        let mut keyed: Vec<_> = docs
            .into_iter()
            .map(|doc| {
                let values: Vec<_> = keys.iter().map(|(path, _)| doc.resolve(path)).collect();
                (values, doc)
            })
            .collect();
        keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b, keys));
        Ok(keyed.into_iter().map(|(_, doc)| doc).collect())
    })
}

fn compare_keys(a: &[Value], b: &[Value], keys: &[(String, SortOrder)]) -> Ordering {
    for ((va, vb), (_, order)) in a.iter().zip(b).zip(keys) {
        let ord = match order {
            SortOrder::Asc => va.cmp(vb),
            SortOrder::Desc => vb.cmp(va),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// `$sample`: `size` records chosen uniformly without replacement.
pub(crate) fn sample<'a>(
    size: u64,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let mut docs = drain(input, &ctx.cancel)?;
        let amount = usize::try_from(size).unwrap_or(usize::MAX).min(docs.len());
        let mut rng = rand::rng();
        let mut picked: Vec<usize> = index::sample(&mut rng, docs.len(), amount).into_vec();
        picked.sort_unstable_by(|a, b| b.cmp(a));
        let mut out: Vec<Document> = picked.into_iter().map(|i| docs.swap_remove(i)).collect();
        out.reverse();
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use crate::executor::test_support::run;

    #[test]
    fn sort_is_stable() {
        let out = run(
            json!({"$sort": {"k": 1}}),
            json!([{"k": 1, "v": "a"}, {"k": 0, "v": "z"}, {"k": 1, "v": "b"}]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([{"k": 0, "v": "z"}, {"k": 1, "v": "a"}, {"k": 1, "v": "b"}])
        );
    }

    #[test]
    fn sort_multiple_keys_and_mixed_types() {
        let out = run(
            json!({"$sort": {"group": 1, "n": -1}}),
            json!([
                {"group": "b", "n": 1},
                {"group": "a", "n": 1},
                {"group": "a", "n": 5},
                {"n": 9},
                {"group": 3, "n": 0}
            ]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"n": 9},
                {"group": 3, "n": 0},
                {"group": "a", "n": 5},
                {"group": "a", "n": 1},
                {"group": "b", "n": 1}
            ])
        );
    }

    #[test]
    fn sample_picks_distinct_records() {
        let input = json!([{"i": 0}, {"i": 1}, {"i": 2}, {"i": 3}, {"i": 4}]);
        let out = run(json!({"$sample": {"size": 3}}), input.clone()).unwrap();
        let picked: HashSet<i64> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["i"].as_i64().unwrap())
            .collect();
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|i| (0..5).contains(i)));

        let all = run(json!({"$sample": {"size": 50}}), input).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 5);
    }
}
