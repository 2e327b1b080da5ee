use std::collections::HashMap;

use super::{ExecContext, RecordStream, blocking};
use crate::accumulator::{Accumulator, AccumulatorSpec};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::Expression;
use crate::stage::{BucketSpec, GroupSpec};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Grouping table
// ---------------------------------------------------------------------------

/// Live groups keyed by structural value equality, remembering first-seen
/// order.
struct Groups<'s> {
    outputs: &'s [(String, AccumulatorSpec)],
    index: HashMap<Value, usize>,
    groups: Vec<(Value, Vec<Accumulator>)>,
}

impl<'s> Groups<'s> {
    fn new(outputs: &'s [(String, AccumulatorSpec)]) -> Self {
        Self {
            outputs,
            index: HashMap::new(),
            groups: Vec::new(),
        }
    }

    fn accumulate(&mut self, key: Value, doc: &Document, ctx: &ExecContext<'_>) -> Result<()> {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = self.groups.len();
                let states = self.outputs.iter().map(|(_, spec)| spec.start()).collect();
                self.index.insert(key.clone(), slot);
                self.groups.push((key, states));
                slot
            }
        };
        let scope = ctx.scope(doc);
        let states = &mut self.groups[slot].1;
        for ((_, spec), state) in self.outputs.iter().zip(states.iter_mut()) {
            state.accumulate(spec.expr.evaluate_in(&scope)?);
        }
        Ok(())
    }

    fn finish(self) -> Vec<(Value, Document)> {
        let outputs = self.outputs;
        self.groups
            .into_iter()
            .map(|(key, states)| {
                let mut doc = Document::new();
                doc.insert("_id", key.clone());
                for ((name, _), state) in outputs.iter().zip(states) {
                    doc.insert(name.clone(), state.finalize());
                }
                (key, doc)
            })
            .collect()
    }
}

fn group_key(expr: &Expression, doc: &Document, ctx: &ExecContext<'_>) -> Result<Value> {
    let key = expr.evaluate_in(&ctx.scope(doc))?;
    Ok(if key.is_missing() { Value::Null } else { key })
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// `$group`: one record per distinct key, in first-seen order.
pub(crate) fn group<'a>(
    spec: &'a GroupSpec,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let mut groups = Groups::new(&spec.accumulators);
        for item in input {
            ctx.cancel.check()?;
            let doc = item?;
            let key = group_key(&spec.key, &doc, &ctx)?;
            groups.accumulate(key, &doc, &ctx)?;
        }
        let out: Vec<Document> = groups.finish().into_iter().map(|(_, doc)| doc).collect();
        log::debug!("$group: {} group(s)", out.len());
        Ok(out)
    })
}

/// `$count`: a single `{field: n}` record, nothing for empty input.
pub(crate) fn count<'a>(
    field: &'a str,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let mut n: i64 = 0;
        for item in input {
            ctx.cancel.check()?;
            item?;
            n += 1;
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut doc = Document::new();
        doc.insert(field, Value::Int(n));
        Ok(vec![doc])
    })
}

/// `$sortByCount`: group by the expression, count, most frequent first.
pub(crate) fn sort_by_count<'a>(
    expr: &'a Expression,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let outputs = [("count".to_string(), AccumulatorSpec::count())];
        let mut groups = Groups::new(&outputs);
        for item in input {
            ctx.cancel.check()?;
            let doc = item?;
            let key = group_key(expr, &doc, &ctx)?;
            groups.accumulate(key, &doc, &ctx)?;
        }
        let mut out: Vec<Document> = groups.finish().into_iter().map(|(_, doc)| doc).collect();
        out.sort_by(|a, b| b.get("count").cmp(&a.get("count")));
        Ok(out)
    })
}

/// `$bucket`: half-open `[lower, upper)` intervals over `boundaries`.
/// Buckets come out in boundary order with the default bucket last;
/// empty buckets are omitted.
pub(crate) fn bucket<'a>(
    spec: &'a BucketSpec,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    blocking(input, move |input| {
        let mut groups = Groups::new(&spec.output);
        for item in input {
            ctx.cancel.check()?;
            let doc = item?;
            let value = group_key(&spec.group_by, &doc, &ctx)?;
            let lower = spec
                .boundaries
                .windows(2)
                .find(|w| value >= w[0] && value < w[1])
                .map(|w| w[0].clone());
            let key = match (lower, &spec.default) {
                (Some(lower), _) => lower,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(Error::OutOfRange(format!(
                        "$bucket value {value} falls outside the boundaries and no default is set"
                    )));
                }
            };
            groups.accumulate(key, &doc, &ctx)?;
        }
        let mut buckets = groups.finish();
        // Boundary buckets in ascending order, default last.
        let rank = |key: &Value| {
            spec.boundaries
                .iter()
                .position(|b| b == key)
                .unwrap_or(spec.boundaries.len())
        };
        buckets.sort_by_key(|(key, _)| rank(key));
        Ok(buckets.into_iter().map(|(_, doc)| doc).collect())
    })
}
