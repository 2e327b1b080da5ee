use std::collections::HashSet;

use super::{ExecContext, RecordStream, build, map_records};
use crate::document::Document;
use crate::error::Result;
use crate::expression::Variables;
use crate::query::Filter;
use crate::stage::{GraphLookupSpec, LookupSpec, StageKind};
use crate::value::Value;

fn as_array(docs: Vec<Document>) -> Value {
    Value::Array(docs.into_iter().map(Value::Document).collect())
}

// ---------------------------------------------------------------------------
// $lookup
// ---------------------------------------------------------------------------

/// `$lookup`: attach the matching foreign records as an array. No match
/// yields an empty array.
pub(crate) fn lookup<'a>(
    spec: &'a LookupSpec,
    index: usize,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    map_records(input, move |mut doc| {
        let joined = lookup_one(spec, index, &doc, &ctx)?;
        doc.insert(spec.as_field.clone(), as_array(joined));
        Ok(doc)
    })
}

fn join_filter(local: &str, foreign: &str, doc: &Document) -> Filter {
    match doc.resolve(local) {
        Value::Array(items) => Filter::field_in(foreign, items),
        Value::Missing => Filter::field_eq(foreign, Value::Null),
        value => Filter::field_eq(foreign, value),
    }
}

fn lookup_one(
    spec: &LookupSpec,
    index: usize,
    doc: &Document,
    ctx: &ExecContext<'_>,
) -> Result<Vec<Document>> {
    let filter = match &spec.join {
        Some((local, foreign)) => join_filter(local, foreign, doc),
        None => Filter::All,
    };
    let foreign = ctx.store.find(&spec.from, &filter)?;
    let Some(stages) = &spec.pipeline else {
        return Ok(foreign);
    };

    let scope = ctx.scope(doc);
    let vars = spec
        .let_vars
        .iter()
        .map(|(name, expr)| Ok((name.clone(), expr.evaluate_in(&scope)?)))
        .collect::<Result<Variables>>()?;
    let child = ctx.with_vars(vars);
    build(stages, Box::new(foreign.into_iter().map(Ok)), &child)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| e.nested(index, StageKind::Lookup))
}

// ---------------------------------------------------------------------------
// $graphLookup
// ---------------------------------------------------------------------------

/// `$graphLookup`: breadth-first traversal of `from`, following
/// `connectFromField` values into `connectToField`.
pub(crate) fn graph_lookup<'a>(
    spec: &'a GraphLookupSpec,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    map_records(input, move |mut doc| {
        let reached = traverse(spec, &doc, &ctx)?;
        doc.insert(spec.as_field.clone(), as_array(reached));
        Ok(doc)
    })
}

/// Push the non-null values of `value` (flattening one array level).
fn push_values(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => out.extend(items.into_iter().filter(|v| !v.is_nullish())),
        v if v.is_nullish() => {}
        v => out.push(v),
    }
}

fn traverse(spec: &GraphLookupSpec, doc: &Document, ctx: &ExecContext<'_>) -> Result<Vec<Document>> {
    let mut frontier = Vec::new();
    push_values(spec.start_with.evaluate_in(&ctx.scope(doc))?, &mut frontier);

    let max_depth = match (spec.max_depth, ctx.max_graph_depth) {
        (Some(own), Some(cap)) => Some(own.min(cap)),
        (own, cap) => own.or(cap),
    };
    let mut queried: HashSet<Value> = HashSet::new();
    let mut seen: HashSet<Value> = HashSet::new();
    let mut reached = Vec::new();
    let mut depth: u64 = 0;

    while max_depth.is_none_or(|max| depth <= max) {
        ctx.cancel.check()?;
        let values: Vec<Value> = frontier
            .drain(..)
            .filter(|v| queried.insert(v.clone()))
            .collect();
        if values.is_empty() {
            break;
        }
        let mut filter = Filter::field_in(spec.connect_to_field.as_str(), values);
        if let Some(restrict) = &spec.restrict {
            filter = Filter::And(vec![filter, restrict.clone()]);
        }
        let found = ctx.store.find(&spec.from, &filter)?;
        log::trace!(
            "$graphLookup on '{}': depth {depth} reached {} record(s)",
            spec.from,
            found.len()
        );
        for mut node in found {
            let identity = node
                .get("_id")
                .cloned()
                .unwrap_or_else(|| Value::Document(node.clone()));
            if !seen.insert(identity) {
                continue;
            }
            push_values(node.resolve(&spec.connect_from_field), &mut frontier);
            if let Some(field) = &spec.depth_field {
                node.insert(field.clone(), Value::Int(depth as i64));
            }
            reached.push(node);
        }
        depth += 1;
    }
    Ok(reached)
}
