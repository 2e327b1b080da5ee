//! Stage executors. Each stage turns an input record stream into an output
//! record stream; streaming stages pull lazily, blocking stages drain their
//! input on the first pull.

mod facet;
mod filter;
mod group;
mod limit;
mod lookup;
mod projection;
mod redact;
mod sort;
mod unwind;
mod write;

use std::sync::Arc;

use crate::document::Document;
use crate::error::Result;
use crate::expression::{Scope, Variables};
use crate::options::{AggregateOptions, CancellationToken};
use crate::stage::Stage;
use crate::store::CollectionStore;

pub(crate) type RecordStream<'a> = Box<dyn Iterator<Item = Result<Document>> + 'a>;

/// Everything a stage needs besides its own spec and input.
#[derive(Clone)]
pub(crate) struct ExecContext<'a> {
    pub store: &'a dyn CollectionStore,
    pub parallel_facets: bool,
    pub max_graph_depth: Option<u64>,
    pub cancel: CancellationToken,
    pub vars: Arc<Variables>,
}

impl<'a> ExecContext<'a> {
    pub fn new(store: &'a dyn CollectionStore, options: &AggregateOptions) -> Self {
        Self {
            store,
            parallel_facets: options.parallel_facets,
            max_graph_depth: options.max_graph_depth,
            cancel: options.cancellation.clone(),
            vars: Arc::new(Variables::new()),
        }
    }

    /// A child context for a nested pipeline with extra variables bound.
    pub fn with_vars(&self, vars: Variables) -> Self {
        let mut merged = (*self.vars).clone();
        merged.extend(vars);
        Self {
            vars: Arc::new(merged),
            ..self.clone()
        }
    }

    pub fn scope<'s>(&'s self, record: &'s Document) -> Scope<'s> {
        Scope::new(record, &self.vars)
    }
}

/// Wire `stages` over `input`. Every item leaving stage `i` is checked for
/// cancellation and errors are tagged with `i` and the stage kind.
pub(crate) fn build<'a>(
    stages: &'a [Stage],
    input: RecordStream<'a>,
    ctx: &ExecContext<'a>,
) -> RecordStream<'a> {
    let mut stream = input;
    for (index, stage) in stages.iter().enumerate() {
        let kind = stage.kind();
        let out = build_stage(stage, index, stream, ctx.clone());
        let cancel = ctx.cancel.clone();
        stream = Box::new(out.map(move |item| {
            cancel.check()?;
            item.map_err(|e| e.at_stage(index, kind))
        }));
    }
    stream
}

fn build_stage<'a>(
    stage: &'a Stage,
    index: usize,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    match stage {
        Stage::Match(filter) => filter::filter(filter, input, ctx),
        Stage::Project(projection) => projection::project(projection, input, ctx),
        Stage::AddFields(fields) => projection::add_fields(fields, input, ctx),
        Stage::Unset(paths) => projection::unset(paths, input),
        Stage::ReplaceRoot(expr) => projection::replace_root(expr, input, ctx),
        Stage::Sort(keys) => sort::sort(keys, input, ctx),
        Stage::Sample(size) => sort::sample(*size, input, ctx),
        Stage::Limit(n) => limit::limit(*n, input),
        Stage::Skip(n) => limit::skip(*n, input),
        Stage::Count(field) => group::count(field, input, ctx),
        Stage::Group(spec) => group::group(spec, input, ctx),
        Stage::SortByCount(expr) => group::sort_by_count(expr, input, ctx),
        Stage::Bucket(spec) => group::bucket(spec, input, ctx),
        Stage::Unwind(spec) => unwind::unwind(spec, input),
        Stage::Lookup(spec) => lookup::lookup(spec, index, input, ctx),
        Stage::GraphLookup(spec) => lookup::graph_lookup(spec, input, ctx),
        Stage::Facet(facets) => facet::facet(facets, index, input, ctx),
        Stage::Redact(expr) => redact::redact(expr, input, ctx),
        Stage::Merge(spec) => write::merge(spec, input, ctx),
        Stage::Out(collection) => write::out(collection, input, ctx),
    }
}

/// Pull every record out of `input`, checking for cancellation between
/// records.
pub(crate) fn drain(input: RecordStream<'_>, cancel: &CancellationToken) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for item in input {
        cancel.check()?;
        docs.push(item?);
    }
    Ok(docs)
}

type Finish<'a> = Box<dyn FnOnce(RecordStream<'a>) -> Result<Vec<Document>> + 'a>;

enum BlockingState<'a> {
    Pending(RecordStream<'a>, Finish<'a>),
    Draining(std::vec::IntoIter<Document>),
    Done,
}

/// Output of a blocking stage: nothing happens until the first pull, which
/// hands the whole input to `finish` and then replays its result.
struct Blocking<'a> {
    state: BlockingState<'a>,
}

impl Iterator for Blocking<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, BlockingState::Done) {
                BlockingState::Pending(input, finish) => match finish(input) {
                    Ok(docs) => self.state = BlockingState::Draining(docs.into_iter()),
                    Err(e) => return Some(Err(e)),
                },
                BlockingState::Draining(mut docs) => {
                    let next = docs.next()?;
                    self.state = BlockingState::Draining(docs);
                    return Some(Ok(next));
                }
                BlockingState::Done => return None,
            }
        }
    }
}

pub(crate) fn blocking<'a, F>(input: RecordStream<'a>, finish: F) -> RecordStream<'a>
where
    F: FnOnce(RecordStream<'a>) -> Result<Vec<Document>> + 'a,
{
    Box::new(Blocking {
        state: BlockingState::Pending(input, Box::new(finish)),
    })
}

/// Apply a fallible per-record transformation, passing upstream errors
/// through untouched.
pub(crate) fn map_records<'a, F>(input: RecordStream<'a>, mut f: F) -> RecordStream<'a>
where
    F: FnMut(Document) -> Result<Document> + 'a,
{
    Box::new(input.map(move |item| item.and_then(&mut f)))
}


#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use serde_json::{Value as JsonValue, json};

    use super::test_support::*;
    use super::*;
    use crate::error::Error;
    use crate::stage::{StageKind, parse_stages};
    use crate::store::MemoryStore;

    fn counted(n: usize, pulls: Rc<Cell<usize>>) -> RecordStream<'static> {
        Box::new((0..n).map(move |i| {
            pulls.set(pulls.get() + 1);
            let mut doc = Document::new();
            doc.insert("i", crate::value::Value::Int(i as i64));
            Ok(doc)
        }))
    }

    #[test]
    fn streaming_stages_pull_lazily() {
        let store = MemoryStore::new();
        let opts = AggregateOptions::default();
        let ctx = ExecContext::new(&store, &opts);
        let stages = parse_stages(&json!([{"$match": {}}, {"$limit": 2}])).unwrap();
        let pulls = Rc::new(Cell::new(0));
        let out: Vec<_> = build(&stages, counted(100, pulls.clone()), &ctx).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(pulls.get(), 2);
    }

    #[test]
    fn blocking_stage_waits_for_first_pull() {
        let store = MemoryStore::new();
        let opts = AggregateOptions::default();
        let ctx = ExecContext::new(&store, &opts);
        let stages = parse_stages(&json!([{"$sort": {"i": -1}}])).unwrap();
        let pulls = Rc::new(Cell::new(0));
        let mut out = build(&stages, counted(5, pulls.clone()), &ctx);
        assert_eq!(pulls.get(), 0);
        let first = out.next().unwrap().unwrap();
        assert_eq!(pulls.get(), 5);
        assert_eq!(first.to_json(), json!({"i": 4}));
    }

    #[test]
    fn errors_carry_stage_index_and_kind() {
        let err = run_stage_list(
            json!([{"$match": {}}, {"$project": {"v": {"$add": ["$s", 1]}}}]),
            json!([{"s": "text"}]),
        )
        .unwrap_err();
        match err {
            Error::Stage { index, kind, source } => {
                assert_eq!(index, 1);
                assert_eq!(kind, StageKind::Project);
                assert!(matches!(*source, Error::TypeMismatch(_)));
            }
            other => panic!("expected stage error, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_between_records() {
        let store = MemoryStore::new();
        let opts = AggregateOptions::default();
        let ctx = ExecContext::new(&store, &opts);
        let stages = parse_stages(&json!([{"$group": {"_id": null, "n": {"$sum": 1}}}])).unwrap();
        let token = ctx.cancel.clone();
        let input: RecordStream<'_> = Box::new((0..10).map(move |i| {
            if i == 3 {
                token.cancel();
            }
            Ok(Document::new())
        }));
        let result: Result<Vec<_>> = build(&stages, input, &ctx).collect();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    fn run_stage_list(stages: JsonValue, input: JsonValue) -> Result<Vec<Document>> {
        let store = MemoryStore::new();
        let opts = AggregateOptions::default();
        let ctx = ExecContext::new(&store, &opts);
        let stages = parse_stages(&stages)?;
        build(&stages, Box::new(docs(input).into_iter().map(Ok)), &ctx).collect()
    }
}
