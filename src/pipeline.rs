use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::Result;
use crate::executor::{self, ExecContext, RecordStream};
use crate::options::AggregateOptions;
use crate::stage::{Placement, Stage, parse_stages, validate_stages};
use crate::store::CollectionStore;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A validated, non-empty list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate and wrap a stage list. Fails with `InvalidSpec` when the list
    /// is empty or a `$merge`/`$out` is not last, at any nesting level.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        validate_stages(&stages, Placement::TopLevel)?;
        log::debug!(
            "pipeline built: {}",
            stages
                .iter()
                .map(|s| s.kind().name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(Self { stages })
    }

    /// Parse a JSON array of `{"$stage": body}` documents.
    pub fn parse(json: &JsonValue) -> Result<Self> {
        Self::new(parse_stages(json)?)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Lazily run the pipeline over `source` with default options.
    pub fn run<'a, I>(&'a self, source: I, store: &'a dyn CollectionStore) -> PipelineRun<'a>
    where
        I: IntoIterator<Item = Document>,
        I::IntoIter: 'a,
    {
        self.run_with_options(source, store, &AggregateOptions::default())
    }

    pub fn run_with_options<'a, I>(
        &'a self,
        source: I,
        store: &'a dyn CollectionStore,
        options: &AggregateOptions,
    ) -> PipelineRun<'a>
    where
        I: IntoIterator<Item = Document>,
        I::IntoIter: 'a,
    {
        let ctx = ExecContext::new(store, options);
        let input: RecordStream<'a> = Box::new(source.into_iter().map(Ok));
        PipelineRun {
            pending: Some((input, ctx)),
            stream: None,
            pipeline: self,
            state: RunState::Idle,
        }
    }

    /// Run to completion and collect the output.
    pub fn execute<I>(&self, source: I, store: &dyn CollectionStore) -> Result<Vec<Document>>
    where
        I: IntoIterator<Item = Document>,
    {
        self.execute_with_options(source, store, &AggregateOptions::default())
    }

    pub fn execute_with_options<I>(
        &self,
        source: I,
        store: &dyn CollectionStore,
        options: &AggregateOptions,
    ) -> Result<Vec<Document>>
    where
        I: IntoIterator<Item = Document>,
    {
        let docs: Vec<Document> = source.into_iter().collect();
        self.run_with_options(docs, store, options).collect()
    }
}

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// An in-progress run: an iterator of output records. Stages are wired on
/// the first pull. After the first error the run is `Failed`, every
/// buffered record is dropped and no further items are produced.
pub struct PipelineRun<'a> {
    pending: Option<(RecordStream<'a>, ExecContext<'a>)>,
    stream: Option<RecordStream<'a>>,
    pipeline: &'a Pipeline,
    state: RunState,
}

impl PipelineRun<'_> {
    pub fn state(&self) -> RunState {
        self.state
    }
}

impl<'a> Iterator for PipelineRun<'a> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((input, ctx)) = self.pending.take() {
            let pipeline: &'a Pipeline = self.pipeline;
            self.stream = Some(executor::build(&pipeline.stages, input, &ctx));
            self.state = RunState::Running;
        }
        let stream = self.stream.as_mut()?;
        match stream.next() {
            Some(Ok(doc)) => Some(Ok(doc)),
            Some(Err(e)) => {
                log::debug!("pipeline run failed: {e}");
                self.stream = None;
                self.state = RunState::Failed;
                Some(Err(e))
            }
            None => {
                self.stream = None;
                self.state = RunState::Completed;
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::stage::StageKind;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn docs(v: JsonValue) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|d| Document::from_json(d).unwrap())
            .collect()
    }

    fn to_json(out: Vec<Document>) -> JsonValue {
        JsonValue::Array(out.iter().map(Document::to_json).collect())
    }

    #[test]
    fn parse_empty_pipeline() {
        assert!(matches!(Pipeline::parse(&json!([])), Err(Error::InvalidSpec(_))));
        assert!(matches!(Pipeline::parse(&json!({})), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn terminal_must_be_last() {
        let err = Pipeline::parse(&json!([{"$out": "x"}, {"$match": {}}])).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert!(Pipeline::parse(&json!([{"$match": {}}, {"$out": "x"}])).is_ok());
    }

    #[test]
    fn new_validates_hand_built_stages() {
        let facet = Stage::Facet(vec![("f".to_string(), Vec::new())]);
        assert!(Pipeline::new(vec![facet]).is_err());
        assert!(Pipeline::new(vec![Stage::Limit(1)]).is_ok());
    }

    #[test]
    fn state_transitions_to_completed() {
        let store = MemoryStore::new();
        let pipeline = Pipeline::parse(&json!([{"$limit": 1}])).unwrap();
        let mut run = pipeline.run(docs(json!([{"a": 1}, {"a": 2}])), &store);
        assert_eq!(run.state(), RunState::Idle);
        assert!(run.next().unwrap().is_ok());
        assert_eq!(run.state(), RunState::Running);
        assert!(run.next().is_none());
        assert_eq!(run.state(), RunState::Completed);
    }

    #[test]
    fn failure_is_final() {
        let store = MemoryStore::new();
        let pipeline =
            Pipeline::parse(&json!([{"$addFields": {"x": {"$add": ["$v", 1]}}}])).unwrap();
        let mut run = pipeline.run(docs(json!([{"v": 1}, {"v": "bad"}, {"v": 3}])), &store);
        assert!(run.next().unwrap().is_ok());
        match run.next() {
            Some(Err(Error::Stage { index, kind, .. })) => {
                assert_eq!(index, 0);
                assert_eq!(kind, StageKind::AddFields);
            }
            other => panic!("expected stage error, got {other:?}"),
        }
        assert_eq!(run.state(), RunState::Failed);
        assert!(run.next().is_none());
        assert_eq!(run.state(), RunState::Failed);
    }

    #[test]
    fn execute_collects() {
        let store = MemoryStore::new();
        let pipeline = Pipeline::parse(&json!([
            {"$match": {"n": {"$gt": 1}}},
            {"$sort": {"n": -1}},
            {"$project": {"_id": 0, "n": 1}}
        ]))
        .unwrap();
        let out = pipeline
            .execute(docs(json!([{"n": 1}, {"n": 3}, {"n": 2}])), &store)
            .unwrap();
        assert_eq!(to_json(out), json!([{"n": 3}, {"n": 2}]));
    }

    #[test]
    fn options_cap_graph_depth() {
        let store = MemoryStore::from_json(&json!({"nodes": [
            {"_id": 1, "next": 2}, {"_id": 2, "next": 3}, {"_id": 3, "next": 4}
        ]}))
        .unwrap();
        let pipeline = Pipeline::parse(&json!([{"$graphLookup": {
            "from": "nodes", "startWith": "$start", "connectFromField": "next",
            "connectToField": "_id", "as": "path", "maxDepth": 10
        }}]))
        .unwrap();
        let opts = AggregateOptions {
            max_graph_depth: Some(1),
            ..AggregateOptions::default()
        };
        let out = pipeline
            .execute_with_options(docs(json!([{"start": 1}])), &store, &opts)
            .unwrap();
        assert_eq!(
            out[0].to_json()["path"],
            json!([{"_id": 1, "next": 2}, {"_id": 2, "next": 3}])
        );
    }
}
