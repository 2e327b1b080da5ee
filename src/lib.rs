pub mod accumulator;
pub mod document;
pub mod error;
mod executor;
pub mod expression;
pub mod options;
pub mod pipeline;
pub mod query;
pub mod stage;
pub mod store;
pub mod value;

pub use document::Document;
pub use error::{Error, Result};
pub use options::{AggregateOptions, CancellationToken, parse_aggregate_options};
pub use pipeline::{Pipeline, PipelineRun, RunState};
pub use query::Filter;
pub use stage::{Stage, StageKind};
pub use store::{CollectionStore, MemoryStore, MergeStats, WhenMatched, WhenNotMatched};
pub use value::{Redaction, Value};
