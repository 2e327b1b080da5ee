use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Shared flag a caller flips to abort a running pipeline. Clones observe
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            log::warn!("pipeline run cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateOptions {
    /// Run `$facet` sub-pipelines on the rayon pool.
    #[serde(rename = "allowParallelFacets")]
    pub parallel_facets: bool,
    /// Global cap on `$graphLookup` recursion, applied on top of each
    /// stage's own `maxDepth`.
    #[serde(rename = "maxGraphLookupDepth")]
    pub max_graph_depth: Option<u64>,
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            parallel_facets: true,
            max_graph_depth: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl AggregateOptions {
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Parse a JSON options document such as
/// `{"allowParallelFacets": false, "maxGraphLookupDepth": 5}`.
pub fn parse_aggregate_options(json: &JsonValue) -> Result<AggregateOptions> {
    if !json.is_object() {
        return Err(Error::InvalidSpec("options must be an object".into()));
    }
    serde_json::from_value(json.clone()).map_err(|e| Error::InvalidSpec(format!("options: {e}")))
}
