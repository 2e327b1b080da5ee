use thiserror::Error;

use crate::stage::StageKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("collection unavailable: {collection}: {reason}")]
    CollectionUnavailable { collection: String, reason: String },

    #[error("write conflict in collection '{collection}': {reason}")]
    WriteConflict { collection: String, reason: String },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("stage {index} ({kind}) failed: {source}")]
    Stage {
        index: usize,
        kind: StageKind,
        #[source]
        source: Box<Error>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be a JSON object")]
    NotAnObject,
}

impl Error {
    /// Tag an error with the stage that produced it. Errors that already
    /// carry a stage, and cancellations, pass through untouched.
    pub fn at_stage(self, index: usize, kind: StageKind) -> Self {
        match self {
            Error::Stage { .. } | Error::Cancelled => self,
            other => Error::Stage {
                index,
                kind,
                source: Box::new(other),
            },
        }
    }

    /// Wrap an error coming out of a nested pipeline (`$facet`, `$lookup`)
    /// so the outer stage is reported too.
    pub(crate) fn nested(self, index: usize, kind: StageKind) -> Self {
        match self {
            Error::Cancelled => self,
            other => Error::Stage {
                index,
                kind,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error with all stage tags removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn unavailable(collection: &str, reason: impl Into<String>) -> Self {
        Error::CollectionUnavailable {
            collection: collection.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_stage_wraps_once() {
        let err = Error::OutOfRange("42".into())
            .at_stage(3, StageKind::Bucket)
            .at_stage(5, StageKind::Sort);
        match &err {
            Error::Stage { index, kind, .. } => {
                assert_eq!(*index, 3);
                assert_eq!(*kind, StageKind::Bucket);
            }
            other => panic!("expected stage error, got {other:?}"),
        }
        assert!(matches!(err.root(), Error::OutOfRange(_)));
    }

    #[test]
    fn cancelled_is_never_tagged() {
        let err = Error::Cancelled.at_stage(0, StageKind::Match);
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn nested_keeps_inner_stage() {
        let inner = Error::TypeMismatch("x".into()).at_stage(1, StageKind::Project);
        let outer = inner.nested(0, StageKind::Facet);
        assert_eq!(
            outer.to_string(),
            "stage 0 ($facet) failed: stage 1 ($project) failed: type mismatch: x"
        );
    }
}
