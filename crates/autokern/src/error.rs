use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::{BackendError, ContextId};
use crate::dtype::NumericType;
use crate::operation::OperationType;

#[derive(Debug, Error)]
pub enum TuneError {
    /// Malformed caller input or model description.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no selection model registered for {operation} / {dtype}")]
    ModelNotFound {
        operation: OperationType,
        dtype: NumericType,
    },

    #[error("expression batch belongs to {found}, but the model is bound to a queue on {expected}")]
    ContextMismatch {
        expected: ContextId,
        found: ContextId,
    },

    #[error("structural fingerprint exceeds {limit} characters")]
    FingerprintOverflow { limit: usize },

    #[error("failed to read model description {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed model description: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl TuneError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TuneError::InvalidArgument(message.into())
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, TuneError::InvalidArgument(_))
    }
}

pub type TuneResult<T> = Result<T, TuneError>;
