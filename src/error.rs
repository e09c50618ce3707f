use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForecastError>;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("training data error: {reason}")]
    TrainingData { reason: String },

    #[error("schema mismatch: expected {expected}, found {found} ({detail})")]
    SchemaMismatch {
        expected: String,
        found: String,
        detail: String,
    },

    #[error("invalid input for `{field}`: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("no model artifact loaded")]
    NotReady,

    #[error("training cancelled")]
    Cancelled,

    #[error("artifact i/o failed for {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("artifact encoding failed: {0}")]
    ArtifactFormat(#[from] serde_json::Error),
}

impl ForecastError {
    pub fn training_data(reason: impl Into<String>) -> Self {
        Self::TrainingData {
            reason: reason.into(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn artifact_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Artifact {
            path: path.into(),
            source,
        }
    }

    /// Field name for request-level validation failures.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidInput { field, .. } => Some(field),
            _ => None,
        }
    }
}
