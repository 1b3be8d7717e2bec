//! Error types shared by the learner and its collaborators.

use thiserror::Error;

use crate::persist::FormatError;

/// Errors raised by learner operations.
///
/// Parameter problems are only reported when the learner is configured; setting a
/// parameter never fails.
#[derive(Debug, Error)]
pub enum LearnerError {
    /// Malformed parameter key or value, or invalid feature metadata.
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// The requested combination of objective, booster, data and workers cannot work.
    #[error("incompatible configuration: {0}")]
    Compatibility(String),

    /// Training data violates a structural requirement (labels, weights, groups).
    #[error("invalid data: {0}")]
    Data(String),

    /// A model or configuration document is malformed.
    #[error("invalid model: {0}")]
    Model(String),

    /// A collective operation failed or a peer disappeared.
    #[error("collective operation failed: {0}")]
    Collective(String),

    /// Binary container could not be decoded.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// I/O error while reading or writing a model.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LearnerError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn compatibility(msg: impl Into<String>) -> Self {
        Self::Compatibility(msg.into())
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub(crate) fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = LearnerError> = std::result::Result<T, E>;
