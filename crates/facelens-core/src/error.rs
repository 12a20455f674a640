//! Error taxonomy shared by every stage of the pipeline.

use crate::registry::ModelKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected (pass a face photo or disable enforce_detection)")]
    NoFaceDetected,
    #[error("incompatible embeddings: {0}")]
    IncompatibleEmbedding(String),
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("failed to load model {key}: {reason}")]
    ModelLoad { key: ModelKey, reason: String },
    #[error("indeterminate distance: {0}")]
    IndeterminateDistance(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Coarse classification of a [`FaceError`] for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidImage,
    NoFaceDetected,
    IncompatibleEmbedding,
    UnsupportedConfiguration,
    ModelLoad,
    IndeterminateDistance,
    Inference,
}

impl FaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FaceError::InvalidImage(_) => ErrorKind::InvalidImage,
            FaceError::NoFaceDetected => ErrorKind::NoFaceDetected,
            FaceError::IncompatibleEmbedding(_) => ErrorKind::IncompatibleEmbedding,
            FaceError::UnsupportedConfiguration(_) => ErrorKind::UnsupportedConfiguration,
            FaceError::ModelLoad { .. } => ErrorKind::ModelLoad,
            FaceError::IndeterminateDistance(_) => ErrorKind::IndeterminateDistance,
            FaceError::Inference(_) | FaceError::Ort(_) => ErrorKind::Inference,
        }
    }

    /// Whether the same request may succeed with relaxed detection settings.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FaceError::NoFaceDetected)
    }
}

pub type Result<T, E = FaceError> = std::result::Result<T, E>;
