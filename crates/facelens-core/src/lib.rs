//! facelens-core: face detection, alignment, embedding, verification and
//! attribute analysis over pretrained models.
//!
//! Models run through ONNX Runtime (plus a SeetaFace cascade for the
//! classical detector) and are cached per process in a [`ModelRegistry`].

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod distance;
pub mod embedder;
pub mod error;
pub mod pipeline;
pub mod preprocess;
pub mod registry;
pub mod thresholds;
pub mod types;

pub use analyzer::{AnalysisResult, Attribute, AttributeOutcome, Prediction};
pub use detector::{Detector, DetectorBackend};
pub use distance::DistanceMetric;
pub use embedder::{Embedder, EmbeddingModel};
pub use error::{ErrorKind, FaceError, Result};
pub use pipeline::{DetectOptions, FaceMatches, FacePipeline, GalleryEntry, Match, VerifyOptions};
pub use preprocess::Normalization;
pub use registry::{default_model_dir, ModelKey, ModelKind, ModelLoader, ModelRegistry, RegistryConfig};
pub use thresholds::ThresholdTable;
pub use types::{
    AlignedFace, ColorSpace, DetectedFace, Embedding, FacialArea, Image, Landmarks, Representation,
    VerificationResult,
};
