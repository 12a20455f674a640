//! Entry points of the face analysis pipeline.
//!
//! A [`FacePipeline`] owns a shared [`ModelRegistry`] and a threshold
//! table. Every operation is synchronous and safe to call from many
//! threads at once; models load lazily on first use.

use crate::alignment::align_face;
use crate::analyzer::{self, AnalysisResult, Attribute, AttributePredictor, ModelPredictor, PredictorSlot};
use crate::detector::{self, Detector, DetectorBackend};
use crate::distance::DistanceMetric;
use crate::embedder::{Embedder, EmbeddingModel, OnnxEmbedder};
use crate::error::{FaceError, Result};
use crate::preprocess::Normalization;
use crate::registry::ModelRegistry;
use crate::thresholds::ThresholdTable;
use crate::types::{
    AlignedFace, DetectedFace, Embedding, FacialArea, FacialAreas, Image, Representation, VerificationResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How faces are located and normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectOptions {
    pub backend: DetectorBackend,
    /// When false, an image without a detectable face is treated as one face.
    pub enforce_detection: bool,
    /// When false, faces are center-cropped even if landmarks are available.
    pub align: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            backend: DetectorBackend::default(),
            enforce_detection: true,
            align: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOptions {
    pub model: EmbeddingModel,
    pub metric: DistanceMetric,
    pub detection: DetectOptions,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            model: EmbeddingModel::VggFace,
            metric: DistanceMetric::Cosine,
            detection: DetectOptions::default(),
        }
    }
}

/// A labelled, precomputed embedding to search against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub label: String,
    pub distance: f32,
    pub threshold: f32,
}

/// Gallery matches for one probe face, closest first.
#[derive(Debug, Clone, Serialize)]
pub struct FaceMatches {
    pub facial_area: FacialArea,
    pub matches: Vec<Match>,
}

pub struct FacePipeline {
    registry: Arc<ModelRegistry>,
    thresholds: ThresholdTable,
}

impl FacePipeline {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            thresholds: ThresholdTable::default(),
        }
    }

    /// Replace the built-in threshold table.
    pub fn with_thresholds(mut self, thresholds: ThresholdTable) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    pub fn detector(&self, backend: DetectorBackend) -> Result<Box<dyn Detector>> {
        detector::build(backend, &self.registry)
    }

    /// Locate faces without aligning them.
    pub fn detect(&self, image: &Image, backend: DetectorBackend) -> Result<Vec<DetectedFace>> {
        image.validate()?;
        let faces = self.detector(backend)?.detect(image)?;
        tracing::debug!(%backend, faces = faces.len(), "detected faces");
        Ok(faces)
    }

    /// Detect every face and align each to `target` (`width`, `height`).
    ///
    /// With `enforce_detection` off, an image without faces yields the whole
    /// image as a single face with confidence 0.
    pub fn detect_and_align(&self, image: &Image, options: &DetectOptions, target: (u32, u32)) -> Result<Vec<AlignedFace>> {
        let rgb = image.to_rgb()?;
        let mut faces = self.detect(image, options.backend)?;

        if faces.is_empty() {
            if options.enforce_detection {
                return Err(FaceError::NoFaceDetected);
            }
            tracing::warn!(backend = %options.backend, "no face detected, using the whole image");
            faces.push(DetectedFace::whole_image(image.width(), image.height()));
        }

        Ok(faces
            .iter()
            .map(|face| align_face(&rgb, face, target, options.align))
            .collect())
    }

    fn embedder(&self, model: EmbeddingModel, normalization: Option<Normalization>) -> Result<OnnxEmbedder> {
        let handle = self.registry.get_or_load(&model.key())?;
        Ok(OnnxEmbedder::with_normalization(model, handle, normalization))
    }

    /// Embed one aligned face with the model's default normalization.
    pub fn represent(&self, face: &AlignedFace, model: EmbeddingModel) -> Result<Embedding> {
        self.represent_with(face, model, None)
    }

    pub fn represent_with(
        &self,
        face: &AlignedFace,
        model: EmbeddingModel,
        normalization: Option<Normalization>,
    ) -> Result<Embedding> {
        self.embedder(model, normalization)?.embed(face)
    }

    /// Detect, align and embed every face in `image`.
    pub fn represent_image(
        &self,
        image: &Image,
        model: EmbeddingModel,
        options: &DetectOptions,
    ) -> Result<Vec<Representation>> {
        let faces = self.detect_and_align(image, options, model.target_size())?;
        let embedder = self.embedder(model, None)?;
        faces
            .iter()
            .map(|face| {
                Ok(Representation {
                    embedding: embedder.embed(face)?,
                    facial_area: face.region,
                    confidence: face.confidence,
                })
            })
            .collect()
    }

    /// Same-identity decision for two images.
    ///
    /// Every face of `image_a` is compared with every face of `image_b`; the
    /// closest pair decides.
    pub fn verify(&self, image_a: &Image, image_b: &Image, options: &VerifyOptions) -> Result<VerificationResult> {
        // Fail on an unknown (model, metric) pair before running any model.
        self.thresholds.threshold(options.model, options.metric)?;

        let reps_a = self.represent_image(image_a, options.model, &options.detection)?;
        let reps_b = self.represent_image(image_b, options.model, &options.detection)?;

        let mut best: Option<(f32, FacialAreas)> = None;
        for a in &reps_a {
            for b in &reps_b {
                let d = a.embedding.distance(&b.embedding, options.metric)?;
                if best.map_or(true, |(current, _)| d < current) {
                    best = Some((
                        d,
                        FacialAreas {
                            img1: a.facial_area,
                            img2: b.facial_area,
                        },
                    ));
                }
            }
        }
        let (distance, areas) = best.ok_or(FaceError::NoFaceDetected)?;
        tracing::debug!(model = %options.model, metric = %options.metric, distance, "verified image pair");

        let mut result = self.thresholds.verify(distance, options.model, options.metric)?;
        result.detector_backend = Some(options.detection.backend);
        result.facial_areas = Some(areas);
        Ok(result)
    }

    /// Distance and decision for two precomputed embeddings of `model`.
    pub fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        model: EmbeddingModel,
        metric: DistanceMetric,
    ) -> Result<VerificationResult> {
        for embedding in [a, b] {
            if embedding.model != model {
                return Err(FaceError::IncompatibleEmbedding(format!(
                    "{} embedding used where {model} was requested",
                    embedding.model
                )));
            }
        }
        let distance = a.distance(b, metric)?;
        self.thresholds.verify(distance, model, metric)
    }

    /// Predict the requested attributes for every face. An empty request means all.
    pub fn analyze(&self, image: &Image, attributes: &[Attribute], options: &DetectOptions) -> Result<Vec<AnalysisResult>> {
        let requested: BTreeSet<Attribute> = if attributes.is_empty() {
            Attribute::ALL.into_iter().collect()
        } else {
            attributes.iter().copied().collect()
        };

        let faces = self.detect_and_align(image, options, analyzer::ANALYSIS_FACE_SIZE)?;

        let slots: Vec<PredictorSlot> = requested
            .into_iter()
            .map(|attribute| {
                let predictor = self
                    .registry
                    .get_or_load(&attribute.key())
                    .map(|handle| Box::new(ModelPredictor::new(attribute, handle)) as Box<dyn AttributePredictor>)
                    .map_err(|e| {
                        tracing::warn!(%attribute, error = %e, "attribute model unavailable");
                        e.to_string()
                    });
                (attribute, predictor)
            })
            .collect();

        Ok(faces.iter().map(|face| analyzer::analyze_face(face, &slots)).collect())
    }

    /// For each face in `image`, the gallery entries within the decision threshold.
    pub fn find(&self, image: &Image, gallery: &[GalleryEntry], options: &VerifyOptions) -> Result<Vec<FaceMatches>> {
        let threshold = self.thresholds.threshold(options.model, options.metric)?;
        let probes = self.represent_image(image, options.model, &options.detection)?;

        probes
            .iter()
            .map(|probe| {
                let mut matches = Vec::new();
                for entry in gallery {
                    let distance = probe.embedding.distance(&entry.embedding, options.metric)?;
                    if distance <= threshold {
                        matches.push(Match {
                            label: entry.label.clone(),
                            distance,
                            threshold,
                        });
                    }
                }
                matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
                Ok(FaceMatches {
                    facial_area: probe.facial_area,
                    matches,
                })
            })
            .collect()
    }
}
