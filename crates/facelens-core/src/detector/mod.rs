//! Face detector backends.
//!
//! Every backend turns an [`Image`] into [`DetectedFace`]s in source pixel
//! coordinates, clipped to the image and sorted by descending confidence.
//! Backends differ only in speed, quality and whether they report landmarks.

pub mod cascade;
pub mod mtcnn;
pub mod scrfd;
pub mod ssd;
pub mod yunet;

use crate::error::{FaceError, Result};
use crate::registry::{ModelKey, ModelKind, ModelOutput, ModelRegistry};
use crate::types::{DetectedFace, Image, Landmarks};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use cascade::CascadeDetector;
pub use mtcnn::MtcnnDetector;
pub use scrfd::ScrfdDetector;
pub use ssd::SsdDetector;
pub use yunet::YuNetDetector;

/// Selectable detector backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    /// SeetaFace funnel cascade on grayscale input. Boxes only.
    #[default]
    Cascade,
    /// ResNet-10 single shot multibox detector. Boxes only.
    Ssd,
    /// Three-stage multitask CNN. Boxes and five landmarks.
    Mtcnn,
    /// Anchor-free single-shot detector. Boxes and five landmarks.
    YuNet,
    /// Anchor-free SCRFD. Boxes and five landmarks.
    Scrfd,
    /// No detection; the whole image is the face.
    Skip,
}

impl DetectorBackend {
    pub const ALL: [DetectorBackend; 6] = [
        DetectorBackend::Cascade,
        DetectorBackend::Ssd,
        DetectorBackend::Mtcnn,
        DetectorBackend::YuNet,
        DetectorBackend::Scrfd,
        DetectorBackend::Skip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DetectorBackend::Cascade => "cascade",
            DetectorBackend::Ssd => "ssd",
            DetectorBackend::Mtcnn => "mtcnn",
            DetectorBackend::YuNet => "yunet",
            DetectorBackend::Scrfd => "scrfd",
            DetectorBackend::Skip => "skip",
        }
    }

    /// Whether the backend reports five-point landmarks.
    pub fn has_landmarks(self) -> bool {
        matches!(
            self,
            DetectorBackend::Mtcnn | DetectorBackend::YuNet | DetectorBackend::Scrfd
        )
    }

    /// Registry keys of the models this backend needs.
    pub fn model_keys(self) -> Vec<ModelKey> {
        let key = |variant| ModelKey::new(ModelKind::Detector, variant);
        match self {
            DetectorBackend::Cascade => vec![key("cascade")],
            DetectorBackend::Ssd => vec![key("ssd")],
            DetectorBackend::Mtcnn => vec![key("mtcnn-pnet"), key("mtcnn-rnet"), key("mtcnn-onet")],
            DetectorBackend::YuNet => vec![key("yunet")],
            DetectorBackend::Scrfd => vec![key("scrfd")],
            DetectorBackend::Skip => Vec::new(),
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorBackend {
    type Err = FaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cascade" | "opencv" => Ok(DetectorBackend::Cascade),
            "ssd" => Ok(DetectorBackend::Ssd),
            "mtcnn" => Ok(DetectorBackend::Mtcnn),
            "yunet" => Ok(DetectorBackend::YuNet),
            "scrfd" => Ok(DetectorBackend::Scrfd),
            "skip" => Ok(DetectorBackend::Skip),
            other => Err(FaceError::UnsupportedConfiguration(format!(
                "unknown detector backend '{other}'"
            ))),
        }
    }
}

/// Locates faces in an image.
pub trait Detector: Send + Sync {
    fn backend(&self) -> DetectorBackend;

    /// Returns an empty vector when the image is valid but holds no face.
    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>>;
}

/// Treats the whole image as one face.
pub struct SkipDetector;

impl Detector for SkipDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Skip
    }

    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>> {
        image.validate()?;
        Ok(vec![DetectedFace::whole_image(image.width(), image.height())])
    }
}

/// Build a detector for `backend`, loading its models through `registry`.
pub fn build(backend: DetectorBackend, registry: &ModelRegistry) -> Result<Box<dyn Detector>> {
    let mut handles = backend
        .model_keys()
        .iter()
        .map(|key| registry.get_or_load(key))
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let mut next = || {
        handles
            .next()
            .ok_or_else(|| FaceError::UnsupportedConfiguration(format!("{backend} is missing a model")))
    };

    let detector: Box<dyn Detector> = match backend {
        DetectorBackend::Cascade => Box::new(CascadeDetector::new(next()?)),
        DetectorBackend::Ssd => Box::new(SsdDetector::new(next()?)),
        DetectorBackend::Mtcnn => Box::new(MtcnnDetector::new(next()?, next()?, next()?)),
        DetectorBackend::YuNet => Box::new(YuNetDetector::new(next()?)),
        DetectorBackend::Scrfd => Box::new(ScrfdDetector::new(next()?)),
        DetectorBackend::Skip => Box::new(SkipDetector),
    };
    Ok(detector)
}

/// Overlap measure used by [`nms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overlap {
    /// Intersection over union.
    Union,
    /// Intersection over the smaller box.
    Min,
}

/// Non-maximum suppression: keep the best of every overlapping cluster.
pub(crate) fn nms(mut detections: Vec<DetectedFace>, threshold: f32, mode: Overlap) -> Vec<DetectedFace> {
    sort_by_confidence(&mut detections);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && overlap(&detections[i], &detections[j], mode) > threshold {
                suppressed[j] = true;
            }
        }
        keep.push(detections[i].clone());
    }

    keep
}

pub(crate) fn overlap(a: &DetectedFace, b: &DetectedFace, mode: Overlap) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = a.width * a.height;
    let area_b = b.width * b.height;
    let denom = match mode {
        Overlap::Union => area_a + area_b - inter,
        Overlap::Min => area_a.min(area_b),
    };

    if denom > 0.0 {
        inter / denom
    } else {
        0.0
    }
}

pub(crate) fn sort_by_confidence(detections: &mut [DetectedFace]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Clip every box to the image, drop empty ones, sort by confidence.
pub(crate) fn finalize(detections: Vec<DetectedFace>, width: u32, height: u32) -> Vec<DetectedFace> {
    let mut out: Vec<DetectedFace> = detections
        .into_iter()
        .filter_map(|d| d.clip_to(width, height))
        .collect();
    sort_by_confidence(&mut out);
    out
}

/// Build landmarks from five points, ordering each eye and mouth pair by x.
pub(crate) fn landmarks_from(points: [(f32, f32); 5]) -> Landmarks {
    let [mut le, mut re, nose, mut ml, mut mr] = points;
    if le.0 > re.0 {
        std::mem::swap(&mut le, &mut re);
    }
    if ml.0 > mr.0 {
        std::mem::swap(&mut ml, &mut mr);
    }
    Landmarks::from_points([le, re, nose, ml, mr])
}

/// Look up a model output by exact name.
pub(crate) fn output_named<'a>(outputs: &'a [ModelOutput], name: &str) -> Result<&'a ModelOutput> {
    outputs
        .iter()
        .find(|o| o.name == name)
        .ok_or_else(|| FaceError::Inference(format!("model has no output named {name}")))
}
