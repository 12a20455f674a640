//! Classical funnel-structured cascade detector on grayscale input.

use super::{finalize, Detector, DetectorBackend};
use crate::error::{FaceError, Result};
use crate::preprocess::{self, ChannelOrder, InputContract, Normalization, TensorLayout};
use crate::registry::ModelHandle;
use crate::types::{DetectedFace, Image};

/// Raw cascade scores at this value map to a confidence of 0.5.
const SCORE_MIDPOINT: f32 = 2.0;

pub struct CascadeDetector {
    model: ModelHandle,
}

impl CascadeDetector {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

impl Detector for CascadeDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Cascade
    }

    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>> {
        let rgb = image.to_rgb()?;
        let contract = InputContract {
            width: rgb.width(),
            height: rgb.height(),
            order: ChannelOrder::Gray,
            layout: TensorLayout::Nchw,
            normalization: Normalization::Raw,
        };
        let input = preprocess::to_tensor(&rgb, &contract);

        let outputs = self.model.run(&input)?;
        let raw = outputs
            .first()
            .ok_or_else(|| FaceError::Inference("cascade produced no outputs".into()))?;

        let faces: Vec<DetectedFace> = raw
            .data
            .chunks_exact(5)
            .map(|r| DetectedFace {
                x: r[0],
                y: r[1],
                width: r[2],
                height: r[3],
                confidence: confidence(r[4]),
                landmarks: None,
            })
            .collect();

        tracing::debug!(faces = faces.len(), "cascade detections");
        Ok(finalize(faces, image.width(), image.height()))
    }
}

/// Squash an unbounded cascade score into (0, 1).
fn confidence(score: f32) -> f32 {
    1.0 / (1.0 + (-(score - SCORE_MIDPOINT)).exp())
}
