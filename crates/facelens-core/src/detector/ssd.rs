//! ResNet-10 SSD face detector (300x300 input, Caffe-style preprocessing).
//!
//! Output is a `[1, 1, N, 7]` tensor of
//! `[image_id, label, confidence, x1, y1, x2, y2]` rows with corner
//! coordinates normalized to [0, 1].

use super::{finalize, Detector, DetectorBackend};
use crate::error::{FaceError, Result};
use crate::preprocess::{self, ChannelOrder, InputContract, Normalization, TensorLayout};
use crate::registry::ModelHandle;
use crate::types::{DetectedFace, Image};

const SSD_INPUT_SIZE: u32 = 300;
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
const SSD_CONFIDENCE_THRESHOLD: f32 = 0.90;
const SSD_FACE_LABEL: f32 = 1.0;
const SSD_ROW_LEN: usize = 7;

const CONTRACT: InputContract = InputContract {
    width: SSD_INPUT_SIZE,
    height: SSD_INPUT_SIZE,
    order: ChannelOrder::Bgr,
    layout: TensorLayout::Nchw,
    normalization: Normalization::MeanStd {
        mean: SSD_MEAN_BGR,
        std: [1.0; 3],
    },
};

pub struct SsdDetector {
    model: ModelHandle,
}

impl SsdDetector {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

impl Detector for SsdDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Ssd
    }

    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>> {
        let rgb = image.to_rgb()?;
        let input = preprocess::to_tensor(&rgb, &CONTRACT);

        let outputs = self.model.run(&input)?;
        let raw = outputs
            .first()
            .ok_or_else(|| FaceError::Inference("SSD produced no outputs".into()))?;
        if raw.data.len() % SSD_ROW_LEN != 0 {
            return Err(FaceError::Inference(format!(
                "SSD output length {} is not a multiple of {SSD_ROW_LEN}",
                raw.data.len()
            )));
        }

        let faces = decode(&raw.data, image.width() as f32, image.height() as f32);
        tracing::debug!(faces = faces.len(), "SSD detections");
        Ok(finalize(faces, image.width(), image.height()))
    }
}

fn decode(rows: &[f32], width: f32, height: f32) -> Vec<DetectedFace> {
    rows.chunks_exact(SSD_ROW_LEN)
        .filter(|r| r[1] == SSD_FACE_LABEL && r[2] >= SSD_CONFIDENCE_THRESHOLD)
        .map(|r| {
            let (x1, y1) = (r[3] * width, r[4] * height);
            let (x2, y2) = (r[5] * width, r[6] * height);
            DetectedFace {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: r[2],
                landmarks: None,
            }
        })
        .collect()
}
