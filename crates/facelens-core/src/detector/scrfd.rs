//! SCRFD face detector.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.

use super::{finalize, landmarks_from, nms, Detector, DetectorBackend, Overlap};
use crate::error::{FaceError, Result};
use crate::preprocess::{self, ChannelOrder, InputContract, Letterbox, Normalization, TensorLayout};
use crate::registry::ModelHandle;
use crate::types::{DetectedFace, Image};

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

const CONTRACT: InputContract = InputContract {
    width: SCRFD_INPUT_SIZE,
    height: SCRFD_INPUT_SIZE,
    order: ChannelOrder::Rgb,
    layout: TensorLayout::Nchw,
    normalization: Normalization::MeanStd {
        mean: [SCRFD_MEAN; 3],
        std: [SCRFD_STD; 3],
    },
};

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

pub struct ScrfdDetector {
    model: ModelHandle,
}

impl ScrfdDetector {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

impl Detector for ScrfdDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Scrfd
    }

    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>> {
        let rgb = image.to_rgb()?;
        let (boxed, letterbox) = preprocess::letterbox(&rgb, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE);
        let input = preprocess::to_tensor(&boxed, &CONTRACT);

        let outputs = self.model.run(&input)?;
        if outputs.len() < 9 {
            return Err(FaceError::Inference(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                outputs.len()
            )));
        }

        let names: Vec<String> = outputs.iter().map(|o| o.name.clone()).collect();
        let stride_indices = discover_output_indices(&names);

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = stride_indices[stride_pos];
            all_detections.extend(decode_stride(
                &outputs[score_idx].data,
                &outputs[bbox_idx].data,
                &outputs[kps_idx].data,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept = nms(all_detections, SCRFD_NMS_THRESHOLD, Overlap::Union);
        tracing::debug!(faces = kept.len(), "SCRFD detections");
        Ok(finalize(kept, image.width(), image.height()))
    }
}

/// Map output tensors to stride slots.
///
/// SCRFD exports either name their tensors ("score_8", "bbox_16", "kps_32", ...)
/// or use generic numeric names, in which case the standard positional order is
/// assumed: `[0-2]` scores, `[3-5]` boxes, `[6-8]` keypoints, each for strides 8/16/32.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level into source-image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<DetectedFace> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * s;
        let anchor_cy = (cell / grid) as f32 * s;

        // Distances from the anchor to each box side, in stride units.
        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = letterbox.unmap(anchor_cx - d[0] * s, anchor_cy - d[1] * s);
        let (x2, y2) = letterbox.unmap(anchor_cx + d[2] * s, anchor_cy + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            let point = |i: usize| letterbox.unmap(anchor_cx + k[i * 2] * s, anchor_cy + k[i * 2 + 1] * s);
            landmarks_from([point(0), point(1), point(2), point(3), point(4)])
        });

        detections.push(DetectedFace {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InferenceModel, ModelOutput};
    use crate::types::ColorSpace;
    use ndarray::Array4;
    use std::sync::Arc;

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices[0], (2, 0, 1));
        assert_eq!(indices[1], (5, 3, 4));
        assert_eq!(indices[2], (8, 6, 7));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_maps_through_letterbox() {
        // Source 320x160 letterboxed to 640: scale 2, pad_y 160.
        let letterbox = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 160.0 };
        let grid = 640 / 32;
        let mut scores = vec![0.0; grid * grid * 2];
        let mut bboxes = vec![0.0; grid * grid * 2 * 4];
        let kps = vec![0.0; grid * grid * 2 * 10];

        // Cell (x=5, y=10), first anchor: center (160, 320) in letterboxed space.
        let idx = (10 * grid + 5) * 2;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_stride(&scores, &bboxes, &kps, 32, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 64.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.y - 64.0).abs() < 1e-4, "y = {}", d.y);
        assert!((d.width - 32.0).abs() < 1e-4);
        assert!(d.landmarks.is_some());
    }

    /// Emits one confident face on stride 32 and nothing elsewhere.
    struct OneFace;

    impl InferenceModel for OneFace {
        fn run(&self, input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
            assert_eq!(input.shape(), &[1, 3, 640, 640]);
            let mut outputs = Vec::new();
            for prefix in ["score", "bbox", "kps"] {
                for stride in SCRFD_STRIDES {
                    let anchors = (640 / stride) * (640 / stride) * 2;
                    let width = match prefix {
                        "score" => 1,
                        "bbox" => 4,
                        _ => 10,
                    };
                    let mut data = vec![0.0; anchors * width];
                    if stride == 32 {
                        let idx = (10 * 20 + 10) * 2;
                        match prefix {
                            "score" => data[idx] = 0.8,
                            "bbox" => data[idx * 4..idx * 4 + 4].copy_from_slice(&[2.0, 2.0, 2.0, 2.0]),
                            _ => {}
                        }
                    }
                    outputs.push(ModelOutput::new(format!("{prefix}_{stride}"), vec![anchors, width], data));
                }
            }
            Ok(outputs)
        }
    }

    #[test]
    fn test_detect_end_to_end() {
        let detector = ScrfdDetector::new(Arc::new(OneFace));
        let img = Image::new(640, 640, ColorSpace::Rgb, vec![90; 640 * 640 * 3]);
        let faces = detector.detect(&img).unwrap();
        assert_eq!(faces.len(), 1);
        assert!((faces[0].x - 256.0).abs() < 1e-3);
        assert!((faces[0].width - 128.0).abs() < 1e-3);
        assert_eq!(faces[0].confidence, 0.8);
    }

    #[test]
    fn test_too_few_outputs() {
        struct Broken;
        impl InferenceModel for Broken {
            fn run(&self, _input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
                Ok(vec![ModelOutput::new("x", vec![1], vec![0.0])])
            }
        }
        let detector = ScrfdDetector::new(Arc::new(Broken));
        let img = Image::new(4, 4, ColorSpace::Gray, vec![0; 16]);
        assert!(matches!(detector.detect(&img), Err(FaceError::Inference(_))));
    }
}
