//! YuNet anchor-free single-shot face detector.
//!
//! The network takes a raw BGR image whose sides are multiples of 32 and
//! emits, per stride, class and objectness scores, box offsets and five
//! keypoints for every grid cell.

use super::{finalize, landmarks_from, nms, output_named, Detector, DetectorBackend, Overlap};
use crate::error::Result;
use crate::preprocess::{self, ChannelOrder, InputContract, Normalization, TensorLayout};
use crate::registry::{ModelHandle, ModelOutput};
use crate::types::{DetectedFace, Image};

const YUNET_MAX_SIDE: u32 = 640;
const YUNET_DIVISOR: u32 = 32;
const YUNET_STRIDES: [usize; 3] = [8, 16, 32];
const YUNET_SCORE_THRESHOLD: f32 = 0.9;
const YUNET_NMS_THRESHOLD: f32 = 0.3;
const YUNET_TOP_K: usize = 5000;

pub struct YuNetDetector {
    model: ModelHandle,
}

impl YuNetDetector {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

impl Detector for YuNetDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::YuNet
    }

    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>> {
        let rgb = image.to_rgb()?;

        // Large inputs are shrunk so the longest side is at most 640; never upscaled.
        let longest = rgb.width().max(rgb.height());
        let scale = if longest > YUNET_MAX_SIDE {
            YUNET_MAX_SIDE as f32 / longest as f32
        } else {
            1.0
        };
        let w = ((rgb.width() as f32 * scale).round() as u32).max(1);
        let h = ((rgb.height() as f32 * scale).round() as u32).max(1);
        let resized = preprocess::resize_exact(&rgb, w, h);

        let pad_w = w.div_ceil(YUNET_DIVISOR) * YUNET_DIVISOR;
        let pad_h = h.div_ceil(YUNET_DIVISOR) * YUNET_DIVISOR;
        let padded = preprocess::crop_padded(&resized, 0, 0, pad_w, pad_h);

        let contract = InputContract {
            width: pad_w,
            height: pad_h,
            order: ChannelOrder::Bgr,
            layout: TensorLayout::Nchw,
            normalization: Normalization::Raw,
        };
        let input = preprocess::to_tensor(&padded, &contract);
        let outputs = self.model.run(&input)?;

        let mut candidates = Vec::new();
        for stride in YUNET_STRIDES {
            candidates.extend(decode_stride(&outputs, stride, pad_w as usize, pad_h as usize, scale)?);
        }
        candidates.truncate(YUNET_TOP_K);

        let kept = nms(candidates, YUNET_NMS_THRESHOLD, Overlap::Union);
        tracing::debug!(faces = kept.len(), "YuNet detections");
        Ok(finalize(kept, image.width(), image.height()))
    }
}

fn decode_stride(
    outputs: &[ModelOutput],
    stride: usize,
    width: usize,
    height: usize,
    scale: f32,
) -> Result<Vec<DetectedFace>> {
    let cls = &output_named(outputs, &format!("cls_{stride}"))?.data;
    let obj = &output_named(outputs, &format!("obj_{stride}"))?.data;
    let bbox = &output_named(outputs, &format!("bbox_{stride}"))?.data;
    let kps = &output_named(outputs, &format!("kps_{stride}"))?.data;

    let cols = width / stride;
    let rows = height / stride;
    let s = stride as f32;

    let mut detections = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            let idx = r * cols + c;
            let (Some(&cls_score), Some(&obj_score)) = (cls.get(idx), obj.get(idx)) else {
                continue;
            };
            let score = (cls_score.clamp(0.0, 1.0) * obj_score.clamp(0.0, 1.0)).sqrt();
            if score < YUNET_SCORE_THRESHOLD {
                continue;
            }
            let (Some(b), Some(k)) = (bbox.get(idx * 4..idx * 4 + 4), kps.get(idx * 10..idx * 10 + 10)) else {
                continue;
            };

            let cx = (c as f32 + b[0]) * s;
            let cy = (r as f32 + b[1]) * s;
            let w = b[2].exp() * s;
            let h = b[3].exp() * s;

            let point = |i: usize| {
                (
                    (k[i * 2] + c as f32) * s / scale,
                    (k[i * 2 + 1] + r as f32) * s / scale,
                )
            };

            detections.push(DetectedFace {
                x: (cx - w / 2.0) / scale,
                y: (cy - h / 2.0) / scale,
                width: w / scale,
                height: h / scale,
                confidence: score,
                landmarks: Some(landmarks_from([point(0), point(1), point(2), point(3), point(4)])),
            });
        }
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaceError;
    use crate::registry::InferenceModel;
    use crate::types::ColorSpace;
    use ndarray::Array4;
    use std::sync::{Arc, Mutex};

    /// Places one face at grid cell (2, 3) of stride 16 and records the input shape.
    struct Synthetic {
        shape: Mutex<Vec<usize>>,
    }

    impl InferenceModel for Synthetic {
        fn run(&self, input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
            *self.shape.lock().unwrap() = input.shape().to_vec();
            let (h, w) = (input.shape()[2], input.shape()[3]);
            let mut outputs = Vec::new();
            for stride in YUNET_STRIDES {
                let n = (h / stride) * (w / stride);
                let cols = w / stride;
                let mut cls = vec![0.0; n];
                let mut obj = vec![0.0; n];
                let mut bbox = vec![0.0; n * 4];
                let mut kps = vec![0.0; n * 10];
                if stride == 16 {
                    let idx = 3 * cols + 2;
                    cls[idx] = 0.95;
                    obj[idx] = 0.99;
                    bbox[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 1.0f32.ln(), 2.0f32.ln()]);
                    // Subject's right eye first, as YuNet reports it.
                    kps[idx * 10..idx * 10 + 4].copy_from_slice(&[0.2, 0.3, 0.8, 0.3]);
                }
                outputs.push(ModelOutput::new(format!("cls_{stride}"), vec![1, n, 1], cls));
                outputs.push(ModelOutput::new(format!("obj_{stride}"), vec![1, n, 1], obj));
                outputs.push(ModelOutput::new(format!("bbox_{stride}"), vec![1, n, 4], bbox));
                outputs.push(ModelOutput::new(format!("kps_{stride}"), vec![1, n, 10], kps));
            }
            Ok(outputs)
        }
    }

    #[test]
    fn test_input_is_padded_to_multiple_of_32() {
        let model = Arc::new(Synthetic { shape: Mutex::new(Vec::new()) });
        let detector = YuNetDetector::new(model.clone());
        let img = Image::new(100, 70, ColorSpace::Rgb, vec![0; 100 * 70 * 3]);
        detector.detect(&img).unwrap();
        assert_eq!(*model.shape.lock().unwrap(), vec![1, 3, 96, 128]);
    }

    #[test]
    fn test_decodes_box_and_landmarks() {
        let model = Arc::new(Synthetic { shape: Mutex::new(Vec::new()) });
        let detector = YuNetDetector::new(model);
        let img = Image::new(128, 128, ColorSpace::Rgb, vec![0; 128 * 128 * 3]);
        let faces = detector.detect(&img).unwrap();
        assert_eq!(faces.len(), 1);

        // Center (2.5 * 16, 3.5 * 16) = (40, 56), size 16 x 32.
        let f = &faces[0];
        assert!((f.x - 32.0).abs() < 1e-3, "x = {}", f.x);
        assert!((f.y - 40.0).abs() < 1e-3, "y = {}", f.y);
        assert!((f.width - 16.0).abs() < 1e-3);
        assert!((f.height - 32.0).abs() < 1e-3);
        assert!((f.confidence - (0.95f32 * 0.99).sqrt()).abs() < 1e-5);

        let lm = f.landmarks.unwrap();
        assert!((lm.left_eye.0 - 35.2).abs() < 1e-3);
        assert!((lm.right_eye.0 - 44.8).abs() < 1e-3);
        assert!(lm.left_eye.0 < lm.right_eye.0);
    }

    #[test]
    fn test_large_images_are_downscaled() {
        let model = Arc::new(Synthetic { shape: Mutex::new(Vec::new()) });
        let detector = YuNetDetector::new(model.clone());
        let img = Image::new(1280, 640, ColorSpace::Gray, vec![0; 1280 * 640]);
        let faces = detector.detect(&img).unwrap();
        assert_eq!(*model.shape.lock().unwrap(), vec![1, 3, 320, 640]);
        // Coordinates come back in source pixels.
        assert!((faces[0].x - 64.0).abs() < 1e-2, "x = {}", faces[0].x);
    }

    #[test]
    fn test_missing_output_is_inference_error() {
        struct Empty;
        impl InferenceModel for Empty {
            fn run(&self, _input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
                Ok(Vec::new())
            }
        }
        let detector = YuNetDetector::new(Arc::new(Empty));
        let img = Image::new(32, 32, ColorSpace::Gray, vec![0; 1024]);
        assert!(matches!(detector.detect(&img), Err(FaceError::Inference(_))));
    }
}
