//! Multitask cascaded CNN (MTCNN) detector.
//!
//! Three networks run in sequence:
//! - P-Net slides over an image pyramid and proposes candidate windows.
//! - R-Net rescores and refines 24x24 crops of the survivors.
//! - O-Net rescores 48x48 crops and regresses five landmarks.
//!
//! Inputs are RGB, NCHW, scaled as `(x - 127.5) / 128`. Each network
//! reports class probabilities on a 2-wide channel, box regression on a
//! 4-wide channel and (O-Net only) landmarks on a 10-wide channel laid
//! out as `[x1..x5, y1..y5]`.

use super::{finalize, landmarks_from, nms, Detector, DetectorBackend, Overlap};
use crate::error::{FaceError, Result};
use crate::preprocess::{self, ChannelOrder, InputContract, Normalization, TensorLayout};
use crate::registry::{ModelHandle, ModelOutput};
use crate::types::{DetectedFace, Image};
use image::RgbImage;

const MIN_FACE_SIZE: f32 = 20.0;
const SCALE_FACTOR: f32 = 0.709;
const THRESHOLDS: [f32; 3] = [0.6, 0.7, 0.7];
const PNET_CELL: f32 = 12.0;
const PNET_STRIDE: f32 = 2.0;
const RNET_SIZE: u32 = 24;
const ONET_SIZE: u32 = 48;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;

/// A candidate window with its pending box regression.
#[derive(Debug, Clone)]
struct Candidate {
    face: DetectedFace,
    reg: [f32; 4],
}

pub struct MtcnnDetector {
    pnet: ModelHandle,
    rnet: ModelHandle,
    onet: ModelHandle,
}

impl MtcnnDetector {
    pub fn new(pnet: ModelHandle, rnet: ModelHandle, onet: ModelHandle) -> Self {
        Self { pnet, rnet, onet }
    }

    fn proposals(&self, img: &RgbImage) -> Result<Vec<DetectedFace>> {
        let (w, h) = (img.width() as f32, img.height() as f32);
        let mut all = Vec::new();

        for scale in pyramid_scales(w.min(h)) {
            let sw = (w * scale).ceil() as u32;
            let sh = (h * scale).ceil() as u32;
            if sw < PNET_CELL as u32 || sh < PNET_CELL as u32 {
                continue;
            }
            let input = preprocess::to_tensor(&preprocess::resize_exact(img, sw, sh), &contract(sw, sh));
            let outputs = self.pnet.run(&input)?;
            let probs = by_channels(&outputs, 2)?;
            let reg = by_channels(&outputs, 4)?;

            let candidates = generate_boxes(probs, reg, scale, THRESHOLDS[0])?;
            let kept = nms_candidates(candidates, 0.5, Overlap::Union);
            all.extend(kept);
        }

        let all = nms_candidates(all, 0.7, Overlap::Union);
        Ok(all.into_iter().map(|c| square(regress(&c.face, c.reg))).collect())
    }

    fn refine(&self, img: &RgbImage, boxes: Vec<DetectedFace>) -> Result<Vec<DetectedFace>> {
        let mut candidates = Vec::new();
        for face in boxes {
            let outputs = self.rnet.run(&crop_tensor(img, &face, RNET_SIZE))?;
            let score = face_score(&outputs)?;
            if score > THRESHOLDS[1] {
                let reg = regression(by_channels(&outputs, 4)?)?;
                candidates.push(Candidate {
                    face: DetectedFace { confidence: score, ..face },
                    reg,
                });
            }
        }
        let kept = nms_candidates(candidates, 0.7, Overlap::Union);
        Ok(kept.into_iter().map(|c| square(regress(&c.face, c.reg))).collect())
    }

    fn output(&self, img: &RgbImage, boxes: Vec<DetectedFace>) -> Result<Vec<DetectedFace>> {
        let mut faces = Vec::new();
        for face in boxes {
            let outputs = self.onet.run(&crop_tensor(img, &face, ONET_SIZE))?;
            let score = face_score(&outputs)?;
            if score <= THRESHOLDS[2] {
                continue;
            }
            let reg = regression(by_channels(&outputs, 4)?)?;
            let lm = &by_channels(&outputs, 10)?.data;
            if lm.len() < 10 {
                return Err(FaceError::Inference("MTCNN landmark output is too short".into()));
            }

            let (bw, bh) = (face.width + 1.0, face.height + 1.0);
            let point = |i: usize| (bw * lm[i] + face.x - 1.0, bh * lm[i + 5] + face.y - 1.0);
            let landmarks = landmarks_from([point(0), point(1), point(2), point(3), point(4)]);

            let mut refined = regress(&face, reg);
            refined.confidence = score;
            refined.landmarks = Some(landmarks);
            faces.push(refined);
        }
        Ok(nms(faces, 0.7, Overlap::Min))
    }
}

impl Detector for MtcnnDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Mtcnn
    }

    fn detect(&self, image: &Image) -> Result<Vec<DetectedFace>> {
        let rgb = image.to_rgb()?;

        let stage1 = self.proposals(&rgb)?;
        let stage2 = if stage1.is_empty() { stage1 } else { self.refine(&rgb, stage1)? };
        let stage3 = if stage2.is_empty() { stage2 } else { self.output(&rgb, stage2)? };

        tracing::debug!(faces = stage3.len(), "MTCNN detections");
        Ok(finalize(stage3, image.width(), image.height()))
    }
}

fn contract(width: u32, height: u32) -> InputContract {
    InputContract {
        width,
        height,
        order: ChannelOrder::Rgb,
        layout: TensorLayout::Nchw,
        normalization: Normalization::MeanStd {
            mean: [MEAN; 3],
            std: [STD; 3],
        },
    }
}

/// Pyramid scales mapping `MIN_FACE_SIZE` onto the 12 px P-Net cell.
fn pyramid_scales(min_side: f32) -> Vec<f32> {
    let m = PNET_CELL / MIN_FACE_SIZE;
    let mut min_l = min_side * m;
    let mut scales = Vec::new();
    let mut factor = 1.0;
    while min_l >= PNET_CELL {
        scales.push(m * factor);
        factor *= SCALE_FACTOR;
        min_l *= SCALE_FACTOR;
    }
    scales
}

/// Find the output whose channel axis (axis 1) has `channels` entries.
fn by_channels(outputs: &[ModelOutput], channels: usize) -> Result<&ModelOutput> {
    outputs
        .iter()
        .find(|o| o.shape.get(1) == Some(&channels))
        .ok_or_else(|| FaceError::Inference(format!("MTCNN output with {channels} channels not found")))
}

/// Face probability of a single-crop R-Net or O-Net run.
fn face_score(outputs: &[ModelOutput]) -> Result<f32> {
    by_channels(outputs, 2)?
        .data
        .get(1)
        .copied()
        .ok_or_else(|| FaceError::Inference("MTCNN probability output is too short".into()))
}

fn regression(reg: &ModelOutput) -> Result<[f32; 4]> {
    reg.data
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| FaceError::Inference("MTCNN regression output is too short".into()))
}

/// Turn a P-Net probability map into candidate windows in source coordinates.
fn generate_boxes(probs: &ModelOutput, reg: &ModelOutput, scale: f32, threshold: f32) -> Result<Vec<Candidate>> {
    let (&map_h, &map_w) = match (probs.shape.get(2), probs.shape.get(3)) {
        (Some(h), Some(w)) => (h, w),
        _ => return Err(FaceError::Inference(format!("P-Net map has shape {:?}", probs.shape))),
    };
    let plane = map_h * map_w;
    if probs.data.len() < 2 * plane || reg.data.len() < 4 * plane {
        return Err(FaceError::Inference("P-Net outputs are truncated".into()));
    }

    let mut out = Vec::new();
    for y in 0..map_h {
        for x in 0..map_w {
            let i = y * map_w + x;
            let score = probs.data[plane + i];
            if score < threshold {
                continue;
            }
            let x1 = ((PNET_STRIDE * x as f32 + 1.0) / scale).floor();
            let y1 = ((PNET_STRIDE * y as f32 + 1.0) / scale).floor();
            let x2 = ((PNET_STRIDE * x as f32 + PNET_CELL) / scale).floor();
            let y2 = ((PNET_STRIDE * y as f32 + PNET_CELL) / scale).floor();
            out.push(Candidate {
                face: DetectedFace {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks: None,
                },
                reg: std::array::from_fn(|k| reg.data[k * plane + i]),
            });
        }
    }
    Ok(out)
}

fn nms_candidates(candidates: Vec<Candidate>, threshold: f32, mode: Overlap) -> Vec<Candidate> {
    let kept = nms(candidates.iter().map(|c| c.face.clone()).collect(), threshold, mode);
    // NMS keeps values, not indices; match survivors back to their regressions.
    kept.into_iter()
        .filter_map(|face| candidates.iter().find(|c| c.face == face).cloned())
        .collect()
}

/// Apply box regression offsets, scaled by the box's inclusive size.
fn regress(face: &DetectedFace, reg: [f32; 4]) -> DetectedFace {
    let w = face.width + 1.0;
    let h = face.height + 1.0;
    let x1 = face.x + reg[0] * w;
    let y1 = face.y + reg[1] * h;
    let x2 = face.x + face.width + reg[2] * w;
    let y2 = face.y + face.height + reg[3] * h;
    DetectedFace {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
        ..face.clone()
    }
}

/// Grow a box to a square around its center.
fn square(face: DetectedFace) -> DetectedFace {
    let side = face.width.max(face.height);
    DetectedFace {
        x: face.x + face.width * 0.5 - side * 0.5,
        y: face.y + face.height * 0.5 - side * 0.5,
        width: side,
        height: side,
        ..face
    }
}

fn crop_tensor(img: &RgbImage, face: &DetectedFace, size: u32) -> ndarray::Array4<f32> {
    let w = (face.width.round() as u32).max(1);
    let h = (face.height.round() as u32).max(1);
    let crop = preprocess::crop_padded(img, face.x.round() as i64, face.y.round() as i64, w, h);
    preprocess::to_tensor(&crop, &contract(size, size))
}
