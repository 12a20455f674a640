use crate::detector::DetectorBackend;
use crate::distance::{self, DistanceMetric};
use crate::embedder::EmbeddingModel;
use crate::error::{FaceError, Result};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Channel layout of an [`Image`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Gray,
    Rgb,
    Bgr,
    /// Recognised so callers get a precise error; not accepted by the pipeline.
    Rgba,
}

impl ColorSpace {
    pub fn channels(self) -> usize {
        match self {
            ColorSpace::Gray => 1,
            ColorSpace::Rgb | ColorSpace::Bgr => 3,
            ColorSpace::Rgba => 4,
        }
    }
}

/// A decoded, row-major, interleaved pixel buffer.
///
/// Construction never fails; structural checks run when the image enters the
/// pipeline so that malformed input surfaces as [`FaceError::InvalidImage`].
#[derive(Debug, Clone)]
pub struct Image {
    data: Vec<u8>,
    width: u32,
    height: u32,
    color: ColorSpace,
}

impl Image {
    pub fn new(width: u32, height: u32, color: ColorSpace, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            color,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color(&self) -> ColorSpace {
        self.color
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Check dimensions, channel count and buffer length.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FaceError::InvalidImage(format!(
                "image has a zero dimension ({}x{})",
                self.width, self.height
            )));
        }
        let channels = self.color.channels();
        if channels != 1 && channels != 3 {
            return Err(FaceError::InvalidImage(format!(
                "unsupported channel count {channels}; expected 1 or 3"
            )));
        }
        let expected = self.width as usize * self.height as usize * channels;
        if self.data.len() != expected {
            return Err(FaceError::InvalidImage(format!(
                "buffer holds {} bytes, expected {expected} for {}x{}x{channels}",
                self.data.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    /// Validate and convert into an owned RGB buffer.
    pub fn to_rgb(&self) -> Result<RgbImage> {
        self.validate()?;
        let pixels = self.width as usize * self.height as usize;
        let mut rgb = Vec::with_capacity(pixels * 3);
        match self.color {
            ColorSpace::Gray => {
                for &y in &self.data {
                    rgb.extend_from_slice(&[y, y, y]);
                }
            }
            ColorSpace::Rgb => rgb.extend_from_slice(&self.data),
            ColorSpace::Bgr => {
                for px in self.data.chunks_exact(3) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            ColorSpace::Rgba => {
                return Err(FaceError::InvalidImage("RGBA input must be flattened to RGB".into()))
            }
        }
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| FaceError::InvalidImage("pixel buffer does not match dimensions".into()))
    }
}

impl From<DynamicImage> for Image {
    fn from(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        match img {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLuma16(_) => {
                Image::new(width, height, ColorSpace::Gray, img.into_luma8().into_raw())
            }
            other => Image::new(width, height, ColorSpace::Rgb, other.into_rgb8().into_raw()),
        }
    }
}

/// Five named facial landmarks in source-image pixel coordinates.
///
/// `left_eye` is the eye with the smaller x coordinate in the image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
    pub nose: (f32, f32),
    pub mouth_left: (f32, f32),
    pub mouth_right: (f32, f32),
}

impl Landmarks {
    /// Build from `[left_eye, right_eye, nose, mouth_left, mouth_right]`.
    pub fn from_points(points: [(f32, f32); 5]) -> Self {
        Self {
            left_eye: points[0],
            right_eye: points[1],
            nose: points[2],
            mouth_left: points[3],
            mouth_right: points[4],
        }
    }

    pub fn points(&self) -> [(f32, f32); 5] {
        [
            self.left_eye,
            self.right_eye,
            self.nose,
            self.mouth_left,
            self.mouth_right,
        ]
    }

    /// Angle of the eye line in radians, positive when the right eye is lower.
    pub fn eye_angle(&self) -> f32 {
        let dx = self.right_eye.0 - self.left_eye.0;
        let dy = self.right_eye.1 - self.left_eye.1;
        dy.atan2(dx)
    }
}

/// A face located by a detector backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl DetectedFace {
    /// The whole image treated as a single face region.
    pub fn whole_image(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 0.0,
            landmarks: None,
        }
    }

    pub fn area(&self) -> FacialArea {
        FacialArea {
            x: self.x.max(0.0).round() as u32,
            y: self.y.max(0.0).round() as u32,
            w: self.width.max(0.0).round() as u32,
            h: self.height.max(0.0).round() as u32,
        }
    }

    /// `[x1, y1, x2, y2]`.
    pub(crate) fn corners(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    /// Clip the box to the image; `None` when nothing of it remains.
    pub(crate) fn clip_to(mut self, width: u32, height: u32) -> Option<Self> {
        let [x1, y1, x2, y2] = self.corners();
        let x1 = x1.clamp(0.0, width as f32);
        let y1 = y1.clamp(0.0, height as f32);
        let x2 = x2.clamp(0.0, width as f32);
        let y2 = y2.clamp(0.0, height as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        self.x = x1;
        self.y = y1;
        self.width = x2 - x1;
        self.height = y2 - y1;
        Some(self)
    }
}

/// Integer face region as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// A normalized face crop sized for one model's input contract.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub pixels: RgbImage,
    pub region: FacialArea,
    pub confidence: f32,
}

impl AlignedFace {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Face embedding tagged with the model variant that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model: EmbeddingModel,
}

impl Embedding {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Distance to another embedding of the same model variant.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> Result<f32> {
        if self.model != other.model {
            return Err(FaceError::IncompatibleEmbedding(format!(
                "{} embedding compared with {} embedding",
                self.model, other.model
            )));
        }
        distance::distance(&self.values, &other.values, metric)
    }
}

/// One embedding per face found in an image.
#[derive(Debug, Clone, Serialize)]
pub struct Representation {
    pub embedding: Embedding,
    pub facial_area: FacialArea,
    pub confidence: f32,
}

/// Winning face regions of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FacialAreas {
    pub img1: FacialArea,
    pub img2: FacialArea,
}

/// Outcome of a same-identity decision.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub distance: f32,
    pub threshold: f32,
    pub model: EmbeddingModel,
    pub metric: DistanceMetric,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector_backend: Option<DetectorBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facial_areas: Option<FacialAreas>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sized_image_is_invalid() {
        let img = Image::new(0, 0, ColorSpace::Rgb, vec![]);
        assert!(matches!(img.validate(), Err(FaceError::InvalidImage(_))));
    }

    #[test]
    fn test_rgba_is_rejected() {
        let img = Image::new(2, 2, ColorSpace::Rgba, vec![0; 16]);
        let err = img.validate().unwrap_err();
        assert!(err.to_string().contains("channel count 4"), "{err}");
    }

    #[test]
    fn test_buffer_length_mismatch() {
        let img = Image::new(4, 4, ColorSpace::Rgb, vec![0; 10]);
        assert!(matches!(img.validate(), Err(FaceError::InvalidImage(_))));
    }

    #[test]
    fn test_bgr_to_rgb_swaps_channels() {
        let img = Image::new(1, 1, ColorSpace::Bgr, vec![10, 20, 30]);
        let rgb = img.to_rgb().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_gray_to_rgb_replicates() {
        let img = Image::new(2, 1, ColorSpace::Gray, vec![7, 200]);
        let rgb = img.to_rgb().unwrap();
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_from_dynamic_gray_keeps_single_channel() {
        let gray = image::GrayImage::from_pixel(3, 2, image::Luma([9]));
        let img = Image::from(DynamicImage::ImageLuma8(gray));
        assert_eq!(img.color(), ColorSpace::Gray);
        assert_eq!(img.data().len(), 6);
    }

    #[test]
    fn test_clip_partially_outside() {
        let face = DetectedFace {
            x: -10.0,
            y: 5.0,
            width: 30.0,
            height: 100.0,
            confidence: 0.9,
            landmarks: None,
        };
        let clipped = face.clip_to(50, 50).unwrap();
        assert_eq!(clipped.x, 0.0);
        assert_eq!(clipped.width, 20.0);
        assert_eq!(clipped.height, 45.0);
    }

    #[test]
    fn test_clip_fully_outside() {
        let face = DetectedFace {
            x: 100.0,
            y: 100.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert!(face.clip_to(50, 50).is_none());
    }

    #[test]
    fn test_eye_angle() {
        let lm = Landmarks::from_points([(0.0, 0.0), (10.0, 10.0), (5.0, 8.0), (2.0, 12.0), (8.0, 12.0)]);
        assert!((lm.eye_angle() - std::f32::consts::FRAC_PI_4).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_model_mismatch() {
        let a = Embedding { values: vec![1.0; 128], model: EmbeddingModel::Facenet };
        let b = Embedding { values: vec![1.0; 128], model: EmbeddingModel::OpenFace };
        assert!(matches!(
            a.distance(&b, DistanceMetric::Cosine),
            Err(FaceError::IncompatibleEmbedding(_))
        ));
    }
}
