//! Pixel preprocessing: resizing, letterboxing, padded crops and the
//! conversion of RGB buffers into model input tensors.

use crate::error::FaceError;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const VGGFACE_MEAN: [f32; 3] = [93.5940, 104.7624, 129.1863];
const VGGFACE2_MEAN: [f32; 3] = [91.4953, 103.8827, 131.0912];
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 128.0;

/// Channel order a model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
    /// Single luma channel (BT.601 weights).
    Gray,
}

impl ChannelOrder {
    fn channels(self) -> usize {
        match self {
            ChannelOrder::Gray => 1,
            ChannelOrder::Rgb | ChannelOrder::Bgr => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Pixel scaling applied after channel reordering. Inputs start in [0, 255].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// x / 255
    Base,
    /// x unchanged
    Raw,
    /// Per-image standardization.
    Facenet,
    /// x / 127.5 - 1
    Facenet2018,
    /// VGGFace1 per-channel mean subtraction.
    VggFace,
    /// VGGFace2 per-channel mean subtraction.
    VggFace2,
    /// (x - 127.5) / 128
    ArcFace,
    /// (x - mean[c]) / std[c], used by detector backends.
    #[serde(skip)]
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Normalization::Base => "base",
            Normalization::Raw => "raw",
            Normalization::Facenet => "facenet",
            Normalization::Facenet2018 => "facenet2018",
            Normalization::VggFace => "vggface",
            Normalization::VggFace2 => "vggface2",
            Normalization::ArcFace => "arcface",
            Normalization::MeanStd { .. } => "mean-std",
        };
        f.write_str(name)
    }
}

impl FromStr for Normalization {
    type Err = FaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(Normalization::Base),
            "raw" => Ok(Normalization::Raw),
            "facenet" => Ok(Normalization::Facenet),
            "facenet2018" => Ok(Normalization::Facenet2018),
            "vggface" => Ok(Normalization::VggFace),
            "vggface2" => Ok(Normalization::VggFace2),
            "arcface" => Ok(Normalization::ArcFace),
            other => Err(FaceError::UnsupportedConfiguration(format!(
                "unknown normalization '{other}'"
            ))),
        }
    }
}

/// Everything a model needs to know about its input tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputContract {
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
    pub layout: TensorLayout,
    pub normalization: Normalization,
}

/// Scale and padding applied by [`letterbox`], for mapping coordinates back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a point from letterboxed space back to the source image.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Resize to exactly `width` x `height`, ignoring aspect ratio.
pub fn resize_exact(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    imageops::resize(img, width, height, FilterType::Triangle)
}

/// Fit inside `width` x `height` preserving aspect ratio, centered on black padding.
pub fn letterbox(img: &RgbImage, width: u32, height: u32) -> (RgbImage, Letterbox) {
    if img.width() == width && img.height() == height {
        let identity = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        return (img.clone(), identity);
    }

    let scale_w = width as f32 / img.width() as f32;
    let scale_h = height as f32 / img.height() as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((img.width() as f32 * scale).round() as u32).clamp(1, width);
    let new_h = ((img.height() as f32 * scale).round() as u32).clamp(1, height);
    let pad_x = (width - new_w) / 2;
    let pad_y = (height - new_h) / 2;

    let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(width, height);
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Crop `[x, y, x + width, y + height)`, filling pixels outside the source with black.
pub fn crop_padded(img: &RgbImage, x: i64, y: i64, width: u32, height: u32) -> RgbImage {
    let mut out = RgbImage::new(width.max(1), height.max(1));
    let (src_w, src_h) = (img.width() as i64, img.height() as i64);
    for oy in 0..out.height() {
        let sy = y + oy as i64;
        if sy < 0 || sy >= src_h {
            continue;
        }
        for ox in 0..out.width() {
            let sx = x + ox as i64;
            if sx < 0 || sx >= src_w {
                continue;
            }
            out.put_pixel(ox, oy, *img.get_pixel(sx as u32, sy as u32));
        }
    }
    out
}

fn luma(px: &Rgb<u8>) -> f32 {
    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
}

/// Convert an RGB image into a `[1, C, H, W]` or `[1, H, W, C]` tensor.
///
/// The image is resized to the contract size first when it differs.
pub fn to_tensor(img: &RgbImage, contract: &InputContract) -> Array4<f32> {
    let resized;
    let img = if img.width() != contract.width || img.height() != contract.height {
        resized = resize_exact(img, contract.width, contract.height);
        &resized
    } else {
        img
    };

    let (w, h) = (contract.width as usize, contract.height as usize);
    let c = contract.order.channels();
    let shape = match contract.layout {
        TensorLayout::Nchw => (1, c, h, w),
        TensorLayout::Nhwc => (1, h, w, c),
    };
    let mut tensor = Array4::<f32>::zeros(shape);

    for (x, y, px) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let values = match contract.order {
            ChannelOrder::Rgb => [px[0] as f32, px[1] as f32, px[2] as f32],
            ChannelOrder::Bgr => [px[2] as f32, px[1] as f32, px[0] as f32],
            ChannelOrder::Gray => [luma(px), 0.0, 0.0],
        };
        for (ch, &v) in values.iter().take(c).enumerate() {
            let idx = match contract.layout {
                TensorLayout::Nchw => [0, ch, y, x],
                TensorLayout::Nhwc => [0, y, x, ch],
            };
            tensor[idx] = v;
        }
    }

    normalize(&mut tensor, contract.normalization, contract.layout);
    tensor
}

fn normalize(tensor: &mut Array4<f32>, normalization: Normalization, layout: TensorLayout) {
    let channel_axis = match layout {
        TensorLayout::Nchw => 1,
        TensorLayout::Nhwc => 3,
    };
    match normalization {
        Normalization::Raw => {}
        Normalization::Base => tensor.mapv_inplace(|v| v / 255.0),
        Normalization::Facenet2018 => tensor.mapv_inplace(|v| v / 127.5 - 1.0),
        Normalization::ArcFace => tensor.mapv_inplace(|v| (v - ARCFACE_MEAN) / ARCFACE_STD),
        Normalization::Facenet => {
            let n = tensor.len() as f32;
            let mean = tensor.sum() / n;
            let var = tensor.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            // Flat images have no spread; centre them instead of dividing by zero.
            let std = if var > f32::EPSILON { var.sqrt() } else { 1.0 };
            tensor.mapv_inplace(|v| (v - mean) / std);
        }
        Normalization::VggFace => per_channel(tensor, VGGFACE_MEAN, [1.0; 3], channel_axis),
        Normalization::VggFace2 => per_channel(tensor, VGGFACE2_MEAN, [1.0; 3], channel_axis),
        Normalization::MeanStd { mean, std } => per_channel(tensor, mean, std, channel_axis),
    }
}

fn per_channel(tensor: &mut Array4<f32>, mean: [f32; 3], std: [f32; 3], channel_axis: usize) {
    for ((_, c1, _, c3), v) in tensor.indexed_iter_mut() {
        let ch = if channel_axis == 1 { c1 } else { c3 }.min(2);
        *v = (*v - mean[ch]) / std[ch];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(order: ChannelOrder, layout: TensorLayout, normalization: Normalization) -> InputContract {
        InputContract {
            width: 4,
            height: 2,
            order,
            layout,
            normalization,
        }
    }

    #[test]
    fn test_tensor_shapes() {
        let img = RgbImage::from_pixel(4, 2, Rgb([10, 20, 30]));
        let nchw = to_tensor(&img, &contract(ChannelOrder::Rgb, TensorLayout::Nchw, Normalization::Raw));
        assert_eq!(nchw.shape(), &[1, 3, 2, 4]);
        let nhwc = to_tensor(&img, &contract(ChannelOrder::Gray, TensorLayout::Nhwc, Normalization::Raw));
        assert_eq!(nhwc.shape(), &[1, 2, 4, 1]);
    }

    #[test]
    fn test_bgr_order() {
        let img = RgbImage::from_pixel(4, 2, Rgb([10, 20, 30]));
        let t = to_tensor(&img, &contract(ChannelOrder::Bgr, TensorLayout::Nhwc, Normalization::Raw));
        assert_eq!(t[[0, 0, 0, 0]], 30.0);
        assert_eq!(t[[0, 1, 3, 2]], 10.0);
    }

    #[test]
    fn test_base_and_arcface_scaling() {
        let img = RgbImage::from_pixel(4, 2, Rgb([255, 127, 0]));
        let base = to_tensor(&img, &contract(ChannelOrder::Rgb, TensorLayout::Nchw, Normalization::Base));
        assert!((base[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(base[[0, 2, 1, 1]], 0.0);

        let arc = to_tensor(&img, &contract(ChannelOrder::Rgb, TensorLayout::Nchw, Normalization::ArcFace));
        assert!((arc[[0, 0, 0, 0]] - (255.0 - 127.5) / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_facenet_standardization() {
        let mut img = RgbImage::new(4, 2);
        for (x, _, px) in img.enumerate_pixels_mut() {
            *px = if x < 2 { Rgb([200, 200, 200]) } else { Rgb([20, 20, 20]) };
        }
        let t = to_tensor(&img, &contract(ChannelOrder::Rgb, TensorLayout::Nhwc, Normalization::Facenet));
        assert!((t.sum()).abs() < 1e-4);
        assert!((t[[0, 0, 0, 0]] - 1.0).abs() < 1e-5);
        assert!((t[[0, 0, 3, 0]] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_facenet_flat_image_is_finite() {
        let img = RgbImage::from_pixel(4, 2, Rgb([90, 90, 90]));
        let t = to_tensor(&img, &contract(ChannelOrder::Rgb, TensorLayout::Nhwc, Normalization::Facenet));
        assert!(t.iter().all(|v| v.is_finite() && v.abs() < 1e-6));
    }

    #[test]
    fn test_vggface_mean_follows_tensor_channel_index() {
        let img = RgbImage::from_pixel(4, 2, Rgb([100, 100, 100]));
        let t = to_tensor(&img, &contract(ChannelOrder::Bgr, TensorLayout::Nchw, Normalization::VggFace));
        assert!((t[[0, 0, 0, 0]] - (100.0 - VGGFACE_MEAN[0])).abs() < 1e-4);
        assert!((t[[0, 2, 0, 0]] - (100.0 - VGGFACE_MEAN[2])).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_pads_centered() {
        let img = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let (out, lb) = letterbox(&img, 100, 100);
        assert_eq!(out.dimensions(), (100, 100));
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_y, 25.0);
        assert_eq!(out.get_pixel(50, 5).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(50, 50).0, [255, 255, 255]);
        let (x, y) = lb.unmap(50.0, 50.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_padded_outside_is_black() {
        let img = RgbImage::from_pixel(10, 10, Rgb([50, 60, 70]));
        let crop = crop_padded(&img, -5, -5, 10, 10);
        assert_eq!(crop.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(crop.get_pixel(9, 9).0, [50, 60, 70]);
    }

    #[test]
    fn test_normalization_parse() {
        assert_eq!("ArcFace".parse::<Normalization>().unwrap(), Normalization::ArcFace);
        assert!("zscore".parse::<Normalization>().is_err());
    }
}
