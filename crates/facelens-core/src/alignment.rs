//! Face alignment into a model's canonical input size.
//!
//! With landmarks, the detection box is rotated about its center until the
//! eye line is horizontal, then scaled to fit the target while preserving
//! aspect ratio. Without landmarks (or with alignment disabled) the box is
//! expanded by a small symmetric margin, clipped to the image, cropped and
//! letterboxed. Either way the output is exactly the target size, with
//! black padding wherever the box does not cover the canvas.

use crate::preprocess;
use crate::types::{AlignedFace, DetectedFace, Landmarks};
use image::{Rgb, RgbImage};

/// Margin added on each side of a box before a plain crop, as a fraction of its size.
const CROP_MARGIN: f32 = 0.05;

/// Align one detected face into a `target` (`width`, `height`) crop.
pub fn align_face(image: &RgbImage, face: &DetectedFace, target: (u32, u32), align: bool) -> AlignedFace {
    let (tw, th) = (target.0.max(1), target.1.max(1));
    let pixels = match (&face.landmarks, align) {
        (Some(landmarks), true) => rotate_crop(image, face, landmarks, tw, th),
        _ => margin_crop(image, face, tw, th),
    };
    AlignedFace {
        pixels,
        region: face.area(),
        confidence: face.confidence,
    }
}

fn margin_crop(image: &RgbImage, face: &DetectedFace, tw: u32, th: u32) -> RgbImage {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x1 = (face.x - mx).max(0.0).floor();
    let y1 = (face.y - my).max(0.0).floor();
    let x2 = (face.x + face.width + mx).min(image.width() as f32).ceil();
    let y2 = (face.y + face.height + my).min(image.height() as f32).ceil();

    let w = ((x2 - x1) as u32).max(1);
    let h = ((y2 - y1) as u32).max(1);
    let crop = preprocess::crop_padded(image, x1 as i64, y1 as i64, w, h);
    preprocess::letterbox(&crop, tw, th).0
}

/// Rotate the box about its center by the eye angle and fit it into `tw` x `th`.
///
/// Each output pixel is mapped back into box-local coordinates, then through
/// the rotation into the source image, and sampled bilinearly. Samples that
/// fall outside the box or the image are black.
fn rotate_crop(image: &RgbImage, face: &DetectedFace, landmarks: &Landmarks, tw: u32, th: u32) -> RgbImage {
    let angle = landmarks.eye_angle();
    let (sin, cos) = angle.sin_cos();

    let (bw, bh) = (face.width.max(1.0), face.height.max(1.0));
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let scale = (tw as f32 / bw).min(th as f32 / bh);
    let (ocx, ocy) = (tw as f32 / 2.0, th as f32 / 2.0);
    let (half_w, half_h) = (bw / 2.0, bh / 2.0);

    let (src_w, src_h) = (image.width() as i64, image.height() as i64);
    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < src_w && y >= 0 && y < src_h {
            let Rgb(p) = *image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let mut out = RgbImage::new(tw, th);
    for (ox, oy, px) in out.enumerate_pixels_mut() {
        // Pixel centers, so a 1:1 unrotated mapping is exact.
        let u = (ox as f32 + 0.5 - ocx) / scale;
        let v = (oy as f32 + 0.5 - ocy) / scale;
        if u.abs() > half_w || v.abs() > half_h {
            continue;
        }

        let sx = cx + cos * u - sin * v - 0.5;
        let sy = cy + sin * u + cos * v - 0.5;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let (tl, tr) = (sample(x0, y0), sample(x0 + 1, y0));
        let (bl, br) = (sample(x0, y0 + 1), sample(x0 + 1, y0 + 1));
        for c in 0..3 {
            let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            px.0[c] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32, landmarks: Option<Landmarks>) -> DetectedFace {
        DetectedFace {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.97,
            landmarks,
        }
    }

    fn paint(img: &mut RgbImage, cx: i64, cy: i64, color: [u8; 3]) {
        for dy in -2..=2 {
            for dx in -2..=2 {
                let (x, y) = (cx + dx, cy + dy);
                if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
                    img.put_pixel(x as u32, y as u32, Rgb(color));
                }
            }
        }
    }

    fn brightest_near(img: &RgbImage, x: f32, y: f32, channel: usize) -> u8 {
        let mut best = 0;
        for dy in -2i64..=2 {
            for dx in -2i64..=2 {
                let (px, py) = (x.round() as i64 + dx, y.round() as i64 + dy);
                if px >= 0 && py >= 0 && (px as u32) < img.width() && (py as u32) < img.height() {
                    best = best.max(img.get_pixel(px as u32, py as u32).0[channel]);
                }
            }
        }
        best
    }

    #[test]
    fn test_output_matches_target_size() {
        let img = RgbImage::from_pixel(200, 100, Rgb([90, 90, 90]));
        let face = boxed(20.0, 10.0, 60.0, 80.0, None);
        let aligned = align_face(&img, &face, (47, 55), true);
        assert_eq!((aligned.width(), aligned.height()), (47, 55));
        assert_eq!(aligned.confidence, 0.97);
        assert_eq!(aligned.region.w, 60);
    }

    #[test]
    fn test_tilted_eyes_become_horizontal() {
        let mut img = RgbImage::new(100, 100);
        paint(&mut img, 30, 30, [255, 0, 0]);
        paint(&mut img, 70, 70, [0, 255, 0]);
        let lm = Landmarks::from_points([(30.5, 30.5), (70.5, 70.5), (50.0, 55.0), (40.0, 70.0), (60.0, 70.0)]);
        let face = boxed(10.0, 10.0, 81.0, 81.0, Some(lm));

        let aligned = align_face(&img, &face, (81, 81), true);
        // Eyes sit 20 * sqrt(2) either side of the box center, now on row 40.
        let offset = 20.0 * std::f32::consts::SQRT_2;

        assert!(brightest_near(&aligned.pixels, 40.0 - offset, 40.0, 0) > 100, "left eye not on the horizontal");
        assert!(brightest_near(&aligned.pixels, 40.0 + offset, 40.0, 1) > 100, "right eye not on the horizontal");
    }

    #[test]
    fn test_align_disabled_ignores_landmarks() {
        let mut img = RgbImage::new(100, 100);
        paint(&mut img, 30, 30, [255, 0, 0]);
        let lm = Landmarks::from_points([(30.0, 30.0), (70.0, 70.0), (50.0, 55.0), (40.0, 70.0), (60.0, 70.0)]);
        let face = boxed(0.0, 0.0, 100.0, 100.0, Some(lm));
        let aligned = align_face(&img, &face, (100, 100), false);
        // Plain crop of the whole image is the image itself.
        assert_eq!(aligned.pixels.get_pixel(30, 30).0, [255, 0, 0]);
    }

    #[test]
    fn test_box_outside_image_is_clipped() {
        let img = RgbImage::from_pixel(50, 50, Rgb([200, 100, 50]));
        let face = boxed(30.0, 30.0, 100.0, 100.0, None);
        let aligned = align_face(&img, &face, (32, 32), true);
        assert_eq!((aligned.width(), aligned.height()), (32, 32));
        // Clipped region is square, so the letterbox has no padding.
        assert_eq!(aligned.pixels.get_pixel(0, 0).0, [200, 100, 50]);
    }

    #[test]
    fn test_wide_box_is_letterboxed() {
        let img = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let face = boxed(0.0, 0.0, 200.0, 100.0, None);
        let aligned = align_face(&img, &face, (50, 50), true);
        assert_eq!(aligned.pixels.get_pixel(25, 2).0, [0, 0, 0]);
        assert_eq!(aligned.pixels.get_pixel(25, 25).0, [255, 255, 255]);
    }

    #[test]
    fn test_deterministic() {
        let mut img = RgbImage::new(64, 64);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Rgb([(x * 4) as u8, (y * 4) as u8, 17]);
        }
        let lm = Landmarks::from_points([(20.0, 25.0), (44.0, 30.0), (32.0, 38.0), (24.0, 48.0), (40.0, 50.0)]);
        let face = boxed(8.0, 8.0, 48.0, 48.0, Some(lm));
        let a = align_face(&img, &face, (112, 112), true);
        let b = align_face(&img, &face, (112, 112), true);
        assert_eq!(a.pixels, b.pixels);
    }
}
