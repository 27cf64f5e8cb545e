//! Normalized image tensors.
//!
//! Images enter the optimization as `(1, 3, height, width)` arrays of
//! `f32`, channel-normalized against the standard ImageNet statistics the
//! pretrained backbone expects. Values are unbounded while the candidate
//! is being optimized; only on export are they de-normalized and clamped
//! back into displayable range.

use crate::Dims;
use ndarray::{Array4, Axis};

/// Per-channel means the backbone was trained against.
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel standard deviations the backbone was trained against.
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A normalized image in `(batch=1, channel=3, height, width)` layout.
pub type ImageTensor = Array4<f32>;

/// Normalizes a `[0, 1]` pixel tensor channel-wise: `y = (x - mean) / std`.
pub fn normalize(mut pixels: ImageTensor) -> ImageTensor {
    for (c, mut chan) in pixels.axis_iter_mut(Axis(1)).enumerate() {
        let inv_std = 1.0 / CHANNEL_STD[c];
        chan.mapv_inplace(|v| (v - CHANNEL_MEAN[c]) * inv_std);
    }
    pixels
}

/// Inverse of [`normalize`]. The result is *not* clamped; display/export
/// paths clamp to `[0, 1]` themselves.
pub fn denormalize(mut pixels: ImageTensor) -> ImageTensor {
    for (c, mut chan) in pixels.axis_iter_mut(Axis(1)).enumerate() {
        chan.mapv_inplace(|v| v * CHANNEL_STD[c] + CHANNEL_MEAN[c]);
    }
    pixels
}

/// Converts a decoded image into a normalized tensor. The alpha channel,
/// if any, is dropped.
pub fn from_image(img: &image::RgbaImage) -> ImageTensor {
    let (width, height) = img.dimensions();
    let mut pixels = Array4::zeros((1, 3, height as usize, width as usize));

    for (x, y, pix) in img.enumerate_pixels() {
        for c in 0..3 {
            pixels[[0, c, y as usize, x as usize]] = f32::from(pix[c]) / 255.0;
        }
    }

    normalize(pixels)
}

/// De-normalizes a tensor back into an 8-bit image, clamping each channel
/// to `[0, 1]` before quantization.
pub fn to_image(tensor: &ImageTensor) -> image::RgbaImage {
    let (_, _, height, width) = tensor.dim();
    let pixels = denormalize(tensor.clone());

    let mut img = image::RgbaImage::new(width as u32, height as u32);
    for (x, y, pix) in img.enumerate_pixels_mut() {
        for c in 0..3 {
            let v = pixels[[0, c, y as usize, x as usize]];
            pix[c] = (v.max(0.0).min(1.0) * 255.0).round() as u8;
        }
        pix[3] = 255;
    }

    img
}

/// Spatial dimensions of a tensor in image convention (width, height).
pub fn dims(tensor: &ImageTensor) -> Dims {
    let (_, _, height, width) = tensor.dim();
    Dims::new(width as u32, height as u32)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_roundtrip_is_identity() {
        let mut pixels = Array4::zeros((1, 3, 4, 5));
        for (i, v) in pixels.iter_mut().enumerate() {
            *v = (i % 17) as f32 / 16.0;
        }

        let roundtripped = denormalize(normalize(pixels.clone()));

        for (a, b) in pixels.iter().zip(roundtripped.iter()) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn image_roundtrip_within_quantization() {
        let mut img = image::RgbaImage::new(6, 4);
        for (x, y, pix) in img.enumerate_pixels_mut() {
            pix[0] = (x * 40) as u8;
            pix[1] = (y * 60) as u8;
            pix[2] = ((x + y) * 20) as u8;
            pix[3] = 255;
        }

        let back = to_image(&from_image(&img));
        for (a, b) in img.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((i16::from(a[c]) - i16::from(b[c])).abs() <= 1);
            }
        }
    }

    #[test]
    fn export_clamps_out_of_range_values() {
        let mut pixels = Array4::zeros((1, 3, 2, 2));
        pixels[[0, 0, 0, 0]] = 100.0;
        pixels[[0, 1, 0, 0]] = -100.0;

        let img = to_image(&pixels);
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(0, 0)[1], 0);
    }
}
