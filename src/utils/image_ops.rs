use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;

/// Scale that brings the shorter side to `min_scale` without pushing the
/// longer side past `max_scale`.
pub fn image_scale(width: u32, height: u32, min_scale: u32, max_scale: u32) -> f32 {
    let size_min = width.min(height) as f32;
    let size_max = width.max(height) as f32;
    let scale = min_scale as f32 / size_min;
    if (scale * size_max).round() > max_scale as f32 {
        max_scale as f32 / size_max
    } else {
        scale
    }
}

pub fn load_rgb_image(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).with_context(|| format!("decoding image {}", path.display()))?;
    Ok(img.into_rgb8())
}

/// Resizes to `scale`, optionally mirrors left to right.
pub fn prepare_image(img: &RgbImage, scale: f32, flipped: bool) -> RgbImage {
    let new_width = ((img.width() as f32 * scale) as u32).max(1);
    let new_height = ((img.height() as f32 * scale) as u32).max(1);
    let resized = imageops::resize(img, new_width, new_height, FilterType::Triangle);
    if flipped {
        imageops::flip_horizontal(&resized)
    } else {
        resized
    }
}

/// RGB pixels to a 3 * h * w BGR array with the pixel means subtracted.
pub fn image_to_blob(img: &RgbImage, pixel_means: &[f32; 3]) -> Array3<f32> {
    let (width, height) = img.dimensions();
    let mut blob = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        blob[[0, y, x]] = pixel[2] as f32 - pixel_means[0];
        blob[[1, y, x]] = pixel[1] as f32 - pixel_means[1];
        blob[[2, y, x]] = pixel[0] as f32 - pixel_means[2];
    }
    blob
}
