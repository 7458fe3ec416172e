use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, ImageError, Rgb, RgbImage};

const HEATMAP_SIZE: u32 = 224;
const OVERLAY_ALPHA: f32 = 0.3;
const JPEG_QUALITY: u8 = 85;

/// Centre-weighted overlay: red at the middle fading to green at the
/// corners. It does not come from the model's activations.
pub fn radial_overlay(image: &DynamicImage) -> RgbImage {
    let base = image
        .resize_exact(HEATMAP_SIZE, HEATMAP_SIZE, FilterType::Triangle)
        .to_rgb8();

    let cx = (HEATMAP_SIZE / 2) as f32;
    let cy = (HEATMAP_SIZE / 2) as f32;
    let max_distance = (cx * cx + cy * cy).sqrt();

    ImageBuffer::from_fn(HEATMAP_SIZE, HEATMAP_SIZE, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let heat = (1.0 - (dx * dx + dy * dy).sqrt() / max_distance).clamp(0.0, 1.0);
        let overlay = [heat * 255.0, (1.0 - heat) * 255.0, 0.0];

        let pixel = base.get_pixel(x, y);
        let mut out = [0u8; 3];
        for c in 0..3 {
            let blended = pixel[c] as f32 * (1.0 - OVERLAY_ALPHA) + overlay[c] * OVERLAY_ALPHA;
            out[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    image.write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

pub fn render(image: &DynamicImage) -> Result<Vec<u8>, ImageError> {
    encode_jpeg(&radial_overlay(image))
}
