//! Collage compositing for per-item photo grids
//!
//! Photos are center-cropped to square tiles and laid out row by row on a
//! white canvas; unused cells of the last row stay white.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};

/// Rows and columns for `n` photos: one row up to 3, two rows up to 6,
/// three rows beyond that.
pub fn grid_dimensions(n: usize) -> (u32, u32) {
    let n = n as u32;
    if n <= 3 {
        (1, n)
    } else if n <= 6 {
        (2, n.div_ceil(2))
    } else {
        (3, n.div_ceil(3))
    }
}

/// Decode downloaded photo bytes (any format supported by `image` crate)
pub fn decode(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).context("Failed to decode image")
}

/// Square tile of `tile_px`, cropped to fill
fn tile(img: &DynamicImage, tile_px: u32) -> RgbImage {
    img.resize_to_fill(tile_px, tile_px, image::imageops::FilterType::Lanczos3)
        .to_rgb8()
}

/// Lays `photos` out in rank order on a grid of `tile_px` squares.
///
/// Returns `None` when there is nothing to lay out.
pub fn compose_collage(photos: &[DynamicImage], tile_px: u32) -> Option<RgbImage> {
    if photos.is_empty() || tile_px == 0 {
        return None;
    }

    let (rows, cols) = grid_dimensions(photos.len());
    let mut canvas = RgbImage::from_pixel(cols * tile_px, rows * tile_px, Rgb([255, 255, 255]));

    for (idx, photo) in photos.iter().enumerate() {
        let idx = idx as u32;
        let (row, col) = (idx / cols, idx % cols);
        image::imageops::overlay(
            &mut canvas,
            &tile(photo, tile_px),
            (col * tile_px) as i64,
            (row * tile_px) as i64,
        );
    }

    Some(canvas)
}

pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode png")?;
    Ok(buf)
}

/// Get image dimensions of encoded bytes
pub fn get_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    Ok(decode(data)?.dimensions())
}
