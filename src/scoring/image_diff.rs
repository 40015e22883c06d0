use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError};
use tracing::debug;

/// Frames are downscaled to this width before comparison.
pub const COMPARE_WIDTH: u32 = 160;
/// A pixel counts as changed when any RGB channel moves by more than this.
pub const CHANNEL_DELTA: u8 = 32;
/// Chunk size for the byte-level fallback.
pub const CHUNK_SIZE: usize = 1024;

/// Fraction of pixels that changed between two encoded frames.
///
/// Falls back to [`chunk_score`] when either frame cannot be decoded.
pub fn score_images(previous: &[u8], current: &[u8]) -> f64 {
    if previous.is_empty() || current.is_empty() || previous == current {
        return 0.0;
    }
    match pixel_score(previous, current) {
        Ok(score) => score,
        Err(e) => {
            debug!(error = %e, "Pixel decoding unavailable; using chunk comparison.");
            chunk_score(previous, current)
        }
    }
}

fn pixel_score(previous: &[u8], current: &[u8]) -> Result<f64, ImageError> {
    let prev = downscale(image::load_from_memory(previous)?);
    let (width, height) = prev.dimensions();
    let curr = image::load_from_memory(current)?;
    let curr = if curr.dimensions() == (width, height) {
        curr
    } else {
        curr.resize_exact(width, height, FilterType::Triangle)
    };

    let total = u64::from(width) * u64::from(height);
    if total == 0 {
        return Ok(0.0);
    }

    let (prev, curr) = (prev.to_rgb8(), curr.to_rgb8());
    let changed = prev
        .pixels()
        .zip(curr.pixels())
        .filter(|(a, b)| {
            a.0.iter()
                .zip(b.0.iter())
                .any(|(x, y)| x.abs_diff(*y) > CHANNEL_DELTA)
        })
        .count() as u64;

    Ok((changed as f64 / total as f64).clamp(0.0, 1.0))
}

/// Reduces a frame to [`COMPARE_WIDTH`], preserving aspect ratio. Never upscales.
fn downscale(img: DynamicImage) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width <= COMPARE_WIDTH {
        return img;
    }
    let scaled_height =
        ((f64::from(height) * f64::from(COMPARE_WIDTH) / f64::from(width)).round() as u32).max(1);
    img.resize_exact(COMPARE_WIDTH, scaled_height, FilterType::Triangle)
}

/// Coarse comparison of raw encoded bytes: `1 - identical_chunks / total_chunks`.
pub fn chunk_score(previous: &[u8], current: &[u8]) -> f64 {
    if previous.is_empty() || current.is_empty() || previous == current {
        return 0.0;
    }
    let prev_chunks: Vec<&[u8]> = previous.chunks(CHUNK_SIZE).collect();
    let curr_chunks: Vec<&[u8]> = current.chunks(CHUNK_SIZE).collect();
    let total = prev_chunks.len().max(curr_chunks.len());
    let identical = prev_chunks
        .iter()
        .zip(curr_chunks.iter())
        .filter(|(a, b)| a == b)
        .count();
    (1.0 - identical as f64 / total as f64).clamp(0.0, 1.0)
}
