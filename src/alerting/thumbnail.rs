use image::imageops::FilterType;
use image::{ImageFormat, ImageResult};
use std::io::Cursor;

/// Re-encodes an image as JPEG, shrinking it to `max_width` (aspect preserved)
/// when it is wider.
pub fn resize_to_width(bytes: &[u8], max_width: u32) -> ImageResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let resized = if max_width == 0 || img.width() <= max_width {
        img
    } else {
        let height = ((img.height() as f64 * max_width as f64) / img.width() as f64)
            .round()
            .max(1.0) as u32;
        img.resize_exact(max_width, height, FilterType::Lanczos3)
    };

    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(resized.to_rgb8()).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}
