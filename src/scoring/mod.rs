//! Change scoring between two consecutive samples of the same target.
//!
//! Every scorer returns a value in `[0, 1]` and returns exactly `0` when
//! either sample is empty or both are identical.
pub mod image_diff;
pub mod text_diff;

use crate::monitor::models::Sample;

pub use image_diff::{chunk_score, score_images};
pub use text_diff::score_text;

pub fn score_samples(previous: &Sample, current: &Sample) -> f64 {
    match (previous, current) {
        (Sample::Image { bytes: prev, .. }, Sample::Image { bytes: curr, .. }) => {
            score_images(prev, curr)
        }
        (Sample::Text(prev), Sample::Text(curr)) => score_text(prev, curr),
        // The kind of sample changed between polls; compare raw bytes.
        (prev, curr) => chunk_score(prev.as_bytes(), curr.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_samples_score_zero() {
        let text = Sample::Text("status: ok".into());
        assert_eq!(score_samples(&text, &text.clone()), 0.0);

        let image = Sample::Image {
            bytes: vec![7u8; 4096],
            mime: "image/jpeg".into(),
        };
        assert_eq!(score_samples(&image, &image.clone()), 0.0);
    }

    #[test]
    fn test_mixed_kinds_fall_back_to_chunks() {
        let text = Sample::Text("a".repeat(10));
        let image = Sample::Image {
            bytes: vec![1u8; 10],
            mime: "image/jpeg".into(),
        };
        assert_eq!(score_samples(&text, &image), 1.0);
    }
}
