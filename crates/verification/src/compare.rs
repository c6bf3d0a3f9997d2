//! Image comparison utilities for verification
//!
//! Device output is quantized to its storage format, so images are compared within a tolerance rather than
//! bit for bit.

/// Result of comparing two images
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareResult {
    /// Every channel of every pixel is within the tolerance
    Match {
        /// Largest absolute channel difference
        max_error: f32,
    },
    /// Images have different dimensions
    DimensionMismatch {
        reference_dimensions: (u32, u32),
        device_dimensions: (u32, u32),
    },
    /// Images have matching dimensions but some pixels differ by more than the tolerance
    PixelMismatch {
        max_error: f32,
        /// Number of pixels with at least one channel out of tolerance
        mismatched_pixels: usize,
        /// First pixel out of tolerance
        first: (u32, u32),
        /// Whether each RGBA channel stayed within the tolerance
        channels_matched: [bool; 4],
    },
}

impl CompareResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

/// Compares two RGBA32F images pixel by pixel
///
/// # Arguments
/// * `reference` - Output of the host reference kernel
/// * `device` - Output read back from the device
/// * `tolerance` - Largest accepted absolute difference per channel
pub fn compare_images(reference: &image::Rgba32FImage, device: &image::Rgba32FImage, tolerance: f32) -> CompareResult {
    if reference.dimensions() != device.dimensions() {
        return CompareResult::DimensionMismatch {
            reference_dimensions: reference.dimensions(),
            device_dimensions: device.dimensions(),
        };
    }

    let mut max_error = 0.0f32;
    let mut mismatched_pixels = 0;
    let mut first = None;
    let mut channels_matched = [true; 4];

    for ((x, y, expected), actual) in reference.enumerate_pixels().zip(device.pixels()) {
        let mut pixel_matched = true;
        for i in 0..4 {
            let error = (expected[i] - actual[i]).abs();
            // NaN must never compare as a match
            if error.is_nan() || error > tolerance {
                channels_matched[i] = false;
                pixel_matched = false;
            }
            max_error = max_error.max(if error.is_nan() { f32::INFINITY } else { error });
        }
        if !pixel_matched {
            mismatched_pixels += 1;
            first.get_or_insert((x, y));
        }
    }

    match first {
        None => CompareResult::Match { max_error },
        Some(first) => CompareResult::PixelMismatch {
            max_error,
            mismatched_pixels,
            first,
            channels_matched,
        },
    }
}
