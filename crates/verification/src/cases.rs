//! Verification cases comparing the device kernel with the host reference
//!
//! Each case uploads a source image, runs one kernel invocation on the device, reads the source back (as
//! quantized by its storage format) and runs the reference kernel on that same input.

use fsr_wgpu::{
    Backend, Extent, FsrError, GpuBackend, KernelOp, PixelRange, UpsampleMode, ViewLayout,
    buffer::{ImageDescriptor, ImageRole},
    kernel::{KernelInvocation, reference},
};
use image::{Rgba32FImage, imageops};
use std::time::{Duration, Instant};

use crate::compare::{CompareResult, compare_images};

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("upscaler error: {0}")]
    Upscaler(#[from] FsrError),
}

/// Kernel operation exercised by a case
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaseOp {
    Upsample { mode: UpsampleMode, output: Extent },
    Sharpen { strength: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCase {
    pub name: String,
    pub source: Extent,
    pub range: PixelRange,
    pub op: CaseOp,
}

impl VerificationCase {
    /// Largest accepted per-channel difference for this case's storage format
    pub fn tolerance(&self) -> f32 {
        match self.range {
            PixelRange::Standard => 2.0 / 255.0,
            PixelRange::Extended => 8.0e-3,
        }
    }

    fn destination(&self) -> Extent {
        match self.op {
            CaseOp::Upsample { output, .. } => output,
            CaseOp::Sharpen { .. } => self.source,
        }
    }

    fn kernel_op(&self) -> KernelOp {
        match self.op {
            CaseOp::Upsample { mode, .. } => KernelOp::Upsample {
                mode,
                input_viewport: self.source,
                input_image: self.source,
            },
            CaseOp::Sharpen { strength } => KernelOp::Sharpen { strength },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaseOutcome {
    pub result: CompareResult,
    pub device_duration: Duration,
    pub reference_duration: Duration,
}

/// Upsampling across both filters and several ratios, and sharpening across the strength range, in both
/// pixel ranges
pub fn default_cases() -> Vec<VerificationCase> {
    let mut cases = Vec::new();
    for range in [PixelRange::Standard, PixelRange::Extended] {
        for mode in [UpsampleMode::EdgeAdaptive, UpsampleMode::Bilinear] {
            for (source, output) in [((96, 54), (128, 72)), ((64, 64), (128, 128)), ((50, 37), (200, 148)), ((40, 40), (33, 29))] {
                let (source, output) = (Extent::from(source), Extent::from(output));
                cases.push(VerificationCase {
                    name: format!("upsample {mode:?} {source} -> {output} ({range:?})"),
                    source,
                    range,
                    op: CaseOp::Upsample { mode, output },
                });
            }
        }
        for strength in [0.0, 0.5, 1.0, 1.5, 2.0] {
            let source = Extent::new(77, 45);
            cases.push(VerificationCase {
                name: format!("sharpen {strength:.1} {source} ({range:?})"),
                source,
                range,
                op: CaseOp::Sharpen { strength },
            });
        }
    }
    cases
}

/// Diagonal edges over a ramp, exercising every edge direction of the filters
///
/// Extended-range patterns exceed 1.0.
pub fn test_pattern(extent: Extent, range: PixelRange) -> Rgba32FImage {
    let gain = match range {
        PixelRange::Standard => 1.0,
        PixelRange::Extended => 2.5,
    };
    Rgba32FImage::from_fn(extent.width, extent.height, |x, y| {
        let (u, v) = (x as f32 / extent.width as f32, y as f32 / extent.height as f32);
        let stripe = if (x + 2 * y) / 5 % 2 == 0 { 0.8 } else { 0.2 };
        let disc = if (u - 0.5).powi(2) + (v - 0.5).powi(2) < 0.09 { 0.9 } else { 0.1 };
        image::Rgba([stripe * gain, (u * 0.5 + disc * 0.5) * gain, v * gain, 1.0])
    })
}

/// Runs one case on the device and the reference kernel
///
/// # Arguments
/// * `backend` - Device backend
/// * `case` - Case to run
/// * `input` - Source image; resized to the case's source extent when it differs
pub fn run_case(backend: &mut GpuBackend, case: &VerificationCase, input: &Rgba32FImage) -> Result<CaseOutcome, VerificationError> {
    let input = if input.dimensions() == (case.source.width, case.source.height) {
        input.clone()
    } else {
        imageops::resize(input, case.source.width, case.source.height, imageops::FilterType::Triangle)
    };

    let source = backend.create_image(&ImageDescriptor::storage(ImageRole::LowRes, case.source, case.range, ViewLayout::Single))?;
    let destination = match backend.create_image(&ImageDescriptor::storage(ImageRole::Output, case.destination(), case.range, ViewLayout::Single)) {
        Ok(destination) => destination,
        Err(e) => {
            backend.release_image(source);
            return Err(e.into());
        }
    };

    let device_run = (|| {
        backend.upload(&source, 0, &input)?;
        let start = Instant::now();
        backend.dispatch(KernelInvocation {
            source: &source,
            destination: &destination,
            op: case.kernel_op(),
        })?;
        let device_output = backend.read_image(&destination, 0)?;
        let device_duration = start.elapsed();
        let quantized_input = backend.read_image(&source, 0)?;
        Ok::<_, FsrError>((device_output, device_duration, quantized_input))
    })();
    backend.release_image(source);
    backend.release_image(destination);
    let (device_output, device_duration, quantized_input) = device_run?;

    let start = Instant::now();
    let reference_output = match case.op {
        CaseOp::Upsample { mode, output } => reference::upsample(&quantized_input, case.source, output, mode)?,
        CaseOp::Sharpen { strength } => reference::sharpen(&quantized_input, strength, case.range)?,
    };
    let reference_duration = start.elapsed();

    let result = compare_images(&reference_output, &device_output, case.tolerance());
    tracing::debug!(case = %case.name, ?result, "case compared");

    Ok(CaseOutcome {
        result,
        device_duration,
        reference_duration,
    })
}
