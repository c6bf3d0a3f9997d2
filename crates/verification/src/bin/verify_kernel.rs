//! Kernel verification binary
//!
//! Runs every verification case on the first available wgpu adapter and compares it with the host
//! reference kernel.

use clap::Parser;
use fsr_wgpu::{GpuBackend, KernelSource};
use fsr_wgpu_verification::{
    cases::{default_cases, run_case, test_pattern},
    compare::CompareResult,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Compares the device kernel with the reference kernel")]
struct Args {
    /// Source image; a generated pattern is used when omitted
    input: Option<PathBuf>,

    /// WGSL file replacing the embedded kernel
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Only run cases whose name contains this string
    #[arg(long)]
    filter: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let input = match &args.input {
        Some(path) => Some(image::open(path).map_err(|e| format!("Failed to open input image: {e}"))?.into_rgba32f()),
        None => None,
    };

    let source = args.kernel.map(KernelSource::File).unwrap_or_default();
    let mut backend = pollster::block_on(GpuBackend::request(&source))?;

    let mut failures = 0;
    for case in default_cases() {
        if args.filter.as_ref().is_some_and(|filter| !case.name.contains(filter.as_str())) {
            continue;
        }

        let pattern;
        let input = match &input {
            Some(input) => input,
            None => {
                pattern = test_pattern(case.source, case.range);
                &pattern
            }
        };

        let outcome = match run_case(&mut backend, &case, input) {
            Ok(outcome) => outcome,
            Err(e) => {
                eprintln!("✗ Error running {}: {e}", case.name);
                failures += 1;
                continue;
            }
        };

        match outcome.result {
            CompareResult::Match { max_error } => {
                println!(
                    "✓ {} (max error {max_error:.5}, device: {:.2?}, reference: {:.2?})",
                    case.name, outcome.device_duration, outcome.reference_duration
                );
            }
            CompareResult::DimensionMismatch {
                reference_dimensions,
                device_dimensions,
            } => {
                eprintln!("✗ Dimension mismatch for {}: reference {reference_dimensions:?}, device {device_dimensions:?}", case.name);
                failures += 1;
            }
            CompareResult::PixelMismatch {
                max_error,
                mismatched_pixels,
                first,
                channels_matched,
            } => {
                eprintln!(
                    "✗ Pixel mismatch for {}: {mismatched_pixels} pixels, first at {first:?}, max error {max_error:.5}, RGBA matched {channels_matched:?}",
                    case.name
                );
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} case(s) failed").into());
    }
    Ok(())
}
