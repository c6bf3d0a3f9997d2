//! Execution backends
//!
//! A backend owns the execution queue: it creates and releases image buffers, runs one kernel invocation
//! at a time in submission order, and copies a finished image to the presentation target.

mod cpu;
mod gpu;

pub use cpu::{AllocationStats, CpuBackend, CpuImage};
pub use gpu::{GpuBackend, GpuImage, texture_format};

use crate::{
    Result,
    buffer::{ImageDescriptor, ImageHandle},
    kernel::KernelInvocation,
};

/// Execution queue used by the render targets and the orchestrator
///
/// Invocations are executed in the order they are submitted; a later invocation observes every write of
/// an earlier one.
pub trait Backend {
    /// Owned image handle
    type Image: ImageHandle;
    /// Presentation target the final image is copied to
    type Target;

    /// Allocates an image buffer
    ///
    /// Fails with [`crate::FsrError::Allocation`] carrying the requested dimensions.
    fn create_image(&mut self, descriptor: &ImageDescriptor) -> Result<Self::Image>;

    /// Releases an image buffer
    fn release_image(&mut self, image: Self::Image);

    /// Executes one kernel invocation
    ///
    /// Fails with [`crate::FsrError::Dispatch`] when the queue rejects it.
    fn dispatch(&mut self, invocation: KernelInvocation<'_, Self::Image>) -> Result<()>;

    /// Copies (or resamples) `image` into the presentation target
    fn present(&mut self, image: &Self::Image, target: &mut Self::Target) -> Result<()>;
}
