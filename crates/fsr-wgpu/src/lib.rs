//! Single-frame spatial upscaling on wgpu
//!
//! This crate renders a scene at a reduced resolution and reconstructs the native-resolution frame with an
//! edge-adaptive upsampling filter, optionally followed by a contrast-adaptive sharpening pass. The filter
//! runs as a WGSL compute kernel on a wgpu device, or on the host through a reference implementation with
//! the same numeric contract.
//!
//! The entry point is [`FsrPipeline`], which owns the persistent render targets and drives one frame at a
//! time through a [`Backend`].

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod config;
mod error;
pub mod kernel;
pub mod pipeline;
pub mod resources;

mod shaders {
    include!(concat!(env!("OUT_DIR"), "/shaders.rs"));
}

pub use backend::{Backend, CpuBackend, GpuBackend};
pub use buffer::{Extent, PixelRange, ViewLayout};
pub use config::{ReallocationPolicy, UpscaleConfig, UpsampleMode};
pub use error::{FsrError, Result};
pub use kernel::{KernelOp, KernelSource};
pub use pipeline::{Frame, FramePath, FrameReport, FrameStage, FsrPipeline, Presentation, SceneCapture};
