//! Error types for the upscaling subsystem

/// Errors raised while allocating buffers, loading the filter kernel, or running a frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FsrError {
    /// Buffer creation failed for the requested dimensions
    #[error("failed to allocate {width}x{height} image: {reason}")]
    Allocation { width: u32, height: u32, reason: String },

    /// The filter kernel asset could not be loaded or compiled
    #[error("failed to load filter kernel: {0}")]
    KernelLoad(String),

    /// Computed render dimensions are zero
    #[error("invalid render dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// The execution queue rejected a kernel invocation or presentation
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// A configuration value is outside its accepted range
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl FsrError {
    /// Returns true for errors that only affect the current frame
    ///
    /// Per-frame errors are absorbed by the orchestrator: the frame is presented from the last valid
    /// output (or skipped) and rendering continues with the next frame.
    pub fn is_per_frame(&self) -> bool {
        matches!(self, FsrError::Allocation { .. } | FsrError::InvalidDimensions { .. } | FsrError::Dispatch(_))
    }
}

pub type Result<T> = std::result::Result<T, FsrError>;
