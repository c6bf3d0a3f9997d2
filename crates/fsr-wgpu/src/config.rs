//! Host-settable configuration of the upscaler
//!
//! [`UpscaleConfig`] is the per-instance configuration surface. Every field has a default matching the
//! behaviour of a freshly enabled upscaler, so partial JSON documents deserialize into a complete config.

use serde::{Deserialize, Serialize};

use crate::{FsrError, Result};

/// Lower bound of the render scale, exclusive
pub const MIN_RENDER_SCALE: f32 = 0.25;
/// Upper bound of the render scale, inclusive
pub const MAX_RENDER_SCALE: f32 = 1.0;
/// Upper bound of the caller-facing sharpness, inclusive (lower bound is 0)
pub const MAX_SHARPNESS: f32 = 2.0;

/// Resampling filter used by the upsample pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsampleMode {
    /// Edge-direction-aware anisotropic filter
    #[default]
    EdgeAdaptive,
    /// Plain four-tap bilinear interpolation
    Bilinear,
}

/// Order of release and allocation when the render targets change size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReallocationPolicy {
    /// Release the previous buffers before allocating their replacements
    #[default]
    ReleaseFirst,
    /// Allocate the replacements first and keep the previous buffers as a fallback if that fails
    ///
    /// Peak memory holds both the old and the new pair of buffers.
    Deferred,
}

/// Configuration surface of the upscaler
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    /// Ratio of render resolution to native resolution, in (0.25, 1.0]
    pub render_scale: f32,
    pub upsample_mode: UpsampleMode,
    /// Enables the sharpen pass after an edge-adaptive upsample
    pub sharpening: bool,
    /// Caller-facing sharpness, in [0, 2]
    pub sharpness: f32,
    pub reallocation: ReallocationPolicy,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            render_scale: 0.75,
            upsample_mode: UpsampleMode::EdgeAdaptive,
            sharpening: false,
            sharpness: 1.0,
            reallocation: ReallocationPolicy::ReleaseFirst,
        }
    }
}

impl UpscaleConfig {
    /// Checks every field against its accepted range
    pub fn validate(&self) -> Result<()> {
        validate_render_scale(self.render_scale)?;
        validate_sharpness(self.sharpness)?;
        Ok(())
    }

    /// Whether frames rendered with this configuration take the upsample-then-sharpen path
    pub fn uses_sharpen_pass(&self) -> bool {
        self.upsample_mode == UpsampleMode::EdgeAdaptive && self.sharpening
    }
}

pub(crate) fn validate_render_scale(scale: f32) -> Result<()> {
    // NaN fails both comparisons
    if scale > MIN_RENDER_SCALE && scale <= MAX_RENDER_SCALE {
        Ok(())
    } else {
        Err(FsrError::InvalidConfiguration(format!(
            "render scale {scale} is outside ({MIN_RENDER_SCALE}, {MAX_RENDER_SCALE}]"
        )))
    }
}

pub(crate) fn validate_sharpness(sharpness: f32) -> Result<()> {
    if (0.0..=MAX_SHARPNESS).contains(&sharpness) {
        Ok(())
    } else {
        Err(FsrError::InvalidConfiguration(format!("sharpness {sharpness} is outside [0, {MAX_SHARPNESS}]")))
    }
}
