//! Filter kernel contract
//!
//! A kernel invocation is one dispatch of the filter: either an upsample from a low-resolution source into a
//! larger (or smaller) destination, or a sharpen of an image into a destination of the same size. At the
//! interface it is the tagged [`KernelOp`]; at the GPU boundary it is flattened into the [`KernelParams`]
//! uniform block whose field names and encodings are shared with `wgsl/fsr.wgsl`.

pub mod reference;

use std::path::PathBuf;

use crate::{
    FsrError, Result,
    buffer::{Extent, ImageHandle, PixelRange},
    config::{MAX_SHARPNESS, UpsampleMode},
    shaders,
};

/// Compute workgroup edge length in both dimensions
pub const WORKGROUP_SIZE: u32 = 16;

/// Number of workgroups needed to cover `extent`
///
/// # Returns
/// `(ceil(width / 16), ceil(height / 16))`
pub fn dispatch_grid(extent: Extent) -> (u32, u32) {
    (extent.width.div_ceil(WORKGROUP_SIZE), extent.height.div_ceil(WORKGROUP_SIZE))
}

/// Operation performed by one kernel invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelOp {
    /// Resample the valid `input_viewport` region of a source whose backing extent is `input_image`
    Upsample {
        mode: UpsampleMode,
        input_viewport: Extent,
        input_image: Extent,
    },
    /// Sharpen with a caller-facing strength in [0, 2]
    Sharpen { strength: f32 },
}

/// One dispatch: source image, destination image, and the operation between them
#[derive(Debug)]
pub struct KernelInvocation<'a, I> {
    pub source: &'a I,
    pub destination: &'a I,
    pub op: KernelOp,
}

impl<'a, I> Clone for KernelInvocation<'a, I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, I> Copy for KernelInvocation<'a, I> {}

impl<'a, I: ImageHandle> KernelInvocation<'a, I> {
    /// Flattens the invocation into the uniform block consumed by the kernel
    ///
    /// Fails with [`FsrError::InvalidDimensions`] when the source, its viewport, or the destination is empty.
    pub fn params(&self) -> Result<KernelParams> {
        let source = self.source.descriptor();
        let destination = self.destination.descriptor();
        KernelParams::encode(self.op, source.extent, destination.extent, destination.range)
    }
}

/// Uniform block of the filter kernel
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub input_viewport_width: u32,
    pub input_viewport_height: u32,
    pub input_image_width: u32,
    pub input_image_height: u32,
    pub output_image_width: u32,
    pub output_image_height: u32,
    /// 0 = edge-adaptive, 1 = bilinear
    pub upsample_mode: u32,
    /// 1 = upsample, 0 = sharpen
    pub upscale_or_sharpen: u32,
    /// Pre-inverted sharpness: `2 - strength`
    pub sharpness: f32,
    /// 1 when the destination stores extended-range pixels
    pub extended_range: u32,
    pub _pad: [u32; 2],
}

impl KernelParams {
    pub const UPSAMPLE: u32 = 1;
    pub const SHARPEN: u32 = 0;

    /// Builds the uniform block for `op`
    ///
    /// # Arguments
    /// * `op` - The operation to encode
    /// * `source` - Backing extent of the source image
    /// * `destination` - Extent of the destination image
    /// * `range` - Pixel range of the destination image
    pub fn encode(op: KernelOp, source: Extent, destination: Extent, range: PixelRange) -> Result<Self> {
        if source.is_empty() {
            return Err(FsrError::InvalidDimensions {
                width: source.width,
                height: source.height,
            });
        }
        if destination.is_empty() {
            return Err(FsrError::InvalidDimensions {
                width: destination.width,
                height: destination.height,
            });
        }

        let (viewport, image, upsample_mode, upscale_or_sharpen, sharpness) = match op {
            KernelOp::Upsample { mode, input_viewport, input_image } => {
                if input_viewport.is_empty() || input_image.is_empty() {
                    return Err(FsrError::InvalidDimensions {
                        width: input_viewport.width.min(input_image.width),
                        height: input_viewport.height.min(input_image.height),
                    });
                }
                // The backing extent can never exceed what was actually allocated
                let image = Extent::new(input_image.width.min(source.width), input_image.height.min(source.height));
                (input_viewport, image, encode_upsample_mode(mode), Self::UPSAMPLE, 0.0)
            }
            KernelOp::Sharpen { strength } => (source, source, 0, Self::SHARPEN, invert_sharpness(strength)),
        };

        Ok(Self {
            input_viewport_width: viewport.width,
            input_viewport_height: viewport.height,
            input_image_width: image.width,
            input_image_height: image.height,
            output_image_width: destination.width,
            output_image_height: destination.height,
            upsample_mode,
            upscale_or_sharpen,
            sharpness,
            extended_range: (range == PixelRange::Extended) as u32,
            _pad: [0; 2],
        })
    }

    /// Viewport clamped to the backing image
    pub fn sample_limit(&self) -> Extent {
        Extent::new(
            self.input_viewport_width.min(self.input_image_width),
            self.input_viewport_height.min(self.input_image_height),
        )
    }

    pub fn output_extent(&self) -> Extent {
        Extent::new(self.output_image_width, self.output_image_height)
    }

    pub fn is_sharpen(&self) -> bool {
        self.upscale_or_sharpen == Self::SHARPEN
    }
}

fn encode_upsample_mode(mode: UpsampleMode) -> u32 {
    match mode {
        UpsampleMode::EdgeAdaptive => 0,
        UpsampleMode::Bilinear => 1,
    }
}

/// Maps the caller-facing strength to the kernel's convention
fn invert_sharpness(strength: f32) -> f32 {
    MAX_SHARPNESS - strength.clamp(0.0, MAX_SHARPNESS)
}

/// Where the WGSL filter kernel comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KernelSource {
    /// The kernel compiled into the crate
    #[default]
    Embedded,
    /// WGSL text with the `STORAGE_FORMAT` placeholder left in
    Wgsl(String),
    /// A WGSL file on disk with the `STORAGE_FORMAT` placeholder left in
    File(PathBuf),
}

impl KernelSource {
    /// The unspecialized WGSL kernel shipped with the crate, for hosts that want to patch it
    pub fn template() -> &'static str {
        shaders::FSR_KERNEL_TEMPLATE
    }

    /// Returns the kernel source specialized for destinations of the given range
    pub fn resolve(&self, range: PixelRange) -> Result<String> {
        match self {
            KernelSource::Embedded => Ok(match range {
                PixelRange::Standard => shaders::FSR_KERNEL_STANDARD,
                PixelRange::Extended => shaders::FSR_KERNEL_EXTENDED,
            }
            .to_string()),
            KernelSource::Wgsl(source) => Ok(specialize(source, range)),
            KernelSource::File(path) => {
                let source = std::fs::read_to_string(path).map_err(|e| FsrError::KernelLoad(format!("{}: {e}", path.display())))?;
                Ok(specialize(&source, range))
            }
        }
    }
}

impl std::fmt::Display for KernelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelSource::Embedded => write!(f, "embedded"),
            KernelSource::Wgsl(source) => write!(f, "inline WGSL ({} bytes)", source.len()),
            KernelSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// WGSL storage texel format written by the kernel
pub fn storage_format_name(range: PixelRange) -> &'static str {
    match range {
        PixelRange::Standard => "rgba8unorm",
        PixelRange::Extended => "rgba16float",
    }
}

fn specialize(template: &str, range: PixelRange) -> String {
    template.replace(shaders::STORAGE_FORMAT_PLACEHOLDER, storage_format_name(range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 48);
        assert_eq!(std::mem::size_of::<KernelParams>() % 16, 0);
    }

    #[test]
    fn test_upsample_encoding() {
        let op = KernelOp::Upsample {
            mode: UpsampleMode::Bilinear,
            input_viewport: Extent::new(1440, 810),
            input_image: Extent::new(1440, 810),
        };
        let params = KernelParams::encode(op, Extent::new(1440, 810), Extent::new(1920, 1080), PixelRange::Standard).unwrap();
        assert_eq!(params.upscale_or_sharpen, 1);
        assert_eq!(params.upsample_mode, 1);
        assert_eq!((params.input_viewport_width, params.input_viewport_height), (1440, 810));
        assert_eq!((params.output_image_width, params.output_image_height), (1920, 1080));
        assert_eq!(params.extended_range, 0);

        let op = KernelOp::Upsample {
            mode: UpsampleMode::EdgeAdaptive,
            input_viewport: Extent::new(10, 10),
            input_image: Extent::new(10, 10),
        };
        let params = KernelParams::encode(op, Extent::new(10, 10), Extent::new(20, 20), PixelRange::Extended).unwrap();
        assert_eq!(params.upsample_mode, 0);
        assert_eq!(params.extended_range, 1);
    }

    #[test]
    fn test_sharpen_encoding_inverts_strength() {
        let encode = |strength| KernelParams::encode(KernelOp::Sharpen { strength }, Extent::new(8, 8), Extent::new(8, 8), PixelRange::Standard).unwrap();
        assert_eq!(encode(0.0).sharpness, 2.0);
        assert_eq!(encode(0.5).sharpness, 1.5);
        assert_eq!(encode(2.0).sharpness, 0.0);
        assert_eq!(encode(0.0).upscale_or_sharpen, 0);
        assert_eq!(encode(3.0).sharpness, 0.0);
    }

    #[test]
    fn test_viewport_larger_than_image_is_clamped() {
        let op = KernelOp::Upsample {
            mode: UpsampleMode::EdgeAdaptive,
            input_viewport: Extent::new(64, 64),
            input_image: Extent::new(32, 48),
        };
        let params = KernelParams::encode(op, Extent::new(32, 48), Extent::new(64, 64), PixelRange::Standard).unwrap();
        assert_eq!(params.sample_limit(), Extent::new(32, 48));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let op = KernelOp::Sharpen { strength: 1.0 };
        assert_eq!(
            KernelParams::encode(op, Extent::new(0, 8), Extent::new(8, 8), PixelRange::Standard),
            Err(FsrError::InvalidDimensions { width: 0, height: 8 })
        );
        assert_eq!(
            KernelParams::encode(op, Extent::new(8, 8), Extent::new(8, 0), PixelRange::Standard),
            Err(FsrError::InvalidDimensions { width: 8, height: 0 })
        );
        let op = KernelOp::Upsample {
            mode: UpsampleMode::Bilinear,
            input_viewport: Extent::new(0, 0),
            input_image: Extent::new(8, 8),
        };
        assert!(KernelParams::encode(op, Extent::new(8, 8), Extent::new(16, 16), PixelRange::Standard).is_err());
    }

    #[test]
    fn test_dispatch_grid_rounds_up() {
        assert_eq!(dispatch_grid(Extent::new(1920, 1080)), (120, 68));
        assert_eq!(dispatch_grid(Extent::new(16, 16)), (1, 1));
        assert_eq!(dispatch_grid(Extent::new(17, 1)), (2, 1));
        assert_eq!(dispatch_grid(Extent::new(0, 0)), (0, 0));
    }

    #[test]
    fn test_kernel_source_specialization() {
        let template = "var output_texture: texture_storage_2d<STORAGE_FORMAT, write>;".to_string();
        let source = KernelSource::Wgsl(template);
        assert!(source.resolve(PixelRange::Standard).unwrap().contains("rgba8unorm"));
        assert!(source.resolve(PixelRange::Extended).unwrap().contains("rgba16float"));
        assert!(!KernelSource::Embedded.resolve(PixelRange::Standard).unwrap().contains("STORAGE_FORMAT"));

        let patched = KernelSource::Wgsl(KernelSource::template().to_string());
        assert!(KernelSource::template().contains("STORAGE_FORMAT"));
        assert!(patched.resolve(PixelRange::Extended).unwrap().contains("texture_storage_2d<rgba16float, write>"));
    }

    #[test]
    fn test_missing_kernel_file() {
        let source = KernelSource::File(PathBuf::from("/nonexistent/fsr.wgsl"));
        assert!(matches!(source.resolve(PixelRange::Standard), Err(FsrError::KernelLoad(_))));
    }
}
