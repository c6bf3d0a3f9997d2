//! Image buffer descriptors shared by every backend

/// Width and height of an image in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either side is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels in a single layer
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Scales both sides by `scale`, rounding down
    ///
    /// The product is taken in single precision, so decimal scales such as 0.7 land on the size a
    /// user would write down (1920 × 0.7 = 1344).
    pub fn scaled(&self, scale: f32) -> Self {
        Self {
            width: (self.width as f32 * scale).floor() as u32,
            height: (self.height as f32 * scale).floor() as u32,
        }
    }
}

impl From<(u32, u32)> for Extent {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Value range of the stored pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PixelRange {
    /// Normalized [0, 1] colour (8 bits per channel on the GPU)
    #[default]
    Standard,
    /// Unbounded non-negative colour (half float on the GPU)
    Extended,
}

/// Array-layer layout of an image, mirroring the presentation surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ViewLayout {
    #[default]
    Single,
    /// One layer per view (e.g. two for stereo)
    MultiView { views: u32 },
}

impl ViewLayout {
    /// Number of array layers
    pub fn layers(&self) -> u32 {
        match self {
            ViewLayout::Single => 1,
            ViewLayout::MultiView { views } => (*views).max(1),
        }
    }
}

/// Purpose of an image within a frame, used for labels and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Scene render target at the reduced resolution
    LowRes,
    /// Full-resolution result handed to presentation
    Output,
    /// Frame-local intermediate between upsample and sharpen
    Scratch,
}

impl ImageRole {
    pub fn label(&self) -> &'static str {
        match self {
            ImageRole::LowRes => "FSR Low-Res Target",
            ImageRole::Output => "FSR Output Target",
            ImageRole::Scratch => "FSR Scratch Target",
        }
    }
}

/// Describes an image buffer to be created by a backend
///
/// Images never carry a mip chain. `storage` requests random-access write from compute kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDescriptor {
    pub role: ImageRole,
    pub extent: Extent,
    pub range: PixelRange,
    pub storage: bool,
    pub layout: ViewLayout,
}

impl ImageDescriptor {
    /// Descriptor of a compute-writable image
    pub fn storage(role: ImageRole, extent: Extent, range: PixelRange, layout: ViewLayout) -> Self {
        Self {
            role,
            extent,
            range,
            storage: true,
            layout,
        }
    }
}

/// Backend-owned handle of an allocated image
pub trait ImageHandle {
    fn descriptor(&self) -> &ImageDescriptor;

    fn extent(&self) -> Extent {
        self.descriptor().extent
    }
}
