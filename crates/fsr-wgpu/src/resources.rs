//! Persistent render targets
//!
//! [`RenderTargets`] owns the low-resolution scene target and the full-resolution output target across frames.
//! Their dimensions are a pure function of the native resolution and the render scale; `ensure_buffers` is
//! called once at the top of every frame and reallocates only when that function's result (or the pixel
//! range or view layout) changed.

use crate::{
    FsrError, Result,
    backend::Backend,
    buffer::{Extent, ImageDescriptor, ImageRole, PixelRange, ViewLayout},
    config::ReallocationPolicy,
};

/// What the current frame needs from the render targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRequest {
    /// Native presentation resolution
    pub native: Extent,
    /// Render scale applied to `native` for the low-resolution target
    pub scale: f32,
    pub range: PixelRange,
    /// View layout of the presentation surface
    pub layout: ViewLayout,
}

/// Low-resolution extent for `native` at `scale`, rounded down
///
/// Fails with [`FsrError::InvalidDimensions`] when either side rounds down to zero.
pub fn compute_low_res(native: Extent, scale: f32) -> Result<Extent> {
    let low = native.scaled(scale);
    if low.is_empty() || native.is_empty() {
        return Err(FsrError::InvalidDimensions {
            width: low.width,
            height: low.height,
        });
    }
    Ok(low)
}

/// Identity of an allocated pair of targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetKey {
    low_res: Extent,
    output: Extent,
    range: PixelRange,
    layout: ViewLayout,
}

impl TargetKey {
    fn descriptors(&self) -> (ImageDescriptor, ImageDescriptor) {
        // The scene renderer writes the low-res target through its own pipeline, not from compute
        let low_res = ImageDescriptor {
            role: ImageRole::LowRes,
            extent: self.low_res,
            range: self.range,
            storage: false,
            layout: self.layout,
        };
        let output = ImageDescriptor::storage(ImageRole::Output, self.output, self.range, self.layout);
        (low_res, output)
    }
}

struct Allocated<I> {
    key: TargetKey,
    low_res: I,
    output: I,
}

/// Owner of the low-resolution and output targets
pub struct RenderTargets<B: Backend> {
    current: Option<Allocated<B::Image>>,
    policy: ReallocationPolicy,
    stale: bool,
    reallocations: u64,
}

impl<B: Backend> std::fmt::Debug for RenderTargets<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTargets")
            .field("current", &self.current.as_ref().map(|allocated| allocated.key))
            .field("policy", &self.policy)
            .field("stale", &self.stale)
            .field("reallocations", &self.reallocations)
            .finish()
    }
}

impl<B: Backend> Default for RenderTargets<B> {
    fn default() -> Self {
        Self::new(ReallocationPolicy::default())
    }
}

impl<B: Backend> RenderTargets<B> {
    pub fn new(policy: ReallocationPolicy) -> Self {
        Self {
            current: None,
            policy,
            stale: false,
            reallocations: 0,
        }
    }

    pub fn policy(&self) -> ReallocationPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ReallocationPolicy) {
        self.policy = policy;
    }

    /// Makes sure both targets match `request`, reallocating them if they do not
    ///
    /// # Arguments
    /// * `backend` - The backend the targets are allocated on
    /// * `request` - Native resolution, render scale, pixel range and view layout of this frame
    ///
    /// # Returns
    /// The `(low_res, output)` pair. On error the previously allocated pair, if any, stays available through
    /// [`RenderTargets::current`] unless the release-first policy already freed it.
    pub fn ensure_buffers(&mut self, backend: &mut B, request: &TargetRequest) -> Result<(&B::Image, &B::Image)> {
        let low_res = compute_low_res(request.native, request.scale)?;
        let key = TargetKey {
            low_res,
            output: request.native,
            range: request.range,
            layout: request.layout,
        };

        let up_to_date = !self.stale && self.current.as_ref().is_some_and(|allocated| allocated.key == key);
        if !up_to_date {
            self.reallocate(backend, key)?;
        }

        self.current().ok_or(FsrError::InvalidDimensions {
            width: low_res.width,
            height: low_res.height,
        })
    }

    fn reallocate(&mut self, backend: &mut B, key: TargetKey) -> Result<()> {
        let previous = self.current.as_ref().map(|allocated| allocated.key);

        if self.policy == ReallocationPolicy::ReleaseFirst {
            self.release_all(backend);
        }

        let allocated = allocate_pair(backend, key)?;

        if let Some(old) = self.current.replace(allocated) {
            backend.release_image(old.low_res);
            backend.release_image(old.output);
        }
        self.stale = false;
        self.reallocations += 1;

        tracing::info!(
            low_res = %key.low_res,
            output = %key.output,
            range = ?key.range,
            layers = key.layout.layers(),
            previous_low_res = ?previous.map(|key| key.low_res),
            "reallocated render targets"
        );

        Ok(())
    }

    /// The currently allocated `(low_res, output)` pair
    pub fn current(&self) -> Option<(&B::Image, &B::Image)> {
        self.current.as_ref().map(|allocated| (&allocated.low_res, &allocated.output))
    }

    /// Forces the next [`RenderTargets::ensure_buffers`] to reallocate
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Releases both targets
    pub fn release_all(&mut self, backend: &mut B) {
        if let Some(allocated) = self.current.take() {
            backend.release_image(allocated.low_res);
            backend.release_image(allocated.output);
        }
    }

    /// Number of completed reallocations
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }
}

fn allocate_pair<B: Backend>(backend: &mut B, key: TargetKey) -> Result<Allocated<B::Image>> {
    let (low_res_descriptor, output_descriptor) = key.descriptors();
    let low_res = backend.create_image(&low_res_descriptor)?;
    let output = match backend.create_image(&output_descriptor) {
        Ok(output) => output,
        Err(e) => {
            backend.release_image(low_res);
            return Err(e);
        }
    };
    Ok(Allocated { key, low_res, output })
}
