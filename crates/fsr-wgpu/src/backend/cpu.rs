//! Host-memory backend running the reference kernel

use std::collections::HashMap;

use image::Rgba32FImage;

use super::Backend;
use crate::{
    FsrError, Result,
    buffer::{Extent, ImageDescriptor, ImageHandle},
    config::UpsampleMode,
    kernel::{KernelInvocation, reference},
};

/// Handle of an image stored by a [`CpuBackend`]
#[derive(Debug, PartialEq, Eq)]
pub struct CpuImage {
    id: u64,
    descriptor: ImageDescriptor,
}

impl ImageHandle for CpuImage {
    fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }
}

/// Allocation accounting of a [`CpuBackend`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Images created since the backend was constructed
    pub allocations: u64,
    /// Images released since the backend was constructed
    pub releases: u64,
    /// Images currently alive
    pub live: u64,
    /// Pixels (across all layers) currently alive
    pub live_pixels: u64,
}

/// Backend executing kernels on the host with [`reference`]
///
/// Every image is a stack of `Rgba32FImage` layers. An optional pixel budget makes allocations fail the way
/// a device running out of memory would.
#[derive(Debug, Default)]
pub struct CpuBackend {
    images: HashMap<u64, Vec<Rgba32FImage>>,
    next_id: u64,
    stats: AllocationStats,
    pixel_budget: Option<u64>,
    #[cfg(test)]
    failing_dispatches: u32,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total number of live pixels across all images
    pub fn with_pixel_budget(mut self, pixels: u64) -> Self {
        self.pixel_budget = Some(pixels);
        self
    }

    pub fn stats(&self) -> AllocationStats {
        self.stats
    }

    /// Returns a copy of one layer of `image`
    pub fn read_layer(&self, image: &CpuImage, layer: u32) -> Result<Rgba32FImage> {
        self.layers(image)?
            .get(layer as usize)
            .cloned()
            .ok_or_else(|| FsrError::Dispatch(format!("image has no layer {layer}")))
    }

    /// Replaces one layer of `image`, as a scene renderer drawing into it would
    pub fn write_layer(&mut self, image: &CpuImage, layer: u32, pixels: &Rgba32FImage) -> Result<()> {
        let extent = image.extent();
        if pixels.dimensions() != (extent.width, extent.height) {
            return Err(FsrError::Dispatch(format!(
                "cannot write {}x{} pixels into a {extent} image",
                pixels.width(),
                pixels.height()
            )));
        }
        let layers = self.images.get_mut(&image.id).ok_or_else(|| FsrError::Dispatch("image was released".into()))?;
        let slot = layers
            .get_mut(layer as usize)
            .ok_or_else(|| FsrError::Dispatch(format!("image has no layer {layer}")))?;
        slot.copy_from_slice(pixels.as_raw());
        Ok(())
    }

    fn layers(&self, image: &CpuImage) -> Result<&[Rgba32FImage]> {
        self.images
            .get(&image.id)
            .map(Vec::as_slice)
            .ok_or_else(|| FsrError::Dispatch("image was released".into()))
    }

    /// Makes the next `count` dispatches fail
    #[cfg(test)]
    pub(crate) fn fail_next_dispatches(&mut self, count: u32) {
        self.failing_dispatches = count;
    }
}

impl Backend for CpuBackend {
    type Image = CpuImage;
    type Target = Rgba32FImage;

    fn create_image(&mut self, descriptor: &ImageDescriptor) -> Result<CpuImage> {
        let Extent { width, height } = descriptor.extent;
        if descriptor.extent.is_empty() {
            return Err(FsrError::Allocation {
                width,
                height,
                reason: "image size must be positive".into(),
            });
        }

        let layer_count = descriptor.layout.layers();
        let pixels = descriptor.extent.pixel_count() * layer_count as u64;
        if let Some(budget) = self.pixel_budget
            && self.stats.live_pixels + pixels > budget
        {
            return Err(FsrError::Allocation {
                width,
                height,
                reason: format!("{pixels} pixels exceed the remaining budget of {}", budget.saturating_sub(self.stats.live_pixels)),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        self.images.insert(id, (0..layer_count).map(|_| Rgba32FImage::new(width, height)).collect());

        self.stats.allocations += 1;
        self.stats.live += 1;
        self.stats.live_pixels += pixels;

        Ok(CpuImage { id, descriptor: *descriptor })
    }

    fn release_image(&mut self, image: CpuImage) {
        if self.images.remove(&image.id).is_some() {
            self.stats.releases += 1;
            self.stats.live -= 1;
            self.stats.live_pixels -= image.extent().pixel_count() * image.descriptor.layout.layers() as u64;
        }
    }

    fn dispatch(&mut self, invocation: KernelInvocation<'_, CpuImage>) -> Result<()> {
        #[cfg(test)]
        if self.failing_dispatches > 0 {
            self.failing_dispatches -= 1;
            return Err(FsrError::Dispatch("injected failure".into()));
        }

        let params = invocation.params()?;
        if !invocation.destination.descriptor.storage {
            return Err(FsrError::Dispatch(format!("{} is not writable from compute", invocation.destination.descriptor.role.label())));
        }
        if invocation.source.id == invocation.destination.id {
            return Err(FsrError::Dispatch("source and destination are the same image".into()));
        }

        // Take the destination out of the store so the source can be borrowed alongside it
        let mut destination = std::mem::take(
            self.images
                .get_mut(&invocation.destination.id)
                .ok_or_else(|| FsrError::Dispatch("destination was released".into()))?,
        );
        let result = self.layers(invocation.source).and_then(|source| {
            destination.iter_mut().enumerate().try_for_each(|(layer, target)| {
                let source = &source[layer.min(source.len() - 1)];
                reference::dispatch(&params, source, target)
            })
        });
        if let Some(slot) = self.images.get_mut(&invocation.destination.id) {
            *slot = destination;
        }
        result
    }

    fn present(&mut self, image: &CpuImage, target: &mut Rgba32FImage) -> Result<()> {
        if target.width() == 0 || target.height() == 0 {
            return Err(FsrError::InvalidDimensions {
                width: target.width(),
                height: target.height(),
            });
        }
        let layers = self.layers(image)?;
        let first = layers.first().ok_or_else(|| FsrError::Dispatch("image has no layers".into()))?;
        if first.dimensions() == target.dimensions() {
            target.copy_from_slice(first.as_raw());
        } else {
            let extent = image.extent();
            *target = reference::upsample(first, extent, Extent::new(target.width(), target.height()), UpsampleMode::Bilinear)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{ImageRole, PixelRange, ViewLayout},
        kernel::KernelOp,
    };

    fn descriptor(role: ImageRole, width: u32, height: u32) -> ImageDescriptor {
        ImageDescriptor::storage(role, Extent::new(width, height), PixelRange::Standard, ViewLayout::Single)
    }

    #[test]
    fn test_allocation_accounting() {
        let mut backend = CpuBackend::new();
        let a = backend.create_image(&descriptor(ImageRole::LowRes, 4, 4)).unwrap();
        let b = backend.create_image(&descriptor(ImageRole::Output, 8, 8)).unwrap();
        assert_eq!(backend.stats().live, 2);
        assert_eq!(backend.stats().live_pixels, 80);
        backend.release_image(a);
        assert_eq!(
            backend.stats(),
            AllocationStats {
                allocations: 2,
                releases: 1,
                live: 1,
                live_pixels: 64
            }
        );
        backend.release_image(b);
        assert_eq!(backend.stats().live, 0);
    }

    #[test]
    fn test_pixel_budget() {
        let mut backend = CpuBackend::new().with_pixel_budget(100);
        let a = backend.create_image(&descriptor(ImageRole::Output, 8, 8)).unwrap();
        let error = backend.create_image(&descriptor(ImageRole::Scratch, 8, 8)).unwrap_err();
        assert!(matches!(error, FsrError::Allocation { width: 8, height: 8, .. }));
        backend.release_image(a);
        assert!(backend.create_image(&descriptor(ImageRole::Scratch, 8, 8)).is_ok());
    }

    #[test]
    fn test_zero_sized_allocation_fails() {
        let mut backend = CpuBackend::new();
        let error = backend.create_image(&descriptor(ImageRole::Output, 0, 8)).unwrap_err();
        assert!(matches!(error, FsrError::Allocation { width: 0, height: 8, .. }));
    }

    #[test]
    fn test_dispatch_requires_storage_destination() {
        let mut backend = CpuBackend::new();
        let source = backend.create_image(&descriptor(ImageRole::LowRes, 4, 4)).unwrap();
        let mut readonly = descriptor(ImageRole::Output, 8, 8);
        readonly.storage = false;
        let destination = backend.create_image(&readonly).unwrap();
        let invocation = KernelInvocation {
            source: &source,
            destination: &destination,
            op: KernelOp::Upsample {
                mode: UpsampleMode::Bilinear,
                input_viewport: Extent::new(4, 4),
                input_image: Extent::new(4, 4),
            },
        };
        assert!(matches!(backend.dispatch(invocation), Err(FsrError::Dispatch(_))));
    }

    #[test]
    fn test_dispatch_runs_per_layer() {
        let mut backend = CpuBackend::new();
        let stereo = ViewLayout::MultiView { views: 2 };
        let source = backend
            .create_image(&ImageDescriptor::storage(ImageRole::LowRes, Extent::new(4, 4), PixelRange::Standard, stereo))
            .unwrap();
        let destination = backend
            .create_image(&ImageDescriptor::storage(ImageRole::Output, Extent::new(8, 8), PixelRange::Standard, stereo))
            .unwrap();
        backend.write_layer(&source, 0, &Rgba32FImage::from_pixel(4, 4, image::Rgba([0.25, 0.25, 0.25, 1.0]))).unwrap();
        backend.write_layer(&source, 1, &Rgba32FImage::from_pixel(4, 4, image::Rgba([0.75, 0.75, 0.75, 1.0]))).unwrap();

        backend
            .dispatch(KernelInvocation {
                source: &source,
                destination: &destination,
                op: KernelOp::Upsample {
                    mode: UpsampleMode::EdgeAdaptive,
                    input_viewport: Extent::new(4, 4),
                    input_image: Extent::new(4, 4),
                },
            })
            .unwrap();

        assert!(backend.read_layer(&destination, 0).unwrap().pixels().all(|p| p.0 == [0.25, 0.25, 0.25, 1.0]));
        assert!(backend.read_layer(&destination, 1).unwrap().pixels().all(|p| p.0 == [0.75, 0.75, 0.75, 1.0]));
    }

    #[test]
    fn test_present_copies_or_resamples() {
        let mut backend = CpuBackend::new();
        let output = backend.create_image(&descriptor(ImageRole::Output, 4, 4)).unwrap();
        backend.write_layer(&output, 0, &Rgba32FImage::from_pixel(4, 4, image::Rgba([0.5, 0.5, 0.5, 1.0]))).unwrap();

        let mut target = Rgba32FImage::new(4, 4);
        backend.present(&output, &mut target).unwrap();
        assert!(target.pixels().all(|p| p.0 == [0.5, 0.5, 0.5, 1.0]));

        let mut target = Rgba32FImage::new(6, 3);
        backend.present(&output, &mut target).unwrap();
        assert_eq!(target.dimensions(), (6, 3));
        assert!(target.pixels().all(|p| p.0 == [0.5, 0.5, 0.5, 1.0]));
    }
}
