//! Per-frame orchestration
//!
//! [`FsrPipeline::render_frame`] runs one frame: validate the render targets, let the host render the scene
//! into the low-resolution target, run the upsample (and optionally sharpen) invocations, and present the
//! output. Per-frame errors never escape; they are logged and returned in the [`FrameReport`].

use crate::{
    FsrError, Result,
    backend::Backend,
    buffer::{Extent, ImageDescriptor, ImageHandle, ImageRole, PixelRange, ViewLayout},
    capture::{CameraState, CaptureAdapter},
    config::{self, ReallocationPolicy, UpscaleConfig, UpsampleMode},
    kernel::{KernelInvocation, KernelOp},
    resources::{RenderTargets, TargetRequest},
};

/// Per-frame context supplied by the host
#[derive(Debug)]
pub struct Frame<'a> {
    native: Extent,
    range: PixelRange,
    layout: ViewLayout,
    camera: Option<&'a mut CameraState>,
}

impl<'a> Frame<'a> {
    /// A frame presented at `width`x`height`
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            native: Extent::new(width, height),
            range: PixelRange::Standard,
            layout: ViewLayout::Single,
            camera: None,
        }
    }

    pub fn with_range(mut self, range: PixelRange) -> Self {
        self.range = range;
        self
    }

    /// View layout of the presentation surface
    pub fn with_view_layout(mut self, layout: ViewLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Native camera to neutralise while the scene is captured
    pub fn with_camera(mut self, camera: &'a mut CameraState) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn native(&self) -> Extent {
        self.native
    }
}

/// What the host's scene renderer receives
///
/// `image` is a color target only. A renderer that depth-tests must attach its own depth buffer of
/// `viewport` size (24-bit or better) for the duration of the capture.
#[derive(Debug)]
pub struct SceneCapture<'a, I> {
    /// Low-resolution target to draw into
    pub image: &'a I,
    /// Region of `image` the upsample pass reads
    pub viewport: Extent,
    /// Camera to draw with, if the frame carried a native camera
    pub camera: Option<CameraState>,
}

/// Which kernel sequence a frame used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePath {
    /// Upsample straight into the output target
    SinglePass,
    /// Upsample into a frame-local scratch image, then sharpen into the output target
    TwoPass,
}

/// Progress of a frame through the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameStage {
    Idle,
    BuffersValidated,
    KernelsDispatched,
    Presented,
}

/// What was shown for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// This frame's output
    Fresh,
    /// The output of an earlier frame
    Stale,
    /// Nothing was presented
    Skipped,
}

/// Outcome of [`FsrPipeline::render_frame`]
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub path: FramePath,
    /// Last stage the frame completed
    pub reached: FrameStage,
    pub presentation: Presentation,
    /// The per-frame error, if the frame did not complete
    pub error: Option<FsrError>,
}

impl FrameReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The upscaler: configuration, persistent render targets and the backend they live on
pub struct FsrPipeline<B: Backend> {
    backend: B,
    targets: RenderTargets<B>,
    config: UpscaleConfig,
}

impl<B: Backend> std::fmt::Debug for FsrPipeline<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsrPipeline").field("targets", &self.targets).field("config", &self.config).finish_non_exhaustive()
    }
}

impl<B: Backend> FsrPipeline<B> {
    /// Creates the upscaler
    ///
    /// Fails with [`FsrError::InvalidConfiguration`] if `config` is out of range.
    pub fn new(backend: B, config: UpscaleConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(?config, "upscaler initialized");
        Ok(Self {
            backend,
            targets: RenderTargets::new(config.reallocation),
            config,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn targets(&self) -> &RenderTargets<B> {
        &self.targets
    }

    /// Output target of the last successful allocation
    pub fn output(&self) -> Option<&B::Image> {
        self.targets.current().map(|(_, output)| output)
    }

    pub fn config(&self) -> &UpscaleConfig {
        &self.config
    }

    /// Replaces the whole configuration
    ///
    /// Takes effect at the next frame. An invalid configuration is rejected and the current one kept.
    pub fn set_config(&mut self, config: UpscaleConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.targets.set_policy(config.reallocation);
        Ok(())
    }

    pub fn set_render_scale(&mut self, scale: f32) -> Result<()> {
        config::validate_render_scale(scale)?;
        self.config.render_scale = scale;
        Ok(())
    }

    pub fn set_upsample_mode(&mut self, mode: UpsampleMode) {
        self.config.upsample_mode = mode;
    }

    pub fn set_sharpening(&mut self, enabled: bool) {
        self.config.sharpening = enabled;
    }

    /// Sets the caller-facing sharpness in [0, 2]
    pub fn set_sharpness(&mut self, sharpness: f32) -> Result<()> {
        config::validate_sharpness(sharpness)?;
        self.config.sharpness = sharpness;
        Ok(())
    }

    pub fn set_reallocation_policy(&mut self, policy: ReallocationPolicy) {
        self.config.reallocation = policy;
        self.targets.set_policy(policy);
    }

    /// Renders, upscales and presents one frame
    ///
    /// # Arguments
    /// * `frame` - Native resolution, pixel range, view layout and camera of this frame
    /// * `target` - Presentation target the output is copied to
    /// * `render_scene` - The host's scene renderer, drawing into the low-resolution target
    ///
    /// # Returns
    /// A report of the path taken, how far the frame got and what was presented
    pub fn render_frame<F>(&mut self, frame: Frame<'_>, target: &mut B::Target, render_scene: F) -> FrameReport
    where
        F: FnOnce(&mut B, SceneCapture<'_, B::Image>),
    {
        let config = self.config;
        let path = if config.uses_sharpen_pass() { FramePath::TwoPass } else { FramePath::SinglePass };
        let mut report = FrameReport {
            path,
            reached: FrameStage::Idle,
            presentation: Presentation::Skipped,
            error: None,
        };

        let guard = frame.camera.map(CaptureAdapter::begin);

        let request = TargetRequest {
            native: frame.native,
            scale: config.render_scale,
            range: frame.range,
            layout: frame.layout,
        };
        let ensured = self.targets.ensure_buffers(&mut self.backend, &request).map(|_| ());
        if let Err(error) = ensured {
            self.fail_frame(&mut report, error, target);
            return report;
        }
        report.reached = FrameStage::BuffersValidated;
        tracing::trace!(native = %frame.native, ?path, "render targets validated");

        let Some((low_res, output)) = self.targets.current() else {
            return report;
        };
        let viewport = low_res.extent();

        render_scene(
            &mut self.backend,
            SceneCapture {
                image: low_res,
                viewport,
                camera: guard.as_ref().map(|guard| guard.capture_camera()),
            },
        );

        let upsample = KernelOp::Upsample {
            mode: config.upsample_mode,
            input_viewport: viewport,
            input_image: low_res.extent(),
        };
        let dispatched = match path {
            FramePath::SinglePass => self.backend.dispatch(KernelInvocation {
                source: low_res,
                destination: output,
                op: upsample,
            }),
            FramePath::TwoPass => run_two_pass(&mut self.backend, low_res, output, upsample, config.sharpness),
        };
        if let Err(error) = dispatched {
            self.fail_frame(&mut report, error, target);
            return report;
        }
        report.reached = FrameStage::KernelsDispatched;
        tracing::trace!("kernels dispatched");

        match self.backend.present(output, target) {
            Ok(()) => {
                report.reached = FrameStage::Presented;
                report.presentation = Presentation::Fresh;
                tracing::trace!("frame presented");
            }
            Err(error) => {
                tracing::warn!(%error, "presentation failed");
                report.error = Some(error);
            }
        }

        drop(guard);
        report
    }

    /// Records a per-frame error and presents the previous output where that is still meaningful
    fn fail_frame(&mut self, report: &mut FrameReport, error: FsrError, target: &mut B::Target) {
        tracing::warn!(%error, reached = ?report.reached, "frame failed");

        if matches!(error, FsrError::Dispatch(_)) {
            // Retry allocation next frame; the output may hold partial results
            self.targets.mark_stale();
        } else if let Some((_, output)) = self.targets.current() {
            match self.backend.present(output, target) {
                Ok(()) => report.presentation = Presentation::Stale,
                Err(present_error) => tracing::warn!(error = %present_error, "stale presentation failed"),
            }
        }

        report.error = Some(error);
    }

    /// Releases every render target
    pub fn shutdown(&mut self) {
        self.targets.release_all(&mut self.backend);
        tracing::info!("upscaler shut down");
    }
}

/// Upsamples into a frame-local scratch image and sharpens it into `output`
///
/// The scratch image is released before returning, whether or not the invocations succeeded.
fn run_two_pass<B: Backend>(backend: &mut B, low_res: &B::Image, output: &B::Image, upsample: KernelOp, sharpness: f32) -> Result<()> {
    let descriptor = output.descriptor();
    let scratch = backend.create_image(&ImageDescriptor::storage(ImageRole::Scratch, descriptor.extent, descriptor.range, descriptor.layout))?;

    let result = backend
        .dispatch(KernelInvocation {
            source: low_res,
            destination: &scratch,
            op: upsample,
        })
        .and_then(|()| {
            backend.dispatch(KernelInvocation {
                source: &scratch,
                destination: output,
                op: KernelOp::Sharpen { strength: sharpness },
            })
        });

    backend.release_image(scratch);
    result
}

#[cfg(test)]
mod tests {
    use image::Rgba32FImage;

    use super::*;
    use crate::{
        backend::CpuBackend,
        capture::{CameraTarget, ClearMode},
    };

    const GREY: [f32; 4] = [0.5, 0.5, 0.5, 1.0];

    fn fill(backend: &mut CpuBackend, scene: SceneCapture<'_, crate::backend::CpuImage>, color: [f32; 4]) {
        let extent = scene.image.extent();
        let pixels = Rgba32FImage::from_pixel(extent.width, extent.height, image::Rgba(color));
        for layer in 0..scene.image.descriptor().layout.layers() {
            backend.write_layer(scene.image, layer, &pixels).unwrap();
        }
    }

    fn pipeline(config: UpscaleConfig) -> FsrPipeline<CpuBackend> {
        FsrPipeline::new(CpuBackend::new(), config).unwrap()
    }

    #[test]
    fn test_single_pass_frame() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::new(64, 48);

        let report = pipeline.render_frame(Frame::new(64, 48), &mut target, |backend, scene| {
            assert_eq!(scene.viewport, Extent::new(48, 36));
            fill(backend, scene, GREY);
        });

        assert_eq!(
            report,
            FrameReport {
                path: FramePath::SinglePass,
                reached: FrameStage::Presented,
                presentation: Presentation::Fresh,
                error: None,
            }
        );
        assert!(target.pixels().all(|p| p.0 == GREY));
        assert_eq!(pipeline.backend().stats().allocations, 2);
    }

    #[test]
    fn test_two_pass_releases_scratch() {
        let mut pipeline = pipeline(UpscaleConfig {
            sharpening: true,
            ..Default::default()
        });
        let mut target = Rgba32FImage::new(32, 32);

        let report = pipeline.render_frame(Frame::new(32, 32), &mut target, |backend, scene| fill(backend, scene, GREY));

        assert!(report.is_ok());
        assert_eq!(report.path, FramePath::TwoPass);
        let stats = pipeline.backend().stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.live, 2);
        for pixel in target.pixels() {
            for i in 0..4 {
                assert!((pixel.0[i] - GREY[i]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_scratch_released_on_dispatch_failure() {
        let mut pipeline = pipeline(UpscaleConfig {
            sharpening: true,
            ..Default::default()
        });
        let mut target = Rgba32FImage::new(32, 32);
        pipeline.backend_mut().fail_next_dispatches(1);

        let report = pipeline.render_frame(Frame::new(32, 32), &mut target, |backend, scene| fill(backend, scene, GREY));

        assert!(matches!(report.error, Some(FsrError::Dispatch(_))));
        assert_eq!(pipeline.backend().stats().live, 2);
        assert_eq!(pipeline.backend().stats().releases, 1);
    }

    #[test]
    fn test_bilinear_ignores_sharpening() {
        let mut pipeline = pipeline(UpscaleConfig {
            sharpening: true,
            upsample_mode: UpsampleMode::Bilinear,
            ..Default::default()
        });
        let mut target = Rgba32FImage::new(16, 16);
        let report = pipeline.render_frame(Frame::new(16, 16), &mut target, |backend, scene| fill(backend, scene, GREY));
        assert_eq!(report.path, FramePath::SinglePass);
        assert_eq!(pipeline.backend().stats().allocations, 2);
    }

    #[test]
    fn test_dispatch_failure_skips_presentation_and_reallocates() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::from_pixel(16, 16, image::Rgba([1.0, 0.0, 0.0, 1.0]));
        pipeline.backend_mut().fail_next_dispatches(1);

        let report = pipeline.render_frame(Frame::new(16, 16), &mut target, |backend, scene| fill(backend, scene, GREY));
        assert_eq!(report.presentation, Presentation::Skipped);
        assert_eq!(report.reached, FrameStage::BuffersValidated);
        assert!(matches!(report.error, Some(FsrError::Dispatch(_))));
        assert!(target.pixels().all(|p| p.0 == [1.0, 0.0, 0.0, 1.0]));
        assert!(pipeline.targets().is_stale());

        let report = pipeline.render_frame(Frame::new(16, 16), &mut target, |backend, scene| fill(backend, scene, GREY));
        assert_eq!(report.presentation, Presentation::Fresh);
        assert_eq!(pipeline.targets().reallocations(), 2);
        assert!(target.pixels().all(|p| p.0 == GREY));
    }

    #[test]
    fn test_invalid_dimensions_present_stale_output() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::new(16, 16);
        pipeline.render_frame(Frame::new(16, 16), &mut target, |backend, scene| fill(backend, scene, GREY));

        let mut tiny = Rgba32FImage::new(1, 1);
        let mut rendered = false;
        let report = pipeline.render_frame(Frame::new(1, 1), &mut tiny, |_, _| rendered = true);

        assert!(!rendered);
        assert_eq!(report.error, Some(FsrError::InvalidDimensions { width: 0, height: 0 }));
        assert_eq!(report.presentation, Presentation::Stale);
        assert_eq!(report.reached, FrameStage::Idle);
        assert_eq!(tiny.get_pixel(0, 0).0, GREY);
    }

    #[test]
    fn test_invalid_dimensions_without_previous_output_skip() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::new(1, 1);
        let report = pipeline.render_frame(Frame::new(1, 1), &mut target, |_, _| {});
        assert_eq!(report.presentation, Presentation::Skipped);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_scratch_allocation_failure_presents_stale_output() {
        // Room for the two persistent targets only
        let backend = CpuBackend::new().with_pixel_budget(32 * 32 + 16 * 16);
        let mut pipeline = FsrPipeline::new(backend, UpscaleConfig { render_scale: 0.5, ..Default::default() }).unwrap();
        let mut target = Rgba32FImage::new(32, 32);
        pipeline.render_frame(Frame::new(32, 32), &mut target, |backend, scene| fill(backend, scene, GREY));

        pipeline.set_sharpening(true);
        let report = pipeline.render_frame(Frame::new(32, 32), &mut target, |backend, scene| fill(backend, scene, [0.25, 0.25, 0.25, 1.0]));

        assert!(matches!(report.error, Some(FsrError::Allocation { width: 32, height: 32, .. })));
        assert_eq!(report.presentation, Presentation::Stale);
        assert!(!pipeline.targets().is_stale());
        assert_eq!(pipeline.backend().stats().live, 2);
        assert!(target.pixels().all(|p| p.0 == GREY));
    }

    #[test]
    fn test_camera_restored_after_frames() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::new(16, 16);
        let mut camera = CameraState {
            culling_mask: 0xff,
            clear: ClearMode::SolidColor([0.0, 0.0, 0.0, 1.0]),
            target: CameraTarget::Native,
        };
        let original = camera;

        let report = pipeline.render_frame(Frame::new(16, 16).with_camera(&mut camera), &mut target, |backend, scene| {
            let capture = scene.camera.unwrap();
            assert_eq!(capture.target, CameraTarget::Offscreen);
            assert_eq!(capture.culling_mask, 0xff);
            fill(backend, scene, GREY);
        });
        assert!(report.is_ok());
        assert_eq!(camera, original);

        pipeline.backend_mut().fail_next_dispatches(1);
        let report = pipeline.render_frame(Frame::new(16, 16).with_camera(&mut camera), &mut target, |backend, scene| fill(backend, scene, GREY));
        assert!(report.error.is_some());
        assert_eq!(camera, original);

        let report = pipeline.render_frame(Frame::new(1, 1).with_camera(&mut camera), &mut target, |_, _| {});
        assert!(report.error.is_some());
        assert_eq!(camera, original);
    }

    #[test]
    fn test_scale_switch_between_frames() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::new(192, 108);
        let mut viewports = Vec::new();

        pipeline.render_frame(Frame::new(192, 108), &mut target, |backend, scene| {
            viewports.push(scene.viewport);
            fill(backend, scene, GREY);
        });
        pipeline.set_render_scale(0.5).unwrap();
        pipeline.render_frame(Frame::new(192, 108), &mut target, |backend, scene| {
            viewports.push(scene.viewport);
            fill(backend, scene, GREY);
        });
        pipeline.render_frame(Frame::new(192, 108), &mut target, |backend, scene| fill(backend, scene, GREY));

        assert_eq!(viewports, vec![Extent::new(144, 81), Extent::new(96, 54)]);
        assert_eq!(pipeline.targets().reallocations(), 2);
        assert_eq!(pipeline.output().unwrap().extent(), Extent::new(192, 108));
    }

    #[test]
    fn test_stereo_frame() {
        let mut pipeline = pipeline(UpscaleConfig {
            sharpening: true,
            ..Default::default()
        });
        let mut target = Rgba32FImage::new(16, 16);
        let frame = Frame::new(16, 16).with_view_layout(ViewLayout::MultiView { views: 2 });
        let report = pipeline.render_frame(frame, &mut target, |backend, scene| fill(backend, scene, GREY));
        assert!(report.is_ok());

        let output = pipeline.output().unwrap();
        assert_eq!(output.descriptor().layout.layers(), 2);
        let right = pipeline.backend().read_layer(output, 1).unwrap();
        assert!(right.pixels().all(|p| (p.0[0] - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_configuration_validation() {
        assert!(matches!(
            FsrPipeline::new(CpuBackend::new(), UpscaleConfig { render_scale: 0.1, ..Default::default() }),
            Err(FsrError::InvalidConfiguration(_))
        ));

        let mut pipeline = pipeline(UpscaleConfig::default());
        assert!(pipeline.set_render_scale(0.25).is_err());
        assert!(pipeline.set_sharpness(2.5).is_err());
        assert!(pipeline.set_config(UpscaleConfig { sharpness: -1.0, ..Default::default() }).is_err());
        assert_eq!(*pipeline.config(), UpscaleConfig::default());

        pipeline.set_config(UpscaleConfig { reallocation: ReallocationPolicy::Deferred, ..Default::default() }).unwrap();
        assert_eq!(pipeline.targets().policy(), ReallocationPolicy::Deferred);
    }

    #[test]
    fn test_shutdown_releases_targets() {
        let mut pipeline = pipeline(UpscaleConfig::default());
        let mut target = Rgba32FImage::new(16, 16);
        pipeline.render_frame(Frame::new(16, 16), &mut target, |backend, scene| fill(backend, scene, GREY));
        pipeline.shutdown();
        assert_eq!(pipeline.backend().stats().live, 0);
        assert!(pipeline.output().is_none());
    }
}
