//! Kernel and presentation tests on a real wgpu device
//!
//! Every test returns early when the host has no usable adapter.

use fsr_wgpu::{
    Backend, Extent, FrameStage, FsrError, FsrPipeline, GpuBackend, KernelOp, KernelSource, PixelRange, Presentation, UpscaleConfig, UpsampleMode, ViewLayout,
    backend::GpuImage,
    buffer::{ImageDescriptor, ImageRole},
    kernel::{KernelInvocation, reference},
    pipeline::Frame,
};
use image::Rgba32FImage;

/// 8-bit quantization of the storage target plus float noise
const TOLERANCE: f32 = 2.0 / 255.0;

fn backend() -> Option<GpuBackend> {
    match pollster::block_on(GpuBackend::request(&KernelSource::Embedded)) {
        Ok(backend) => Some(backend),
        Err(FsrError::Dispatch(reason)) => {
            eprintln!("skipping GPU test: {reason}");
            None
        }
        Err(e) => panic!("failed to create GPU backend: {e}"),
    }
}

fn pattern(width: u32, height: u32) -> Rgba32FImage {
    Rgba32FImage::from_fn(width, height, |x, y| {
        let edge = if x * 3 > y * 2 + 5 { 0.85 } else { 0.15 };
        let ripple = ((x * 5 + y * 3) % 7) as f32 / 40.0;
        image::Rgba([edge, (edge + ripple).min(1.0), 1.0 - edge, 1.0])
    })
}

fn create(backend: &mut GpuBackend, role: ImageRole, extent: Extent, range: PixelRange) -> GpuImage {
    backend
        .create_image(&ImageDescriptor::storage(role, extent, range, ViewLayout::Single))
        .expect("image allocation")
}

fn assert_close(expected: &Rgba32FImage, actual: &Rgba32FImage) {
    assert_eq!(expected.dimensions(), actual.dimensions());
    for (x, y, pixel) in expected.enumerate_pixels() {
        let other = actual.get_pixel(x, y);
        for i in 0..4 {
            assert!((pixel.0[i] - other.0[i]).abs() <= TOLERANCE, "pixel ({x}, {y}) channel {i}: expected {:?}, got {:?}", pixel.0, other.0);
        }
    }
}

#[test]
fn upsample_matches_reference() {
    let Some(mut backend) = backend() else { return };

    for mode in [UpsampleMode::EdgeAdaptive, UpsampleMode::Bilinear] {
        let low_res_extent = Extent::new(13, 9);
        let output_extent = Extent::new(29, 20);
        let low_res = create(&mut backend, ImageRole::LowRes, low_res_extent, PixelRange::Standard);
        let output = create(&mut backend, ImageRole::Output, output_extent, PixelRange::Standard);

        backend.upload(&low_res, 0, &pattern(13, 9)).unwrap();
        backend
            .dispatch(KernelInvocation {
                source: &low_res,
                destination: &output,
                op: KernelOp::Upsample {
                    mode,
                    input_viewport: low_res_extent,
                    input_image: low_res_extent,
                },
            })
            .unwrap();

        // Compare against the quantized source the device actually sampled
        let source = backend.read_image(&low_res, 0).unwrap();
        let expected = reference::upsample(&source, low_res_extent, output_extent, mode).unwrap();
        assert_close(&expected, &backend.read_image(&output, 0).unwrap());

        backend.release_image(low_res);
        backend.release_image(output);
    }
}

#[test]
fn sharpen_matches_reference() {
    let Some(mut backend) = backend() else { return };

    let extent = Extent::new(24, 17);
    for strength in [0.0, 0.8, 2.0] {
        let source = create(&mut backend, ImageRole::Scratch, extent, PixelRange::Standard);
        let output = create(&mut backend, ImageRole::Output, extent, PixelRange::Standard);
        backend.upload(&source, 0, &pattern(24, 17)).unwrap();

        backend
            .dispatch(KernelInvocation {
                source: &source,
                destination: &output,
                op: KernelOp::Sharpen { strength },
            })
            .unwrap();

        let input = backend.read_image(&source, 0).unwrap();
        let expected = reference::sharpen(&input, strength, PixelRange::Standard).unwrap();
        assert_close(&expected, &backend.read_image(&output, 0).unwrap());

        backend.release_image(source);
        backend.release_image(output);
    }
}

#[test]
fn extended_range_round_trip() {
    let Some(mut backend) = backend() else { return };

    let extent = Extent::new(8, 8);
    let source = create(&mut backend, ImageRole::LowRes, extent, PixelRange::Extended);
    let output = create(&mut backend, ImageRole::Output, Extent::new(16, 16), PixelRange::Extended);
    let bright = Rgba32FImage::from_pixel(8, 8, image::Rgba([3.0, 1.5, 0.25, 1.0]));
    backend.upload(&source, 0, &bright).unwrap();

    backend
        .dispatch(KernelInvocation {
            source: &source,
            destination: &output,
            op: KernelOp::Upsample {
                mode: UpsampleMode::EdgeAdaptive,
                input_viewport: extent,
                input_image: extent,
            },
        })
        .unwrap();

    let result = backend.read_image(&output, 0).unwrap();
    let expected = [3.0, 1.5, 0.25, 1.0];
    assert!(result.pixels().all(|p| p.0.iter().zip(expected).all(|(v, e)| (v - e).abs() <= 1e-2)));
}

fn presentation_target(backend: &GpuBackend, width: u32, height: u32, format: wgpu::TextureFormat) -> wgpu::Texture {
    backend.device().create_texture(&wgpu::TextureDescriptor {
        label: Some("Presentation Target"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

#[test]
fn pipeline_presents_by_copy_and_blit() {
    let Some(backend) = backend() else { return };

    let grey = Rgba32FImage::from_pixel(24, 24, image::Rgba([0.5, 0.5, 0.5, 1.0]));
    let mut copy_target = presentation_target(&backend, 32, 32, wgpu::TextureFormat::Rgba8Unorm);
    let mut blit_target = presentation_target(&backend, 40, 20, wgpu::TextureFormat::Rgba16Float);

    let config = UpscaleConfig {
        sharpening: true,
        ..Default::default()
    };
    let mut pipeline = FsrPipeline::new(backend, config).unwrap();

    for target in [&mut copy_target, &mut blit_target] {
        let report = pipeline.render_frame(Frame::new(32, 32), target, |backend, scene| {
            assert_eq!(scene.viewport, Extent::new(24, 24));
            backend.upload(scene.image, 0, &grey).unwrap();
        });
        assert_eq!(report.error, None);
        assert_eq!(report.reached, FrameStage::Presented);
        assert_eq!(report.presentation, Presentation::Fresh);
    }

    for target in [&copy_target, &blit_target] {
        let presented = pipeline.backend().read_texture(target, 0).unwrap();
        assert!(presented.pixels().all(|p| (p.0[0] - 0.5).abs() <= TOLERANCE && (p.0[3] - 1.0).abs() <= TOLERANCE));
    }

    pipeline.shutdown();
}

#[test]
fn broken_kernel_fails_at_initialization() {
    let Some(backend) = backend() else { return };

    let device = backend.device().clone();
    let queue = backend.queue().clone();
    let error = GpuBackend::new(device, queue, &KernelSource::Wgsl("fn main( {".into())).unwrap_err();
    assert!(matches!(error, FsrError::KernelLoad(_)), "{error}");
}

#[test]
fn oversized_image_is_an_allocation_error() {
    let Some(mut backend) = backend() else { return };

    let limit = backend.device().limits().max_texture_dimension_2d;
    let descriptor = ImageDescriptor::storage(ImageRole::Output, Extent::new(limit + 1, 4), PixelRange::Standard, ViewLayout::Single);
    assert!(matches!(backend.create_image(&descriptor), Err(FsrError::Allocation { .. })));
}
