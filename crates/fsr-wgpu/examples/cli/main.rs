//! FSR CLI Image Upscaler
//!
//! Treats the input image as a rendered scene: it is drawn into the low-resolution target at the configured
//! render scale, then reconstructed at native resolution by the upscaler and written to the output file.
//!
//! # Usage
//! ```bash
//! fsr-cli input.png output.png --scale 0.5 --mode edge-adaptive --sharpen --sharpness 0.6
//! ```

use clap::{Parser, ValueEnum};
use fsr_wgpu::{
    CpuBackend, Extent, FrameStage, FsrPipeline, GpuBackend, KernelSource, PixelRange, UpscaleConfig, UpsampleMode, backend::texture_format, pipeline::Frame,
};
use image::{Rgba32FImage, imageops};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    EdgeAdaptive,
    Bilinear,
}

impl From<Mode> for UpsampleMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::EdgeAdaptive => UpsampleMode::EdgeAdaptive,
            Mode::Bilinear => UpsampleMode::Bilinear,
        }
    }
}

#[derive(Parser)]
#[command(version, about = "CLI tool for upscaling images with FSR")]
struct Args {
    /// Input image file path
    input: PathBuf,

    /// Output image file path
    output: PathBuf,

    /// Native output width (defaults to the input width)
    #[arg(long)]
    width: Option<u32>,

    /// Native output height (defaults to the input height)
    #[arg(long)]
    height: Option<u32>,

    /// Render scale in (0.25, 1.0]
    #[arg(long, short)]
    scale: Option<f32>,

    /// Upsampling filter
    #[arg(long, short, value_enum)]
    mode: Option<Mode>,

    /// Enable the sharpening pass
    #[arg(long)]
    sharpen: bool,

    /// Sharpening strength in [0.0, 2.0]; 0.0 is the strongest
    #[arg(long)]
    sharpness: Option<f32>,

    /// Process in extended (half-float) range
    #[arg(long)]
    hdr: bool,

    /// Run the reference kernel on the CPU instead of a GPU
    #[arg(long)]
    cpu: bool,

    /// JSON file with an upscaler configuration; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// WGSL file replacing the embedded kernel
    #[arg(long)]
    kernel: Option<PathBuf>,
}

impl Args {
    fn upscale_config(&self) -> Result<UpscaleConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => UpscaleConfig::default(),
        };
        if let Some(scale) = self.scale {
            config.render_scale = scale;
        }
        if let Some(mode) = self.mode {
            config.upsample_mode = mode.into();
        }
        if let Some(sharpness) = self.sharpness {
            config.sharpness = sharpness;
        }
        config.sharpening |= self.sharpen;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = args.upscale_config()?;

    println!("Loading image from: {}", args.input.display());
    let scene = image::open(&args.input)?.into_rgba32f();
    let native = Extent::new(args.width.unwrap_or(scene.width()), args.height.unwrap_or(scene.height()));
    let range = if args.hdr { PixelRange::Extended } else { PixelRange::Standard };
    println!("Input image: {}x{}, native output: {native}", scene.width(), scene.height());

    let output = if args.cpu {
        upscale_on_cpu(config, native, range, &scene)?
    } else {
        let source = args.kernel.clone().map(KernelSource::File).unwrap_or_default();
        println!("Initializing GPU with {source} kernel...");
        let backend = pollster::block_on(GpuBackend::request(&source))?;
        upscale_on_gpu(backend, config, native, range, &scene)?
    };

    println!("Saving result to: {}", args.output.display());
    let output = image::DynamicImage::ImageRgba32F(output);
    let float_output = args.output.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("exr"));
    if float_output {
        output.save(&args.output)?;
    } else {
        output.into_rgba8().save(&args.output)?;
    }

    Ok(())
}

/// Resamples the scene into the low-resolution viewport
fn draw_scene(scene: &Rgba32FImage, viewport: Extent) -> Rgba32FImage {
    imageops::resize(scene, viewport.width, viewport.height, imageops::FilterType::Triangle)
}

fn upscale_on_cpu(config: UpscaleConfig, native: Extent, range: PixelRange, scene: &Rgba32FImage) -> Result<Rgba32FImage, Box<dyn std::error::Error>> {
    let mut pipeline = FsrPipeline::new(CpuBackend::new(), config)?;
    let mut target = Rgba32FImage::new(native.width, native.height);
    let mut drawn = Ok(());

    let report = pipeline.render_frame(Frame::new(native.width, native.height).with_range(range), &mut target, |backend, capture| {
        drawn = backend.write_layer(capture.image, 0, &draw_scene(scene, capture.viewport));
    });
    drawn?;
    if let Some(error) = report.error {
        return Err(error.into());
    }
    println!("Frame {:?}, reached {:?}", report.path, report.reached);

    pipeline.shutdown();
    Ok(target)
}

fn upscale_on_gpu(backend: GpuBackend, config: UpscaleConfig, native: Extent, range: PixelRange, scene: &Rgba32FImage) -> Result<Rgba32FImage, Box<dyn std::error::Error>> {
    let mut target = backend.device().create_texture(&wgpu::TextureDescriptor {
        label: Some("CLI Output"),
        size: wgpu::Extent3d {
            width: native.width,
            height: native.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: texture_format(range),
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });

    let mut pipeline = FsrPipeline::new(backend, config)?;
    let mut drawn = Ok(());

    let report = pipeline.render_frame(Frame::new(native.width, native.height).with_range(range), &mut target, |backend, capture| {
        drawn = backend.upload(capture.image, 0, &draw_scene(scene, capture.viewport));
    });
    drawn?;
    if let Some(error) = report.error {
        return Err(error.into());
    }
    debug_assert_eq!(report.reached, FrameStage::Presented);
    println!("Frame {:?}, reached {:?}", report.path, report.reached);

    let output = pipeline.backend().read_texture(&target, 0)?;
    pipeline.shutdown();
    Ok(output)
}
