//! wgpu backend
//!
//! Binds the filter kernel to wgpu resources and runs it on a single device queue. Each kernel invocation
//! is recorded into its own command encoder and submitted immediately, so the queue's in-order execution
//! is the only ordering between the upsample and sharpen passes. wgpu validation and out-of-memory errors
//! are captured with error scopes and surfaced as [`FsrError`]s instead of the device's uncaptured-error
//! handler.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use super::Backend;
use crate::{
    FsrError, Result,
    buffer::{Extent, ImageDescriptor, ImageHandle, PixelRange},
    kernel::{KernelInvocation, KernelParams, KernelSource, dispatch_grid},
    shaders,
};

/// Texture format backing images of the given range
pub fn texture_format(range: PixelRange) -> wgpu::TextureFormat {
    match range {
        PixelRange::Standard => wgpu::TextureFormat::Rgba8Unorm,
        PixelRange::Extended => wgpu::TextureFormat::Rgba16Float,
    }
}

/// An image allocated on the device
#[derive(Debug)]
pub struct GpuImage {
    texture: wgpu::Texture,
    descriptor: ImageDescriptor,
}

impl GpuImage {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Single-layer 2D view of one array layer
    fn layer_view(&self, layer: u32) -> wgpu::TextureView {
        layer_view(&self.texture, layer)
    }
}

impl ImageHandle for GpuImage {
    fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }
}

fn layer_view(texture: &wgpu::Texture, layer: u32) -> wgpu::TextureView {
    texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some("FSR Layer View"),
        dimension: Some(wgpu::TextureViewDimension::D2),
        base_array_layer: layer,
        array_layer_count: Some(1),
        ..Default::default()
    })
}

/// The filter kernel compiled for one storage format
#[derive(Debug)]
struct KernelPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    compute_pipeline: wgpu::ComputePipeline,
}

impl KernelPipeline {
    /// Compiles the kernel writing `range` pixels
    ///
    /// # Arguments
    /// * `device` - The wgpu device for pipeline creation
    /// * `source` - Where the WGSL kernel comes from
    /// * `range` - Pixel range of the destination images
    ///
    /// # Returns
    /// The compiled pipeline, or [`FsrError::KernelLoad`] if the kernel is missing or fails validation
    fn new(device: &wgpu::Device, source: &KernelSource, range: PixelRange) -> Result<Self> {
        let code = source.resolve(range)?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("FSR Kernel"),
            source: wgpu::ShaderSource::Wgsl(code.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("FSR Kernel"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: texture_format(range),
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<KernelParams>() as u64),
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("FSR Kernel"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let compute_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("FSR Kernel"),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(FsrError::KernelLoad(format!("{range:?} kernel: {error}")));
        }

        Ok(Self {
            bind_group_layout,
            compute_pipeline,
        })
    }
}

/// Full-screen blit used when presentation cannot be a plain texture copy
#[derive(Debug)]
struct Blitter {
    shader_module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    /// Render pipelines keyed by target format
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl Blitter {
    fn new(device: &wgpu::Device) -> Self {
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("FSR Blit"),
            source: wgpu::ShaderSource::Wgsl(shaders::BLIT_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("FSR Blit"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("FSR Blit"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("FSR Blit"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            lod_min_clamp: 0.0,
            lod_max_clamp: 0.0,
            compare: None,
            anisotropy_clamp: 1,
            border_color: None,
        });

        Self {
            shader_module,
            bind_group_layout,
            pipeline_layout,
            sampler,
            pipelines: HashMap::new(),
        }
    }

    /// Creates the render pipeline for `format` unless it is cached
    fn prepare(&mut self, device: &wgpu::Device, format: wgpu::TextureFormat) {
        self.pipelines.entry(format).or_insert_with(|| {
            tracing::debug!(?format, "creating blit pipeline");
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("FSR Blit"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shader_module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.shader_module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        });
    }
}

/// Backend running the WGSL kernel on a wgpu device
#[derive(Debug)]
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    kernels: HashMap<PixelRange, KernelPipeline>,
    blitter: Blitter,
}

impl GpuBackend {
    /// Creates the backend on an existing device
    ///
    /// Both kernel variants are compiled here so that a missing or broken kernel is reported before the
    /// first frame.
    ///
    /// # Arguments
    /// * `device` - The wgpu device for resource creation
    /// * `queue` - The queue every invocation is submitted to
    /// * `source` - Where the WGSL kernel comes from
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, source: &KernelSource) -> Result<Self> {
        let mut kernels = HashMap::new();
        for range in [PixelRange::Standard, PixelRange::Extended] {
            kernels.insert(range, KernelPipeline::new(&device, source, range)?);
        }
        let blitter = Blitter::new(&device);

        tracing::info!(%source, "filter kernel loaded");

        Ok(Self {
            device,
            queue,
            kernels,
            blitter,
        })
    }

    /// Requests a high-performance adapter and device, then creates the backend on it
    pub async fn request(source: &KernelSource) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| FsrError::Dispatch(format!("no suitable adapter: {e}")))?;

        tracing::info!(adapter = ?adapter.get_info().name, "using adapter");

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("FSR Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| FsrError::Dispatch(format!("failed to create device: {e}")))?;

        Self::new(device, queue, source)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Uploads pixels into one layer of `image`
    ///
    /// Values are quantized to the image's texture format.
    pub fn upload(&self, image: &GpuImage, layer: u32, pixels: &image::Rgba32FImage) -> Result<()> {
        let Extent { width, height } = image.extent();
        if pixels.dimensions() != (width, height) {
            return Err(FsrError::Dispatch(format!(
                "cannot upload {}x{} pixels into a {} image",
                pixels.width(),
                pixels.height(),
                image.extent()
            )));
        }

        let (data, bytes_per_pixel) = match image.descriptor.range {
            PixelRange::Standard => (pixels.as_raw().iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8).collect::<Vec<_>>(), 4),
            PixelRange::Extended => {
                let halves = pixels.as_raw().iter().map(|&v| half::f16::from_f32(v)).collect::<Vec<_>>();
                (bytemuck::cast_slice(&halves).to_vec(), 8)
            }
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bytes_per_pixel),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        Ok(())
    }

    /// Reads one layer of `image` back to the host
    ///
    /// Blocks until the device has finished every submitted invocation.
    pub fn read_image(&self, image: &GpuImage, layer: u32) -> Result<image::Rgba32FImage> {
        self.read_texture(&image.texture, layer)
    }

    /// Reads one layer of an `Rgba8Unorm` or `Rgba16Float` texture back to the host
    pub fn read_texture(&self, texture: &wgpu::Texture, layer: u32) -> Result<image::Rgba32FImage> {
        let (width, height) = (texture.width(), texture.height());
        let format = texture.format();
        let bytes_per_pixel = match format {
            wgpu::TextureFormat::Rgba8Unorm => 4,
            wgpu::TextureFormat::Rgba16Float => 8,
            _ => return Err(FsrError::Dispatch(format!("unsupported texture format for readback: {format:?}"))),
        };

        // Rows of a texture-to-buffer copy must be aligned to 256 bytes
        let unpadded_bytes_per_row = width * bytes_per_pixel;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("FSR Readback"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("FSR Readback") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |v| {
            sender.send(v).ok();
        });

        self.device.poll(wgpu::PollType::Wait).map_err(|e| FsrError::Dispatch(e.to_string()))?;
        pollster::block_on(receiver.receive())
            .ok_or_else(|| FsrError::Dispatch("readback buffer was never mapped".into()))?
            .map_err(|e| FsrError::Dispatch(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for row in data.chunks(padded_bytes_per_row as usize) {
            let row = &row[..unpadded_bytes_per_row as usize];
            if bytes_per_pixel == 4 {
                pixels.extend(row.iter().map(|&b| b as f32 / 255.0));
            } else {
                pixels.extend(row.chunks_exact(2).map(|h| half::f16::from_le_bytes([h[0], h[1]]).to_f32()));
            }
        }
        drop(data);
        buffer.unmap();

        image::Rgba32FImage::from_raw(width, height, pixels).ok_or_else(|| FsrError::Dispatch("readback size mismatch".into()))
    }

    /// Runs `f` inside validation and out-of-memory error scopes
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(out_of_memory))
    }
}

impl Backend for GpuBackend {
    type Image = GpuImage;
    type Target = wgpu::Texture;

    fn create_image(&mut self, descriptor: &ImageDescriptor) -> Result<GpuImage> {
        let Extent { width, height } = descriptor.extent;
        let limits = self.device.limits();
        let layers = descriptor.layout.layers();
        if descriptor.extent.is_empty() || width > limits.max_texture_dimension_2d || height > limits.max_texture_dimension_2d {
            return Err(FsrError::Allocation {
                width,
                height,
                reason: format!("size must be within 1..={}", limits.max_texture_dimension_2d),
            });
        }
        if layers > limits.max_texture_array_layers {
            return Err(FsrError::Allocation {
                width,
                height,
                reason: format!("{layers} layers exceed the device limit of {}", limits.max_texture_array_layers),
            });
        }

        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        if descriptor.storage {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        let (texture, error) = self.scoped(|| {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(descriptor.role.label()),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(descriptor.range),
                usage,
                view_formats: &[],
            })
        });
        if let Some(error) = error {
            texture.destroy();
            return Err(FsrError::Allocation {
                width,
                height,
                reason: error.to_string(),
            });
        }

        Ok(GpuImage {
            texture,
            descriptor: *descriptor,
        })
    }

    fn release_image(&mut self, image: GpuImage) {
        image.texture.destroy();
    }

    fn dispatch(&mut self, invocation: KernelInvocation<'_, GpuImage>) -> Result<()> {
        let params = invocation.params()?;
        let destination = invocation.destination;
        if !destination.descriptor.storage {
            return Err(FsrError::Dispatch(format!("{} is not writable from compute", destination.descriptor.role.label())));
        }
        let kernel = self
            .kernels
            .get(&destination.descriptor.range)
            .ok_or_else(|| FsrError::Dispatch(format!("no kernel for {:?} range", destination.descriptor.range)))?;

        let source_layers = invocation.source.descriptor.layout.layers();
        let (workgroup_x, workgroup_y) = dispatch_grid(params.output_extent());

        let ((), error) = self.scoped(|| {
            let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("FSR Kernel Params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("FSR Kernel") });

            for layer in 0..destination.descriptor.layout.layers() {
                let source_view = invocation.source.layer_view(layer.min(source_layers - 1));
                let destination_view = destination.layer_view(layer);

                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("FSR Kernel"),
                    layout: &kernel.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&source_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&destination_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: uniform.as_entire_binding(),
                        },
                    ],
                });

                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("FSR Kernel"),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&kernel.compute_pipeline);
                compute_pass.set_bind_group(0, &bind_group, &[]);
                compute_pass.dispatch_workgroups(workgroup_x, workgroup_y, 1);
            }

            self.queue.submit(std::iter::once(encoder.finish()));
        });

        match error {
            Some(error) => Err(FsrError::Dispatch(error.to_string())),
            None => Ok(()),
        }
    }

    fn present(&mut self, image: &GpuImage, target: &mut wgpu::Texture) -> Result<()> {
        let Extent { width, height } = image.extent();
        let layers = image.descriptor.layout.layers().min(target.depth_or_array_layers());

        if target.format() == image.texture.format() && target.width() == width && target.height() == height {
            let ((), error) = self.scoped(|| {
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("FSR Present") });
                encoder.copy_texture_to_texture(image.texture.as_image_copy(), target.as_image_copy(), wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: layers,
                });
                self.queue.submit(std::iter::once(encoder.finish()));
            });
            return match error {
                Some(error) => Err(FsrError::Dispatch(error.to_string())),
                None => Ok(()),
            };
        }

        let format = target.format();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        self.blitter.prepare(&self.device, format);
        if let Some(pipeline) = self.blitter.pipelines.get(&format) {
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("FSR Present") });
            for layer in 0..layers {
                let source_view = image.layer_view(layer);
                let target_view = layer_view(target, layer);

                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("FSR Blit"),
                    layout: &self.blitter.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&source_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::Sampler(&self.blitter.sampler),
                        },
                    ],
                });

                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("FSR Blit"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &bind_group, &[]);
                render_pass.draw(0..3, 0..1);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        }

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(FsrError::Dispatch(error.to_string())),
            None => Ok(()),
        }
    }
}
