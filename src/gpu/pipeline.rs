/// wgpu compute pipeline for variance-of-Laplacian scoring
///
/// This module manages all the wgpu boilerplate:
/// - Device and queue initialization (once per engine)
/// - Kernel pipelines and the Gaussian weight buffer (once per engine)
/// - Per-frame textures, bind groups and command encoding
/// - Readback of the two-float statistics buffer
///
/// Each `score` call owns its own transient resources, so any number of
/// calls may be in flight on the shared device at once.

use super::shaders;
use crate::frame::CanonicalFrame;
use crate::sharpness::{sample_variance, EngineError, SharpnessConfig, SharpnessScorer};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use wgpu::util::DeviceExt;

/// Number of first-pass reduction workgroups
const PARTIAL_GROUPS: u32 = 64;

/// Size of one `vec2<f32>` partial
const PARTIAL_STRIDE: u64 = 8;

/// `[mean, population variance]`
const STATS_SIZE: u64 = 8;

/// Must match `BlurParams` in the Gaussian shader
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuBlurParams {
    radius: i32,
    horizontal: u32,
    padding0: u32,
    padding1: u32,
}

/// Must match `ReduceParams` in the final reduction shader
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuReduceParams {
    pixel_count: u32,
    partial_count: u32,
    padding0: u32,
    padding1: u32,
}

struct KernelPipelines {
    /// texture in, storage texture out (luma and Laplacian)
    image_layout: wgpu::BindGroupLayout,
    gaussian_layout: wgpu::BindGroupLayout,
    partial_layout: wgpu::BindGroupLayout,
    final_layout: wgpu::BindGroupLayout,
    luma: wgpu::ComputePipeline,
    gaussian: wgpu::ComputePipeline,
    laplacian: wgpu::ComputePipeline,
    partial: wgpu::ComputePipeline,
    reduce: wgpu::ComputePipeline,
}

/// Immutable smoothing resources shared by every call
struct GaussianResources {
    weights: wgpu::Buffer,
    horizontal: wgpu::Buffer,
    vertical: wgpu::Buffer,
}

/// Everything one scoring call keeps alive until its readback completes
struct FrameJob {
    commands: wgpu::CommandBuffer,
    staging: wgpu::Buffer,
    _textures: Vec<wgpu::Texture>,
    _buffers: Vec<wgpu::Buffer>,
}

/// GPU sharpness engine: one device, many concurrent frames
pub struct GpuSharpnessEngine {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    pipelines: KernelPipelines,
    gaussian: Option<GaussianResources>,
    adapter_name: String,
    max_dimension: u32,
}

// Manual Debug implementation (wgpu types don't implement Debug)
impl std::fmt::Debug for GpuSharpnessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuSharpnessEngine")
            .field("adapter", &self.adapter_name)
            .field("smoothing", &self.gaussian.is_some())
            .field("max_dimension", &self.max_dimension)
            .finish_non_exhaustive()
    }
}

impl GpuSharpnessEngine {
    /// Acquire a device and compile every kernel
    pub async fn new(config: &SharpnessConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(EngineError::NoAdapter)?;

        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "using GPU adapter");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Blur Scan Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        // The default handler panics; a bad frame must not take the process down
        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(%error, "uncaptured GPU error");
        }));

        let max_dimension = device.limits().max_texture_dimension_2d;
        let pipelines = KernelPipelines::new(&device);
        let gaussian = config
            .kernel()
            .map(|weights| GaussianResources::new(&device, &weights));

        Ok(Self {
            device: Arc::new(device),
            queue,
            pipelines,
            gaussian,
            adapter_name: info.name,
            max_dimension,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Score one frame; the frame is released as soon as it has been uploaded
    pub async fn score_frame(&self, frame: CanonicalFrame) -> Result<f64, EngineError> {
        let (width, height) = (frame.width(), frame.height());
        let n = frame.pixel_count();
        if n < 2 {
            return Err(EngineError::TooFewPixels(n));
        }
        if width > self.max_dimension || height > self.max_dimension {
            return Err(EngineError::FrameTooLarge {
                width,
                height,
                limit: self.max_dimension,
            });
        }

        let job = self.encode(&frame);
        drop(frame);
        self.queue.submit(Some(job.commands));

        let (tx, rx) = oneshot::channel();
        job.staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });

        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            let _ = device.poll(wgpu::Maintain::Wait);
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?;

        rx.await
            .map_err(|_| EngineError::Readback("map callback dropped".to_string()))?
            .map_err(|e| EngineError::Readback(e.to_string()))?;

        let population_variance = {
            let data = job.staging.slice(..).get_mapped_range();
            let stats: &[f32] = bytemuck::cast_slice(&data[..]);
            stats[1] as f64
        };
        job.staging.unmap();

        tracing::trace!(width, height, population_variance, "frame scored on GPU");
        sample_variance(population_variance, n)
    }

    /// Upload the frame and record every kernel dispatch
    fn encode(&self, frame: &CanonicalFrame) -> FrameJob {
        let device = &*self.device;
        let (width, height) = (frame.width(), frame.height());
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let input = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Canonical Frame (Bgra8Unorm)"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Bgra8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        // Frame rows are already padded to COPY_BYTES_PER_ROW_ALIGNMENT
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &input,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            frame.as_bytes(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(frame.bytes_per_row()),
                rows_per_image: Some(height),
            },
            size,
        );

        // Two R32Float planes, ping-ponged between stages
        let ping = plane_texture(device, size, "Luma Plane A (R32Float)");
        let pong = plane_texture(device, size, "Luma Plane B (R32Float)");
        let input_view = input.create_view(&wgpu::TextureViewDescriptor::default());
        let ping_view = ping.create_view(&wgpu::TextureViewDescriptor::default());
        let pong_view = pong.create_view(&wgpu::TextureViewDescriptor::default());

        let partials = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Reduction Partials"),
            size: PARTIAL_GROUPS as u64 * PARTIAL_STRIDE,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let stats = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Laplacian Statistics"),
            size: STATS_SIZE,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Statistics Readback"),
            size: STATS_SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let reduce_params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Reduce Params"),
            contents: bytemuck::bytes_of(&GpuReduceParams {
                pixel_count: width * height,
                partial_count: PARTIAL_GROUPS,
                padding0: 0,
                padding1: 0,
            }),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let p = &self.pipelines;
        let tiles = (
            width.div_ceil(shaders::TILE_SIZE),
            height.div_ceil(shaders::TILE_SIZE),
            1,
        );
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Sharpness Encoder"),
        });

        let group = image_bind_group(device, &p.image_layout, &input_view, &ping_view);
        dispatch(&mut encoder, "Luma Pass", &p.luma, &group, tiles);
        let (mut current, mut spare) = (&ping_view, &pong_view);

        if let Some(g) = &self.gaussian {
            for (label, params) in [
                ("Gaussian Pass (horizontal)", &g.horizontal),
                ("Gaussian Pass (vertical)", &g.vertical),
            ] {
                let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(label),
                    layout: &p.gaussian_layout,
                    entries: &[
                        view_entry(0, current),
                        view_entry(1, spare),
                        buffer_entry(2, &g.weights),
                        buffer_entry(3, params),
                    ],
                });
                dispatch(&mut encoder, label, &p.gaussian, &group, tiles);
                std::mem::swap(&mut current, &mut spare);
            }
        }

        let group = image_bind_group(device, &p.image_layout, current, spare);
        dispatch(&mut encoder, "Laplacian Pass", &p.laplacian, &group, tiles);
        std::mem::swap(&mut current, &mut spare);

        let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Partial Reduce"),
            layout: &p.partial_layout,
            entries: &[view_entry(0, current), buffer_entry(1, &partials)],
        });
        dispatch(&mut encoder, "Partial Reduce Pass", &p.partial, &group, (PARTIAL_GROUPS, 1, 1));

        let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Final Reduce"),
            layout: &p.final_layout,
            entries: &[
                buffer_entry(0, &partials),
                buffer_entry(1, &stats),
                buffer_entry(2, &reduce_params),
            ],
        });
        dispatch(&mut encoder, "Final Reduce Pass", &p.reduce, &group, (1, 1, 1));

        encoder.copy_buffer_to_buffer(&stats, 0, &staging, 0, STATS_SIZE);

        FrameJob {
            commands: encoder.finish(),
            staging,
            _textures: vec![input, ping, pong],
            _buffers: vec![partials, stats, reduce_params],
        }
    }
}

#[async_trait]
impl SharpnessScorer for GpuSharpnessEngine {
    async fn score(&self, frame: CanonicalFrame) -> Result<f64, EngineError> {
        self.score_frame(frame).await
    }

    fn name(&self) -> &'static str {
        "gpu"
    }
}

impl KernelPipelines {
    fn new(device: &wgpu::Device) -> Self {
        let image_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Image Kernel Layout"),
            entries: &[texture_layout(0), storage_texture_layout(1)],
        });
        let gaussian_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Gaussian Layout"),
            entries: &[
                texture_layout(0),
                storage_texture_layout(1),
                buffer_layout(2, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_layout(3, wgpu::BufferBindingType::Uniform),
            ],
        });
        let partial_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Partial Reduce Layout"),
            entries: &[
                texture_layout(0),
                buffer_layout(1, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
        let final_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Final Reduce Layout"),
            entries: &[
                buffer_layout(0, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_layout(1, wgpu::BufferBindingType::Storage { read_only: false }),
                buffer_layout(2, wgpu::BufferBindingType::Uniform),
            ],
        });

        let luma = compute_pipeline(
            device,
            "Luma",
            &image_layout,
            shaders::LUMA_SHADER,
            "luma_main",
        );
        let gaussian = compute_pipeline(
            device,
            "Gaussian",
            &gaussian_layout,
            shaders::GAUSSIAN_SHADER,
            "gaussian_main",
        );
        let laplacian = compute_pipeline(
            device,
            "Laplacian",
            &image_layout,
            shaders::LAPLACIAN_SHADER,
            "laplacian_main",
        );
        let partial = compute_pipeline(
            device,
            "Partial Reduce",
            &partial_layout,
            shaders::PARTIAL_REDUCE_SHADER,
            "partial_main",
        );
        let reduce = compute_pipeline(
            device,
            "Final Reduce",
            &final_layout,
            shaders::FINAL_REDUCE_SHADER,
            "final_main",
        );

        Self {
            image_layout,
            gaussian_layout,
            partial_layout,
            final_layout,
            luma,
            gaussian,
            laplacian,
            partial,
            reduce,
        }
    }
}

impl GaussianResources {
    fn new(device: &wgpu::Device, weights: &[f32]) -> Self {
        let radius = (weights.len() / 2) as i32;
        let params = |horizontal: u32, label: &str| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(&GpuBlurParams {
                    radius,
                    horizontal,
                    padding0: 0,
                    padding1: 0,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            })
        };

        Self {
            weights: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Gaussian Weights"),
                contents: bytemuck::cast_slice(weights),
                usage: wgpu::BufferUsages::STORAGE,
            }),
            horizontal: params(1, "Gaussian Params (horizontal)"),
            vertical: params(0, "Gaussian Params (vertical)"),
        }
    }
}

fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    bind_group_layout: &wgpu::BindGroupLayout,
    source: &str,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&layout),
        module: &module,
        entry_point,
    })
}

fn plane_texture(device: &wgpu::Device, size: wgpu::Extent3d, label: &str) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R32Float,
        usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    })
}

fn texture_layout(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn storage_texture_layout(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

fn buffer_layout(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn view_entry(binding: u32, view: &wgpu::TextureView) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::TextureView(view),
    }
}

fn buffer_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn image_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    src: &wgpu::TextureView,
    dst: &wgpu::TextureView,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Image Kernel"),
        layout,
        entries: &[view_entry(0, src), view_entry(1, dst)],
    })
}

/// One compute pass per stage, so every stage sees the previous one's writes
fn dispatch(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    (x, y, z): (u32, u32, u32),
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(x, y, z);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharpness::tests::{checkerboard, frame_from_fn};
    use crate::sharpness::CpuSharpnessEngine;

    /// `None` on machines without a usable adapter
    async fn engine(config: &SharpnessConfig) -> Option<GpuSharpnessEngine> {
        match GpuSharpnessEngine::new(config).await {
            Ok(engine) => Some(engine),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    fn assert_close(gpu: f64, cpu: f64) {
        let tolerance = 1e-3 * cpu.abs().max(1e-3);
        assert!((gpu - cpu).abs() <= tolerance, "gpu {gpu} vs cpu {cpu}");
    }

    #[test]
    fn test_uniform_layouts_are_16_bytes() {
        assert_eq!(std::mem::size_of::<GpuBlurParams>(), 16);
        assert_eq!(std::mem::size_of::<GpuReduceParams>(), 16);
    }

    #[tokio::test]
    async fn test_gpu_matches_cpu_reference() {
        let Some(gpu) = engine(&SharpnessConfig::default()).await else {
            return;
        };
        let cpu = CpuSharpnessEngine::default();

        for frame in [
            checkerboard(64, 4),
            frame_from_fn(96, |x, y| ((x * 37 + y * 91) % 256) as u8),
            frame_from_fn(50, |x, _| (x * 5) as u8),
        ] {
            let expected = cpu.score_frame(&frame).unwrap();
            assert_close(gpu.score(frame).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_gpu_smoothing_matches_cpu_reference() {
        let config = SharpnessConfig {
            gaussian_sigma: Some(1.0),
        };
        let Some(gpu) = engine(&config).await else {
            return;
        };
        let cpu = CpuSharpnessEngine::new(&config).unwrap();

        let frame = checkerboard(64, 3);
        let expected = cpu.score_frame(&frame).unwrap();
        assert_close(gpu.score(frame).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_gpu_flat_and_degenerate_frames() {
        let Some(gpu) = engine(&SharpnessConfig::default()).await else {
            return;
        };

        let flat = frame_from_fn(40, |_, _| 77);
        assert!(gpu.score(flat).await.unwrap().abs() < 1e-9);

        let single = CanonicalFrame::from_rgba(1, 1, &[1, 2, 3, 255]).unwrap();
        assert!(matches!(
            gpu.score(single).await,
            Err(EngineError::TooFewPixels(1))
        ));
    }

    #[tokio::test]
    async fn test_gpu_concurrent_calls_resolve_independently() {
        let Some(gpu) = engine(&SharpnessConfig::default()).await else {
            return;
        };
        let gpu = Arc::new(gpu);
        let cpu = CpuSharpnessEngine::default();

        let frames: Vec<_> = (1..=6).map(|cell| checkerboard(48, cell)).collect();
        let expected: Vec<f64> = frames.iter().map(|f| cpu.score_frame(f).unwrap()).collect();

        let handles: Vec<_> = frames
            .into_iter()
            .map(|frame| {
                let gpu = Arc::clone(&gpu);
                tokio::spawn(async move { gpu.score(frame).await })
            })
            .collect();

        for (handle, expected) in handles.into_iter().zip(expected) {
            assert_close(handle.await.unwrap().unwrap(), expected);
        }
    }
}
