//! [`GraphicsApi`] implemented on `wgpu`.
//!
//! Mapping of native concepts:
//! - display: an instance plus the adapter it selected.
//! - config: the colour format output surfaces use.
//! - context: a device/queue pair.
//! - program pipeline: the vertex and fragment programs attached to it; the
//!   concrete `wgpu::RenderPipeline` is built on first draw per target format
//!   and cached.
//! - uniforms: a CPU copy of each program's std140 block, flushed before draw.
//! - external texture: up to two sampled planes (RGBA, or luma + chroma).
//!
//! Bind groups are fixed: group 0 carries the vertex matrices, group 1 the
//! input planes and sampler, group 2 the fragment property block.

use std::borrow::Cow;
use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::bounded;
use tracing::{debug, warn};
use wgpu::util::DeviceExt;

use super::reflect;
use super::{
    ActiveUniform, ColorBits, ConfigHandle, ConfigRequest, ContextHandle, DisplayHandle,
    GraphicsApi, PipelineHandle, ProgramHandle, SurfaceAttribs, SurfaceColorSpace, SurfaceHandle,
    TextureHandle, UniformLocation, UniformValue, YUV_TARGET_EXTENSION,
};
use crate::error::{ApiError, ShaderStage};
use crate::host::{DeliveredImage, FrameImage, ImageTarget, NativeWindow, RenderedFrame, WindowTarget};
use crate::types::{DeviceInfo, Size};

const VERTEX_GROUP: u32 = 0;
const PROPERTY_GROUP: u32 = 2;
const MIN_UNIFORM_BYTES: u64 = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    tex_coord: [f32; 2],
}

/// Triangle strip covering clip space, texture origin at the first vertex.
const QUAD: [QuadVertex; 4] = [
    QuadVertex {
        position: [-1.0, -1.0],
        tex_coord: [0.0, 0.0],
    },
    QuadVertex {
        position: [1.0, -1.0],
        tex_coord: [1.0, 0.0],
    },
    QuadVertex {
        position: [-1.0, 1.0],
        tex_coord: [0.0, 1.0],
    },
    QuadVertex {
        position: [1.0, 1.0],
        tex_coord: [1.0, 1.0],
    },
];

struct Display {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
}

struct Config {
    display: DisplayHandle,
    format: wgpu::TextureFormat,
}

struct Device {
    display: DisplayHandle,
    device: wgpu::Device,
    queue: wgpu::Queue,
    shared: SharedResources,
}

/// Layouts and buffers shared by every program and pipeline on a device.
struct SharedResources {
    vertex_layout: wgpu::BindGroupLayout,
    input_layout: wgpu::BindGroupLayout,
    property_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    quad: wgpu::Buffer,
    sampler: wgpu::Sampler,
    blank_input: wgpu::BindGroup,
}

enum SurfaceKind {
    Offscreen,
    Image(ImageTarget),
    Window {
        surface: wgpu::Surface<'static>,
        frame: Option<wgpu::SurfaceTexture>,
        _target: std::sync::Arc<dyn WindowTarget>,
    },
}

struct Surface {
    context: ContextHandle,
    kind: SurfaceKind,
    texture: Option<wgpu::Texture>,
    size: Size,
    format: wgpu::TextureFormat,
    timestamp_ns: i64,
}

struct Program {
    context: ContextHandle,
    module: wgpu::ShaderModule,
    uniforms: Vec<ActiveUniform>,
    data: Vec<u8>,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    dirty: bool,
}

#[derive(Default)]
struct ProgramPipeline {
    vertex: Option<ProgramHandle>,
    fragment: Option<ProgramHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlaneLayout {
    Rgba8,
    Nv12,
    P010,
}

struct InputPlanes {
    size: Size,
    layout: PlaneLayout,
    plane0: wgpu::Texture,
    plane1: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

struct InputTexture {
    context: ContextHandle,
    planes: Option<InputPlanes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct RenderKey {
    vertex: ProgramHandle,
    fragment: ProgramHandle,
    format: wgpu::TextureFormat,
}

/// Production graphics backend.
#[derive(Default)]
pub struct WgpuBackend {
    next_handle: u64,
    displays: HashMap<DisplayHandle, Display>,
    configs: HashMap<ConfigHandle, Config>,
    devices: HashMap<ContextHandle, Device>,
    surfaces: HashMap<SurfaceHandle, Surface>,
    programs: HashMap<ProgramHandle, Program>,
    pipelines: HashMap<PipelineHandle, ProgramPipeline>,
    textures: HashMap<TextureHandle, InputTexture>,
    render_pipelines: HashMap<RenderKey, wgpu::RenderPipeline>,
    current_context: Option<ContextHandle>,
    current_surface: Option<SurfaceHandle>,
    bound_pipeline: Option<PipelineHandle>,
    bound_texture: Option<TextureHandle>,
    viewport: Option<Size>,
}

impl WgpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn current_context_handle(&self, operation: &'static str) -> Result<ContextHandle, ApiError> {
        self.current_context
            .ok_or_else(|| ApiError::new(operation, "no context is current"))
    }

    fn current_device(&self, operation: &'static str) -> Result<(ContextHandle, &Device), ApiError> {
        let handle = self.current_context_handle(operation)?;
        let device = self
            .devices
            .get(&handle)
            .ok_or_else(|| ApiError::new(operation, "current context was destroyed"))?;
        Ok((handle, device))
    }

    /// Newest live context created on `display`.
    fn device_for_display(
        &self,
        display: DisplayHandle,
        operation: &'static str,
    ) -> Result<(ContextHandle, &Device), ApiError> {
        self.devices
            .iter()
            .filter(|(_, device)| device.display == display)
            .max_by_key(|(handle, _)| **handle)
            .map(|(handle, device)| (*handle, device))
            .ok_or_else(|| ApiError::new(operation, "display has no live context"))
    }

    fn config_format(&self, config: ConfigHandle, operation: &'static str) -> Result<wgpu::TextureFormat, ApiError> {
        self.configs
            .get(&config)
            .map(|config| config.format)
            .ok_or_else(|| ApiError::new(operation, "unknown config"))
    }

    fn ensure_render_pipeline(&mut self, key: RenderKey) -> Result<(), ApiError> {
        if self.render_pipelines.contains_key(&key) {
            return Ok(());
        }
        let (_, device) = self.current_device("draw_quad")?;
        let vertex = self
            .programs
            .get(&key.vertex)
            .ok_or_else(|| ApiError::new("draw_quad", "vertex program was deleted"))?;
        let fragment = self
            .programs
            .get(&key.fragment)
            .ok_or_else(|| ApiError::new("draw_quad", "fragment program was deleted"))?;

        device.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("lens render pipeline"),
                layout: Some(&device.shared.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex.module,
                    entry_point: Some("main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &fragment.module,
                    entry_point: Some("main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: key.format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache: None,
            });
        if let Some(error) = pollster::block_on(device.device.pop_error_scope()) {
            return Err(ApiError::new("create_render_pipeline", error.to_string()));
        }
        debug!(?key, "built render pipeline");
        self.render_pipelines.insert(key, pipeline);
        Ok(())
    }

    fn flush_uniforms(&mut self, programs: [ProgramHandle; 2]) -> Result<(), ApiError> {
        let context = self.current_context_handle("draw_quad")?;
        let device = self
            .devices
            .get(&context)
            .ok_or_else(|| ApiError::new("draw_quad", "current context was destroyed"))?;
        for handle in programs {
            if let Some(program) = self.programs.get_mut(&handle) {
                if program.dirty {
                    device.queue.write_buffer(&program.buffer, 0, &program.data);
                    program.dirty = false;
                }
            }
        }
        Ok(())
    }
}

fn create_shared_resources(device: &wgpu::Device) -> SharedResources {
    let uniform_entry = |visibility| wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let plane_entry = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    let vertex_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("lens vertex uniforms"),
        entries: &[uniform_entry(wgpu::ShaderStages::VERTEX)],
    });
    let input_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("lens input planes"),
        entries: &[
            plane_entry(0),
            plane_entry(1),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });
    let property_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("lens properties"),
        entries: &[uniform_entry(wgpu::ShaderStages::FRAGMENT)],
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("lens pipeline layout"),
        bind_group_layouts: &[&vertex_layout, &input_layout, &property_layout],
        push_constant_ranges: &[],
    });
    let quad = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("lens quad"),
        contents: bytemuck::cast_slice(&QUAD),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("lens input sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });
    let blank = create_plane(device, Size::new(1, 1), wgpu::TextureFormat::Rgba8Unorm, "lens blank plane");
    let blank_input = create_input_bind_group(device, &input_layout, &sampler, &blank, &blank);

    SharedResources {
        vertex_layout,
        input_layout,
        property_layout,
        pipeline_layout,
        quad,
        sampler,
        blank_input,
    }
}

fn create_plane(device: &wgpu::Device, size: Size, format: wgpu::TextureFormat, label: &str) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: size.width.max(1),
            height: size.height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn create_input_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    plane0: &wgpu::Texture,
    plane1: &wgpu::Texture,
) -> wgpu::BindGroup {
    let view0 = plane0.create_view(&wgpu::TextureViewDescriptor::default());
    let view1 = plane1.create_view(&wgpu::TextureViewDescriptor::default());
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("lens input bind group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&view0),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&view1),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

fn write_plane(queue: &wgpu::Queue, texture: &wgpu::Texture, size: Size, bytes_per_pixel: u32, data: &[u8]) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(size.width * bytes_per_pixel),
            rows_per_image: Some(size.height),
        },
        wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        },
    );
}

fn chroma_size(size: Size) -> Size {
    Size::new(size.width.div_ceil(2), size.height.div_ceil(2))
}

/// Samples a `size` plane with `components` per texel holds, or `None` if
/// that does not fit in memory.
fn plane_len(size: Size, components: usize) -> Option<usize> {
    (size.width as usize)
        .checked_mul(size.height as usize)?
        .checked_mul(components)
}

fn check_plane_len(
    actual: usize,
    size: Size,
    components: usize,
    operation: &'static str,
) -> Result<(), ApiError> {
    let expected = plane_len(size, components)
        .ok_or_else(|| ApiError::new(operation, format!("a {size} plane does not fit in memory")))?;
    if actual < expected {
        return Err(ApiError::new(
            operation,
            format!("plane holds {actual} samples, {expected} required"),
        ));
    }
    Ok(())
}

/// Copies `texture` back to the CPU as tightly packed RGBA8, top row first.
fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    format: wgpu::TextureFormat,
    size: Size,
) -> Result<Vec<u8>, ApiError> {
    let unpadded = size.width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded = unpadded.div_ceil(align) * align;
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("lens readback"),
        size: u64::from(padded) * u64::from(size.height),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("lens readback encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(size.height),
            },
        },
        wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(Some(encoder.finish()));

    let slice = buffer.slice(..);
    let (tx, rx) = bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = device.poll(wgpu::PollType::Wait);
    rx.recv()
        .map_err(|_| ApiError::new("read_pixels", "map callback never fired"))?
        .map_err(|error| ApiError::new("read_pixels", error.to_string()))?;

    let mut pixels = Vec::with_capacity(unpadded as usize * size.height as usize);
    {
        let mapped = slice.get_mapped_range();
        for row in mapped.chunks(padded as usize).take(size.height as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
    }
    buffer.unmap();

    if format == wgpu::TextureFormat::Rgb10a2Unorm {
        for texel in pixels.chunks_exact_mut(4) {
            let packed = u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]);
            texel[0] = ((packed & 0x3ff) >> 2) as u8;
            texel[1] = (((packed >> 10) & 0x3ff) >> 2) as u8;
            texel[2] = (((packed >> 20) & 0x3ff) >> 2) as u8;
            texel[3] = ((packed >> 30) * 85) as u8;
        }
    }
    Ok(pixels)
}

impl GraphicsApi for WgpuBackend {
    fn open_display(&mut self) -> Result<DisplayHandle, ApiError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|error| ApiError::new("open_display", error.to_string()))?;

        let info = adapter.get_info();
        debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );
        let handle = DisplayHandle(self.next_id());
        self.displays.insert(handle, Display { instance, adapter });
        Ok(handle)
    }

    fn choose_config(
        &mut self,
        display: DisplayHandle,
        request: &ConfigRequest,
    ) -> Result<ConfigHandle, ApiError> {
        let adapter = &self
            .displays
            .get(&display)
            .ok_or_else(|| ApiError::new("choose_config", "unknown display"))?
            .adapter;
        let format = match request.color {
            ColorBits::Rgba8888 => wgpu::TextureFormat::Rgba8Unorm,
            ColorBits::Rgba1010102 => wgpu::TextureFormat::Rgb10a2Unorm,
        };
        let required = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC;
        let allowed = adapter.get_texture_format_features(format).allowed_usages;
        if !allowed.contains(required) {
            return Err(ApiError::new(
                "choose_config",
                format!("{format:?} cannot be rendered to and read back"),
            ));
        }
        let handle = ConfigHandle(self.next_id());
        self.configs.insert(handle, Config { display, format });
        Ok(handle)
    }

    fn create_context(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        request: &ConfigRequest,
    ) -> Result<ContextHandle, ApiError> {
        self.config_format(config, "create_context")?;
        let adapter = &self
            .displays
            .get(&display)
            .ok_or_else(|| ApiError::new("create_context", "unknown display"))?
            .adapter;

        let mut required_features = wgpu::Features::empty();
        let sixteen_bit = wgpu::Features::TEXTURE_FORMAT_16BIT_NORM;
        if request.client_version >= 3 && adapter.features().contains(sixteen_bit) {
            required_features |= sixteen_bit;
        }
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("lens device"),
            required_features,
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|error| ApiError::new("create_context", error.to_string()))?;

        let shared = create_shared_resources(&device);
        let handle = ContextHandle(self.next_id());
        self.devices.insert(
            handle,
            Device {
                display,
                device,
                queue,
                shared,
            },
        );
        Ok(handle)
    }

    fn create_pbuffer_surface(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        size: Size,
    ) -> Result<SurfaceHandle, ApiError> {
        let format = self.config_format(config, "create_pbuffer_surface")?;
        let (context, device) = self.device_for_display(display, "create_pbuffer_surface")?;
        let texture = device.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("lens pbuffer"),
            size: wgpu::Extent3d {
                width: size.width.max(1),
                height: size.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let handle = SurfaceHandle(self.next_id());
        self.surfaces.insert(
            handle,
            Surface {
                context,
                kind: SurfaceKind::Offscreen,
                texture: Some(texture),
                size,
                format,
                timestamp_ns: 0,
            },
        );
        Ok(handle)
    }

    fn create_window_surface(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        window: &NativeWindow,
        attribs: &SurfaceAttribs,
    ) -> Result<SurfaceHandle, ApiError> {
        let format = self.config_format(config, "create_window_surface")?;
        let size = window.size();
        if size.width == 0 || size.height == 0 {
            return Err(ApiError::new("create_window_surface", "window has no area"));
        }
        if attribs.color_space == SurfaceColorSpace::Bt2020Hlg {
            debug!("HLG colour space requested; wgpu surfaces use the adapter default");
        }
        let (context, device) = self.device_for_display(display, "create_window_surface")?;

        let surface = if let Some(target) = window.window_target() {
            let display_state = self
                .displays
                .get(&display)
                .ok_or_else(|| ApiError::new("create_window_surface", "unknown display"))?;
            let window_handle = target
                .window_handle()
                .map_err(|error| ApiError::new("create_window_surface", error.to_string()))?;
            let display_handle = target
                .display_handle()
                .map_err(|error| ApiError::new("create_window_surface", error.to_string()))?;
            // SAFETY: the target is kept alive alongside the surface.
            let surface = unsafe {
                display_state
                    .instance
                    .create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                        raw_display_handle: display_handle.as_raw(),
                        raw_window_handle: window_handle.as_raw(),
                    })
            }
            .map_err(|error| ApiError::new("create_window_surface", error.to_string()))?;

            let caps = surface.get_capabilities(&display_state.adapter);
            let surface_format = caps
                .formats
                .iter()
                .copied()
                .find(|candidate| *candidate == format)
                .or_else(|| caps.formats.first().copied())
                .ok_or_else(|| ApiError::new("create_window_surface", "surface is incompatible with the adapter"))?;
            if surface_format != format {
                warn!(?format, fallback = ?surface_format, "surface does not support config format");
            }
            let alpha_mode = caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto);
            surface.configure(
                &device.device,
                &wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format: surface_format,
                    width: size.width,
                    height: size.height,
                    present_mode: wgpu::PresentMode::Fifo,
                    alpha_mode,
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                },
            );
            Surface {
                context,
                kind: SurfaceKind::Window {
                    surface,
                    frame: None,
                    _target: std::sync::Arc::clone(target),
                },
                texture: None,
                size,
                format: surface_format,
                timestamp_ns: 0,
            }
        } else if let Some(target) = window.image_target() {
            let texture = device.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("lens image target"),
                size: wgpu::Extent3d {
                    width: size.width,
                    height: size.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            Surface {
                context,
                kind: SurfaceKind::Image(target.clone()),
                texture: Some(texture),
                size,
                format,
                timestamp_ns: 0,
            }
        } else {
            return Err(ApiError::new("create_window_surface", "unsupported window kind"));
        };

        let handle = SurfaceHandle(self.next_id());
        self.surfaces.insert(handle, surface);
        Ok(handle)
    }

    fn surface_size(&self, surface: SurfaceHandle) -> Result<Size, ApiError> {
        self.surfaces
            .get(&surface)
            .map(|surface| surface.size)
            .ok_or_else(|| ApiError::new("surface_size", "unknown surface"))
    }

    fn make_current(
        &mut self,
        display: DisplayHandle,
        surface: Option<SurfaceHandle>,
        context: Option<ContextHandle>,
    ) -> Result<(), ApiError> {
        if !self.displays.contains_key(&display) {
            return Err(ApiError::new("make_current", "unknown display"));
        }
        if let Some(context) = context {
            if !self.devices.contains_key(&context) {
                return Err(ApiError::new("make_current", "unknown context"));
            }
        }
        if let Some(surface) = surface {
            let record = self
                .surfaces
                .get(&surface)
                .ok_or_else(|| ApiError::new("make_current", "unknown surface"))?;
            if context.is_some_and(|context| context != record.context) {
                return Err(ApiError::new("make_current", "surface belongs to another context"));
            }
        }
        self.current_context = context;
        self.current_surface = surface;
        Ok(())
    }

    fn destroy_surface(&mut self, _display: DisplayHandle, surface: SurfaceHandle) -> Result<(), ApiError> {
        let record = self
            .surfaces
            .remove(&surface)
            .ok_or_else(|| ApiError::new("destroy_surface", "unknown surface"))?;
        if let Some(texture) = record.texture {
            texture.destroy();
        }
        if self.current_surface == Some(surface) {
            self.current_surface = None;
        }
        Ok(())
    }

    fn destroy_context(&mut self, _display: DisplayHandle, context: ContextHandle) -> Result<(), ApiError> {
        self.devices
            .remove(&context)
            .ok_or_else(|| ApiError::new("destroy_context", "unknown context"))?;
        self.surfaces.retain(|_, surface| surface.context != context);
        self.programs.retain(|_, program| program.context != context);
        self.textures.retain(|_, texture| texture.context != context);
        let programs = &self.programs;
        self.render_pipelines
            .retain(|key, _| programs.contains_key(&key.vertex) && programs.contains_key(&key.fragment));
        if self.current_context == Some(context) {
            self.current_context = None;
            self.current_surface = None;
        }
        Ok(())
    }

    fn terminate_display(&mut self, display: DisplayHandle) {
        self.displays.remove(&display);
        self.configs.retain(|_, config| config.display != display);
    }

    fn device_info(&self, display: DisplayHandle) -> DeviceInfo {
        let Some(state) = self.displays.get(&display) else {
            return DeviceInfo::default();
        };
        let info = state.adapter.get_info();
        let mut gl_extensions = Vec::new();
        let has_16bit = self
            .current_context
            .and_then(|context| self.devices.get(&context))
            .map(|device| device.device.features())
            .unwrap_or_else(|| state.adapter.features())
            .contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM);
        if has_16bit {
            gl_extensions.push(YUV_TARGET_EXTENSION);
        }
        let driver = format!("{} {}", info.driver, info.driver_info);
        DeviceInfo {
            gl_version: match driver.trim() {
                "" => DeviceInfo::VERSION_UNKNOWN.to_string(),
                driver => driver.to_string(),
            },
            egl_version: format!("{:?}", info.backend),
            gl_extensions: gl_extensions.join(" "),
            // wgpu surfaces expose no HLG colour space.
            egl_extensions: String::new(),
        }
    }

    fn create_program(&mut self, stage: ShaderStage, source: &str) -> Result<ProgramHandle, ApiError> {
        let module = reflect::parse(stage, source).map_err(|log| ApiError::new("create_program", log))?;
        let group = match stage {
            ShaderStage::Vertex => VERTEX_GROUP,
            ShaderStage::Fragment => PROPERTY_GROUP,
        };
        let block = reflect::uniform_block(&module, group);

        let (context, device) = self.current_device("create_program")?;
        device.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(match stage {
                ShaderStage::Vertex => "lens vertex program",
                ShaderStage::Fragment => "lens fragment program",
            }),
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Owned(source.to_string()),
                stage: reflect::naga_stage(stage),
                defines: &[],
            },
        });
        if let Some(error) = pollster::block_on(device.device.pop_error_scope()) {
            return Err(ApiError::new("create_program", error.to_string()));
        }

        let buffer_size = u64::from(block.size).max(MIN_UNIFORM_BYTES).next_multiple_of(16);
        let buffer = device.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lens program uniforms"),
            size: buffer_size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let layout = match stage {
            ShaderStage::Vertex => &device.shared.vertex_layout,
            ShaderStage::Fragment => &device.shared.property_layout,
        };
        let bind_group = device.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lens program bind group"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        let handle = ProgramHandle(self.next_id());
        self.programs.insert(
            handle,
            Program {
                context,
                module: shader,
                uniforms: block.uniforms,
                data: vec![0; buffer_size as usize],
                buffer,
                bind_group,
                dirty: true,
            },
        );
        Ok(handle)
    }

    fn active_uniforms(&self, program: ProgramHandle) -> Result<Vec<ActiveUniform>, ApiError> {
        self.programs
            .get(&program)
            .map(|program| program.uniforms.clone())
            .ok_or_else(|| ApiError::new("active_uniforms", "unknown program"))
    }

    fn set_uniform(
        &mut self,
        program: ProgramHandle,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), ApiError> {
        let program = self
            .programs
            .get_mut(&program)
            .ok_or_else(|| ApiError::new("set_uniform", "unknown program"))?;
        let bytes: Vec<u8> = match value {
            UniformValue::Float(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Int(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec2(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::IVec2(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Vec3(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Vec4(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Mat4(m) => bytemuck::bytes_of(m).to_vec(),
        };
        let start = location.0 as usize;
        let end = start + bytes.len();
        let slot = program
            .data
            .get_mut(start..end)
            .ok_or_else(|| ApiError::new("set_uniform", "location outside the uniform block"))?;
        slot.copy_from_slice(&bytes);
        program.dirty = true;
        Ok(())
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
        self.render_pipelines
            .retain(|key, _| key.vertex != program && key.fragment != program);
    }

    fn create_program_pipeline(&mut self) -> Result<PipelineHandle, ApiError> {
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(handle, ProgramPipeline::default());
        Ok(handle)
    }

    fn use_program_stage(
        &mut self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        program: ProgramHandle,
    ) -> Result<(), ApiError> {
        if !self.programs.contains_key(&program) {
            return Err(ApiError::new("use_program_stage", "unknown program"));
        }
        let pipeline = self
            .pipelines
            .get_mut(&pipeline)
            .ok_or_else(|| ApiError::new("use_program_stage", "unknown pipeline"))?;
        match stage {
            ShaderStage::Vertex => pipeline.vertex = Some(program),
            ShaderStage::Fragment => pipeline.fragment = Some(program),
        }
        Ok(())
    }

    fn bind_program_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), ApiError> {
        if !self.pipelines.contains_key(&pipeline) {
            return Err(ApiError::new("bind_program_pipeline", "unknown pipeline"));
        }
        self.bound_pipeline = Some(pipeline);
        Ok(())
    }

    fn delete_program_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline);
        if self.bound_pipeline == Some(pipeline) {
            self.bound_pipeline = None;
        }
    }

    fn bind_quad_geometry(&mut self) -> Result<(), ApiError> {
        // The quad buffer lives with the device and is bound at draw time.
        self.current_device("bind_quad_geometry").map(|_| ())
    }

    fn create_input_texture(&mut self) -> Result<TextureHandle, ApiError> {
        let (context, _) = self.current_device("create_input_texture")?;
        let handle = TextureHandle(self.next_id());
        self.textures.insert(
            handle,
            InputTexture {
                context,
                planes: None,
            },
        );
        Ok(handle)
    }

    fn upload_input_texture(&mut self, texture: TextureHandle, image: &FrameImage) -> Result<(), ApiError> {
        const OP: &str = "upload_input_texture";
        let context = self.current_context_handle(OP)?;
        let device = self
            .devices
            .get(&context)
            .ok_or_else(|| ApiError::new(OP, "current context was destroyed"))?;
        let record = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| ApiError::new(OP, "unknown texture"))?;
        let size = image.size();
        let layout = match image {
            FrameImage::Rgba8 { .. } => PlaneLayout::Rgba8,
            FrameImage::Nv12 { .. } => PlaneLayout::Nv12,
            FrameImage::P010 { .. } => PlaneLayout::P010,
        };
        if layout == PlaneLayout::P010
            && !device
                .device
                .features()
                .contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM)
        {
            return Err(ApiError::new(OP, "10-bit planes need 16-bit normalised textures"));
        }

        let reuse = record
            .planes
            .as_ref()
            .is_some_and(|planes| planes.size == size && planes.layout == layout);
        if !reuse {
            let (format0, format1, size1) = match layout {
                PlaneLayout::Rgba8 => (
                    wgpu::TextureFormat::Rgba8Unorm,
                    wgpu::TextureFormat::Rg8Unorm,
                    Size::new(1, 1),
                ),
                PlaneLayout::Nv12 => (
                    wgpu::TextureFormat::R8Unorm,
                    wgpu::TextureFormat::Rg8Unorm,
                    chroma_size(size),
                ),
                PlaneLayout::P010 => (
                    wgpu::TextureFormat::R16Unorm,
                    wgpu::TextureFormat::Rg16Unorm,
                    chroma_size(size),
                ),
            };
            let plane0 = create_plane(&device.device, size, format0, "lens input plane 0");
            let plane1 = create_plane(&device.device, size1, format1, "lens input plane 1");
            let bind_group = create_input_bind_group(
                &device.device,
                &device.shared.input_layout,
                &device.shared.sampler,
                &plane0,
                &plane1,
            );
            record.planes = Some(InputPlanes {
                size,
                layout,
                plane0,
                plane1,
                bind_group,
            });
        }
        let Some(planes) = record.planes.as_ref() else {
            return Err(ApiError::new(OP, "input planes missing"));
        };

        let chroma = chroma_size(size);
        match image {
            FrameImage::Rgba8 { data, .. } => {
                check_plane_len(data.len(), size, 4, OP)?;
                write_plane(&device.queue, &planes.plane0, size, 4, data);
            }
            FrameImage::Nv12 { y, uv, .. } => {
                check_plane_len(y.len(), size, 1, OP)?;
                check_plane_len(uv.len(), chroma, 2, OP)?;
                write_plane(&device.queue, &planes.plane0, size, 1, y);
                write_plane(&device.queue, &planes.plane1, chroma, 2, uv);
            }
            FrameImage::P010 { y, uv, .. } => {
                check_plane_len(y.len(), size, 1, OP)?;
                check_plane_len(uv.len(), chroma, 2, OP)?;
                write_plane(&device.queue, &planes.plane0, size, 2, bytemuck::cast_slice(y));
                write_plane(&device.queue, &planes.plane1, chroma, 4, bytemuck::cast_slice(uv));
            }
        }
        Ok(())
    }

    fn bind_input_texture(&mut self, texture: TextureHandle) -> Result<(), ApiError> {
        if !self.textures.contains_key(&texture) {
            return Err(ApiError::new("bind_input_texture", "unknown texture"));
        }
        self.bound_texture = Some(texture);
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(record) = self.textures.remove(&texture) {
            if let Some(planes) = record.planes {
                planes.plane0.destroy();
                planes.plane1.destroy();
            }
        }
        if self.bound_texture == Some(texture) {
            self.bound_texture = None;
        }
    }

    fn viewport(&mut self, size: Size) {
        self.viewport = Some(size);
    }

    fn draw_quad(&mut self) -> Result<(), ApiError> {
        const OP: &str = "draw_quad";
        let surface_handle = self
            .current_surface
            .ok_or_else(|| ApiError::new(OP, "no surface is current"))?;
        let pipeline = self
            .bound_pipeline
            .and_then(|pipeline| self.pipelines.get(&pipeline))
            .ok_or_else(|| ApiError::new(OP, "no program pipeline is bound"))?;
        let (Some(vertex), Some(fragment)) = (pipeline.vertex, pipeline.fragment) else {
            return Err(ApiError::new(OP, "program pipeline is missing a stage"));
        };
        let format = self
            .surfaces
            .get(&surface_handle)
            .map(|surface| surface.format)
            .ok_or_else(|| ApiError::new(OP, "current surface was destroyed"))?;
        let key = RenderKey {
            vertex,
            fragment,
            format,
        };
        self.ensure_render_pipeline(key)?;
        self.flush_uniforms([vertex, fragment])?;

        let surface = self
            .surfaces
            .get_mut(&surface_handle)
            .ok_or_else(|| ApiError::new(OP, "current surface was destroyed"))?;
        if let SurfaceKind::Window { surface: window, frame, .. } = &mut surface.kind {
            if frame.is_none() {
                *frame = Some(
                    window
                        .get_current_texture()
                        .map_err(|error| ApiError::new(OP, error.to_string()))?,
                );
            }
        }
        let view = match (&surface.kind, &surface.texture) {
            (SurfaceKind::Window { frame: Some(frame), .. }, _) => frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
            (_, Some(texture)) => texture.create_view(&wgpu::TextureViewDescriptor::default()),
            _ => return Err(ApiError::new(OP, "surface has no backing texture")),
        };
        let target_size = surface.size;

        let (_, device) = self.current_device(OP)?;
        let render_pipeline = self
            .render_pipelines
            .get(&key)
            .ok_or_else(|| ApiError::new(OP, "render pipeline missing"))?;
        let (Some(vertex), Some(fragment)) = (self.programs.get(&vertex), self.programs.get(&fragment)) else {
            return Err(ApiError::new(OP, "attached program was deleted"));
        };
        let input = self
            .bound_texture
            .and_then(|texture| self.textures.get(&texture))
            .and_then(|texture| texture.planes.as_ref())
            .map(|planes| &planes.bind_group)
            .unwrap_or(&device.shared.blank_input);
        let viewport = self.viewport.unwrap_or(target_size);
        let width = viewport.width.min(target_size.width).max(1);
        let height = viewport.height.min(target_size.height).max(1);

        device.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lens draw encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("lens draw pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
            pass.set_pipeline(render_pipeline);
            pass.set_bind_group(0, &vertex.bind_group, &[]);
            pass.set_bind_group(1, input, &[]);
            pass.set_bind_group(2, &fragment.bind_group, &[]);
            pass.set_vertex_buffer(0, device.shared.quad.slice(..));
            pass.draw(0..QUAD.len() as u32, 0..1);
        }
        device.queue.submit(Some(encoder.finish()));
        if let Some(error) = pollster::block_on(device.device.pop_error_scope()) {
            return Err(ApiError::new(OP, error.to_string()));
        }
        Ok(())
    }

    fn set_presentation_time(
        &mut self,
        _display: DisplayHandle,
        surface: SurfaceHandle,
        timestamp_ns: i64,
    ) -> Result<(), ApiError> {
        let surface = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| ApiError::new("set_presentation_time", "unknown surface"))?;
        surface.timestamp_ns = timestamp_ns;
        Ok(())
    }

    fn swap_buffers(&mut self, _display: DisplayHandle, surface: SurfaceHandle) -> Result<(), ApiError> {
        const OP: &str = "swap_buffers";
        let record = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| ApiError::new(OP, "unknown surface"))?;
        match &mut record.kind {
            SurfaceKind::Offscreen => Ok(()),
            SurfaceKind::Window { frame, .. } => {
                let frame = frame
                    .take()
                    .ok_or_else(|| ApiError::new(OP, "nothing was drawn since the last swap"))?;
                frame.present();
                Ok(())
            }
            SurfaceKind::Image(target) => {
                let target = target.clone();
                let (size, format, timestamp_ns, context) =
                    (record.size, record.format, record.timestamp_ns, record.context);
                let texture = record
                    .texture
                    .as_ref()
                    .ok_or_else(|| ApiError::new(OP, "image surface has no texture"))?;
                let device = self
                    .devices
                    .get(&context)
                    .ok_or_else(|| ApiError::new(OP, "surface context was destroyed"))?;
                let rgba = read_texture(&device.device, &device.queue, texture, format, size)?;
                target
                    .deliver(DeliveredImage::Frame(RenderedFrame {
                        size,
                        timestamp_ns,
                        rgba,
                    }))
                    .map_err(|error| ApiError::new(OP, error.to_string()))
            }
        }
    }

    fn read_pixels(&mut self, size: Size) -> Result<Vec<u8>, ApiError> {
        const OP: &str = "read_pixels";
        let surface = self
            .current_surface
            .and_then(|surface| self.surfaces.get(&surface))
            .ok_or_else(|| ApiError::new(OP, "no surface is current"))?;
        if size.width > surface.size.width || size.height > surface.size.height {
            return Err(ApiError::new(OP, format!("{size} exceeds surface {}", surface.size)));
        }
        let texture = surface
            .texture
            .as_ref()
            .ok_or_else(|| ApiError::new(OP, "window surfaces cannot be read back"))?;
        let device = self
            .devices
            .get(&surface.context)
            .ok_or_else(|| ApiError::new(OP, "surface context was destroyed"))?;
        let top_down = read_texture(&device.device, &device.queue, texture, surface.format, surface.size)?;

        let full_row = surface.size.width as usize * 4;
        let row = size.width as usize * 4;
        let mut bottom_up = Vec::with_capacity(row * size.height as usize);
        for line in top_down.chunks(full_row).take(size.height as usize).rev() {
            bottom_up.extend_from_slice(&line[..row]);
        }
        Ok(bottom_up)
    }
}
