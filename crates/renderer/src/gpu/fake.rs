//! Recording [`GraphicsApi`] used by unit tests.
//!
//! Every call is appended to an op log and mutates a small model of the
//! native objects so tests can assert on ordering, liveness and isolation.
//! The [`FakeMonitor`] half stays with the test to inspect state and inject
//! failures while the [`FakeApi`] half is moved onto the render thread.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    ActiveUniform, ColorBits, ConfigHandle, ConfigRequest, ContextHandle, DisplayHandle,
    GraphicsApi, PipelineHandle, ProgramHandle, SurfaceAttribs, SurfaceColorSpace, SurfaceHandle,
    TextureHandle, UniformLocation, UniformType, UniformValue, HLG_COLORSPACE_EXTENSION,
    YUV_TARGET_EXTENSION,
};
use crate::compile::PROPERTY_BLOCK;
use crate::error::{ApiError, ShaderStage};
use crate::host::{FrameImage, NativeWindow, SurfaceId};
use crate::matrix::Mat4;
use crate::types::{DeviceInfo, Size};

#[derive(Clone, Debug)]
pub(crate) struct FakeSurface {
    pub window: Option<SurfaceId>,
    pub size: Size,
    pub color_space: SurfaceColorSpace,
}

#[derive(Clone, Debug)]
pub(crate) struct FakeProgram {
    pub stage: ShaderStage,
    pub source: String,
    pub uniforms: Vec<ActiveUniform>,
    pub values: HashMap<String, UniformValue>,
}

/// One `draw_quad`, with the vertex matrices that were bound for it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DrawRecord {
    pub surface: SurfaceHandle,
    pub fragment: ProgramHandle,
    pub transform: Mat4,
    pub texture_matrix: Mat4,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    ops: Vec<String>,

    displays: HashSet<DisplayHandle>,
    configs: HashMap<ConfigHandle, ColorBits>,
    contexts: HashSet<ContextHandle>,
    contexts_created: usize,
    surfaces: HashMap<SurfaceHandle, FakeSurface>,
    surfaces_destroyed: Vec<SurfaceHandle>,
    programs: HashMap<ProgramHandle, FakeProgram>,
    pipelines: HashMap<PipelineHandle, (Option<ProgramHandle>, Option<ProgramHandle>)>,
    textures: HashSet<TextureHandle>,
    uploads: usize,

    current: (Option<SurfaceHandle>, Option<ContextHandle>),
    bound_pipeline: Option<PipelineHandle>,
    uniform_writes: usize,
    draws: Vec<DrawRecord>,
    swaps: Vec<SurfaceHandle>,
    presentation_times: Vec<(SurfaceHandle, i64)>,
    read_pixels: usize,

    gl_extensions: String,
    egl_extensions: String,
    fail_open_display: bool,
    fail_hdr_config: bool,
    fail_window_surface: HashSet<SurfaceId>,
    fail_swap: HashSet<SurfaceId>,
    fail_draw: HashSet<SurfaceId>,
    fail_compile: Option<String>,
}

impl FakeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn log(&mut self, op: impl Into<String>) {
        self.ops.push(op.into());
    }

    fn window_of(&self, surface: SurfaceHandle) -> Option<SurfaceId> {
        self.surfaces.get(&surface).and_then(|record| record.window)
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test double for the native graphics API.
pub(crate) struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side view of a [`FakeApi`].
#[derive(Clone)]
pub(crate) struct FakeMonitor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn new() -> (Self, FakeMonitor) {
        let state = Arc::new(Mutex::new(FakeState {
            gl_extensions: format!("GL_OES_EGL_image_external {YUV_TARGET_EXTENSION}"),
            egl_extensions: format!("EGL_KHR_surfaceless_context {HLG_COLORSPACE_EXTENSION}"),
            ..FakeState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            FakeMonitor { state },
        )
    }
}

impl FakeMonitor {
    pub fn ops(&self) -> Vec<String> {
        lock(&self.state).ops.clone()
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        lock(&self.state)
            .ops
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub fn set_extensions(&self, gl: &str, egl: &str) {
        let mut state = lock(&self.state);
        state.gl_extensions = gl.to_string();
        state.egl_extensions = egl.to_string();
    }

    pub fn fail_open_display(&self) {
        lock(&self.state).fail_open_display = true;
    }

    pub fn fail_hdr_config(&self) {
        lock(&self.state).fail_hdr_config = true;
    }

    pub fn fail_window_surface(&self, window: SurfaceId, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_window_surface.insert(window);
        } else {
            state.fail_window_surface.remove(&window);
        }
    }

    pub fn fail_swap(&self, window: SurfaceId, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_swap.insert(window);
        } else {
            state.fail_swap.remove(&window);
        }
    }

    pub fn fail_draw(&self, window: SurfaceId) {
        lock(&self.state).fail_draw.insert(window);
    }

    /// Makes every later program whose source contains `marker` fail to
    /// compile.
    pub fn fail_compile_containing(&self, marker: &str) {
        lock(&self.state).fail_compile = Some(marker.to_string());
    }

    pub fn live_displays(&self) -> usize {
        lock(&self.state).displays.len()
    }

    pub fn live_contexts(&self) -> usize {
        lock(&self.state).contexts.len()
    }

    pub fn contexts_created(&self) -> usize {
        lock(&self.state).contexts_created
    }

    pub fn live_surfaces(&self) -> usize {
        lock(&self.state).surfaces.len()
    }

    /// Every surface handle that was destroyed, in order. Duplicates reveal a
    /// double free.
    pub fn destroyed_surfaces(&self) -> Vec<SurfaceHandle> {
        lock(&self.state).surfaces_destroyed.clone()
    }

    pub fn window_surface(&self, window: SurfaceId) -> Option<SurfaceHandle> {
        lock(&self.state)
            .surfaces
            .iter()
            .find(|(_, record)| record.window == Some(window))
            .map(|(handle, _)| *handle)
    }

    pub fn surface(&self, handle: SurfaceHandle) -> Option<FakeSurface> {
        lock(&self.state).surfaces.get(&handle).cloned()
    }

    pub fn live_programs(&self, stage: ShaderStage) -> usize {
        lock(&self.state)
            .programs
            .values()
            .filter(|program| program.stage == stage)
            .count()
    }

    pub fn program(&self, handle: ProgramHandle) -> Option<FakeProgram> {
        lock(&self.state).programs.get(&handle).cloned()
    }

    /// Fragment program attached to `pipeline`.
    pub fn attached_fragment(&self, pipeline: PipelineHandle) -> Option<ProgramHandle> {
        lock(&self.state)
            .pipelines
            .get(&pipeline)
            .and_then(|(_, fragment)| *fragment)
    }

    pub fn live_pipelines(&self) -> usize {
        lock(&self.state).pipelines.len()
    }

    pub fn live_textures(&self) -> usize {
        lock(&self.state).textures.len()
    }

    pub fn uploads(&self) -> usize {
        lock(&self.state).uploads
    }

    pub fn uniform_writes(&self) -> usize {
        lock(&self.state).uniform_writes
    }

    pub fn uniform_value(&self, program: ProgramHandle, name: &str) -> Option<UniformValue> {
        lock(&self.state)
            .programs
            .get(&program)
            .and_then(|program| program.values.get(name).copied())
    }

    pub fn draws(&self) -> Vec<DrawRecord> {
        lock(&self.state).draws.clone()
    }

    pub fn swaps_for(&self, window: SurfaceId) -> usize {
        let state = lock(&self.state);
        state
            .swaps
            .iter()
            .filter(|surface| state.window_of(**surface) == Some(window))
            .count()
    }

    pub fn total_swaps(&self) -> usize {
        lock(&self.state).swaps.len()
    }

    pub fn presentation_times(&self) -> Vec<i64> {
        lock(&self.state)
            .presentation_times
            .iter()
            .map(|(_, timestamp)| *timestamp)
            .collect()
    }

    pub fn read_pixels_calls(&self) -> usize {
        lock(&self.state).read_pixels
    }

    pub fn current(&self) -> (Option<SurfaceHandle>, Option<ContextHandle>) {
        lock(&self.state).current
    }
}

/// Members of the lifted property block, in declaration order.
fn property_uniforms(source: &str) -> Vec<ActiveUniform> {
    let header = format!("uniform {PROPERTY_BLOCK} {{");
    let mut inside = false;
    let mut uniforms = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if line.ends_with(&header) {
            inside = true;
            continue;
        }
        if !inside {
            continue;
        }
        if line.starts_with('}') {
            break;
        }
        let Some(decl) = line.strip_suffix(';') else {
            continue;
        };
        let mut parts = decl.split_whitespace();
        let (Some(ty), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (name, array_size) = match name.split_once('[') {
            Some((name, len)) => (name, len.trim_end_matches(']').parse().unwrap_or(1)),
            None => (name, 1),
        };
        uniforms.push(ActiveUniform {
            name: name.to_string(),
            ty: uniform_type(ty),
            array_size,
            location: UniformLocation(uniforms.len() as u32),
        });
    }
    uniforms
}

fn uniform_type(glsl: &str) -> UniformType {
    match glsl {
        "float" => UniformType::Float,
        "int" => UniformType::Int,
        "vec2" => UniformType::Vec2,
        "vec3" => UniformType::Vec3,
        "vec4" => UniformType::Vec4,
        "ivec2" => UniformType::IVec2,
        "ivec3" => UniformType::IVec3,
        "ivec4" => UniformType::IVec4,
        "mat4" => UniformType::Mat4,
        _ => UniformType::Unsupported,
    }
}

fn err(operation: &'static str, message: &str) -> ApiError {
    ApiError::new(operation, message)
}

impl GraphicsApi for FakeApi {
    fn open_display(&mut self) -> Result<DisplayHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log("open_display");
        if state.fail_open_display {
            return Err(err("open_display", "no display"));
        }
        let handle = DisplayHandle(state.handle());
        state.displays.insert(handle);
        Ok(handle)
    }

    fn choose_config(
        &mut self,
        display: DisplayHandle,
        request: &ConfigRequest,
    ) -> Result<ConfigHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("choose_config {:?}", request.color));
        if !state.displays.contains(&display) {
            return Err(err("choose_config", "unknown display"));
        }
        if state.fail_hdr_config && request.color == ColorBits::Rgba1010102 {
            return Err(err("choose_config", "no matching config"));
        }
        let handle = ConfigHandle(state.handle());
        state.configs.insert(handle, request.color);
        Ok(handle)
    }

    fn create_context(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        request: &ConfigRequest,
    ) -> Result<ContextHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("create_context v{}", request.client_version));
        if !state.displays.contains(&display) || !state.configs.contains_key(&config) {
            return Err(err("create_context", "bad display or config"));
        }
        let handle = ContextHandle(state.handle());
        state.contexts.insert(handle);
        state.contexts_created += 1;
        Ok(handle)
    }

    fn create_pbuffer_surface(
        &mut self,
        _display: DisplayHandle,
        _config: ConfigHandle,
        size: Size,
    ) -> Result<SurfaceHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("create_pbuffer {size}"));
        let handle = SurfaceHandle(state.handle());
        state.surfaces.insert(
            handle,
            FakeSurface {
                window: None,
                size,
                color_space: SurfaceColorSpace::Default,
            },
        );
        Ok(handle)
    }

    fn create_window_surface(
        &mut self,
        _display: DisplayHandle,
        _config: ConfigHandle,
        window: &NativeWindow,
        attribs: &SurfaceAttribs,
    ) -> Result<SurfaceHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("create_window_surface {}", window.id()));
        if state.fail_window_surface.contains(&window.id()) {
            return Err(err("create_window_surface", "bad native window"));
        }
        let handle = SurfaceHandle(state.handle());
        state.surfaces.insert(
            handle,
            FakeSurface {
                window: Some(window.id()),
                size: window.size(),
                color_space: attribs.color_space,
            },
        );
        Ok(handle)
    }

    fn surface_size(&self, surface: SurfaceHandle) -> Result<Size, ApiError> {
        lock(&self.state)
            .surfaces
            .get(&surface)
            .map(|record| record.size)
            .ok_or_else(|| err("surface_size", "unknown surface"))
    }

    fn make_current(
        &mut self,
        _display: DisplayHandle,
        surface: Option<SurfaceHandle>,
        context: Option<ContextHandle>,
    ) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("make_current {:?}", surface.map(|s| s.0)));
        if surface.is_some_and(|surface| !state.surfaces.contains_key(&surface)) {
            return Err(err("make_current", "unknown surface"));
        }
        if context.is_some_and(|context| !state.contexts.contains(&context)) {
            return Err(err("make_current", "unknown context"));
        }
        state.current = (surface, context);
        Ok(())
    }

    fn destroy_surface(&mut self, _display: DisplayHandle, surface: SurfaceHandle) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("destroy_surface {}", surface.0));
        state.surfaces_destroyed.push(surface);
        state
            .surfaces
            .remove(&surface)
            .map(|_| ())
            .ok_or_else(|| err("destroy_surface", "unknown surface"))
    }

    fn destroy_context(&mut self, _display: DisplayHandle, context: ContextHandle) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.log("destroy_context");
        if !state.contexts.remove(&context) {
            return Err(err("destroy_context", "unknown context"));
        }
        Ok(())
    }

    fn terminate_display(&mut self, display: DisplayHandle) {
        let mut state = lock(&self.state);
        state.log("terminate_display");
        state.displays.remove(&display);
    }

    fn device_info(&self, display: DisplayHandle) -> DeviceInfo {
        let state = lock(&self.state);
        if !state.displays.contains(&display) {
            return DeviceInfo::default();
        }
        DeviceInfo {
            gl_version: "3.2 fake".to_string(),
            egl_version: "1.5".to_string(),
            gl_extensions: state.gl_extensions.clone(),
            egl_extensions: state.egl_extensions.clone(),
        }
    }

    fn create_program(&mut self, stage: ShaderStage, source: &str) -> Result<ProgramHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("create_program {stage:?}"));
        if source.contains("#error") {
            return Err(err("create_program", "0:1: error: #error directive"));
        }
        if state
            .fail_compile
            .as_deref()
            .is_some_and(|marker| source.contains(marker))
        {
            return Err(err("create_program", "0:1: error: injected failure"));
        }
        let uniforms = match stage {
            ShaderStage::Vertex => vec![
                ActiveUniform {
                    name: "uTexMatrix".to_string(),
                    ty: UniformType::Mat4,
                    array_size: 1,
                    location: UniformLocation(0),
                },
                ActiveUniform {
                    name: "uTransMatrix".to_string(),
                    ty: UniformType::Mat4,
                    array_size: 1,
                    location: UniformLocation(64),
                },
            ],
            ShaderStage::Fragment => property_uniforms(source),
        };
        let handle = ProgramHandle(state.handle());
        state.programs.insert(
            handle,
            FakeProgram {
                stage,
                source: source.to_string(),
                uniforms,
                values: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn active_uniforms(&self, program: ProgramHandle) -> Result<Vec<ActiveUniform>, ApiError> {
        lock(&self.state)
            .programs
            .get(&program)
            .map(|program| program.uniforms.clone())
            .ok_or_else(|| err("active_uniforms", "unknown program"))
    }

    fn set_uniform(
        &mut self,
        program: ProgramHandle,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.uniform_writes += 1;
        let record = state
            .programs
            .get_mut(&program)
            .ok_or_else(|| err("set_uniform", "unknown program"))?;
        let name = record
            .uniforms
            .iter()
            .find(|uniform| uniform.location == location)
            .map(|uniform| uniform.name.clone())
            .ok_or_else(|| err("set_uniform", "no uniform at location"))?;
        record.values.insert(name, *value);
        Ok(())
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        let mut state = lock(&self.state);
        state.log(format!("delete_program {}", program.0));
        state.programs.remove(&program);
    }

    fn create_program_pipeline(&mut self) -> Result<PipelineHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log("create_program_pipeline");
        let handle = PipelineHandle(state.handle());
        state.pipelines.insert(handle, (None, None));
        Ok(handle)
    }

    fn use_program_stage(
        &mut self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        program: ProgramHandle,
    ) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("use_program_stage {stage:?} {}", program.0));
        if !state.programs.contains_key(&program) {
            return Err(err("use_program_stage", "unknown program"));
        }
        let slots = state
            .pipelines
            .get_mut(&pipeline)
            .ok_or_else(|| err("use_program_stage", "unknown pipeline"))?;
        match stage {
            ShaderStage::Vertex => slots.0 = Some(program),
            ShaderStage::Fragment => slots.1 = Some(program),
        }
        Ok(())
    }

    fn bind_program_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("bind_program_pipeline {}", pipeline.0));
        if !state.pipelines.contains_key(&pipeline) {
            return Err(err("bind_program_pipeline", "unknown pipeline"));
        }
        state.bound_pipeline = Some(pipeline);
        Ok(())
    }

    fn delete_program_pipeline(&mut self, pipeline: PipelineHandle) {
        let mut state = lock(&self.state);
        state.log(format!("delete_program_pipeline {}", pipeline.0));
        state.pipelines.remove(&pipeline);
        if state.bound_pipeline == Some(pipeline) {
            state.bound_pipeline = None;
        }
    }

    fn bind_quad_geometry(&mut self) -> Result<(), ApiError> {
        lock(&self.state).log("bind_quad_geometry");
        Ok(())
    }

    fn create_input_texture(&mut self) -> Result<TextureHandle, ApiError> {
        let mut state = lock(&self.state);
        state.log("create_input_texture");
        let handle = TextureHandle(state.handle());
        state.textures.insert(handle);
        Ok(handle)
    }

    fn upload_input_texture(&mut self, texture: TextureHandle, _image: &FrameImage) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        if !state.textures.contains(&texture) {
            return Err(err("upload_input_texture", "unknown texture"));
        }
        state.uploads += 1;
        Ok(())
    }

    fn bind_input_texture(&mut self, texture: TextureHandle) -> Result<(), ApiError> {
        let state = lock(&self.state);
        if !state.textures.contains(&texture) {
            return Err(err("bind_input_texture", "unknown texture"));
        }
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        let mut state = lock(&self.state);
        state.log("delete_texture");
        state.textures.remove(&texture);
    }

    fn viewport(&mut self, _size: Size) {}

    fn draw_quad(&mut self) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        let surface = state.current.0.ok_or_else(|| err("draw_quad", "no surface"))?;
        if state
            .window_of(surface)
            .is_some_and(|window| state.fail_draw.contains(&window))
        {
            return Err(err("draw_quad", "GL_INVALID_OPERATION"));
        }
        let (vertex, fragment) = state
            .bound_pipeline
            .and_then(|pipeline| state.pipelines.get(&pipeline))
            .copied()
            .ok_or_else(|| err("draw_quad", "no pipeline bound"))?;
        let fragment = fragment.ok_or_else(|| err("draw_quad", "no fragment program bound"))?;
        let matrix = |name: &str| {
            vertex
                .and_then(|vertex| state.programs.get(&vertex))
                .and_then(|program| program.values.get(name))
                .and_then(|value| match value {
                    UniformValue::Mat4(matrix) => Some(*matrix),
                    _ => None,
                })
                .unwrap_or(Mat4::IDENTITY)
        };
        let record = DrawRecord {
            surface,
            fragment,
            transform: matrix("uTransMatrix"),
            texture_matrix: matrix("uTexMatrix"),
        };
        state.log(format!("draw {}", surface.0));
        state.draws.push(record);
        Ok(())
    }

    fn set_presentation_time(
        &mut self,
        _display: DisplayHandle,
        surface: SurfaceHandle,
        timestamp_ns: i64,
    ) -> Result<(), ApiError> {
        lock(&self.state).presentation_times.push((surface, timestamp_ns));
        Ok(())
    }

    fn swap_buffers(&mut self, _display: DisplayHandle, surface: SurfaceHandle) -> Result<(), ApiError> {
        let mut state = lock(&self.state);
        state.log(format!("swap {}", surface.0));
        if state
            .window_of(surface)
            .is_some_and(|window| state.fail_swap.contains(&window))
        {
            return Err(err("swap_buffers", "EGL_BAD_SURFACE"));
        }
        state.swaps.push(surface);
        Ok(())
    }

    fn read_pixels(&mut self, size: Size) -> Result<Vec<u8>, ApiError> {
        let mut state = lock(&self.state);
        state.read_pixels += 1;
        let current = state.current.0;
        let draw = state
            .draws
            .iter()
            .rev()
            .find(|draw| Some(draw.surface) == current)
            .copied();
        let mut pixels = Vec::with_capacity(size.width as usize * size.height as usize * 4);
        for row in 0..size.height {
            for column in 0..size.width {
                let pixel = match &draw {
                    Some(draw) => shade(draw, size, column, row),
                    None => [0x40, 0x40, 0x80, 0xff],
                };
                pixels.extend_from_slice(&pixel);
            }
        }
        Ok(pixels)
    }
}

/// Colour the quad would leave at `(column, row)`, rows counted from the
/// bottom. The input is modelled as four quadrants: red marks its top half
/// (`v < 0.5`) and green its left half (`u < 0.5`). Pixels the quad does not
/// cover stay black.
fn shade(draw: &DrawRecord, size: Size, column: u32, row: u32) -> [u8; 4] {
    let clip_x = (column as f32 + 0.5) / size.width as f32 * 2.0 - 1.0;
    let clip_y = (row as f32 + 0.5) / size.height as f32 * 2.0 - 1.0;
    let Some((x, y)) = unproject(&draw.transform, clip_x, clip_y) else {
        return [0, 0, 0, 0xff];
    };
    if x.abs() > 1.0 || y.abs() > 1.0 {
        return [0, 0, 0, 0xff];
    }
    let (u, v) = draw
        .texture_matrix
        .transform_point((x + 1.0) / 2.0, (y + 1.0) / 2.0);
    let half = |inside: bool| if inside { 0xff } else { 0 };
    [half(v < 0.5), half(u < 0.5), 0x80, 0xff]
}

/// Quad position that `transform` maps onto clip-space `(x, y)`.
fn unproject(transform: &Mat4, x: f32, y: f32) -> Option<(f32, f32)> {
    let m = &transform.0;
    let det = m[0] * m[5] - m[4] * m[1];
    if det.abs() < f32::EPSILON {
        return None;
    }
    let (x, y) = (x - m[12], y - m[13]);
    Some(((m[5] * x - m[4] * y) / det, (m[0] * y - m[1] * x) / det))
}
