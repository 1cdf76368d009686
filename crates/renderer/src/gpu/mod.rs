//! GPU side of the effects engine.
//!
//! Everything in here runs on the render thread only:
//! - `context` owns the display/config/context triple plus the placeholder
//!   surface and enforces thread affinity for every call.
//! - `surfaces` caches native surfaces for registered outputs, creating them
//!   lazily and demoting them back to a sentinel when they fail.
//! - `program` wraps compiled programs with the uniform table reflected at
//!   link time.
//! - `pipeline` pairs the fixed vertex program with a swappable fragment
//!   program inside a program pipeline object.
//! - `renderer` drives per-surface draws and selects the pipeline matching the
//!   current input format.
//! - `wgpu_backend` implements [`GraphicsApi`] on top of `wgpu`; `reflect`
//!   pulls uniform tables out of parsed GLSL.
//!
//! The [`GraphicsApi`] trait mirrors the native calls the engine issues so
//! the lifecycle logic can run against a recording fake in tests.

mod context;
#[cfg(test)]
pub(crate) mod fake;
mod pipeline;
mod program;
pub(crate) mod reflect;
mod renderer;
mod surfaces;
mod wgpu_backend;

pub(crate) use renderer::{FrameRenderer, OutputRender};
pub use wgpu_backend::WgpuBackend;

use crate::error::{ApiError, ShaderStage};
use crate::host::{FrameImage, NativeWindow};
use crate::matrix::Mat4;
use crate::types::{DeviceInfo, PropertyValue, Size};

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

native_handle!(
    /// Connection to the display the context renders for.
    DisplayHandle
);
native_handle!(
    /// Framebuffer configuration chosen for the display.
    ConfigHandle
);
native_handle!(ContextHandle);
native_handle!(SurfaceHandle);
native_handle!(ProgramHandle);
native_handle!(PipelineHandle);
native_handle!(TextureHandle);

/// Location of an active uniform inside its program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

/// Extension advertising 10-bit YUV sampling support.
pub const YUV_TARGET_EXTENSION: &str = "GL_EXT_YUV_target";
/// Extension advertising the BT.2020 HLG surface colour space.
pub const HLG_COLORSPACE_EXTENSION: &str = "EGL_EXT_gl_colorspace_bt2020_hlg";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorBits {
    Rgba8888,
    Rgba1010102,
}

/// Parameters for config selection and context creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigRequest {
    pub color: ColorBits,
    /// 3 for 10-bit output, 2 otherwise.
    pub client_version: u32,
    pub recordable: bool,
}

impl ConfigRequest {
    pub fn for_hdr(hdr: bool) -> Self {
        if hdr {
            Self {
                color: ColorBits::Rgba1010102,
                client_version: 3,
                recordable: true,
            }
        } else {
            Self {
                color: ColorBits::Rgba8888,
                client_version: 2,
                recordable: true,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SurfaceColorSpace {
    #[default]
    Default,
    Bt2020Hlg,
}

/// Attributes applied to every output window surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SurfaceAttribs {
    pub color_space: SurfaceColorSpace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformType {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
    IVec2,
    IVec3,
    IVec4,
    Mat4,
    Sampler,
    Unsupported,
}

/// One entry of a program's active uniform table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveUniform {
    pub name: String,
    pub ty: UniformType,
    pub array_size: u32,
    pub location: UniformLocation,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    IVec2([i32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4(Mat4),
}

impl UniformValue {
    /// The uniform type a value of this shape can be written to.
    pub fn uniform_type(&self) -> UniformType {
        match self {
            UniformValue::Float(_) => UniformType::Float,
            UniformValue::Int(_) => UniformType::Int,
            UniformValue::Vec2(_) => UniformType::Vec2,
            UniformValue::IVec2(_) => UniformType::IVec2,
            UniformValue::Vec3(_) => UniformType::Vec3,
            UniformValue::Vec4(_) => UniformType::Vec4,
            UniformValue::Mat4(_) => UniformType::Mat4,
        }
    }
}

impl From<PropertyValue> for UniformValue {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Float(v) => UniformValue::Float(v),
            PropertyValue::Int(v) => UniformValue::Int(v),
            PropertyValue::Vec2(v) => UniformValue::Vec2(v),
            PropertyValue::IVec2(v) => UniformValue::IVec2(v),
            PropertyValue::Vec3(v) => UniformValue::Vec3(v),
            PropertyValue::Vec4(v) => UniformValue::Vec4(v),
        }
    }
}

/// Native graphics calls issued by the engine.
///
/// Implementations are only ever driven from the render thread, one call at
/// a time. Handles are opaque to the engine and only meaningful to the
/// implementation that issued them.
pub trait GraphicsApi: Send {
    fn open_display(&mut self) -> Result<DisplayHandle, ApiError>;
    fn choose_config(
        &mut self,
        display: DisplayHandle,
        request: &ConfigRequest,
    ) -> Result<ConfigHandle, ApiError>;
    fn create_context(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        request: &ConfigRequest,
    ) -> Result<ContextHandle, ApiError>;
    fn create_pbuffer_surface(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        size: Size,
    ) -> Result<SurfaceHandle, ApiError>;
    fn create_window_surface(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        window: &NativeWindow,
        attribs: &SurfaceAttribs,
    ) -> Result<SurfaceHandle, ApiError>;
    fn surface_size(&self, surface: SurfaceHandle) -> Result<Size, ApiError>;
    /// Binds `surface` as both draw and read target. `None` unbinds.
    fn make_current(
        &mut self,
        display: DisplayHandle,
        surface: Option<SurfaceHandle>,
        context: Option<ContextHandle>,
    ) -> Result<(), ApiError>;
    fn destroy_surface(&mut self, display: DisplayHandle, surface: SurfaceHandle)
        -> Result<(), ApiError>;
    fn destroy_context(&mut self, display: DisplayHandle, context: ContextHandle)
        -> Result<(), ApiError>;
    fn terminate_display(&mut self, display: DisplayHandle);
    /// Version and extension strings; GL strings need a current context.
    fn device_info(&self, display: DisplayHandle) -> DeviceInfo;

    /// Compiles and links a separable single-stage program. The error
    /// message carries the compiler log.
    fn create_program(&mut self, stage: ShaderStage, source: &str) -> Result<ProgramHandle, ApiError>;
    fn active_uniforms(&self, program: ProgramHandle) -> Result<Vec<ActiveUniform>, ApiError>;
    fn set_uniform(
        &mut self,
        program: ProgramHandle,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), ApiError>;
    fn delete_program(&mut self, program: ProgramHandle);

    fn create_program_pipeline(&mut self) -> Result<PipelineHandle, ApiError>;
    fn use_program_stage(
        &mut self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        program: ProgramHandle,
    ) -> Result<(), ApiError>;
    fn bind_program_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), ApiError>;
    fn delete_program_pipeline(&mut self, pipeline: PipelineHandle);

    /// Binds the fixed full-screen quad to the position and texcoord inputs.
    fn bind_quad_geometry(&mut self) -> Result<(), ApiError>;
    fn create_input_texture(&mut self) -> Result<TextureHandle, ApiError>;
    fn upload_input_texture(
        &mut self,
        texture: TextureHandle,
        image: &FrameImage,
    ) -> Result<(), ApiError>;
    /// Binds the input texture to unit 0.
    fn bind_input_texture(&mut self, texture: TextureHandle) -> Result<(), ApiError>;
    fn delete_texture(&mut self, texture: TextureHandle);

    fn viewport(&mut self, size: Size);
    fn draw_quad(&mut self) -> Result<(), ApiError>;
    fn set_presentation_time(
        &mut self,
        display: DisplayHandle,
        surface: SurfaceHandle,
        timestamp_ns: i64,
    ) -> Result<(), ApiError>;
    fn swap_buffers(&mut self, display: DisplayHandle, surface: SurfaceHandle)
        -> Result<(), ApiError>;
    /// Reads RGBA8 pixels of the current draw surface, bottom row first.
    fn read_pixels(&mut self, size: Size) -> Result<Vec<u8>, ApiError>;
}
