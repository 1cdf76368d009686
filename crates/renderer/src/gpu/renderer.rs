use std::collections::HashMap;

use tracing::{debug, error, trace, warn};

use super::context::GraphicsContext;
use super::pipeline::ShaderPipeline;
use super::{GraphicsApi, TextureHandle};
use crate::compile::SamplerKind;
use crate::effects::{AttachCallback, FragmentShader, PreFrameCallback};
use crate::error::{ApiError, ContextError, InitializationError, ShaderError};
use crate::host::{InputFrame, NativeWindow, SurfaceId};
use crate::matrix::Mat4;
use crate::types::{DeviceInfo, DynamicRange, InputFormat, PropertyValue, Size};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RendererState {
    Uninitialized,
    Initialized,
    Rendering,
    Released,
}

/// What happened to one output during a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputRender {
    Presented,
    /// No native surface or the draw failed; retried next frame.
    Skipped,
    /// The swap failed and the surface was demoted for recreation.
    SurfaceLost,
}

/// Draws the camera texture through the pipeline matching the current input
/// format into each output.
pub(crate) struct FrameRenderer {
    ctx: GraphicsContext,
    state: RendererState,
    pipelines: HashMap<InputFormat, ShaderPipeline>,
    input_format: InputFormat,
    input_texture: Option<TextureHandle>,
    shader_source: String,
    on_attach: Option<AttachCallback>,
    on_pre_frame: Option<PreFrameCallback>,
}

impl FrameRenderer {
    pub fn new(gl: Box<dyn GraphicsApi>) -> Self {
        Self {
            ctx: GraphicsContext::new(gl),
            state: RendererState::Uninitialized,
            pipelines: HashMap::new(),
            input_format: InputFormat::Unknown,
            input_texture: None,
            shader_source: String::new(),
            on_attach: None,
            on_pre_frame: None,
        }
    }

    /// Initializes the context, compiles one pipeline per input format,
    /// seeds each through the shader's attach hook and activates the one for
    /// [`InputFormat::Unknown`].
    pub fn init(
        &mut self,
        dynamic_range: DynamicRange,
        shader: FragmentShader,
    ) -> Result<DeviceInfo, InitializationError> {
        if self.state != RendererState::Uninitialized {
            return Err(ContextError::AlreadyInitialized.into());
        }
        let info = self.ctx.initialize(dynamic_range)?;
        let hdr = self.ctx.dynamic_range().is_10bit_hdr();

        if let Err(error) = self.build_pipelines(hdr, &shader.source, shader.on_attach.as_ref()) {
            self.teardown();
            return Err(error);
        }
        self.shader_source = shader.source;
        self.on_attach = shader.on_attach;
        self.on_pre_frame = shader.on_pre_frame;
        self.input_format = InputFormat::Unknown;
        if let Err(error) = self.apply_input_format() {
            self.teardown();
            return Err(InitializationError::Misuse(error));
        }
        self.state = RendererState::Initialized;
        debug!(range = %self.ctx.dynamic_range(), "frame renderer initialized");
        Ok(info)
    }

    fn build_pipelines(
        &mut self,
        hdr: bool,
        source: &str,
        on_attach: Option<&AttachCallback>,
    ) -> Result<(), InitializationError> {
        let gl = self.ctx.api()?;
        for format in InputFormat::ALL {
            let sampler = SamplerKind::for_format(format, hdr);
            let pipeline = ShaderPipeline::new(gl, sampler, source)?;
            if let Some(callback) = on_attach {
                pipeline.run_on_attach(gl, callback);
            }
            self.pipelines.insert(format, pipeline);
        }
        let texture = gl
            .create_input_texture()
            .map_err(|error| InitializationError::Misuse(error.into()))?;
        self.input_texture = Some(texture);
        Ok(())
    }

    pub fn state(&self) -> RendererState {
        self.state
    }

    pub fn dynamic_range(&self) -> DynamicRange {
        self.ctx.dynamic_range()
    }

    pub fn input_format(&self) -> InputFormat {
        self.input_format
    }

    fn ensure_live(&self) -> Result<(), ContextError> {
        match self.state {
            RendererState::Uninitialized => Err(ContextError::NotInitialized),
            RendererState::Released => Err(ContextError::Released),
            RendererState::Initialized | RendererState::Rendering => Ok(()),
        }
    }

    fn active_pipeline(&self) -> Result<&ShaderPipeline, ContextError> {
        self.pipelines
            .get(&self.input_format)
            .ok_or(ContextError::NotInitialized)
    }

    /// Rebinds the pipeline for the current format.
    fn apply_input_format(&mut self) -> Result<(), ContextError> {
        let pipeline = self
            .pipelines
            .get(&self.input_format)
            .ok_or(ContextError::NotInitialized)?;
        let gl = self.ctx.api()?;
        pipeline.activate(gl)?;
        trace!(format = %self.input_format, sampler = ?pipeline.sampler(), "activated pipeline");
        Ok(())
    }

    /// Switches the active pipeline when the format changes. Textures are
    /// left alone.
    pub fn set_input_format(&mut self, format: InputFormat) -> Result<(), ContextError> {
        self.ensure_live()?;
        if format == self.input_format {
            return Ok(());
        }
        debug!(from = %self.input_format, to = %format, "input format changed");
        self.input_format = format;
        self.apply_input_format()
    }

    /// Swaps the fragment program of every pipeline.
    ///
    /// Either all pipelines take the new shader or none do. The active
    /// pipeline is re-applied afterwards even if the format is unchanged.
    pub fn set_fragment_shader(&mut self, shader: FragmentShader) -> Result<(), ShaderError> {
        self.ensure_live()?;
        let gl = self.ctx.api()?;
        let mut swapped = Vec::new();
        let mut failure = None;
        for format in InputFormat::ALL {
            let Some(pipeline) = self.pipelines.get_mut(&format) else {
                continue;
            };
            match pipeline.set_fragment_shader(gl, &shader.source, shader.on_attach.as_ref()) {
                Ok(()) => swapped.push(format),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            for format in swapped {
                if let Some(pipeline) = self.pipelines.get_mut(&format) {
                    let restored =
                        pipeline.restore_fragment_shader(gl, &self.shader_source, self.on_attach.as_ref());
                    if let Err(restore) = restored {
                        error!(%format, %restore, "failed to restore previous fragment shader");
                    }
                }
            }
            self.apply_input_format()?;
            return Err(error);
        }

        self.shader_source = shader.source;
        self.on_attach = shader.on_attach;
        self.on_pre_frame = shader.on_pre_frame;
        self.apply_input_format()?;
        Ok(())
    }

    /// Sets a property on every pipeline so it survives format switches.
    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), ContextError> {
        self.ensure_live()?;
        let gl = self.ctx.api()?;
        for pipeline in self.pipelines.values() {
            if let Err(error) = pipeline.set_property(gl, name, value) {
                warn!(name, %error, "failed to set property");
            }
        }
        Ok(())
    }

    /// Frames drawn by the active pipeline since its last shader swap.
    pub fn frame_count(&self) -> u64 {
        self.active_pipeline()
            .map(ShaderPipeline::frame_count)
            .unwrap_or_default()
    }

    /// Runs the pre-frame callback once for the frame about to be drawn into
    /// every output and advances the active pipeline's frame counter.
    pub fn begin_frame(&mut self, size: Size) -> Result<(), ContextError> {
        self.ensure_live()?;
        let gl = self.ctx.api()?;
        let pipeline = self
            .pipelines
            .get_mut(&self.input_format)
            .ok_or(ContextError::NotInitialized)?;
        pipeline.on_before_draw(gl, self.on_pre_frame.as_mut(), size);
        Ok(())
    }

    /// Uploads the newest camera frame into the input texture.
    pub fn update_input(&mut self, frame: &InputFrame) -> Result<(), ContextError> {
        self.ensure_live()?;
        let texture = self.input_texture.ok_or(ContextError::NotInitialized)?;
        self.ctx.make_placeholder_current()?;
        self.ctx.api()?.upload_input_texture(texture, &frame.image)?;
        Ok(())
    }

    pub fn register_output(&mut self, window: NativeWindow) -> Result<bool, ContextError> {
        self.ensure_live()?;
        self.ctx.register_output(window)
    }

    pub fn unregister_output(&mut self, id: SurfaceId) -> Result<bool, ContextError> {
        self.ensure_live()?;
        self.ctx.unregister_output(id)
    }

    pub fn has_output(&self, id: SurfaceId) -> bool {
        self.ctx.has_output(id)
    }

    pub fn is_output_pending(&self, id: SurfaceId) -> bool {
        self.ctx.is_output_pending(id)
    }

    /// Renders the current input texture into one registered output.
    ///
    /// Failures confined to this output are logged and reported through the
    /// returned [`OutputRender`]; only misuse is returned as an error.
    pub fn render(
        &mut self,
        timestamp_ns: i64,
        texture_matrix: &Mat4,
        id: SurfaceId,
    ) -> Result<OutputRender, ContextError> {
        self.ensure_live()?;
        let Some(surface) = self.ctx.resolve_output(id)? else {
            return Ok(OutputRender::Skipped);
        };
        self.state = RendererState::Rendering;
        self.ctx.make_current(surface.handle)?;

        if let Err(error) = self.draw(surface.size, texture_matrix, &Mat4::IDENTITY) {
            warn!(surface = %id, %error, "failed to draw output; skipping");
            return Ok(OutputRender::Skipped);
        }
        if let Err(error) = self.ctx.set_presentation_time(surface.handle, timestamp_ns) {
            debug!(surface = %id, %error, "failed to set presentation time");
        }
        if let Err(error) = self.ctx.swap_buffers(surface.handle) {
            warn!(surface = %id, %error, "failed to swap buffers; recreating surface next frame");
            self.ctx.invalidate_output(id)?;
            return Ok(OutputRender::SurfaceLost);
        }
        Ok(OutputRender::Presented)
    }

    fn draw(&mut self, size: Size, texture_matrix: &Mat4, transform: &Mat4) -> Result<(), ApiError> {
        let texture = self
            .input_texture
            .ok_or_else(|| ApiError::new("draw", "input texture missing"))?;
        let gl = self
            .ctx
            .api()
            .map_err(|error| ApiError::new("draw", error.to_string()))?;
        let pipeline = self
            .pipelines
            .get(&self.input_format)
            .ok_or_else(|| ApiError::new("draw", "no pipeline for input format"))?;

        gl.viewport(size);
        pipeline.update_texture_matrix(gl, texture_matrix)?;
        pipeline.update_transform_matrix(gl, transform)?;
        gl.bind_input_texture(texture)?;
        gl.draw_quad()
    }

    /// Renders the current input offscreen at `size` with `transform` applied
    /// to the geometry and returns the RGBA pixels in readback order.
    pub fn snapshot(
        &mut self,
        size: Size,
        texture_matrix: &Mat4,
        transform: &Mat4,
    ) -> Result<Vec<u8>, ApiError> {
        self.ensure_live()
            .map_err(|error| ApiError::new("snapshot", error.to_string()))?;
        let surface = self
            .ctx
            .create_offscreen(size)
            .map_err(|error| ApiError::new("create_pbuffer_surface", error.to_string()))?;

        let result = self
            .ctx
            .make_current(surface)
            .map_err(|error| ApiError::new("make_current", error.to_string()))
            .and_then(|()| self.draw(size, texture_matrix, transform))
            .and_then(|()| {
                self.ctx
                    .api()
                    .map_err(|error| ApiError::new("read_pixels", error.to_string()))?
                    .read_pixels(size)
            });

        if let Err(error) = self.ctx.destroy_offscreen(surface) {
            warn!(%error, "failed to destroy snapshot surface");
        }
        result
    }

    /// Deletes pipelines and the input texture, then releases the context.
    pub fn release(&mut self) {
        if self.state == RendererState::Released {
            return;
        }
        self.teardown();
        self.state = RendererState::Released;
        debug!("frame renderer released");
    }

    fn teardown(&mut self) {
        if let Ok(gl) = self.ctx.api() {
            for (_, pipeline) in self.pipelines.drain() {
                pipeline.delete(gl);
            }
            if let Some(texture) = self.input_texture.take() {
                gl.delete_texture(texture);
            }
        }
        if let Err(error) = self.ctx.release() {
            error!(%error, "failed to release graphics context");
        }
    }
}
