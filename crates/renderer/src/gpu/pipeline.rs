use tracing::{debug, warn};

use super::program::{FragmentProgram, ProgramProperties, VertexProgram};
use super::{GraphicsApi, PipelineHandle, ProgramHandle};
use crate::compile::SamplerKind;
use crate::effects::{AttachCallback, PreFrameCallback};
use crate::error::{ApiError, ShaderError, ShaderStage};
use crate::matrix::Mat4;
use crate::types::{PropertyValue, Size};

/// Fixed vertex program plus a swappable fragment program bound through one
/// program pipeline object.
#[derive(Debug)]
pub(crate) struct ShaderPipeline {
    handle: PipelineHandle,
    vertex: VertexProgram,
    fragment: FragmentProgram,
    sampler: SamplerKind,
    frame_count: u64,
}

impl ShaderPipeline {
    pub fn new(
        gl: &mut dyn GraphicsApi,
        sampler: SamplerKind,
        fragment_source: &str,
    ) -> Result<Self, ShaderError> {
        let vertex = VertexProgram::compile(gl)?;
        let fragment = match FragmentProgram::compile(gl, fragment_source, sampler) {
            Ok(fragment) => fragment,
            Err(error) => {
                vertex.delete(gl);
                return Err(error);
            }
        };
        let attached = gl.create_program_pipeline().and_then(|handle| {
            let stages = gl
                .use_program_stage(handle, ShaderStage::Vertex, vertex.handle())
                .and_then(|()| gl.use_program_stage(handle, ShaderStage::Fragment, fragment.handle()))
                .and_then(|()| vertex.use_defaults(gl));
            match stages {
                Ok(()) => Ok(handle),
                Err(error) => {
                    gl.delete_program_pipeline(handle);
                    Err(error)
                }
            }
        });
        match attached {
            Ok(handle) => {
                debug!(pipeline = handle.0, ?sampler, "created shader pipeline");
                Ok(Self {
                    handle,
                    vertex,
                    fragment,
                    sampler,
                    frame_count: 0,
                })
            }
            Err(error) => {
                fragment.delete(gl);
                vertex.delete(gl);
                Err(ShaderError::Attach(error))
            }
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    pub fn sampler(&self) -> SamplerKind {
        self.sampler
    }

    pub fn fragment_handle(&self) -> ProgramHandle {
        self.fragment.handle()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Binds the pipeline and quad geometry and points the fragment sampler
    /// at texture unit 0.
    pub fn activate(&self, gl: &mut dyn GraphicsApi) -> Result<(), ApiError> {
        gl.bind_program_pipeline(self.handle)?;
        gl.bind_quad_geometry()?;
        self.fragment.use_sampler_unit(gl)
    }

    pub fn update_texture_matrix(&self, gl: &mut dyn GraphicsApi, matrix: &Mat4) -> Result<(), ApiError> {
        self.vertex.update_texture_matrix(gl, matrix)
    }

    pub fn update_transform_matrix(&self, gl: &mut dyn GraphicsApi, matrix: &Mat4) -> Result<(), ApiError> {
        self.vertex.update_transform_matrix(gl, matrix)
    }

    /// Replaces the fragment program, runs `on_attach` against it and
    /// restarts the frame counter.
    ///
    /// The previous program is deleted only once the new one is attached and
    /// activated; on any failure the previous program stays attached.
    pub fn set_fragment_shader(
        &mut self,
        gl: &mut dyn GraphicsApi,
        source: &str,
        on_attach: Option<&AttachCallback>,
    ) -> Result<(), ShaderError> {
        self.replace_fragment(gl, source, on_attach)?;
        self.frame_count = 0;
        Ok(())
    }

    /// Puts back a previously attached shader after a failed multi-pipeline
    /// swap. The frame counter keeps running.
    pub fn restore_fragment_shader(
        &mut self,
        gl: &mut dyn GraphicsApi,
        source: &str,
        on_attach: Option<&AttachCallback>,
    ) -> Result<(), ShaderError> {
        self.replace_fragment(gl, source, on_attach)
    }

    fn replace_fragment(
        &mut self,
        gl: &mut dyn GraphicsApi,
        source: &str,
        on_attach: Option<&AttachCallback>,
    ) -> Result<(), ShaderError> {
        let replacement = FragmentProgram::compile(gl, source, self.sampler)?;
        let attached = gl
            .use_program_stage(self.handle, ShaderStage::Fragment, replacement.handle())
            .and_then(|()| gl.bind_program_pipeline(self.handle))
            .and_then(|()| replacement.use_sampler_unit(gl));
        if let Err(error) = attached {
            if let Err(restore) =
                gl.use_program_stage(self.handle, ShaderStage::Fragment, self.fragment.handle())
            {
                warn!(%restore, "failed to reattach previous fragment program");
            }
            replacement.delete(gl);
            return Err(ShaderError::Attach(error));
        }

        let previous = std::mem::replace(&mut self.fragment, replacement);
        previous.delete(gl);
        if let Some(callback) = on_attach {
            self.run_on_attach(gl, callback);
        }
        debug!(
            pipeline = self.handle.0,
            program = self.fragment.handle().0,
            "swapped fragment program"
        );
        Ok(())
    }

    /// Lets the shader seed properties on the attached fragment program.
    pub fn run_on_attach(&self, gl: &mut dyn GraphicsApi, callback: &AttachCallback) {
        let mut properties = ProgramProperties {
            gl,
            program: &self.fragment,
        };
        callback(&mut properties);
    }

    /// Uploads a property to the attached fragment program. Unknown names
    /// are ignored.
    pub fn set_property(&self, gl: &mut dyn GraphicsApi, name: &str, value: PropertyValue) -> Result<(), ApiError> {
        self.fragment.set_property(gl, name, value.into())
    }

    /// Runs the pre-frame callback for the upcoming draw, then advances the
    /// frame counter.
    pub fn on_before_draw(
        &mut self,
        gl: &mut dyn GraphicsApi,
        callback: Option<&mut PreFrameCallback>,
        size: Size,
    ) {
        if let Some(callback) = callback {
            let mut properties = ProgramProperties {
                gl,
                program: &self.fragment,
            };
            callback(&mut properties, self.frame_count, size.width, size.height);
        }
        self.frame_count += 1;
    }

    /// Deletes the pipeline object and both programs.
    pub fn delete(self, gl: &mut dyn GraphicsApi) {
        gl.delete_program_pipeline(self.handle);
        self.fragment.delete(gl);
        self.vertex.delete(gl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::PropertySetter;
    use crate::gpu::fake::{FakeApi, FakeMonitor};
    use std::sync::{Arc, Mutex};

    const FIRST: &str = "uniform float amount;\nvoid main() { outColor = texture(sTexture, vTextureCoord) * amount; }\n";
    const SECOND: &str = "uniform int mode;\nvoid main() { outColor = vec4(float(mode)); }\n";

    fn pipeline() -> (FakeApi, FakeMonitor, ShaderPipeline) {
        let (mut gl, monitor) = FakeApi::new();
        let pipeline = ShaderPipeline::new(&mut gl, SamplerKind::Rgba, FIRST).unwrap();
        (gl, monitor, pipeline)
    }

    #[test]
    fn swap_keeps_exactly_one_fragment_program() {
        let (mut gl, monitor, mut pipeline) = pipeline();
        pipeline.activate(&mut gl).unwrap();
        for source in [SECOND, FIRST, SECOND] {
            pipeline.set_fragment_shader(&mut gl, source, None).unwrap();
            assert_eq!(monitor.live_programs(ShaderStage::Fragment), 1);
            assert_eq!(
                monitor.attached_fragment(pipeline.handle()),
                Some(pipeline.fragment_handle())
            );
        }
    }

    #[test]
    fn previous_program_is_deleted_after_attach() {
        let (mut gl, monitor, mut pipeline) = pipeline();
        let old = pipeline.fragment_handle();
        pipeline.set_fragment_shader(&mut gl, SECOND, None).unwrap();
        let new = pipeline.fragment_handle();

        let ops = monitor.ops();
        let attach = ops
            .iter()
            .position(|op| *op == format!("use_program_stage Fragment {}", new.0))
            .unwrap();
        let delete = ops
            .iter()
            .position(|op| *op == format!("delete_program {}", old.0))
            .unwrap();
        assert!(attach < delete);
    }

    #[test]
    fn failed_compile_keeps_previous_program() {
        let (mut gl, monitor, mut pipeline) = pipeline();
        let old = pipeline.fragment_handle();
        let error = pipeline
            .set_fragment_shader(&mut gl, "#error nope\n", None)
            .unwrap_err();
        assert!(matches!(error, ShaderError::Compile { .. }));
        assert_eq!(pipeline.fragment_handle(), old);
        assert_eq!(monitor.attached_fragment(pipeline.handle()), Some(old));
    }

    #[test]
    fn frame_counter_resets_on_swap() {
        let (mut gl, _monitor, mut pipeline) = pipeline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut callback: PreFrameCallback =
            Box::new(move |_: &mut dyn PropertySetter, frame: u64, _: u32, _: u32| sink.lock().unwrap().push(frame));
        let size = Size::new(4, 4);

        for _ in 0..3 {
            pipeline.on_before_draw(&mut gl, Some(&mut callback), size);
        }
        pipeline.set_fragment_shader(&mut gl, SECOND, None).unwrap();
        for _ in 0..2 {
            pipeline.on_before_draw(&mut gl, Some(&mut callback), size);
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn attach_hook_seeds_the_new_program() {
        let (mut gl, monitor, mut pipeline) = pipeline();
        let hook: AttachCallback =
            Box::new(|props: &mut dyn PropertySetter| props.set_property("mode", PropertyValue::Int(3)));
        pipeline.set_fragment_shader(&mut gl, SECOND, Some(&hook)).unwrap();
        assert_eq!(
            monitor.uniform_value(pipeline.fragment_handle(), "mode"),
            Some(crate::gpu::UniformValue::Int(3))
        );
    }

    #[test]
    fn restore_keeps_the_frame_counter() {
        let (mut gl, _monitor, mut pipeline) = pipeline();
        for _ in 0..2 {
            pipeline.on_before_draw(&mut gl, None, Size::new(4, 4));
        }
        pipeline.restore_fragment_shader(&mut gl, FIRST, None).unwrap();
        assert_eq!(pipeline.frame_count(), 2);
        pipeline.set_fragment_shader(&mut gl, SECOND, None).unwrap();
        assert_eq!(pipeline.frame_count(), 0);
    }

    #[test]
    fn callback_sets_properties_on_current_program() {
        let (mut gl, monitor, mut pipeline) = pipeline();
        let mut callback: PreFrameCallback = Box::new(|props: &mut dyn PropertySetter, frame: u64, width: u32, _: u32| {
            props.set_property("amount", PropertyValue::Float(frame as f32 + width as f32));
        });
        pipeline.on_before_draw(&mut gl, Some(&mut callback), Size::new(10, 2));
        assert_eq!(
            monitor.uniform_value(pipeline.fragment_handle(), "amount"),
            Some(crate::gpu::UniformValue::Float(10.0))
        );
    }

    #[test]
    fn unknown_property_makes_no_call() {
        let (mut gl, monitor, pipeline) = pipeline();
        let before = monitor.uniform_writes();
        pipeline
            .set_property(&mut gl, "nonexistentUniform", PropertyValue::Float(1.0))
            .unwrap();
        assert_eq!(monitor.uniform_writes(), before);
    }

    #[test]
    fn delete_releases_everything() {
        let (mut gl, monitor, pipeline) = pipeline();
        pipeline.delete(&mut gl);
        assert_eq!(monitor.live_programs(ShaderStage::Fragment), 0);
        assert_eq!(monitor.live_programs(ShaderStage::Vertex), 0);
        assert_eq!(monitor.live_pipelines(), 0);
    }
}
