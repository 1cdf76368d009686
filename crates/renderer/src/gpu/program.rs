use std::collections::HashMap;

use tracing::{trace, warn};

use super::{GraphicsApi, ProgramHandle, UniformLocation, UniformType, UniformValue};
use crate::compile::{wrap_fragment, SamplerKind, VERTEX_SHADER_GLSL};
use crate::effects::PropertySetter;
use crate::error::{ApiError, ShaderError, ShaderStage};
use crate::matrix::Mat4;
use crate::types::PropertyValue;

const TEX_MATRIX: &str = "uTexMatrix";
const TRANS_MATRIX: &str = "uTransMatrix";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UniformInfo {
    pub location: UniformLocation,
    pub ty: UniformType,
    pub array_size: u32,
}

/// Active uniforms of a linked program, keyed by name.
#[derive(Clone, Debug, Default)]
pub(crate) struct UniformTable {
    entries: HashMap<String, UniformInfo>,
}

impl UniformTable {
    fn load(gl: &dyn GraphicsApi, program: ProgramHandle) -> Result<Self, ApiError> {
        let entries = gl
            .active_uniforms(program)?
            .into_iter()
            .map(|uniform| {
                let info = UniformInfo {
                    location: uniform.location,
                    ty: uniform.ty,
                    array_size: uniform.array_size,
                };
                (uniform.name, info)
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&UniformInfo> {
        self.entries.get(name)
    }

    fn sampler(&self) -> Option<UniformLocation> {
        self.entries
            .values()
            .find(|info| info.ty == UniformType::Sampler)
            .map(|info| info.location)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn compile_error(stage: ShaderStage, error: ApiError) -> ShaderError {
    ShaderError::Compile {
        stage,
        log: error.message,
    }
}

/// The fixed vertex stage with its two matrix locations.
#[derive(Debug)]
pub(crate) struct VertexProgram {
    handle: ProgramHandle,
    tex_matrix: UniformLocation,
    trans_matrix: UniformLocation,
}

impl VertexProgram {
    pub fn compile(gl: &mut dyn GraphicsApi) -> Result<Self, ShaderError> {
        let handle = gl
            .create_program(ShaderStage::Vertex, VERTEX_SHADER_GLSL)
            .map_err(|error| compile_error(ShaderStage::Vertex, error))?;
        let locations = UniformTable::load(gl, handle).and_then(|table| {
            let find = |name: &'static str| {
                table
                    .get(name)
                    .map(|info| info.location)
                    .ok_or_else(|| ApiError::new("active_uniforms", format!("{name} is not active")))
            };
            Ok((find(TEX_MATRIX)?, find(TRANS_MATRIX)?))
        });
        match locations {
            Ok((tex_matrix, trans_matrix)) => Ok(Self {
                handle,
                tex_matrix,
                trans_matrix,
            }),
            Err(error) => {
                gl.delete_program(handle);
                Err(compile_error(ShaderStage::Vertex, error))
            }
        }
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    /// Resets both matrices to identity.
    pub fn use_defaults(&self, gl: &mut dyn GraphicsApi) -> Result<(), ApiError> {
        self.update_texture_matrix(gl, &Mat4::IDENTITY)?;
        self.update_transform_matrix(gl, &Mat4::IDENTITY)
    }

    pub fn update_texture_matrix(&self, gl: &mut dyn GraphicsApi, matrix: &Mat4) -> Result<(), ApiError> {
        gl.set_uniform(self.handle, self.tex_matrix, &UniformValue::Mat4(*matrix))
    }

    pub fn update_transform_matrix(
        &self,
        gl: &mut dyn GraphicsApi,
        matrix: &Mat4,
    ) -> Result<(), ApiError> {
        gl.set_uniform(self.handle, self.trans_matrix, &UniformValue::Mat4(*matrix))
    }

    pub fn delete(self, gl: &mut dyn GraphicsApi) {
        gl.delete_program(self.handle);
    }
}

/// A linked fragment stage and the uniforms it exposes as properties.
#[derive(Debug)]
pub(crate) struct FragmentProgram {
    handle: ProgramHandle,
    uniforms: UniformTable,
}

impl FragmentProgram {
    pub fn compile(
        gl: &mut dyn GraphicsApi,
        source: &str,
        sampler: SamplerKind,
    ) -> Result<Self, ShaderError> {
        let wrapped = wrap_fragment(source, sampler);
        let handle = gl
            .create_program(ShaderStage::Fragment, &wrapped.source)
            .map_err(|error| compile_error(ShaderStage::Fragment, error))?;
        match UniformTable::load(gl, handle) {
            Ok(uniforms) => {
                trace!(
                    program = handle.0,
                    uniforms = uniforms.len(),
                    "linked fragment program"
                );
                Ok(Self { handle, uniforms })
            }
            Err(error) => {
                gl.delete_program(handle);
                Err(compile_error(ShaderStage::Fragment, error))
            }
        }
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn uniforms(&self) -> &UniformTable {
        &self.uniforms
    }

    /// Points the input sampler at texture unit 0.
    pub fn use_sampler_unit(&self, gl: &mut dyn GraphicsApi) -> Result<(), ApiError> {
        match self.uniforms.sampler() {
            Some(location) => gl.set_uniform(self.handle, location, &UniformValue::Int(0)),
            None => Ok(()),
        }
    }

    /// Uploads `value` to the uniform called `name`.
    ///
    /// Unknown names are ignored; values whose shape does not match the
    /// declared type are logged and dropped.
    pub fn set_property(
        &self,
        gl: &mut dyn GraphicsApi,
        name: &str,
        value: UniformValue,
    ) -> Result<(), ApiError> {
        let Some(info) = self.uniforms.get(name) else {
            trace!(name, "ignoring property without an active uniform");
            return Ok(());
        };
        if info.ty != value.uniform_type() {
            warn!(
                name,
                declared = ?info.ty,
                supplied = ?value.uniform_type(),
                "Unsupported type for property; value dropped"
            );
            return Ok(());
        }
        gl.set_uniform(self.handle, info.location, &value)
    }

    pub fn delete(self, gl: &mut dyn GraphicsApi) {
        gl.delete_program(self.handle);
    }
}

/// Property setter handed to pre-frame callbacks.
pub(crate) struct ProgramProperties<'a> {
    pub gl: &'a mut dyn GraphicsApi,
    pub program: &'a FragmentProgram,
}

impl PropertySetter for ProgramProperties<'_> {
    fn set_property(&mut self, name: &str, value: PropertyValue) {
        if let Err(error) = self.program.set_property(self.gl, name, value.into()) {
            warn!(name, %error, "failed to upload property");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fake::FakeApi;

    const EFFECT: &str = "uniform float brightness;\nuniform ivec2 cells;\nvoid main() { outColor = texture(sTexture, vTextureCoord) + brightness; }\n";

    #[test]
    fn reflection_builds_uniform_table() {
        let (mut gl, _monitor) = FakeApi::new();
        let program = FragmentProgram::compile(&mut gl, EFFECT, SamplerKind::Rgba).unwrap();
        let brightness = program.uniforms().get("brightness").unwrap();
        assert_eq!(brightness.ty, UniformType::Float);
        assert_eq!(brightness.array_size, 1);
        assert_eq!(program.uniforms().get("cells").unwrap().ty, UniformType::IVec2);
    }

    #[test]
    fn mismatched_and_unknown_properties_are_dropped() {
        let (mut gl, monitor) = FakeApi::new();
        let program = FragmentProgram::compile(&mut gl, EFFECT, SamplerKind::Rgba).unwrap();
        let before = monitor.uniform_writes();
        program
            .set_property(&mut gl, "nonexistentUniform", UniformValue::Float(1.0))
            .unwrap();
        program
            .set_property(&mut gl, "brightness", UniformValue::Int(1))
            .unwrap();
        assert_eq!(monitor.uniform_writes(), before);

        program
            .set_property(&mut gl, "cells", UniformValue::IVec2([4, 3]))
            .unwrap();
        assert_eq!(monitor.uniform_writes(), before + 1);
        assert_eq!(
            monitor.uniform_value(program.handle(), "cells"),
            Some(UniformValue::IVec2([4, 3]))
        );
    }

    #[test]
    fn failed_compile_reports_log() {
        let (mut gl, _monitor) = FakeApi::new();
        let error = FragmentProgram::compile(&mut gl, "#error broken\n", SamplerKind::Rgba)
            .unwrap_err();
        assert!(matches!(
            error,
            ShaderError::Compile {
                stage: ShaderStage::Fragment,
                ..
            }
        ));
    }

    #[test]
    fn vertex_program_resolves_matrix_locations() {
        let (mut gl, monitor) = FakeApi::new();
        let vertex = VertexProgram::compile(&mut gl).unwrap();
        vertex.use_defaults(&mut gl).unwrap();
        assert_eq!(
            monitor.uniform_value(vertex.handle(), TEX_MATRIX),
            Some(UniformValue::Mat4(Mat4::IDENTITY))
        );
    }
}
