//! Uniform reflection over GLSL parsed by naga.
//!
//! The wgpu backend keeps uniforms in one std140 block per program, so the
//! "location" of an active uniform is its byte offset inside that block.

use wgpu::naga::front::glsl::{Frontend, Options};
use wgpu::naga::{self, AddressSpace, ArraySize, Module, ScalarKind, TypeInner, VectorSize};

use super::{ActiveUniform, UniformLocation, UniformType};
use crate::error::ShaderStage;

/// Uniform block a program reads its properties or matrices from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct UniformBlock {
    /// Byte size of the block, zero when the program declares none.
    pub size: u32,
    pub uniforms: Vec<ActiveUniform>,
}

pub(crate) fn naga_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    }
}

/// Parses GLSL, returning the front end's diagnostics on failure.
pub(crate) fn parse(stage: ShaderStage, source: &str) -> Result<Module, String> {
    let mut frontend = Frontend::default();
    frontend
        .parse(&Options::from(naga_stage(stage)), source)
        .map_err(|errors| format!("{errors:?}"))
}

/// Collects the members of the uniform block bound at `group`.
pub(crate) fn uniform_block(module: &Module, group: u32) -> UniformBlock {
    for (_, global) in module.global_variables.iter() {
        if global.space != AddressSpace::Uniform {
            continue;
        }
        if global.binding.as_ref().map(|binding| binding.group) != Some(group) {
            continue;
        }
        let TypeInner::Struct { members, span } = &module.types[global.ty].inner else {
            continue;
        };
        let uniforms = members
            .iter()
            .filter_map(|member| {
                let name = member.name.clone()?;
                let (ty, array_size) = classify(module, member.ty);
                Some(ActiveUniform {
                    name,
                    ty,
                    array_size,
                    location: UniformLocation(member.offset),
                })
            })
            .collect();
        return UniformBlock {
            size: *span,
            uniforms,
        };
    }
    UniformBlock::default()
}

fn classify(module: &Module, ty: naga::Handle<naga::Type>) -> (UniformType, u32) {
    match &module.types[ty].inner {
        TypeInner::Array { base, size, .. } => {
            let len = match size {
                ArraySize::Constant(len) => len.get(),
                _ => 1,
            };
            (element_type(&module.types[*base].inner), len)
        }
        inner => (element_type(inner), 1),
    }
}

fn element_type(inner: &TypeInner) -> UniformType {
    match inner {
        TypeInner::Scalar(scalar) => match scalar.kind {
            ScalarKind::Float => UniformType::Float,
            ScalarKind::Sint => UniformType::Int,
            _ => UniformType::Unsupported,
        },
        TypeInner::Vector { size, scalar } => match (scalar.kind, size) {
            (ScalarKind::Float, VectorSize::Bi) => UniformType::Vec2,
            (ScalarKind::Float, VectorSize::Tri) => UniformType::Vec3,
            (ScalarKind::Float, VectorSize::Quad) => UniformType::Vec4,
            (ScalarKind::Sint, VectorSize::Bi) => UniformType::IVec2,
            (ScalarKind::Sint, VectorSize::Tri) => UniformType::IVec3,
            (ScalarKind::Sint, VectorSize::Quad) => UniformType::IVec4,
            _ => UniformType::Unsupported,
        },
        TypeInner::Matrix {
            columns: VectorSize::Quad,
            rows: VectorSize::Quad,
            ..
        } => UniformType::Mat4,
        _ => UniformType::Unsupported,
    }
}
