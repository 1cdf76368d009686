use std::fmt::Write as _;

use crate::types::InputFormat;

/// How the fragment program reads the camera texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    /// Direct RGBA sampling.
    Rgba,
    /// Limited-range BT.2020 YUV planes converted to RGB.
    YuvToRgb,
    /// Opaque black, used when HDR input has no known format yet.
    Blank,
}

impl SamplerKind {
    pub fn for_format(format: InputFormat, hdr: bool) -> Self {
        match format {
            InputFormat::Default => SamplerKind::Rgba,
            InputFormat::Yuv => SamplerKind::YuvToRgb,
            InputFormat::Unknown if hdr => SamplerKind::Blank,
            InputFormat::Unknown => SamplerKind::Rgba,
        }
    }
}

/// A loose `uniform` declaration lifted into the property block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyDecl {
    pub name: String,
    pub glsl_type: String,
    pub array_len: Option<u32>,
}

#[derive(Clone, Debug)]
pub(crate) struct WrappedFragment {
    pub source: String,
    pub properties: Vec<PropertyDecl>,
}

/// Block instance holding lifted properties; member names match the
/// original uniform names.
pub(crate) const PROPERTY_BLOCK: &str = "LensProperties";
const PROPERTY_INSTANCE: &str = "lens_props";
const SAMPLE_FN: &str = "lens_sample_input";

/// Produces Vulkan-flavoured GLSL from an effect written against the
/// `sTexture` / `vTextureCoord` / `outColor` contract.
///
/// Steps performed:
///
/// 1. Blank out `#version`, `#extension` and `precision` lines, the varying
///    and output declarations, and the input sampler declaration. Lines are
///    replaced rather than removed so compiler logs keep user line numbers.
/// 2. Lift every loose `uniform <type> <name>;` into a std140 block and alias
///    the names back through macros.
/// 3. Rewrite `texture(sTexture, ...)` into a call to the sampler function
///    selected by `sampler`.
pub(crate) fn wrap_fragment(source: &str, sampler: SamplerKind) -> WrappedFragment {
    let mut properties = Vec::new();
    let mut sampler_names: Vec<String> = Vec::new();
    let mut output_name = None;
    let mut body_lines: Vec<&str> = Vec::new();

    for line in source.lines() {
        match classify(line) {
            Line::Directive | Line::Varying => body_lines.push(""),
            Line::Output(name) => {
                output_name.get_or_insert(name);
                body_lines.push("");
            }
            Line::Sampler(name) => {
                sampler_names.push(name);
                body_lines.push("");
            }
            Line::Property(decl) => {
                properties.push(decl);
                body_lines.push("");
            }
            Line::Code => body_lines.push(line),
        }
    }
    if sampler_names.is_empty() {
        sampler_names.push("sTexture".to_string());
    }

    let mut body = String::new();
    for line in body_lines {
        let mut rewritten = line.to_string();
        for name in &sampler_names {
            rewritten = rewrite_sampling(&rewritten, name);
        }
        body.push_str(&rewritten);
        body.push('\n');
    }

    let output_name = output_name.unwrap_or_else(|| "outColor".to_string());
    let header = build_header(&properties, &output_name, sampler);
    WrappedFragment {
        source: format!("{header}\n#line 1\n{body}"),
        properties,
    }
}

/// Lists the properties an effect exposes without wrapping it.
pub fn declared_properties(source: &str) -> Vec<PropertyDecl> {
    source
        .lines()
        .filter_map(|line| match classify(line) {
            Line::Property(decl) => Some(decl),
            _ => None,
        })
        .collect()
}

enum Line {
    Directive,
    Varying,
    Output(String),
    Sampler(String),
    Property(PropertyDecl),
    Code,
}

const PRECISIONS: [&str; 3] = ["lowp", "mediump", "highp"];

fn classify(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.starts_with("#version")
        || trimmed.starts_with("#extension")
        || trimmed.starts_with("precision ")
    {
        return Line::Directive;
    }
    let Some(decl) = trimmed.strip_suffix(';') else {
        return Line::Code;
    };
    let tokens: Vec<&str> = decl
        .split_whitespace()
        .filter(|token| !PRECISIONS.contains(token))
        .collect();
    match tokens.as_slice() {
        ["in" | "varying", "vec2", "vTextureCoord"] => Line::Varying,
        ["out", "vec4", name] if is_identifier(name) => Line::Output((*name).to_string()),
        ["uniform", ty, name] if ty.starts_with("sampler") && is_identifier(name) => {
            Line::Sampler((*name).to_string())
        }
        ["uniform", ty, name] if is_identifier(ty) => match split_array(name) {
            Some((name, array_len)) => Line::Property(PropertyDecl {
                name: name.to_string(),
                glsl_type: (*ty).to_string(),
                array_len,
            }),
            None => Line::Code,
        },
        _ => Line::Code,
    }
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_array(token: &str) -> Option<(&str, Option<u32>)> {
    match token.split_once('[') {
        None if is_identifier(token) => Some((token, None)),
        None => None,
        Some((name, rest)) => {
            let len = rest.strip_suffix(']')?.trim().parse().ok()?;
            is_identifier(name).then_some((name, Some(len)))
        }
    }
}

/// Replaces `texture(<sampler>,` and `texture2D(<sampler>,` with the
/// generated sampling function.
fn rewrite_sampling(line: &str, sampler: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(index) = rest.find("texture") {
        let (before, candidate) = rest.split_at(index);
        out.push_str(before);
        let preceded_by_ident = before
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        let after_name = candidate["texture".len()..]
            .strip_prefix("2D")
            .unwrap_or(&candidate["texture".len()..]);
        let matched = after_name
            .trim_start()
            .strip_prefix('(')
            .map(str::trim_start)
            .and_then(|args| args.strip_prefix(sampler))
            .map(str::trim_start)
            .and_then(|args| args.strip_prefix(','));
        match matched {
            Some(remaining) if !preceded_by_ident => {
                let _ = write!(out, "{SAMPLE_FN}(");
                rest = remaining.trim_start();
            }
            _ => {
                out.push_str("texture");
                rest = &candidate["texture".len()..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn build_header(properties: &[PropertyDecl], output_name: &str, sampler: SamplerKind) -> String {
    let mut header = String::from(INPUT_HEADER);
    let _ = writeln!(header, "layout(location = 0) out vec4 {output_name};");

    if !properties.is_empty() {
        let _ = writeln!(
            header,
            "\nlayout(std140, set = 2, binding = 0) uniform {PROPERTY_BLOCK} {{"
        );
        for property in properties {
            match property.array_len {
                Some(len) => {
                    let _ = writeln!(header, "    {} {}[{len}];", property.glsl_type, property.name);
                }
                None => {
                    let _ = writeln!(header, "    {} {};", property.glsl_type, property.name);
                }
            }
        }
        let _ = writeln!(header, "}} {PROPERTY_INSTANCE};\n");
        for property in properties {
            let _ = writeln!(
                header,
                "#define {name} {PROPERTY_INSTANCE}.{name}",
                name = property.name
            );
        }
    }

    header.push_str(match sampler {
        SamplerKind::Rgba => RGBA_SAMPLER,
        SamplerKind::YuvToRgb => YUV_SAMPLER,
        SamplerKind::Blank => BLANK_SAMPLER,
    });
    header
}

const INPUT_HEADER: &str = r"#version 450
layout(location = 0) in vec2 vTextureCoord;

layout(set = 1, binding = 0) uniform texture2D lens_plane0;
layout(set = 1, binding = 1) uniform texture2D lens_plane1;
layout(set = 1, binding = 2) uniform sampler lens_sampler;
";

const RGBA_SAMPLER: &str = r"
vec4 lens_sample_input(vec2 uv) {
    return texture(sampler2D(lens_plane0, lens_sampler), uv);
}
";

const YUV_SAMPLER: &str = r"
vec4 lens_sample_input(vec2 uv) {
    const vec3 offset = vec3(0.0625, 0.5, 0.5);
    const mat3 yuv_to_rgb = mat3(
        1.1689, 1.1689, 1.1689,
        0.0000, -0.1881, 2.1502,
        1.6853, -0.6530, 0.0000
    );
    float luma = texture(sampler2D(lens_plane0, lens_sampler), uv).r;
    vec2 chroma = texture(sampler2D(lens_plane1, lens_sampler), uv).rg;
    vec3 rgb = yuv_to_rgb * (vec3(luma, chroma) - offset);
    return vec4(clamp(rgb, 0.0, 1.0), 1.0);
}
";

const BLANK_SAMPLER: &str = r"
vec4 lens_sample_input(vec2 uv) {
    return vec4(0.0, 0.0, 0.0, 1.0);
}
";

/// Fixed vertex stage shared by every pipeline.
///
/// The uniform block layout must match the matrix locations the vertex
/// program resolves at link time.
pub(crate) const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) in vec2 aPosition;
layout(location = 1) in vec2 aTextureCoord;
layout(location = 0) out vec2 vTextureCoord;

layout(std140, set = 0, binding = 0) uniform LensVertex {
    mat4 uTexMatrix;
    mat4 uTransMatrix;
} lens_vertex;

void main() {
    gl_Position = lens_vertex.uTransMatrix * vec4(aPosition, 0.0, 1.0);
    vTextureCoord = (lens_vertex.uTexMatrix * vec4(aTextureCoord, 0.0, 1.0)).xy;
}
";

#[cfg(test)]
mod tests {
    use super::*;

    const EFFECT: &str = r#"#version 310 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
in vec2 vTextureCoord;
uniform samplerExternalOES sTexture;
uniform float brightness;
uniform highp vec2 offset;
uniform float weights[4];
out vec4 outColor;
void main() {
    vec4 color = texture(sTexture, vTextureCoord + offset);
    outColor = vec4(color.rgb * weights[0] + brightness, color.a);
}
"#;

    fn body(wrapped: &str) -> &str {
        wrapped.split("#line 1\n").nth(1).unwrap()
    }

    #[test]
    fn wrap_lifts_loose_uniforms_into_block() {
        let wrapped = wrap_fragment(EFFECT, SamplerKind::Rgba);
        let names: Vec<_> = wrapped.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["brightness", "offset", "weights"]);
        assert_eq!(wrapped.properties[2].array_len, Some(4));
        assert!(wrapped.source.contains("uniform LensProperties {"));
        assert!(wrapped.source.contains("    vec2 offset;"));
        assert!(wrapped.source.contains("    float weights[4];"));
        assert!(wrapped.source.contains("#define brightness lens_props.brightness"));
        assert!(!body(&wrapped.source).contains("uniform"));
    }

    #[test]
    fn wrap_strips_es_directives_and_keeps_line_numbers() {
        let wrapped = wrap_fragment(EFFECT, SamplerKind::Rgba);
        assert_eq!(wrapped.source.matches("#version").count(), 1);
        assert!(wrapped.source.starts_with("#version 450"));
        assert!(!wrapped.source.contains("#extension"));
        assert!(!wrapped.source.contains("precision mediump"));
        assert_eq!(body(&wrapped.source).lines().count(), EFFECT.lines().count());
    }

    #[test]
    fn sampling_calls_are_rewritten() {
        let wrapped = wrap_fragment(EFFECT, SamplerKind::Rgba);
        assert!(body(&wrapped.source)
            .contains("vec4 color = lens_sample_input(vTextureCoord + offset);"));
        assert!(!wrapped.source.contains("sTexture"));
    }

    #[test]
    fn rewrite_leaves_other_texture_calls_alone() {
        assert_eq!(
            rewrite_sampling("a = texture2D( sTexture , uv);", "sTexture"),
            "a = lens_sample_input(uv);"
        );
        assert_eq!(
            rewrite_sampling("a = texture(other, uv);", "sTexture"),
            "a = texture(other, uv);"
        );
        assert_eq!(
            rewrite_sampling("a = mytexture(sTexture, uv);", "sTexture"),
            "a = mytexture(sTexture, uv);"
        );
    }

    #[test]
    fn sampler_kind_follows_format_and_range() {
        assert_eq!(SamplerKind::for_format(InputFormat::Unknown, false), SamplerKind::Rgba);
        assert_eq!(SamplerKind::for_format(InputFormat::Unknown, true), SamplerKind::Blank);
        assert_eq!(SamplerKind::for_format(InputFormat::Default, true), SamplerKind::Rgba);
        assert_eq!(SamplerKind::for_format(InputFormat::Yuv, false), SamplerKind::YuvToRgb);
    }

    #[test]
    fn yuv_prelude_carries_bt2020_conversion() {
        let wrapped = wrap_fragment(EFFECT, SamplerKind::YuvToRgb);
        assert!(wrapped.source.contains("vec3(0.0625, 0.5, 0.5)"));
        assert!(wrapped.source.contains("1.6853, -0.6530, 0.0000"));
        assert!(wrapped.source.contains("lens_plane1"));
    }

    #[test]
    fn effects_without_properties_skip_the_block() {
        let source = "void main() { outColor = texture(sTexture, vTextureCoord); }";
        let wrapped = wrap_fragment(source, SamplerKind::Blank);
        assert!(wrapped.properties.is_empty());
        assert!(!wrapped.source.contains(PROPERTY_BLOCK));
        assert!(wrapped.source.contains("layout(location = 0) out vec4 outColor;"));
    }

    #[test]
    fn declared_properties_ignores_samplers_and_blocks() {
        let source = "uniform sampler2D sTexture;\nuniform int mode;\nuniform Block { float x; };\n";
        let properties = declared_properties(source);
        assert_eq!(
            properties,
            vec![PropertyDecl {
                name: "mode".into(),
                glsl_type: "int".into(),
                array_len: None,
            }]
        );
    }
}
