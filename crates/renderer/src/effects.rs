//! Fragment effects and the builtin catalogue.
//!
//! Effects are written against a small contract: sample the camera through
//! `sTexture` at `vTextureCoord` and write `outColor`. Loose `uniform`
//! declarations become properties settable at runtime.

use std::fmt;

use crate::types::PropertyValue;

/// Receives property updates for the fragment program about to draw.
pub trait PropertySetter {
    fn set_property(&mut self, name: &str, value: PropertyValue);
}

/// Invoked once per camera frame, before the frame is drawn into any output,
/// with the property setter, the number of frames since the shader was
/// attached and the size of the first output.
pub type PreFrameCallback = Box<dyn FnMut(&mut dyn PropertySetter, u64, u32, u32) + Send>;

/// Invoked once a freshly compiled fragment program is attached, before it
/// draws. Every program starts with zeroed properties, so this is where an
/// effect seeds its defaults. Runs once per compiled pipeline.
pub type AttachCallback = Box<dyn Fn(&mut dyn PropertySetter) + Send>;

/// Source of a fragment effect plus its optional attach and per-frame hooks.
pub struct FragmentShader {
    pub source: String,
    pub on_attach: Option<AttachCallback>,
    pub on_pre_frame: Option<PreFrameCallback>,
}

impl FragmentShader {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            on_attach: None,
            on_pre_frame: None,
        }
    }

    pub fn with_on_attach(mut self, callback: impl Fn(&mut dyn PropertySetter) + Send + 'static) -> Self {
        self.on_attach = Some(Box::new(callback));
        self
    }

    pub fn with_pre_frame(
        mut self,
        callback: impl FnMut(&mut dyn PropertySetter, u64, u32, u32) + Send + 'static,
    ) -> Self {
        self.on_pre_frame = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for FragmentShader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentShader")
            .field("source_len", &self.source.len())
            .field("on_attach", &self.on_attach.is_some())
            .field("on_pre_frame", &self.on_pre_frame.is_some())
            .finish()
    }
}

impl From<Effect> for FragmentShader {
    fn from(effect: Effect) -> Self {
        let shader = FragmentShader::new(effect.source());
        match effect {
            Effect::BrightnessContrast => shader.with_on_attach(|props| {
                props.set_property("brightness", PropertyValue::Float(0.0));
                props.set_property("contrast", PropertyValue::Float(1.0));
            }),
            Effect::Passthrough | Effect::Grayscale => shader,
        }
    }
}

/// Builtin effects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Effect {
    #[default]
    Passthrough,
    Grayscale,
    BrightnessContrast,
}

impl Effect {
    pub const ALL: [Effect; 3] = [Effect::Passthrough, Effect::Grayscale, Effect::BrightnessContrast];

    pub fn name(self) -> &'static str {
        match self {
            Effect::Passthrough => "passthrough",
            Effect::Grayscale => "grayscale",
            Effect::BrightnessContrast => "brightness-contrast",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Effect::Passthrough => "camera image unchanged",
            Effect::Grayscale => "Rec. 709 luma",
            Effect::BrightnessContrast => "adjustable `brightness` and `contrast` properties",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|effect| effect.name().eq_ignore_ascii_case(name))
    }

    pub fn source(self) -> &'static str {
        match self {
            Effect::Passthrough => PASSTHROUGH,
            Effect::Grayscale => GRAYSCALE,
            Effect::BrightnessContrast => BRIGHTNESS_CONTRAST,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const PASSTHROUGH: &str = r"#version 310 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES sTexture;
in vec2 vTextureCoord;
out vec4 outColor;

void main() {
    outColor = texture(sTexture, vTextureCoord);
}
";

const GRAYSCALE: &str = r"#version 310 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES sTexture;
in vec2 vTextureCoord;
out vec4 outColor;

void main() {
    vec4 color = texture(sTexture, vTextureCoord);
    float luma = dot(color.rgb, vec3(0.2126, 0.7152, 0.0722));
    outColor = vec4(vec3(luma), color.a);
}
";

const BRIGHTNESS_CONTRAST: &str = r"#version 310 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES sTexture;
uniform float brightness;
uniform float contrast;
in vec2 vTextureCoord;
out vec4 outColor;

vec3 adjust(vec3 color, float offset, float gain) {
    return (color - 0.5) * gain + 0.5 + offset;
}

void main() {
    vec4 color = texture(sTexture, vTextureCoord);
    outColor = vec4(adjust(color.rgb, brightness, contrast), 1.0);
}
";
