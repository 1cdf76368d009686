use std::fmt;

/// Pixel dimensions of a surface, texture, or snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Swaps width and height for quarter-turn rotations.
    pub fn rotated(self, degrees: u32) -> Self {
        if degrees % 180 == 90 {
            Self::new(self.height, self.width)
        } else {
            self
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Transfer function half of a [`DynamicRange`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    #[default]
    Sdr,
    Hlg,
    Hdr10,
    Hdr10Plus,
    DolbyVision,
    HdrUnspecified,
    Unspecified,
}

/// Bits per colour component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BitDepth {
    #[default]
    Eight,
    Ten,
    Unspecified,
}

/// Dynamic range a camera stream was negotiated with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DynamicRange {
    pub encoding: Encoding,
    pub bit_depth: BitDepth,
}

impl DynamicRange {
    pub const SDR: Self = Self::new(Encoding::Sdr, BitDepth::Eight);
    pub const HLG_10_BIT: Self = Self::new(Encoding::Hlg, BitDepth::Ten);
    pub const HDR10_10_BIT: Self = Self::new(Encoding::Hdr10, BitDepth::Ten);

    pub const fn new(encoding: Encoding, bit_depth: BitDepth) -> Self {
        Self {
            encoding,
            bit_depth,
        }
    }

    /// Whether the range requires 10-bit high dynamic range output.
    pub fn is_10bit_hdr(&self) -> bool {
        self.bit_depth == BitDepth::Ten
            && !matches!(self.encoding, Encoding::Sdr | Encoding::Unspecified)
    }
}

impl fmt::Display for DynamicRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoding = match self.encoding {
            Encoding::Sdr => "sdr",
            Encoding::Hlg => "hlg",
            Encoding::Hdr10 => "hdr10",
            Encoding::Hdr10Plus => "hdr10+",
            Encoding::DolbyVision => "dolby-vision",
            Encoding::HdrUnspecified => "hdr",
            Encoding::Unspecified => "unspecified",
        };
        let bits = match self.bit_depth {
            BitDepth::Eight => "8-bit",
            BitDepth::Ten => "10-bit",
            BitDepth::Unspecified => "?-bit",
        };
        write!(f, "{encoding} {bits}")
    }
}

/// Colour encoding of the camera texture, used to select a sampler program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InputFormat {
    #[default]
    Unknown,
    Default,
    Yuv,
}

impl InputFormat {
    pub const ALL: [InputFormat; 3] = [InputFormat::Unknown, InputFormat::Default, InputFormat::Yuv];
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputFormat::Unknown => "unknown",
            InputFormat::Default => "default",
            InputFormat::Yuv => "yuv",
        };
        f.write_str(name)
    }
}

/// What an output surface consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Rendered frames (preview, encoder input, image readers).
    #[default]
    Raster,
    /// Encoded still images written by the snapshot path.
    Jpeg,
}

/// Version and extension strings reported by the graphics stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub gl_version: String,
    pub egl_version: String,
    pub gl_extensions: String,
    pub egl_extensions: String,
}

impl DeviceInfo {
    pub const VERSION_UNKNOWN: &'static str = "0.0";
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            gl_version: Self::VERSION_UNKNOWN.to_string(),
            egl_version: Self::VERSION_UNKNOWN.to_string(),
            gl_extensions: String::new(),
            egl_extensions: String::new(),
        }
    }
}

/// Value accepted by `set_property`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PropertyValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    IVec2([i32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
}

impl From<f32> for PropertyValue {
    fn from(value: f32) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<[f32; 2]> for PropertyValue {
    fn from(value: [f32; 2]) -> Self {
        PropertyValue::Vec2(value)
    }
}

impl From<[i32; 2]> for PropertyValue {
    fn from(value: [i32; 2]) -> Self {
        PropertyValue::IVec2(value)
    }
}

impl From<[f32; 3]> for PropertyValue {
    fn from(value: [f32; 3]) -> Self {
        PropertyValue::Vec3(value)
    }
}

impl From<[f32; 4]> for PropertyValue {
    fn from(value: [f32; 4]) -> Self {
        PropertyValue::Vec4(value)
    }
}
