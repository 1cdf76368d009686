use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories_next::ProjectDirs;
use renderer::{DynamicRange, PropertyValue};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "shaderlens.toml";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Shaderlens";
const APPLICATION: &str = "shaderlens";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShaderlensConfig {
    #[serde(default)]
    pub processor: ProcessorSection,
    #[serde(default)]
    pub effect: EffectSection,
    #[serde(default)]
    pub capture: CaptureSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeSetting {
    #[default]
    Sdr,
    Hlg,
    Hdr10,
}

impl RangeSetting {
    pub fn dynamic_range(self) -> DynamicRange {
        match self {
            RangeSetting::Sdr => DynamicRange::SDR,
            RangeSetting::Hlg => DynamicRange::HLG_10_BIT,
            RangeSetting::Hdr10 => DynamicRange::HDR10_10_BIT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorSection {
    #[serde(default)]
    pub dynamic_range: RangeSetting,
    #[serde(default)]
    pub thread_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectSection {
    /// Builtin effect name.
    #[serde(default)]
    pub name: Option<String>,
    /// Fragment shader file; relative paths resolve against the config file.
    #[serde(default)]
    pub shader: Option<PathBuf>,
    #[serde(default)]
    pub properties: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureSection {
    #[serde(default = "default_frames")]
    pub frames: u32,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub rotation: u32,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            size: default_size(),
            output_dir: None,
            quality: default_quality(),
            rotation: 0,
        }
    }
}

fn default_frames() -> u32 {
    30
}

fn default_size() -> String {
    "1280x720".to_string()
}

fn default_quality() -> u8 {
    95
}

impl ShaderlensConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: ShaderlensConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, resolving a relative `effect.shader` against the file's
    /// directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&input)?;
        if let (Some(shader), Some(parent)) = (config.effect.shader.as_mut(), path.parent()) {
            if shader.is_relative() {
                *shader = parent.join(&*shader);
            }
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.effect.name.is_some() && self.effect.shader.is_some() {
            return Err(ConfigError::Invalid(
                "effect.name and effect.shader are mutually exclusive".to_string(),
            ));
        }
        if self.capture.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "capture.quality must be within 0..=100, got {}",
                self.capture.quality
            )));
        }
        if self.capture.rotation % 90 != 0 {
            return Err(ConfigError::Invalid(format!(
                "capture.rotation must be a multiple of 90, got {}",
                self.capture.rotation
            )));
        }
        for (name, value) in &self.effect.properties {
            property_value(value).map_err(|reason| {
                ConfigError::Invalid(format!("effect.properties.{name}: {reason}"))
            })?;
        }
        Ok(())
    }

    pub fn properties(&self) -> Vec<(String, PropertyValue)> {
        self.effect
            .properties
            .iter()
            .filter_map(|(name, value)| property_value(value).ok().map(|value| (name.clone(), value)))
            .collect()
    }
}

/// Converts a TOML scalar or 2-4 element array into a property value.
pub fn property_value(value: &toml::Value) -> Result<PropertyValue, String> {
    match value {
        toml::Value::Float(v) => Ok(PropertyValue::Float(*v as f32)),
        toml::Value::Integer(v) => i32::try_from(*v)
            .map(PropertyValue::Int)
            .map_err(|_| format!("integer {v} out of range")),
        toml::Value::Boolean(v) => Ok(PropertyValue::Int(i32::from(*v))),
        toml::Value::Array(items) => {
            let all_ints = items.iter().all(|item| item.is_integer());
            if all_ints && items.len() == 2 {
                let ints = items
                    .iter()
                    .map(|item| item.as_integer().and_then(|v| i32::try_from(v).ok()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| "integer component out of range".to_string())?;
                return Ok(PropertyValue::IVec2([ints[0], ints[1]]));
            }
            let floats = items
                .iter()
                .map(|item| match item {
                    toml::Value::Float(v) => Some(*v as f32),
                    toml::Value::Integer(v) => Some(*v as f32),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| "vector components must be numbers".to_string())?;
            match floats.as_slice() {
                [x, y] => Ok(PropertyValue::Vec2([*x, *y])),
                [x, y, z] => Ok(PropertyValue::Vec3([*x, *y, *z])),
                [x, y, z, w] => Ok(PropertyValue::Vec4([*x, *y, *z, *w])),
                _ => Err(format!("vectors have 2 to 4 components, got {}", floats.len())),
            }
        }
        other => Err(format!("unsupported value type {}", other.type_str())),
    }
}

/// `shaderlens.toml` inside the user configuration directory.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Loads the explicit path if given, else the default path if it exists,
/// else built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<(ShaderlensConfig, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
        return Ok((ShaderlensConfig::load(path)?, Some(path.to_path_buf())));
    }
    match default_config_path() {
        Some(path) if path.is_file() => Ok((ShaderlensConfig::load(&path)?, Some(path))),
        _ => Ok((ShaderlensConfig::default(), None)),
    }
}
