use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use renderer::PropertyValue;

#[derive(Parser, Debug)]
#[command(
    name = "shaderlens",
    author,
    version,
    about = "Runs camera frames through GLSL effects on the GPU"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive a synthetic camera through an effect and write the results.
    Run(RunArgs),
    /// Print the properties a fragment shader exposes.
    Inspect(InspectArgs),
    /// List builtin effects.
    Effects,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Configuration file; defaults to `shaderlens.toml` in the user config directory.
    #[arg(long, value_name = "PATH", env = "SHADERLENS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Builtin effect to apply (see `shaderlens effects`).
    #[arg(long, value_name = "NAME", conflicts_with = "shader")]
    pub effect: Option<String>,

    /// GLSL fragment shader to apply instead of a builtin effect.
    #[arg(long, value_name = "PATH")]
    pub shader: Option<PathBuf>,

    /// Set a shader property, e.g. `--set contrast=1.4` or `--set tint=1,0.8,0.6`.
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_property)]
    pub properties: Vec<(String, PropertyValue)>,

    /// Number of camera frames to process.
    #[arg(long, value_name = "N")]
    pub frames: Option<u32>,

    /// Camera resolution (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT")]
    pub size: Option<String>,

    /// Request a 10-bit HDR stream; falls back to SDR when unsupported.
    #[arg(long)]
    pub hdr: bool,

    /// Directory the last processed frame is written to.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Also capture a JPEG still of the last frame to this path.
    #[arg(long, value_name = "PATH")]
    pub snapshot: Option<PathBuf>,

    /// JPEG quality for `--snapshot`.
    #[arg(long, value_name = "0-100", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub quality: Option<u8>,

    /// Rotation applied to the snapshot, in degrees.
    #[arg(long, value_name = "DEGREES", value_parser = parse_rotation)]
    pub rotation: Option<u32>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to a fragment shader, or the name of a builtin effect.
    #[arg(value_name = "SHADER")]
    pub shader: String,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_property(value: &str) -> Result<(String, PropertyValue), String> {
    let (name, raw) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{value}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("property name must not be empty".to_string());
    }
    let value = parse_property_value(raw)?;
    Ok((name.to_string(), value))
}

/// Parses `1`, `0.5`, or a comma-separated vector of 2 to 4 components.
/// Components containing a `.` or an exponent are floats.
pub fn parse_property_value(raw: &str) -> Result<PropertyValue, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(format!("invalid property value '{raw}'"));
    }
    let is_float = parts.iter().any(|part| part.contains(['.', 'e', 'E']));

    if is_float {
        let floats = parts
            .iter()
            .map(|part| part.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("invalid float in '{raw}'"))?;
        match floats.as_slice() {
            [x] => Ok(PropertyValue::Float(*x)),
            [x, y] => Ok(PropertyValue::Vec2([*x, *y])),
            [x, y, z] => Ok(PropertyValue::Vec3([*x, *y, *z])),
            [x, y, z, w] => Ok(PropertyValue::Vec4([*x, *y, *z, *w])),
            _ => Err(format!("vectors have 2 to 4 components, got {}", floats.len())),
        }
    } else {
        let ints = parts
            .iter()
            .map(|part| part.parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("invalid integer in '{raw}'"))?;
        match ints.as_slice() {
            [x] => Ok(PropertyValue::Int(*x)),
            [x, y] => Ok(PropertyValue::IVec2([*x, *y])),
            [x, y, z] => Ok(PropertyValue::Vec3([*x as f32, *y as f32, *z as f32])),
            [x, y, z, w] => Ok(PropertyValue::Vec4([*x as f32, *y as f32, *z as f32, *w as f32])),
            _ => Err(format!("vectors have 2 to 4 components, got {}", ints.len())),
        }
    }
}

pub fn parse_rotation(value: &str) -> Result<u32, String> {
    let degrees: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid rotation '{value}'"))?;
    if degrees % 90 != 0 {
        return Err(format!("rotation must be a multiple of 90 degrees, got {degrees}"));
    }
    Ok(degrees % 360)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_values_infer_their_type() {
        assert_eq!(parse_property_value("3"), Ok(PropertyValue::Int(3)));
        assert_eq!(parse_property_value("0.5"), Ok(PropertyValue::Float(0.5)));
        assert_eq!(parse_property_value("1e-1"), Ok(PropertyValue::Float(0.1)));
        assert_eq!(parse_property_value("4, 2"), Ok(PropertyValue::IVec2([4, 2])));
        assert_eq!(
            parse_property_value("1,0.5,0.25"),
            Ok(PropertyValue::Vec3([1.0, 0.5, 0.25]))
        );
        assert!(parse_property_value("1,2,3,4,5").is_err());
        assert!(parse_property_value("1,,2").is_err());
        assert!(parse_property_value("bright").is_err());
    }

    #[test]
    fn property_flag_splits_name() {
        assert_eq!(
            parse_property("contrast=1.5"),
            Ok(("contrast".to_string(), PropertyValue::Float(1.5)))
        );
        assert!(parse_property("=1").is_err());
        assert!(parse_property("contrast").is_err());
    }

    #[test]
    fn rotation_must_be_quarter_turns() {
        assert_eq!(parse_rotation("270"), Ok(270));
        assert_eq!(parse_rotation("450"), Ok(90));
        assert!(parse_rotation("45").is_err());
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "shaderlens",
            "run",
            "--effect",
            "grayscale",
            "--set",
            "contrast=2",
            "--frames",
            "5",
            "--quality",
            "80",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.effect.as_deref(), Some("grayscale"));
        assert_eq!(args.properties, vec![("contrast".to_string(), PropertyValue::Int(2))]);
        assert_eq!(args.frames, Some(5));
        assert_eq!(args.quality, Some(80));
    }

    #[test]
    fn effect_and_shader_conflict() {
        let result = Cli::try_parse_from([
            "shaderlens",
            "run",
            "--effect",
            "grayscale",
            "--shader",
            "x.glsl",
        ]);
        assert!(result.is_err());
    }
}
