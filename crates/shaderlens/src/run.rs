use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::RgbaImage;
use renderer::{
    declared_properties, image_target, DeliveredImage, DynamicRange, Effect, FragmentShader,
    Mat4, NativeWindow, OutputFormat, ProcessorOptions, PropertyDecl, PropertyValue, RenderedFrame,
    Size, SurfaceOutput, SurfaceProcessor, SurfaceReply, SurfaceRequest, TransformationInfo,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::camera::{CameraFormat, SyntheticCamera};
use crate::cli::{Cli, Command, InspectArgs, RunArgs};
use crate::config::{load_config, RangeSetting, ShaderlensConfig};

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_FILE: &str = "frame.png";

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Inspect(args) => inspect(args),
        Command::Effects => {
            list_effects();
            Ok(())
        }
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Clone, PartialEq)]
enum ShaderChoice {
    Builtin(Effect),
    File(PathBuf),
}

#[derive(Debug, Clone)]
struct RunSettings {
    dynamic_range: DynamicRange,
    thread_name: Option<String>,
    shader: ShaderChoice,
    properties: Vec<(String, PropertyValue)>,
    frames: u32,
    size: Size,
    output_dir: PathBuf,
    snapshot: Option<PathBuf>,
    quality: u8,
    rotation: u32,
}

/// Command-line flags override the configuration file.
fn resolve_settings(args: RunArgs, config: &ShaderlensConfig) -> Result<RunSettings> {
    let shader = match (&args.effect, &args.shader) {
        (Some(name), _) => ShaderChoice::Builtin(builtin(name)?),
        (None, Some(path)) => ShaderChoice::File(path.clone()),
        (None, None) => match (&config.effect.name, &config.effect.shader) {
            (Some(name), _) => ShaderChoice::Builtin(builtin(name)?),
            (None, Some(path)) => ShaderChoice::File(path.clone()),
            (None, None) => ShaderChoice::Builtin(Effect::Passthrough),
        },
    };

    let dynamic_range = match (args.hdr, config.processor.dynamic_range) {
        (true, RangeSetting::Sdr) => DynamicRange::HLG_10_BIT,
        (_, setting) => setting.dynamic_range(),
    };

    let size_spec = args.size.as_deref().unwrap_or(&config.capture.size);
    let (width, height) = parse_surface_size(size_spec)
        .with_context(|| format!("invalid camera size '{size_spec}'"))?;

    let mut properties = config.properties();
    properties.extend(args.properties);

    Ok(RunSettings {
        dynamic_range,
        thread_name: config.processor.thread_name.clone(),
        shader,
        properties,
        frames: args.frames.unwrap_or(config.capture.frames).max(1),
        size: Size::new(width, height),
        output_dir: args
            .output_dir
            .or_else(|| config.capture.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
        snapshot: args.snapshot,
        quality: args.quality.unwrap_or(config.capture.quality),
        rotation: args.rotation.unwrap_or(config.capture.rotation % 360),
    })
}

fn builtin(name: &str) -> Result<Effect> {
    Effect::from_name(name).ok_or_else(|| {
        let known: Vec<_> = Effect::ALL.iter().map(|effect| effect.name()).collect();
        anyhow!("unknown effect '{name}' (available: {})", known.join(", "))
    })
}

pub fn parse_surface_size(spec: &str) -> Result<(u32, u32)> {
    let trimmed = spec.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("expected WxH format, e.g. 1280x720"))?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid width in size specification"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid height in size specification"))?;

    if width == 0 || height == 0 {
        bail!("camera dimensions must be greater than zero");
    }

    Ok((width, height))
}

/// Integer literals become floats when the shader declares a float type.
fn coerce_property(decls: &[PropertyDecl], name: &str, value: PropertyValue) -> PropertyValue {
    let Some(decl) = decls.iter().find(|decl| decl.name == name) else {
        return value;
    };
    match (decl.glsl_type.as_str(), value) {
        ("float", PropertyValue::Int(v)) => PropertyValue::Float(v as f32),
        ("vec2", PropertyValue::IVec2([x, y])) => PropertyValue::Vec2([x as f32, y as f32]),
        (_, value) => value,
    }
}

fn shader_source(choice: &ShaderChoice) -> Result<String> {
    match choice {
        ShaderChoice::Builtin(effect) => Ok(effect.source().to_string()),
        ShaderChoice::File(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read shader {}", path.display())),
    }
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let (config, config_path) = load_config(args.config.as_deref())?;
    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded configuration");
    }
    let settings = resolve_settings(args, &config)?;
    let source = shader_source(&settings.shader)?;
    let decls = declared_properties(&source);

    let mut options = ProcessorOptions {
        dynamic_range: settings.dynamic_range,
        ..ProcessorOptions::default()
    };
    if let Some(name) = &settings.thread_name {
        options.thread_name = name.clone();
    }
    if let ShaderChoice::Builtin(effect) = settings.shader {
        options.initial_effect = effect;
    }

    let processor = SurfaceProcessor::new(options).context("failed to start surface processor")?;
    let device = processor.device_info();
    info!(
        gl = %device.gl_version,
        backend = %device.egl_version,
        range = %processor.dynamic_range(),
        "processor started"
    );

    if let ShaderChoice::File(path) = &settings.shader {
        processor
            .set_fragment_shader(FragmentShader::new(source.clone()))
            .wait()
            .with_context(|| format!("failed to apply shader {}", path.display()))?;
        info!(path = %path.display(), "applied custom shader");
    }
    for (name, value) in &settings.properties {
        if !decls.iter().any(|decl| &decl.name == name) {
            warn!(property = %name, "shader does not declare this property");
        }
        let value = coerce_property(&decls, name, *value);
        debug!(property = %name, ?value, "setting property");
        processor.set_property(name.clone(), value);
    }

    let (raster_target, frames_rx) = image_target(settings.size);
    let raster = SurfaceOutput::new(
        NativeWindow::from_image_target(raster_target),
        OutputFormat::Raster,
        Mat4::IDENTITY,
    );
    processor.on_output_surface(raster);

    let capture = settings.snapshot.as_ref().map(|_| {
        let (target, rx) = image_target(settings.size);
        let output = SurfaceOutput::new(
            NativeWindow::from_image_target(target),
            OutputFormat::Jpeg,
            Mat4::IDENTITY,
        );
        processor.on_output_surface(output);
        rx
    });

    let hdr = processor.dynamic_range().is_10bit_hdr();
    let (request, handle) = SurfaceRequest::new(settings.size, processor.dynamic_range());
    processor.on_input_surface(request);
    if hdr {
        handle.update_transformation(TransformationInfo {
            rotation_degrees: 0,
            has_camera_transform: true,
        });
    }
    let provided = match handle.wait() {
        Some(SurfaceReply::Provided(provided)) => provided,
        Some(SurfaceReply::Declined) | None => bail!("processor declined the input surface"),
    };

    let camera = SyntheticCamera::new(
        settings.size,
        if hdr { CameraFormat::P010 } else { CameraFormat::Rgba8 },
    );
    let mut last = None;
    let mut still = None;
    for index in 0..settings.frames {
        // A still is taken during the render pass of the frame queued after it.
        if index + 1 == settings.frames && capture.is_some() {
            still = Some(processor.snapshot(settings.quality, settings.rotation));
        }
        if !provided.surface().queue_frame(camera.frame(index)) {
            bail!("input surface detached while queueing frame {index}");
        }
        last = Some(next_frame(&frames_rx).with_context(|| format!("frame {index} was not rendered"))?);
    }
    info!(frames = settings.frames, "processed camera frames");

    if let Some(frame) = &last {
        fs::create_dir_all(&settings.output_dir).with_context(|| {
            format!("failed to create output directory {}", settings.output_dir.display())
        })?;
        let path = settings.output_dir.join(FRAME_FILE);
        save_frame(frame, &path)?;
        info!(path = %path.display(), "wrote last frame");
    }

    if let (Some(path), Some(rx), Some(still)) = (&settings.snapshot, &capture, still) {
        still.wait().context("snapshot failed")?;
        let bytes = rx
            .try_iter()
            .find_map(|delivered| match delivered {
                DeliveredImage::Encoded(bytes) => Some(bytes),
                DeliveredImage::Frame(_) => None,
            })
            .ok_or_else(|| anyhow!("snapshot resolved without delivering an image"))?;
        fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
        info!(
            path = %path.display(),
            bytes = bytes.len(),
            quality = settings.quality,
            rotation = settings.rotation,
            "wrote snapshot"
        );
    }

    // Outputs are closed by the processor as part of release.
    provided.detach();
    processor.release();
    processor.wait_for_release();
    Ok(())
}

fn next_frame(rx: &crossbeam_channel::Receiver<DeliveredImage>) -> Result<RenderedFrame> {
    loop {
        match rx.recv_timeout(FRAME_TIMEOUT)? {
            DeliveredImage::Frame(frame) => return Ok(frame),
            DeliveredImage::Encoded(_) => continue,
        }
    }
}

fn save_frame(frame: &RenderedFrame, path: &Path) -> Result<()> {
    let image = RgbaImage::from_raw(frame.size.width, frame.size.height, frame.rgba.clone())
        .ok_or_else(|| anyhow!("rendered frame does not match its size"))?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn inspect(args: InspectArgs) -> Result<()> {
    let path = Path::new(&args.shader);
    let source = if path.is_file() {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    } else {
        builtin(&args.shader)?.source().to_string()
    };
    let decls = declared_properties(&source);
    if decls.is_empty() {
        println!("no properties declared");
    }
    for decl in decls {
        match decl.array_len {
            Some(len) => println!("{}\t{}[{}]", decl.name, decl.glsl_type, len),
            None => println!("{}\t{}", decl.name, decl.glsl_type),
        }
    }
    Ok(())
}

fn list_effects() {
    for effect in Effect::ALL {
        println!("{:<20} {}", effect.name(), effect.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs::default()
    }

    #[test]
    fn parses_surface_sizes() {
        assert_eq!(parse_surface_size("1920x1080").unwrap(), (1920, 1080));
        assert_eq!(parse_surface_size(" 640 X 480 ").unwrap(), (640, 480));
        assert!(parse_surface_size("0x10").is_err());
        assert!(parse_surface_size("1920").is_err());
        assert!(parse_surface_size("wide x tall").is_err());
    }

    #[test]
    fn defaults_without_config_or_flags() {
        let settings = resolve_settings(args(), &ShaderlensConfig::default()).unwrap();
        assert_eq!(settings.shader, ShaderChoice::Builtin(Effect::Passthrough));
        assert_eq!(settings.dynamic_range, DynamicRange::SDR);
        assert_eq!(settings.size, Size::new(1280, 720));
        assert_eq!(settings.frames, 30);
        assert_eq!(settings.output_dir, PathBuf::from("."));
    }

    #[test]
    fn flags_override_config() {
        let config = ShaderlensConfig::from_toml_str(
            "[effect]\nname = \"grayscale\"\n[effect.properties]\nstrength = 0.5\n[capture]\nframes = 8\nsize = \"320x240\"\nquality = 60\n",
        )
        .unwrap();
        let mut overrides = args();
        overrides.shader = Some(PathBuf::from("warm.glsl"));
        overrides.frames = Some(2);
        overrides.quality = Some(90);
        overrides.properties = vec![("strength".to_string(), PropertyValue::Float(1.0))];

        let settings = resolve_settings(overrides, &config).unwrap();
        assert_eq!(settings.shader, ShaderChoice::File(PathBuf::from("warm.glsl")));
        assert_eq!(settings.frames, 2);
        assert_eq!(settings.size, Size::new(320, 240));
        assert_eq!(settings.quality, 90);
        // Later entries win when applied in order.
        assert_eq!(
            settings.properties.last(),
            Some(&("strength".to_string(), PropertyValue::Float(1.0)))
        );
    }

    #[test]
    fn hdr_flag_upgrades_sdr_config() {
        let mut hdr = args();
        hdr.hdr = true;
        let settings = resolve_settings(hdr, &ShaderlensConfig::default()).unwrap();
        assert_eq!(settings.dynamic_range, DynamicRange::HLG_10_BIT);
    }

    #[test]
    fn unknown_effect_lists_alternatives() {
        let mut unknown = args();
        unknown.effect = Some("sepia".to_string());
        let error = resolve_settings(unknown, &ShaderlensConfig::default()).unwrap_err();
        assert!(error.to_string().contains("grayscale"));
    }

    #[test]
    fn integer_literals_follow_declared_types() {
        let decls = declared_properties(Effect::BrightnessContrast.source());
        assert_eq!(
            coerce_property(&decls, "contrast", PropertyValue::Int(2)),
            PropertyValue::Float(2.0)
        );
        assert_eq!(
            coerce_property(&decls, "undeclared", PropertyValue::Int(2)),
            PropertyValue::Int(2)
        );
    }
}
