use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use compositor::gpu::validate_program;
use compositor::{
    ChannelDirective, CommentDirectiveParser, DirectiveParser, LoadedImage, ParamDef, ProgramKind,
    ProgramSlot,
};
use serde::Serialize;
use stageconfig::StageConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;
use winit::event_loop::EventLoop;

use crate::app::{CaptureTarget, StageApp};
use crate::cli::{CheckArgs, CropArgs, RunArgs};
use crate::controls::{startup_messages, StageDefaults, StartupModes};
use crate::loader::ThreadedLoader;
use crate::paths::AppPaths;

const LOADER_WORKERS: usize = 2;

pub fn run(args: RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let config_path = args.config.clone().unwrap_or_else(|| paths.config_file());
    let mut config = load_config(&config_path)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let program = args
        .program
        .as_deref()
        .map(|path| load_program(path, args.scene))
        .transpose()?;
    let program_dir = args.program.as_deref().and_then(Path::parent);
    let roots = paths.texture_roots(program_dir);
    let loaders = (
        ThreadedLoader::spawn("control", roots.clone(), LOADER_WORKERS)?,
        ThreadedLoader::spawn("display", roots, LOADER_WORKERS)?,
    );

    let mut defaults = StageDefaults::from_config(&config);
    defaults.asset = args.asset.clone();
    let modes = StartupModes {
        tiles: args.tiles.is_some(),
        mixer: args.mixer,
        asset: args.asset.is_some(),
    };
    let capture = args.capture.clone().map(|dir| CaptureTarget {
        dir,
        every: args.capture_every,
    });

    let event_loop =
        EventLoop::new().map_err(|err| anyhow!("failed to create event loop: {err}"))?;
    let mut app = StageApp::new(&event_loop, &config, defaults.clone(), loaders, capture)?;
    app.preload_global_presets(config.global_presets());
    for (index, reference) in args.channels {
        app.bind_channel(index, reference);
    }
    for message in startup_messages(program.as_ref(), modes, &defaults) {
        app.apply(message);
    }

    info!("stage running; close either window or press Escape to quit");
    event_loop
        .run(move |event, target| app.handle_event(event, target))
        .map_err(|err| anyhow!("window event loop error: {err}"))
}

/// Interface summary printed by `check --json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport<'a> {
    program: &'a Path,
    kind: ProgramKind,
    params: &'a [ParamDef],
    channels: &'a [ChannelDirective],
    #[serde(skip_serializing_if = "Option::is_none")]
    vertex_count: Option<u32>,
}

pub fn check(args: CheckArgs) -> Result<()> {
    let slot = load_program(&args.program, args.scene)?;
    let interface = CommentDirectiveParser.parse(&slot.source);
    validate_program(slot.kind, &slot.source, &interface)
        .map_err(|err| anyhow!("{}: {err}", args.program.display()))?;

    if args.json {
        let report = CheckReport {
            program: &args.program,
            kind: slot.kind,
            params: &interface.params,
            channels: &interface.channels,
            vertex_count: interface.vertex_count,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{}: {} program ok ({} params, {} channels)",
        args.program.display(),
        slot.kind,
        interface.params.len(),
        interface.channels.len()
    );
    for def in &interface.params {
        println!("  param    {:<16} {:?} default={:?}", def.name, def.kind, def.default);
    }
    for directive in &interface.channels {
        println!(
            "  channel{} {} ({:?})",
            directive.channel, directive.texture_name, directive.kind
        );
    }
    Ok(())
}

pub fn crop(args: CropArgs) -> Result<()> {
    let image = LoadedImage::open(&args.input)?;
    let cropped = image.autocrop(args.tolerance);
    let output: image::RgbaImage = cropped
        .to_rgba_image()
        .ok_or_else(|| anyhow!("cropped image buffer is inconsistent"))?;
    output
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!(
        "{}x{} -> {}x{} written to {}",
        image.width,
        image.height,
        cropped.width,
        cropped.height,
        args.output.display()
    );
    Ok(())
}

pub fn load_config(path: &Path) -> Result<StageConfig> {
    let config = StageConfig::load_or_default(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(path = %path.display(), exists = path.exists(), "stage configuration");
    Ok(config)
}

fn apply_overrides(config: &mut StageConfig, args: &RunArgs) {
    if let Some(layout) = args.tiles {
        config.tiles = layout;
    }
    if let Some(blend) = args.blend {
        config.mixer.blend = blend;
    }
    if let Some(fps) = args.fps {
        config.display.fps = Some(fps);
    }
    if args.fullscreen {
        config.display.fullscreen = true;
    }
    if let Some(framing) = args.framing {
        config.sync.framing = framing;
    }
}

fn load_program(path: &Path, scene: bool) -> Result<ProgramSlot> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read program {}", path.display()))?;
    let is_wgsl = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wgsl"));
    let kind = if scene || is_wgsl {
        ProgramKind::Scene
    } else {
        ProgramKind::Shader
    };
    Ok(ProgramSlot::new(kind, source))
}

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use compositor::{BlendMode, TileLayout};
    use stageconfig::SyncFraming;

    #[test]
    fn command_line_overrides_the_file() {
        let cli = Cli::try_parse_from([
            "duoshade",
            "--tiles",
            "3x3:2",
            "--blend",
            "multiply",
            "--fps",
            "30",
            "--fullscreen",
            "--framing",
            "json",
        ])
        .unwrap();
        let mut config = StageConfig::default();
        apply_overrides(&mut config, &cli.run);

        assert_eq!(config.tiles, TileLayout::new(3, 3, 2));
        assert_eq!(config.mixer.blend, BlendMode::Multiply);
        assert_eq!(config.display.fps, Some(30.0));
        assert!(config.display.fullscreen);
        assert_eq!(config.sync.framing, SyncFraming::Json);
        config.validate().unwrap();
    }

    #[test]
    fn wgsl_extension_selects_scene_programs() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("orbit.WGSL");
        let shader = dir.path().join("plasma.glsl");
        fs::write(&scene, "// scene").unwrap();
        fs::write(&shader, "// shader").unwrap();

        assert_eq!(load_program(&scene, false).unwrap().kind, ProgramKind::Scene);
        assert_eq!(load_program(&shader, false).unwrap().kind, ProgramKind::Shader);
        assert_eq!(load_program(&shader, true).unwrap().kind, ProgramKind::Scene);
        assert!(load_program(&dir.path().join("missing.glsl"), false).is_err());
    }
}
