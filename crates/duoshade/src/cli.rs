use std::path::PathBuf;

use clap::{Parser, Subcommand};
use compositor::{BlendMode, TileLayout, CHANNEL_COUNT};
use stageconfig::SyncFraming;

#[derive(Parser, Debug)]
#[command(
    name = "duoshade",
    author,
    version,
    about = "Live shader compositor with a control preview and a mirrored display",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Program loaded on the control surface at startup (GLSL `mainImage` or WGSL scene).
    #[arg(value_name = "PROGRAM")]
    pub program: Option<PathBuf>,

    /// Treat PROGRAM as a WGSL scene; implied by a `.wgsl` extension.
    #[arg(long)]
    pub scene: bool,

    /// Stage configuration file (defaults to `stage.toml` in the config directory).
    #[arg(long, value_name = "FILE", env = "DUOSHADE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Start in tiled mode with a `ROWSxCOLS[:GAP]` grid.
    #[arg(long, value_name = "ROWSxCOLS[:GAP]", value_parser = parse_tiles)]
    pub tiles: Option<TileLayout>,

    /// Start in mixer mode with the configured channel count.
    #[arg(long)]
    pub mixer: bool,

    /// Mixer blend mode (`normal`, `add`, `multiply`, `screen`, ...).
    #[arg(long, value_name = "MODE")]
    pub blend: Option<BlendMode>,

    /// Show a static image in asset mode.
    #[arg(long, value_name = "FILE")]
    pub asset: Option<String>,

    /// Bind a texture to an input channel, e.g. `--channel 0=noise.png`.
    #[arg(long = "channel", value_name = "N=TEXTURE", value_parser = parse_channel)]
    pub channels: Vec<(usize, String)>,

    /// Display FPS cap (0 follows the measured refresh rate).
    #[arg(long, value_name = "FPS")]
    pub fps: Option<f32>,

    /// Open the display window fullscreen.
    #[arg(long)]
    pub fullscreen: bool,

    /// Message framing between the surfaces (`direct` or `json`).
    #[arg(long, value_name = "FRAMING", value_parser = parse_framing)]
    pub framing: Option<SyncFraming>,

    /// Write display frames as PNG files into this directory.
    #[arg(long, value_name = "DIR")]
    pub capture: Option<PathBuf>,

    /// Keep every Nth frame when capturing.
    #[arg(long, value_name = "N", default_value_t = 60, requires = "capture")]
    pub capture_every: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a program without opening any window.
    Check(CheckArgs),
    /// Trim the uniform border off an image.
    Crop(CropArgs),
    /// Manage the stage configuration file.
    Config(ConfigCommand),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[arg(value_name = "PROGRAM")]
    pub program: PathBuf,

    /// Treat PROGRAM as a WGSL scene; implied by a `.wgsl` extension.
    #[arg(long)]
    pub scene: bool,

    /// Print the declared interface as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct CropArgs {
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Maximum per-component difference still counted as border.
    #[arg(short, long, value_name = "0-255", default_value_t = 10)]
    pub tolerance: u8,
}

#[derive(Parser, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a commented starter `stage.toml`.
    Init {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved configuration and data paths.
    Where,
    /// Parse and validate the configuration file.
    Check {
        /// Print the effective configuration, defaults included, as TOML.
        #[arg(long)]
        print: bool,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_tiles(value: &str) -> Result<TileLayout, String> {
    let trimmed = value.trim();
    let (grid, gap) = match trimmed.split_once(':') {
        Some((grid, gap)) => (grid, Some(gap)),
        None => (trimmed, None),
    };
    let (rows, cols) = grid
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected ROWSxCOLS[:GAP], got '{trimmed}'"))?;
    let rows = rows
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid row count '{rows}'"))?;
    let cols = cols
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid column count '{cols}'"))?;
    if rows == 0 || cols == 0 {
        return Err("tile grid needs at least one row and one column".into());
    }
    let gap = match gap {
        Some(gap) => gap
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid tile gap '{gap}'"))?,
        None => 0,
    };
    Ok(TileLayout::new(rows, cols, gap))
}

pub fn parse_channel(value: &str) -> Result<(usize, String), String> {
    let (index, reference) = value
        .split_once('=')
        .ok_or_else(|| format!("expected N=TEXTURE, got '{value}'"))?;
    let index = index
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid channel index '{index}'"))?;
    if index >= CHANNEL_COUNT {
        return Err(format!(
            "channel index {index} out of range; expected 0..{}",
            CHANNEL_COUNT - 1
        ));
    }
    let reference = reference.trim();
    if reference.is_empty() {
        return Err("channel texture must not be empty".into());
    }
    Ok((index, reference.to_string()))
}

pub fn parse_framing(value: &str) -> Result<SyncFraming, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "direct" => Ok(SyncFraming::Direct),
        "json" => Ok(SyncFraming::Json),
        other => Err(format!("unknown framing '{other}'; expected direct or json")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tile_grids() {
        assert_eq!(parse_tiles("2x3").unwrap(), TileLayout::new(2, 3, 0));
        assert_eq!(parse_tiles("4X4:8").unwrap(), TileLayout::new(4, 4, 8));
        assert!(parse_tiles("0x3").is_err());
        assert!(parse_tiles("3").is_err());
        assert!(parse_tiles("2x2:wide").is_err());
    }

    #[test]
    fn parses_channel_bindings() {
        assert_eq!(
            parse_channel("1=noise.png").unwrap(),
            (1, "noise.png".to_string())
        );
        assert!(parse_channel("4=noise.png").is_err());
        assert!(parse_channel("0=").is_err());
        assert!(parse_channel("noise.png").is_err());
    }

    #[test]
    fn blend_flag_accepts_any_case() {
        let cli = Cli::try_parse_from(["duoshade", "--mixer", "--blend", "Screen"]).unwrap();
        assert_eq!(cli.run.blend, Some(BlendMode::Screen));
        assert!(cli.run.mixer);
    }

    #[test]
    fn capture_every_requires_capture() {
        assert!(Cli::try_parse_from(["duoshade", "--capture-every", "10"]).is_err());
    }
}
