use std::fmt;
use std::path::Path;
use std::time::Duration;

use compositor::gpu::GpuOptions;
use compositor::{BlendMode, ParameterSet, Preset, TileLayout, MAX_CHANNELS, MAX_GRID_SIDE};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Starter file written by `duoshade config init`.
pub const TEMPLATE: &str = r#"version = 1

# Operator preview window.
[control]
width = 960
height = 540
title = "duoshade control"

# Full-resolution output window.
[display]
width = 1920
height = 1080
title = "duoshade display"
fullscreen = false
# 0 follows the measured refresh rate of the display's monitor.
fps = 0
# Optional letterboxed render area, e.g. "16:9".
# aspect = "16:9"

[gpu]
power = "low"
vsync = true
frame_latency = 2

[tiles]
rows = 2
cols = 2
gap = 4

[mixer]
blend = "normal"
channels = 4

[sync]
capacity = 64
framing = "direct"
fps_report_interval = "1s"
time_sync_interval = "5s"
"#;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageConfig {
    pub version: u32,
    #[serde(default = "WindowConfig::control")]
    pub control: WindowConfig,
    #[serde(default = "WindowConfig::display")]
    pub display: WindowConfig,
    #[serde(default)]
    pub gpu: GpuOptions,
    #[serde(default = "default_tiles")]
    pub tiles: TileLayout,
    #[serde(default)]
    pub mixer: MixerDefaults,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Preloaded into the global preset bank.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<PresetEntry>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            version: 1,
            control: WindowConfig::control(),
            display: WindowConfig::display(),
            gpu: GpuOptions::default(),
            tiles: default_tiles(),
            mixer: MixerDefaults::default(),
            sync: SyncConfig::default(),
            presets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fullscreen: bool,
    /// Frame-rate cap; 0 (or absent) follows the measured refresh rate.
    #[serde(default)]
    pub fps: Option<f32>,
    /// Locks the render area to `W:H` (or a plain ratio such as `1.7778`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect: Option<String>,
}

impl WindowConfig {
    fn control() -> Self {
        Self {
            width: 960,
            height: 540,
            title: Some("duoshade control".into()),
            fullscreen: false,
            fps: None,
            aspect: None,
        }
    }

    fn display() -> Self {
        Self {
            width: 1920,
            height: 1080,
            title: Some("duoshade display".into()),
            fullscreen: false,
            fps: Some(0.0),
            aspect: None,
        }
    }

    /// `None` when uncapped or following the monitor.
    pub fn fps_cap(&self) -> Option<f32> {
        self.fps.filter(|fps| *fps > 0.0)
    }

    pub fn aspect_ratio(&self) -> Result<Option<f64>, ConfigError> {
        self.aspect.as_deref().map(parse_aspect).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MixerDefaults {
    #[serde(deserialize_with = "deserialize_blend")]
    pub blend: BlendMode,
    pub channels: usize,
}

impl Default for MixerDefaults {
    fn default() -> Self {
        Self {
            blend: BlendMode::default(),
            channels: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFraming {
    #[default]
    Direct,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Envelopes each lane holds before the sender has to retry.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub framing: SyncFraming,
    #[serde(
        default = "default_fps_report_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub fps_report_interval: Duration,
    /// How often the control surface re-sends its clock to cancel drift.
    #[serde(
        default = "default_time_sync_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub time_sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            framing: SyncFraming::default(),
            fps_report_interval: default_fps_report_interval(),
            time_sync_interval: default_time_sync_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PresetEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub params: ParameterSet,
}

impl From<&PresetEntry> for Preset {
    fn from(entry: &PresetEntry) -> Self {
        Preset {
            name: entry.name.clone(),
            params: entry.params.clone(),
        }
    }
}

fn default_tiles() -> TileLayout {
    TileLayout::new(2, 2, 4)
}

fn default_capacity() -> usize {
    64
}

fn default_fps_report_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_time_sync_interval() -> Duration {
    Duration::from_secs(5)
}

fn deserialize_blend<'de, D>(deserializer: D) -> Result<BlendMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(de::Error::custom)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses `16:9`, `4/3` or a plain ratio such as `2.35`.
pub fn parse_aspect(raw: &str) -> Result<f64, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::Invalid(format!("invalid aspect ratio '{trimmed}'"));
    let ratio = match trimmed.split_once([':', '/']) {
        Some((w, h)) => {
            let w: f64 = w.trim().parse().map_err(|_| invalid())?;
            let h: f64 = h.trim().parse().map_err(|_| invalid())?;
            w / h
        }
        None => trimmed.parse().map_err(|_| invalid())?,
    };
    if ratio.is_finite() && ratio > 0.0 {
        Ok(ratio)
    } else {
        Err(invalid())
    }
}

impl StageConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: StageConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Invalid(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn global_presets(&self) -> Vec<Preset> {
        self.presets.iter().map(Preset::from).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        for (name, window) in [("control", &self.control), ("display", &self.display)] {
            if window.width == 0 || window.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} window size must be non-zero, got {}x{}",
                    window.width, window.height
                )));
            }
            if let Some(fps) = window.fps {
                if fps.is_nan() || fps < 0.0 {
                    return Err(ConfigError::Invalid(format!("{name}.fps must be >= 0")));
                }
            }
            window.aspect_ratio()?;
        }

        if !(1..=3).contains(&self.gpu.frame_latency) {
            return Err(ConfigError::Invalid(
                "gpu.frame_latency must be between 1 and 3".into(),
            ));
        }

        let sides = 1..=MAX_GRID_SIDE;
        if !sides.contains(&self.tiles.rows) || !sides.contains(&self.tiles.cols) {
            return Err(ConfigError::Invalid(format!(
                "tiles.rows and tiles.cols must be between 1 and {MAX_GRID_SIDE}"
            )));
        }

        if self.mixer.channels == 0 || self.mixer.channels > MAX_CHANNELS {
            return Err(ConfigError::Invalid(format!(
                "mixer.channels must be between 1 and {MAX_CHANNELS}"
            )));
        }

        if self.sync.capacity == 0 {
            return Err(ConfigError::Invalid(
                "sync.capacity must be greater than zero".into(),
            ));
        }
        if self.sync.fps_report_interval.is_zero() || self.sync.time_sync_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sync intervals must be greater than zero".into(),
            ));
        }

        for (index, preset) in self.presets.iter().enumerate() {
            if preset.params.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "preset {index} ({}) has no params",
                    preset.name.as_deref().unwrap_or("unnamed")
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use compositor::gpu::GpuPower;
    use compositor::ParamValue;

    use super::*;

    #[test]
    fn template_matches_defaults() {
        let config = StageConfig::from_toml_str(TEMPLATE).expect("parse template");
        assert_eq!(config, StageConfig::default());
    }

    #[test]
    fn minimal_config_fills_sections() {
        let config = StageConfig::from_toml_str("version = 1\n").unwrap();
        assert_eq!(config.display.width, 1920);
        assert_eq!(config.sync.capacity, 64);
        assert_eq!(config.tiles, TileLayout::new(2, 2, 4));
    }

    #[test]
    fn parses_full_config() {
        let config = StageConfig::from_toml_str(
            r#"
version = 1

[display]
width = 3840
height = 2160
fullscreen = true
fps = 50
aspect = "21:9"

[gpu]
power = "high"

[tiles]
rows = 3
cols = 4
gap = 2

[mixer]
blend = "Screen"
channels = 6

[sync]
capacity = 8
framing = "json"
fps_report_interval = "500ms"
time_sync_interval = 10

[[presets]]
name = "warm"
[presets.params]
speed = 2.0
tint = [1.0, 0.5, 0.0]
"#,
        )
        .unwrap();

        assert!(config.display.fullscreen);
        assert_eq!(config.display.fps_cap(), Some(50.0));
        let aspect = config.display.aspect_ratio().unwrap().unwrap();
        assert!((aspect - 21.0 / 9.0).abs() < 1e-9);
        assert_eq!(config.gpu.power, GpuPower::High);
        assert_eq!(config.tiles, TileLayout::new(3, 4, 2));
        assert_eq!(config.mixer.blend, BlendMode::Screen);
        assert_eq!(config.sync.framing, SyncFraming::Json);
        assert_eq!(config.sync.fps_report_interval, Duration::from_millis(500));
        assert_eq!(config.sync.time_sync_interval, Duration::from_secs(10));

        let presets = config.global_presets();
        assert_eq!(presets[0].name.as_deref(), Some("warm"));
        assert_eq!(
            presets[0].params.get("tint"),
            Some(&ParamValue::Vector(vec![1.0, 0.5, 0.0]))
        );
    }

    #[test]
    fn rejects_bad_values() {
        for body in [
            "version = 2",
            "version = 1\n[display]\nwidth = 0\nheight = 10",
            "version = 1\n[tiles]\nrows = 0\ncols = 2",
            "version = 1\n[tiles]\nrows = 2\ncols = 65",
            "version = 1\n[mixer]\nchannels = 99",
            "version = 1\n[sync]\ncapacity = 0",
            "version = 1\n[control]\nwidth = 10\nheight = 10\naspect = \"wide\"",
            "version = 1\n[gpu]\nframe_latency = 9",
        ] {
            let err = StageConfig::from_toml_str(body).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{body}: {err}");
        }
    }

    #[test]
    fn unknown_blend_mode_is_a_parse_error() {
        let err = StageConfig::from_toml_str("version = 1\n[mixer]\nblend = \"sparkle\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::load_or_default(&dir.path().join("stage.toml")).unwrap();
        assert_eq!(config, StageConfig::default());

        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "version = 1\n[tiles]\nrows = 1\ncols = 3\n").unwrap();
        let config = StageConfig::load_or_default(&path).unwrap();
        assert_eq!(config.tiles, TileLayout::new(1, 3, 0));
    }

    #[test]
    fn parses_aspect_forms() {
        assert!((parse_aspect("4/3").unwrap() - 4.0 / 3.0).abs() < 1e-9);
        assert!((parse_aspect(" 2.35 ").unwrap() - 2.35).abs() < 1e-9);
        assert!(parse_aspect("0:9").is_err());
        assert!(parse_aspect("16:0").is_err());
    }
}
