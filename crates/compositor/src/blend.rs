use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Global mixer blend mode.
///
/// Every mode composites as `mix(dst, B(dst, src), a)` with
/// `a = alpha * src.a`; [`blend_pixel`] is the reference the GPU pass mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    #[default]
    Normal,
    Add,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
    Exclusion,
}

impl BlendMode {
    pub const ALL: [BlendMode; 9] = [
        BlendMode::Normal,
        BlendMode::Add,
        BlendMode::Multiply,
        BlendMode::Screen,
        BlendMode::Overlay,
        BlendMode::Darken,
        BlendMode::Lighten,
        BlendMode::Difference,
        BlendMode::Exclusion,
    ];

    /// Stable numeric id passed to the blend shader.
    pub fn index(self) -> u32 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Add => 1,
            BlendMode::Multiply => 2,
            BlendMode::Screen => 3,
            BlendMode::Overlay => 4,
            BlendMode::Darken => 5,
            BlendMode::Lighten => 6,
            BlendMode::Difference => 7,
            BlendMode::Exclusion => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlendMode::Normal => "normal",
            BlendMode::Add => "add",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
        }
    }

    /// Next mode in cycling order.
    pub fn next(self) -> Self {
        let index = self.index() as usize;
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    fn channel(self, dst: f32, src: f32) -> f32 {
        match self {
            BlendMode::Normal => src,
            BlendMode::Add => (dst + src).min(1.0),
            BlendMode::Multiply => dst * src,
            BlendMode::Screen => 1.0 - (1.0 - dst) * (1.0 - src),
            BlendMode::Overlay => {
                if dst < 0.5 {
                    2.0 * dst * src
                } else {
                    1.0 - 2.0 * (1.0 - dst) * (1.0 - src)
                }
            }
            BlendMode::Darken => dst.min(src),
            BlendMode::Lighten => dst.max(src),
            BlendMode::Difference => (dst - src).abs(),
            BlendMode::Exclusion => dst + src - 2.0 * dst * src,
        }
    }
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown blend mode '{0}'")]
pub struct UnknownBlendMode(pub String);

impl FromStr for BlendMode {
    type Err = UnknownBlendMode;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        BlendMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| UnknownBlendMode(raw.to_string()))
    }
}

/// Composites `src` over `dst` (straight alpha, components in `[0, 1]`).
pub fn blend_pixel(dst: [f32; 4], src: [f32; 4], alpha: f32, mode: BlendMode) -> [f32; 4] {
    let a = (alpha * src[3]).clamp(0.0, 1.0);
    let mut out = [0.0; 4];
    for i in 0..3 {
        let blended = mode.channel(dst[i], src[i]);
        out[i] = (dst[i] + (blended - dst[i]) * a).clamp(0.0, 1.0);
    }
    out[3] = (dst[3] + a * (1.0 - dst[3])).clamp(0.0, 1.0);
    out
}
