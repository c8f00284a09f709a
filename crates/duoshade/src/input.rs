use compositor::PresetScope;
use winit::keyboard::{Key, NamedKey};

/// Playback-rate step for the arrow keys.
pub const SPEED_STEP: f32 = 0.1;
/// Mixer alpha step for `[` and `]`.
pub const ALPHA_STEP: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    TogglePlay,
    ToggleBlackout,
    ToggleTiles,
    ToggleMixer,
    ToggleAsset,
    NextBlend,
    SavePreset(PresetScope),
    RecallPreset(usize),
    Speed(f32),
    MixerAlpha(f32),
    RestartTime,
    ToggleFullscreen,
    Quit,
}

/// Shortcuts on the operator preview.
///
/// Lower-case `s` saves a local preset, upper-case (shifted) `S` a global
/// one; digits recall local presets starting at `1`.
pub fn control_action(key: &Key) -> Option<Action> {
    match key {
        Key::Named(NamedKey::Space) => Some(Action::TogglePlay),
        Key::Named(NamedKey::Escape) => Some(Action::Quit),
        Key::Named(NamedKey::ArrowUp) => Some(Action::Speed(SPEED_STEP)),
        Key::Named(NamedKey::ArrowDown) => Some(Action::Speed(-SPEED_STEP)),
        Key::Character(text) => match text.as_str() {
            " " => Some(Action::TogglePlay),
            "b" | "B" => Some(Action::ToggleBlackout),
            "t" | "T" => Some(Action::ToggleTiles),
            "m" | "M" => Some(Action::ToggleMixer),
            "a" | "A" => Some(Action::ToggleAsset),
            "n" | "N" => Some(Action::NextBlend),
            "s" => Some(Action::SavePreset(PresetScope::Local)),
            "S" => Some(Action::SavePreset(PresetScope::Global)),
            "r" | "R" => Some(Action::RestartTime),
            "[" => Some(Action::MixerAlpha(-ALPHA_STEP)),
            "]" => Some(Action::MixerAlpha(ALPHA_STEP)),
            "q" | "Q" => Some(Action::Quit),
            other => preset_digit(other).map(Action::RecallPreset),
        },
        _ => None,
    }
}

/// Shortcuts on the output window: preset recall, fullscreen and quit.
pub fn display_action(key: &Key) -> Option<Action> {
    match key {
        Key::Named(NamedKey::Escape) => Some(Action::Quit),
        Key::Named(NamedKey::F11) => Some(Action::ToggleFullscreen),
        Key::Character(text) => match text.as_str() {
            "f" | "F" => Some(Action::ToggleFullscreen),
            other => preset_digit(other).map(Action::RecallPreset),
        },
        _ => None,
    }
}

fn preset_digit(text: &str) -> Option<usize> {
    let mut chars = text.chars();
    let digit = chars.next()?.to_digit(10)?;
    if chars.next().is_some() || digit == 0 {
        return None;
    }
    Some(digit as usize - 1)
}
