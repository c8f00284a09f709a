//! Turns operator shortcuts into sync messages.
//!
//! Every toggle is expressed as the message that produces the new state so
//! the control surface and the display go through the same code path.

use std::time::Instant;

use compositor::{
    AssetRef, BlendMode, GraphicsContext, MixerChannelState, MixerConfig, ProgramSlot,
    RenderSurface, TileLayout, TileState, TiledConfig, SPEED,
};
use stageconfig::StageConfig;
use surface_sync::{SyncMessage, TimeSync};

use crate::input::Action;

/// Startup choices the toggles fall back to.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefaults {
    pub tiles: TileLayout,
    pub blend: BlendMode,
    pub mixer_channels: usize,
    pub asset: Option<String>,
}

impl StageDefaults {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            tiles: config.tiles,
            blend: config.mixer.blend,
            mixer_channels: config.mixer.channels,
            asset: None,
        }
    }
}

/// Message implementing `action` against the current control state.
///
/// Preset shortcuts, fullscreen and quit are handled by the caller and
/// yield `None` here, as do toggles with nothing to act on.
pub fn message_for<C: GraphicsContext>(
    surface: &RenderSurface<C>,
    action: Action,
    defaults: &StageDefaults,
    now: Instant,
) -> Option<SyncMessage> {
    let clock = surface.clock();
    match action {
        Action::TogglePlay => Some(SyncMessage::TimeSync(TimeSync {
            time: clock.time_at(now),
            frame: clock.frame(),
            playing: !clock.is_playing(),
        })),
        Action::RestartTime => Some(SyncMessage::TimeSync(TimeSync {
            time: 0.0,
            frame: 0,
            playing: clock.is_playing(),
        })),
        Action::ToggleBlackout => Some(SyncMessage::Blackout(!surface.blackout())),
        Action::ToggleTiles if surface.tiles().is_some() => Some(SyncMessage::TileExit),
        Action::ToggleTiles => Some(SyncMessage::TileInit(tiled_config(
            surface.program(),
            defaults.tiles,
        ))),
        Action::ToggleMixer if surface.mixer().is_some() => Some(SyncMessage::MixerExit),
        Action::ToggleMixer => Some(SyncMessage::MixerInit(mixer_config(
            surface.program(),
            defaults,
        ))),
        Action::ToggleAsset if surface.asset().is_some() => Some(SyncMessage::AssetUpdate(None)),
        Action::ToggleAsset => defaults
            .asset
            .as_ref()
            .map(|reference| SyncMessage::AssetUpdate(Some(AssetRef::image(reference.clone())))),
        Action::NextBlend => {
            let current = surface
                .mixer()
                .map_or(defaults.blend, |mixer| mixer.blend_mode());
            Some(SyncMessage::MixerBlendMode {
                blend_mode: current.next(),
            })
        }
        Action::Speed(delta) => {
            let current = surface
                .params()
                .get(SPEED)
                .and_then(|value| value.as_scalar())
                .unwrap_or(1.0);
            Some(SyncMessage::param(SPEED, (current + delta).max(0.0)))
        }
        Action::MixerAlpha(delta) => {
            let mixer = surface.mixer()?;
            let channel_index = mixer.channel_count().checked_sub(1)?;
            let alpha = mixer.channel(channel_index)?.alpha;
            Some(SyncMessage::MixerAlphaUpdate {
                channel_index,
                alpha: (alpha + delta).clamp(0.0, 1.0),
            })
        }
        Action::SavePreset(_)
        | Action::RecallPreset(_)
        | Action::ToggleFullscreen
        | Action::Quit => None,
    }
}

/// Every tile starts on `program`.
pub fn tiled_config(program: Option<&ProgramSlot>, layout: TileLayout) -> TiledConfig {
    let slot = program.cloned();
    let tiles = (0..layout.tile_count())
        .map(|_| TileState {
            slot: slot.clone(),
            ..TileState::default()
        })
        .collect();
    TiledConfig { layout, tiles }
}

/// Channel 0 carries `program` at full alpha and the asset (if any) sits on
/// channel 1 at half alpha. Remaining channels start empty.
pub fn mixer_config(program: Option<&ProgramSlot>, defaults: &StageDefaults) -> MixerConfig {
    let mut channels = vec![MixerChannelState::default(); defaults.mixer_channels.max(1)];
    channels[0].slot = program.cloned();
    if let (Some(reference), Some(channel)) = (&defaults.asset, channels.get_mut(1)) {
        channel.asset = Some(AssetRef::image(reference.clone()));
        channel.alpha = 0.5;
    }
    MixerConfig {
        blend_mode: defaults.blend,
        channels,
    }
}

/// Modes requested on the command line, applied once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupModes {
    pub tiles: bool,
    pub mixer: bool,
    pub asset: bool,
}

/// Messages that bring a fresh control surface into the requested state.
///
/// The program goes first so tiles and mixer channels start on it.
pub fn startup_messages(
    program: Option<&ProgramSlot>,
    modes: StartupModes,
    defaults: &StageDefaults,
) -> Vec<SyncMessage> {
    let mut messages = Vec::new();
    if let Some(slot) = program {
        messages.push(SyncMessage::program(slot));
    }
    if modes.asset {
        if let Some(reference) = &defaults.asset {
            messages.push(SyncMessage::AssetUpdate(Some(AssetRef::image(reference.clone()))));
        }
    }
    if modes.tiles {
        messages.push(SyncMessage::TileInit(tiled_config(program, defaults.tiles)));
    }
    if modes.mixer {
        messages.push(SyncMessage::MixerInit(mixer_config(program, defaults)));
    }
    messages
}
