use std::time::Instant;

use compositor::{GraphicsContext, ProgramSlot, RenderError, RenderSurface};
use tracing::{debug, warn};

use crate::message::SyncMessage;

/// Applies one state message to `surface`.
///
/// Every message is idempotent: applying it twice leaves the surface as
/// applying it once does. Compile and load failures stay local and are only
/// logged; a context failure is returned so the caller can skip its tick.
/// Link-level messages (`hello`, `fpsReport`) are ignored here.
pub fn apply_message<C: GraphicsContext>(
    surface: &mut RenderSurface<C>,
    message: SyncMessage,
    now: Instant,
) -> Result<(), RenderError> {
    let kind = message.kind();
    let result = match message {
        SyncMessage::Init(snapshot) => surface.restore(*snapshot, now),
        SyncMessage::ProgramUpdate(update) => {
            let current = surface.program();
            let mode = update
                .mode
                .or_else(|| current.map(|slot| slot.kind))
                .unwrap_or_default();
            let unchanged =
                current.is_some_and(|slot| slot.kind == mode && slot.source == update.source);
            if unchanged {
                Ok(())
            } else {
                surface.set_program(ProgramSlot::new(mode, update.source))
            }
        }
        SyncMessage::TimeSync(sync) => {
            surface.resync_time(sync.time, sync.frame, sync.playing, now);
            Ok(())
        }
        SyncMessage::ParamUpdate { name, value } => {
            if !surface.set_param(&name, &value) {
                debug!(%name, "ignored update for unknown parameter");
            }
            Ok(())
        }
        SyncMessage::ParamBatchUpdate(params) => {
            surface.apply_params(&params);
            Ok(())
        }
        SyncMessage::PresetSync(preset) => {
            surface.apply_preset(preset.scope, preset.index, preset.params);
            Ok(())
        }
        SyncMessage::PresetSave {
            scope,
            index,
            preset,
        } => {
            surface.store_preset(scope, index, preset);
            Ok(())
        }
        SyncMessage::PresetRemove {
            scope,
            index,
            preset,
        } => {
            if surface.remove_preset_matching(scope, index, &preset).is_none() {
                debug!(index, "preset to remove is already gone");
            }
            Ok(())
        }
        SyncMessage::Blackout(enabled) => {
            surface.set_blackout(enabled);
            Ok(())
        }
        SyncMessage::AssetUpdate(Some(asset)) => {
            surface.set_asset(asset);
            Ok(())
        }
        SyncMessage::AssetUpdate(None) => {
            surface.clear_asset();
            Ok(())
        }
        SyncMessage::TileInit(config) => surface.tile_init(config.layout, config.tiles),
        SyncMessage::TileLayoutUpdate(layout) => {
            surface.tile_layout(layout);
            Ok(())
        }
        SyncMessage::TileAssign {
            tile_index,
            slot,
            params,
        } => surface.tile_assign(tile_index, slot, params),
        SyncMessage::TileParamUpdate {
            tile_index,
            name,
            value,
        } => {
            if !surface.tile_param(tile_index, &name, &value) {
                debug!(tile_index, %name, "ignored update for unknown tile parameter");
            }
            Ok(())
        }
        SyncMessage::TileVisibility {
            tile_index,
            visible,
        } => {
            surface.tile_visible(tile_index, visible);
            Ok(())
        }
        SyncMessage::TileExit => {
            surface.tile_exit();
            Ok(())
        }
        SyncMessage::MixerInit(config) => surface.mixer_init(config),
        SyncMessage::MixerChannelUpdate(update) => {
            let index = update.channel_index;
            surface.mixer_update(index, update.into())
        }
        SyncMessage::MixerAlphaUpdate {
            channel_index,
            alpha,
        } => {
            surface.mixer_alpha(channel_index, alpha);
            Ok(())
        }
        SyncMessage::MixerBlendMode { blend_mode } => {
            surface.mixer_blend_mode(blend_mode);
            Ok(())
        }
        SyncMessage::MixerExit => {
            surface.mixer_exit();
            Ok(())
        }
        SyncMessage::Hello { .. } | SyncMessage::FpsReport { .. } => Ok(()),
    };
    match result {
        Err(err) if !err.skips_tick() => {
            warn!(message = kind, error = %err, "synced update applied with errors");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use compositor::testing::{param_program, solid_program, ImmediateLoader, RasterContext};
    use compositor::{
        CommentDirectiveParser, ContextManager, ParamValue, ParameterSet, PresetScope,
        TileLayout, TiledConfig, SPEED,
    };

    use super::*;
    use crate::message::{PresetSync, ProgramUpdate};

    const TINTED: &str = "// @param tint color 0 0 0\n";

    fn surface() -> RenderSurface<RasterContext> {
        RenderSurface::new(
            ContextManager::new(RasterContext::new(32, 32)),
            Box::new(CommentDirectiveParser),
            Box::new(ImmediateLoader::new()),
            Instant::now(),
        )
    }

    fn tinted_program() -> String {
        format!("{TINTED}{}", param_program("tint"))
    }

    fn load(surface: &mut RenderSurface<RasterContext>, source: String) {
        apply_message(
            surface,
            SyncMessage::ProgramUpdate(ProgramUpdate { mode: None, source }),
            Instant::now(),
        )
        .unwrap();
    }

    #[test]
    fn repeated_param_update_is_idempotent() {
        let mut surface = surface();
        load(&mut surface, solid_program([1.0, 0.0, 0.0, 1.0]));
        let update = SyncMessage::param(SPEED, 1.5f32);
        apply_message(&mut surface, update.clone(), Instant::now()).unwrap();
        let once = surface.params().clone();
        apply_message(&mut surface, update, Instant::now()).unwrap();
        assert_eq!(surface.params(), &once);
        assert_eq!(surface.params().get(SPEED), Some(&ParamValue::Scalar(1.5)));
    }

    #[test]
    fn unknown_parameter_is_ignored() {
        let mut surface = surface();
        load(&mut surface, solid_program([1.0, 0.0, 0.0, 1.0]));
        let before = surface.params().clone();
        apply_message(&mut surface, SyncMessage::param("warp", 3.0f32), Instant::now()).unwrap();
        assert_eq!(surface.params(), &before);
    }

    #[test]
    fn same_program_update_keeps_current_params() {
        let mut surface = surface();
        load(&mut surface, tinted_program());
        apply_message(
            &mut surface,
            SyncMessage::param("tint", [0.0f32, 1.0, 0.0]),
            Instant::now(),
        )
        .unwrap();
        load(&mut surface, tinted_program());
        assert_eq!(
            surface.params().get("tint"),
            Some(&ParamValue::Vector(vec![0.0, 1.0, 0.0]))
        );
    }

    #[test]
    fn preset_sync_round_trips_its_values() {
        let mut surface = surface();
        load(&mut surface, tinted_program());
        let mut params = ParameterSet::new();
        params.set(SPEED, 2.0f32);
        params.set("tint", [1.0f32, 0.0, 0.0]);
        apply_message(
            &mut surface,
            SyncMessage::PresetSync(PresetSync {
                scope: PresetScope::Local,
                index: 0,
                params: params.clone(),
            }),
            Instant::now(),
        )
        .unwrap();
        for (name, value) in params.iter() {
            assert_eq!(surface.params().get(name), Some(value));
        }
        assert_eq!(surface.presets(PresetScope::Local).active(), Some(0));
    }

    #[test]
    fn repeated_preset_remove_deletes_one_preset() {
        let mut surface = surface();
        load(&mut surface, solid_program([1.0, 0.0, 0.0, 1.0]));
        for name in ["a", "b", "c"] {
            surface.snapshot_preset(PresetScope::Local, Some(name.into()));
        }
        let first = surface.presets(PresetScope::Local).get(0).cloned().unwrap();
        let remove = SyncMessage::PresetRemove {
            scope: PresetScope::Local,
            index: 0,
            preset: first,
        };

        apply_message(&mut surface, remove.clone(), Instant::now()).unwrap();
        let once = surface.presets(PresetScope::Local).clone();
        apply_message(&mut surface, remove, Instant::now()).unwrap();
        assert_eq!(surface.presets(PresetScope::Local), &once);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn preset_save_far_past_the_bank_is_ignored() {
        let mut surface = surface();
        let frame = r#"{"type":"presetSave","payload":{"index":18446744073709551615,"preset":{"params":{}}}}"#;
        let message: SyncMessage = serde_json::from_str(frame).unwrap();
        apply_message(&mut surface, message, Instant::now()).unwrap();
        assert!(surface.presets(PresetScope::Local).is_empty());
    }

    #[test]
    fn compile_failure_stays_local() {
        let mut surface = surface();
        let result = apply_message(
            &mut surface,
            SyncMessage::ProgramUpdate(ProgramUpdate {
                mode: None,
                source: compositor::testing::BROKEN_PROGRAM.into(),
            }),
            Instant::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn tile_messages_drive_the_tile_compositor() {
        let mut surface = surface();
        let config = TiledConfig {
            layout: TileLayout::new(1, 2, 0),
            tiles: Vec::new(),
        };
        apply_message(&mut surface, SyncMessage::TileInit(config), Instant::now()).unwrap();
        apply_message(
            &mut surface,
            SyncMessage::TileAssign {
                tile_index: 1,
                slot: Some(ProgramSlot::shader(solid_program([0.0, 0.0, 1.0, 1.0]))),
                params: None,
            },
            Instant::now(),
        )
        .unwrap();
        let tiles = surface.tiles().expect("tiled mode");
        assert_eq!(tiles.tiles().len(), 2);
        assert!(tiles.tile(1).and_then(|tile| tile.state().slot.as_ref()).is_some());

        apply_message(&mut surface, SyncMessage::TileExit, Instant::now()).unwrap();
        assert!(surface.tiles().is_none());
    }
}
