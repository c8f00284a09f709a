//! One surface's complete rendering state.
//!
//! A [`RenderSurface`] owns its context manager, default program renderer,
//! tile and mixer compositors, asset layer, presets and sinks. Nothing in
//! here is shared with another surface; peers only exchange the plain data
//! types ([`SurfaceSnapshot`], [`ParameterSet`], [`TileState`], ...).

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::asset::plan_draws;
use crate::blend::BlendMode;
use crate::capture::{FrameSink, SinkRegistry};
use crate::context::{
    Backend, ContextManager, ContextOwner, ContextStatus, DrawTarget, GraphicsContext,
};
use crate::error::RenderError;
use crate::frame::{ChannelInputs, FrameClock, PointerState, TextureId, CHANNEL_COUNT};
use crate::layout::{render_area, Bounds, TileLayout};
use crate::loader::{LoadResult, LoadedImage, TextureLoader};
use crate::mixer::{AssetRef, ChannelUpdate, MixerCompositor, MixerConfig};
use crate::params::{ParamValue, ParameterSet, Preset, PresetBank, PresetScope};
use crate::program::{
    ChannelKind, DirectiveParser, ProgramKind, ProgramRenderer, ProgramSlot, RenderOutcome,
};
use crate::tiles::{TileCompositor, TileRenderStats, TileState};

/// Which modes are currently engaged; several may be at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    pub blackout: bool,
    pub mixer: bool,
    pub tiled: bool,
    pub asset: bool,
}

/// The single path executed for a rendered tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPath {
    Blackout,
    Mixer,
    Tiled,
    Asset,
    Normal,
}

/// Strict priority: blackout, mixer, tiled, asset, normal.
pub fn select_path(flags: ModeFlags) -> RenderPath {
    if flags.blackout {
        RenderPath::Blackout
    } else if flags.mixer {
        RenderPath::Mixer
    } else if flags.tiled {
        RenderPath::Tiled
    } else if flags.asset {
        RenderPath::Asset
    } else {
        RenderPath::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiledConfig {
    pub layout: TileLayout,
    #[serde(default)]
    pub tiles: Vec<TileState>,
}

/// Full state needed to bring a mirroring surface up to date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSnapshot {
    #[serde(default)]
    pub program_source: Option<String>,
    #[serde(default)]
    pub mode: ProgramKind,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub frame: u64,
    #[serde(default = "playing_by_default")]
    pub playing: bool,
    #[serde(default, deserialize_with = "channel_slots")]
    pub channels: [Option<String>; CHANNEL_COUNT],
    #[serde(default)]
    pub params: ParameterSet,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub active_preset_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_presets: Vec<Preset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiled_config: Option<TiledConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixer_config: Option<MixerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
    #[serde(default)]
    pub blackout: bool,
}

fn playing_by_default() -> bool {
    true
}

/// Accepts any number of channel references; extra entries are dropped and
/// missing ones stay unbound.
fn channel_slots<'de, D>(deserializer: D) -> Result<[Option<String>; CHANNEL_COUNT], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let listed = Vec::<Option<String>>::deserialize(deserializer)?;
    let mut slots: [Option<String>; CHANNEL_COUNT] = Default::default();
    for (slot, reference) in slots.iter_mut().zip(listed) {
        *slot = reference;
    }
    Ok(slots)
}

/// What happened during one rendered tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub path: RenderPath,
    pub frame: u64,
    pub time: f64,
    pub tiles: Option<TileRenderStats>,
}

#[derive(Debug, Clone, Default)]
struct ChannelBinding {
    reference: Option<String>,
    texture: Option<TextureId>,
    resolution: [f32; 3],
}

struct AssetLayer {
    asset: AssetRef,
    image: Option<TextureId>,
}

pub struct RenderSurface<C: GraphicsContext> {
    manager: ContextManager<C>,
    parser: Box<dyn DirectiveParser>,
    loader: Box<dyn TextureLoader>,
    clock: FrameClock,
    program: ProgramRenderer<C>,
    local_presets: PresetBank,
    global_presets: PresetBank,
    tiles: Option<TileCompositor<C>>,
    mixer: Option<MixerCompositor<C>>,
    asset: Option<AssetLayer>,
    blackout: bool,
    channels: [ChannelBinding; CHANNEL_COUNT],
    sinks: SinkRegistry,
    aspect: Option<f64>,
    canvas: (u32, u32),
}

impl<C: GraphicsContext> RenderSurface<C> {
    pub fn new(
        manager: ContextManager<C>,
        parser: Box<dyn DirectiveParser>,
        loader: Box<dyn TextureLoader>,
        now: Instant,
    ) -> Self {
        let canvas = manager
            .context()
            .map(GraphicsContext::canvas_size)
            .unwrap_or((0, 0));
        Self {
            manager,
            parser,
            loader,
            clock: FrameClock::new(now),
            program: ProgramRenderer::new(ContextOwner::Default, Bounds::full(canvas.0, canvas.1)),
            local_presets: PresetBank::new(),
            global_presets: PresetBank::new(),
            tiles: None,
            mixer: None,
            asset: None,
            blackout: false,
            channels: Default::default(),
            sinks: SinkRegistry::new(),
            aspect: None,
            canvas,
        }
    }

    pub fn status(&self) -> ContextStatus {
        self.manager.status()
    }

    pub fn manager(&self) -> &ContextManager<C> {
        &self.manager
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn mode_flags(&self) -> ModeFlags {
        ModeFlags {
            blackout: self.blackout,
            mixer: self.mixer.is_some(),
            tiled: self.tiles.is_some(),
            asset: self.asset.is_some(),
        }
    }

    fn area(&self) -> Bounds {
        render_area(self.canvas.0, self.canvas.1, self.aspect)
    }

    /// Locks the render area to `aspect` (width / height), centred.
    pub fn set_aspect(&mut self, aspect: Option<f64>) {
        self.aspect = aspect;
        self.rebind_area();
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.manager.acquire()?.resize(width, height)?;
        self.canvas = (width, height);
        self.rebind_area();
        Ok(())
    }

    fn rebind_area(&mut self) {
        let area = self.area();
        self.program.set_resolution(area);
        if let Some(tiles) = &mut self.tiles {
            tiles.set_area(area);
        }
        if let Some(mixer) = &mut self.mixer {
            mixer.set_area(area);
        }
    }

    /// Installs a recreated context; programs recompile and media reload lazily.
    pub fn replace_context(&mut self, context: C) {
        self.canvas = context.canvas_size();
        self.manager.replace_context(context);
        self.rebind_area();
        for binding in &mut self.channels {
            binding.texture = None;
            if let Some(reference) = &binding.reference {
                self.loader.request(reference);
            }
        }
        if let Some(layer) = &mut self.asset {
            layer.image = None;
            self.loader.request(&layer.asset.reference);
        }
        if let Some(mixer) = &mut self.mixer {
            mixer.reload_assets(self.loader.as_mut());
        }
        info!(generation = self.manager.generation(), "graphics context replaced");
    }

    pub fn register_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.register(sink);
    }

    // Program and parameters.

    pub fn program(&self) -> Option<&ProgramSlot> {
        self.program.slot()
    }

    pub fn program_renderer(&self) -> &ProgramRenderer<C> {
        &self.program
    }

    /// Swaps the default program, disposing the previous one first.
    ///
    /// Switching between shader and scene programs hands the context to a
    /// different owner. A compile error is returned but the surface keeps
    /// rendering (a placeholder in normal mode).
    pub fn set_program(&mut self, slot: ProgramSlot) -> Result<(), RenderError> {
        self.program.dispose(&mut self.manager);
        let owner = match slot.kind {
            ProgramKind::Shader => ContextOwner::Default,
            ProgramKind::Scene => ContextOwner::Scene,
        };
        if self.program.owner() != owner {
            self.program = ProgramRenderer::new(owner, self.area());
        }
        let result = self.program.compile(&mut self.manager, self.parser.as_ref(), slot);
        let directives: Vec<_> = self
            .program
            .interface()
            .channels
            .iter()
            .filter(|directive| directive.kind == ChannelKind::Texture)
            .map(|directive| (directive.channel, directive.texture_name.clone()))
            .collect();
        for (channel, name) in directives {
            let bound = self
                .channels
                .get(channel)
                .and_then(|binding| binding.reference.as_deref());
            if bound != Some(name.as_str()) {
                self.set_channel(channel, Some(name));
            }
        }
        result
    }

    pub fn params(&self) -> &ParameterSet {
        self.program.params()
    }

    pub fn set_param(&mut self, name: &str, value: &ParamValue) -> bool {
        self.program.set_param(name, value)
    }

    pub fn apply_params(&mut self, params: &ParameterSet) -> usize {
        self.program.apply(params)
    }

    // Presets.

    pub fn presets(&self, scope: PresetScope) -> &PresetBank {
        match scope {
            PresetScope::Local => &self.local_presets,
            PresetScope::Global => &self.global_presets,
        }
    }

    fn bank_mut(&mut self, scope: PresetScope) -> &mut PresetBank {
        match scope {
            PresetScope::Local => &mut self.local_presets,
            PresetScope::Global => &mut self.global_presets,
        }
    }

    pub fn snapshot_preset(&mut self, scope: PresetScope, name: Option<String>) -> usize {
        let params = self.program.params().clone();
        self.bank_mut(scope).snapshot(name, &params)
    }

    /// Applies every entry of the preset; `None` (and no change) when it is missing.
    pub fn recall_preset(&mut self, scope: PresetScope, index: usize) -> Option<ParameterSet> {
        let params = self.bank_mut(scope).recall(index)?.params.clone();
        self.program.apply(&params);
        Some(params)
    }

    /// Stores a preset body received from a peer, then recalls it.
    pub fn apply_preset(&mut self, scope: PresetScope, index: usize, params: ParameterSet) {
        if self.bank_mut(scope).store(index, params) {
            self.recall_preset(scope, index);
        }
    }

    /// Stores a preset received from a peer without recalling it.
    pub fn store_preset(&mut self, scope: PresetScope, index: usize, preset: Preset) -> bool {
        self.bank_mut(scope).put(index, preset)
    }

    pub fn remove_preset(&mut self, scope: PresetScope, index: usize) -> Option<Preset> {
        self.bank_mut(scope).remove(index)
    }

    /// Removes the preset at `index` only if it still equals `expected`.
    pub fn remove_preset_matching(
        &mut self,
        scope: PresetScope,
        index: usize,
        expected: &Preset,
    ) -> Option<Preset> {
        self.bank_mut(scope).remove_matching(index, expected)
    }

    // Time and input.

    pub fn resync_time(&mut self, time: f64, frame: u64, playing: bool, now: Instant) {
        self.clock.resync(time, frame, playing, now);
    }

    pub fn set_playing(&mut self, playing: bool, now: Instant) {
        self.clock.set_playing(playing, now);
    }

    pub fn set_pointer(&mut self, pointer: PointerState) {
        self.clock.set_pointer(pointer);
    }

    pub fn blackout(&self) -> bool {
        self.blackout
    }

    pub fn set_blackout(&mut self, enabled: bool) {
        self.blackout = enabled;
    }

    // Texture channels.

    /// Binds `reference` to texture channel `index`; the load completes on a later tick.
    pub fn set_channel(&mut self, index: usize, reference: Option<String>) {
        let Some(binding) = self.channels.get_mut(index) else {
            warn!(index, "ignoring out-of-range texture channel");
            return;
        };
        match reference {
            Some(reference) => {
                self.loader.request(&reference);
                binding.reference = Some(reference);
            }
            None => {
                if let Some(texture) = binding.texture.take() {
                    if let Ok(context) = self.manager.acquire() {
                        context.dispose_image(texture);
                    }
                }
                *binding = ChannelBinding::default();
            }
        }
    }

    pub fn channel_references(&self) -> [Option<String>; CHANNEL_COUNT] {
        std::array::from_fn(|index| self.channels[index].reference.clone())
    }

    fn channel_inputs(&self) -> ChannelInputs {
        ChannelInputs {
            textures: std::array::from_fn(|index| self.channels[index].texture),
            resolutions: std::array::from_fn(|index| self.channels[index].resolution),
        }
    }

    // Tiles.

    pub fn tiles(&self) -> Option<&TileCompositor<C>> {
        self.tiles.as_ref()
    }

    /// Enters tiled mode, replacing (and disposing) any previous grid.
    pub fn tile_init(
        &mut self,
        layout: TileLayout,
        states: Vec<TileState>,
    ) -> Result<(), RenderError> {
        self.tile_exit();
        let mut tiles = TileCompositor::new(layout, self.area());
        let result = tiles.init(&mut self.manager, self.parser.as_ref(), layout, states);
        self.tiles = Some(tiles);
        result
    }

    pub fn tile_layout(&mut self, layout: TileLayout) {
        match &mut self.tiles {
            Some(tiles) => tiles.set_layout(&mut self.manager, layout),
            None => self.tiles = Some(TileCompositor::new(layout, self.area())),
        }
    }

    pub fn tile_assign(
        &mut self,
        index: usize,
        slot: Option<ProgramSlot>,
        params: Option<ParameterSet>,
    ) -> Result<(), RenderError> {
        let Some(tiles) = &mut self.tiles else {
            debug!(index, "tile assignment outside tiled mode ignored");
            return Ok(());
        };
        tiles.assign(&mut self.manager, self.parser.as_ref(), index, slot, params)
    }

    pub fn tile_param(&mut self, index: usize, name: &str, value: &ParamValue) -> bool {
        self.tiles
            .as_mut()
            .is_some_and(|tiles| tiles.set_param(index, name, value))
    }

    pub fn tile_visible(&mut self, index: usize, visible: bool) {
        if let Some(tiles) = &mut self.tiles {
            tiles.set_visible(index, visible);
        }
    }

    pub fn tile_clear(&mut self, index: usize) {
        if let Some(tiles) = &mut self.tiles {
            tiles.clear(&mut self.manager, index);
        }
    }

    /// Leaves tiled mode, disposing every tile renderer.
    pub fn tile_exit(&mut self) {
        if let Some(mut tiles) = self.tiles.take() {
            tiles.exit(&mut self.manager);
        }
    }

    // Mixer.

    pub fn mixer(&self) -> Option<&MixerCompositor<C>> {
        self.mixer.as_ref()
    }

    /// Enters mixer mode with `config`, replacing any previous channel stack.
    pub fn mixer_init(&mut self, config: MixerConfig) -> Result<(), RenderError> {
        self.mixer_exit();
        let mut mixer = MixerCompositor::new(self.area());
        let result = mixer.init(
            &mut self.manager,
            self.parser.as_ref(),
            self.loader.as_mut(),
            config,
        );
        self.mixer = Some(mixer);
        result
    }

    /// Updates one channel, entering mixer mode if needed.
    pub fn mixer_update(&mut self, index: usize, update: ChannelUpdate) -> Result<(), RenderError> {
        let area = self.area();
        let mixer = self.mixer.get_or_insert_with(|| MixerCompositor::new(area));
        mixer.update_channel(
            &mut self.manager,
            self.parser.as_ref(),
            self.loader.as_mut(),
            index,
            update,
        )
    }

    pub fn mixer_alpha(&mut self, index: usize, alpha: f32) {
        if let Some(mixer) = &mut self.mixer {
            mixer.set_alpha(index, alpha);
        }
    }

    pub fn mixer_blend_mode(&mut self, mode: BlendMode) {
        let area = self.area();
        self.mixer
            .get_or_insert_with(|| MixerCompositor::new(area))
            .set_blend_mode(mode);
    }

    pub fn mixer_exit(&mut self) {
        if let Some(mut mixer) = self.mixer.take() {
            mixer.exit(&mut self.manager);
        }
    }

    // Asset layer.

    pub fn asset(&self) -> Option<&AssetRef> {
        self.asset.as_ref().map(|layer| &layer.asset)
    }

    /// Shows `asset` in asset mode; only a new reference triggers a reload.
    pub fn set_asset(&mut self, asset: AssetRef) {
        if let Some(layer) = &mut self.asset {
            if layer.asset.reference == asset.reference {
                layer.asset = asset;
                return;
            }
        }
        self.clear_asset();
        self.loader.request(&asset.reference);
        self.asset = Some(AssetLayer { asset, image: None });
    }

    pub fn clear_asset(&mut self) {
        if let Some(layer) = self.asset.take() {
            if let Some(image) = layer.image {
                if let Ok(context) = self.manager.acquire() {
                    context.dispose_image(image);
                }
            }
        }
    }

    // Snapshot and restore.

    pub fn snapshot(&self, now: Instant) -> SurfaceSnapshot {
        SurfaceSnapshot {
            program_source: self.program.slot().map(|slot| slot.source.clone()),
            mode: self
                .program
                .slot()
                .map(|slot| slot.kind)
                .unwrap_or_default(),
            time: self.clock.time_at(now),
            frame: self.clock.frame(),
            playing: self.clock.is_playing(),
            channels: self.channel_references(),
            params: self.program.params().clone(),
            presets: self.local_presets.presets().to_vec(),
            active_preset_index: self.local_presets.active(),
            global_presets: self.global_presets.presets().to_vec(),
            tiled_config: self.tiles.as_ref().map(|tiles| TiledConfig {
                layout: tiles.layout(),
                tiles: tiles.states(),
            }),
            mixer_config: self.mixer.as_ref().map(MixerCompositor::config),
            asset: self.asset().cloned(),
            blackout: self.blackout,
        }
    }

    /// Applies a full snapshot in one step.
    ///
    /// Compile and load failures stay local; only context failures are returned.
    pub fn restore(&mut self, snapshot: SurfaceSnapshot, now: Instant) -> Result<(), RenderError> {
        self.tile_exit();
        self.mixer_exit();
        self.clear_asset();

        match snapshot.program_source {
            Some(source) => {
                let slot = ProgramSlot::new(snapshot.mode, source);
                if let Err(err) = self.set_program(slot) {
                    if err.skips_tick() {
                        return Err(err);
                    }
                }
            }
            None => self.program.dispose(&mut self.manager),
        }
        for (index, reference) in snapshot.channels.into_iter().enumerate() {
            if self.channels[index].reference != reference {
                self.set_channel(index, reference);
            }
        }
        self.program.apply(&snapshot.params);
        self.local_presets =
            PresetBank::from_presets(snapshot.presets, snapshot.active_preset_index);
        self.global_presets = PresetBank::from_presets(snapshot.global_presets, None);
        self.clock
            .resync(snapshot.time, snapshot.frame, snapshot.playing, now);
        self.blackout = snapshot.blackout;

        if let Some(tiled) = snapshot.tiled_config {
            self.tile_init(tiled.layout, tiled.tiles).or_else(non_fatal)?;
        }
        if let Some(config) = snapshot.mixer_config {
            self.mixer_init(config).or_else(non_fatal)?;
        }
        if let Some(asset) = snapshot.asset {
            self.set_asset(asset);
        }
        Ok(())
    }

    // Rendering.

    /// Uploads every load completed since the previous tick.
    fn poll_loads(&mut self) {
        for result in self.loader.drain() {
            self.deliver(&result);
        }
    }

    /// Hands one load to every consumer waiting on its reference.
    ///
    /// A failed upload is logged and does not stop the remaining consumers.
    fn deliver(&mut self, result: &LoadResult) {
        for (index, binding) in self.channels.iter_mut().enumerate() {
            if binding.reference.as_deref() != Some(result.reference.as_str()) {
                continue;
            }
            match &result.image {
                Ok(image) => {
                    if let Err(err) = attach_channel(&mut self.manager, binding, image) {
                        warn!(channel = index, reference = %result.reference, error = %err, "failed to attach loaded image");
                    }
                }
                Err(message) => {
                    let err = RenderError::ChannelLoad {
                        channel: index,
                        reference: result.reference.clone(),
                        message: message.clone(),
                    };
                    warn!(error = %err, "texture channel left unchanged");
                }
            }
        }
        if let Some(layer) = &mut self.asset {
            if layer.image.is_none() && layer.asset.reference == result.reference {
                match &result.image {
                    Ok(image) => {
                        match self.manager.acquire().and_then(|context| context.upload_image(image)) {
                            Ok(texture) => layer.image = Some(texture),
                            Err(err) => {
                                warn!(reference = %result.reference, error = %err, "failed to attach asset image");
                            }
                        }
                    }
                    Err(message) => {
                        warn!(reference = %result.reference, %message, "asset failed to load");
                    }
                }
            }
        }
        if let Some(mixer) = &mut self.mixer {
            if let Err(err) = mixer.deliver(&mut self.manager, result) {
                warn!(reference = %result.reference, error = %err, "failed to attach mixer image");
            }
        }
    }

    /// Renders one tick through exactly one path.
    ///
    /// The frame state is captured once up front; an error means the tick
    /// was skipped and nothing was presented.
    pub fn render(&mut self, now: Instant) -> Result<FrameReport, RenderError> {
        self.poll_loads();
        self.manager.acquire()?;
        let frame = self.clock.capture(now, &self.channel_inputs());
        let path = select_path(self.mode_flags());
        let area = self.area();
        self.manager.acquire()?.begin_frame()?;

        let mut tile_stats = None;
        let source = match path {
            RenderPath::Blackout => {
                self.compositor_context()?
                    .clear(DrawTarget::Canvas, [0.0, 0.0, 0.0, 1.0])?;
                DrawTarget::Canvas
            }
            RenderPath::Mixer => {
                if let Some(mixer) = &mut self.mixer {
                    mixer.render(&mut self.manager, &frame)?;
                }
                DrawTarget::Accumulation
            }
            RenderPath::Tiled => {
                if let Some(tiles) = &mut self.tiles {
                    tile_stats = Some(tiles.render(&mut self.manager, &frame, DrawTarget::Canvas)?);
                }
                DrawTarget::Canvas
            }
            RenderPath::Asset => {
                let layer = self
                    .asset
                    .as_ref()
                    .and_then(|layer| layer.image.map(|image| (image, layer.asset.params)));
                let context = self.compositor_context()?;
                context.clear(DrawTarget::Canvas, [0.0, 0.0, 0.0, 1.0])?;
                if let Some((image, params)) = layer {
                    if let Some(native) = context.image_size(image) {
                        let draws = plan_draws(native, area, &params, frame.time);
                        context.draw_image(
                            image,
                            &draws,
                            area,
                            1.0,
                            BlendMode::Normal,
                            DrawTarget::Canvas,
                        )?;
                    }
                }
                DrawTarget::Canvas
            }
            RenderPath::Normal => {
                self.compositor_context()?
                    .clear(DrawTarget::Canvas, [0.0, 0.0, 0.0, 1.0])?;
                let outcome = match self.program.render(&mut self.manager, &frame, DrawTarget::Canvas) {
                    Ok(outcome) => outcome,
                    Err(err) if err.skips_tick() => return Err(err),
                    Err(err) => {
                        warn!(error = %err, "program render failed");
                        RenderOutcome::Failed
                    }
                };
                if outcome == RenderOutcome::Failed {
                    self.compositor_context()?
                        .draw_placeholder(area, DrawTarget::Canvas)?;
                }
                DrawTarget::Canvas
            }
        };

        let capture = !self.sinks.is_empty();
        let captured = self.manager.acquire()?.finish_frame(source, capture)?;
        if let Some(captured) = captured {
            self.sinks.deliver(&captured);
        }
        Ok(FrameReport {
            path,
            frame: frame.frame,
            time: frame.time,
            tiles: tile_stats,
        })
    }

    fn compositor_context(&mut self) -> Result<&mut C, RenderError> {
        let token = self
            .manager
            .claim(ContextOwner::Compositor, Backend::Raster)?;
        self.manager.context_for(&token)
    }

    /// Releases every GPU resource held by the surface.
    pub fn shutdown(&mut self) {
        self.tile_exit();
        self.mixer_exit();
        self.clear_asset();
        self.program.dispose(&mut self.manager);
        for index in 0..CHANNEL_COUNT {
            self.set_channel(index, None);
        }
    }
}

fn attach_channel<C: GraphicsContext>(
    manager: &mut ContextManager<C>,
    binding: &mut ChannelBinding,
    image: &LoadedImage,
) -> Result<(), RenderError> {
    let context = manager.acquire()?;
    if let Some(previous) = binding.texture.take() {
        context.dispose_image(previous);
    }
    binding.texture = Some(context.upload_image(image)?);
    binding.resolution = [image.width as f32, image.height as f32, 1.0];
    Ok(())
}

fn non_fatal(err: RenderError) -> Result<(), RenderError> {
    if err.skips_tick() {
        Err(err)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::directives::CommentDirectiveParser;
    use crate::loader::LoadedImage;
    use crate::params::SPEED;
    use crate::testing::{param_program, solid_program, ImmediateLoader, RasterContext};

    const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
    const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

    fn surface_with(loader: ImmediateLoader) -> RenderSurface<RasterContext> {
        RenderSurface::new(
            ContextManager::new(RasterContext::new(16, 16)),
            Box::new(CommentDirectiveParser),
            Box::new(loader),
            Instant::now(),
        )
    }

    fn surface() -> RenderSurface<RasterContext> {
        surface_with(ImmediateLoader::new())
    }

    fn presented(surface: &RenderSurface<RasterContext>) -> Vec<u8> {
        surface
            .manager()
            .context()
            .and_then(RasterContext::presented)
            .map(|frame| frame.rgba.clone())
            .expect("presented frame")
    }

    #[test]
    fn path_priority_is_strict() {
        let all = ModeFlags {
            blackout: true,
            mixer: true,
            tiled: true,
            asset: true,
        };
        assert_eq!(select_path(all), RenderPath::Blackout);
        assert_eq!(
            select_path(ModeFlags {
                blackout: false,
                ..all
            }),
            RenderPath::Mixer
        );
        assert_eq!(
            select_path(ModeFlags {
                tiled: true,
                asset: true,
                ..ModeFlags::default()
            }),
            RenderPath::Tiled
        );
        assert_eq!(select_path(ModeFlags::default()), RenderPath::Normal);
    }

    #[test]
    fn all_modes_enabled_renders_like_blackout_alone() {
        let now = Instant::now();
        let mut blackout_only = surface();
        blackout_only.set_blackout(true);
        blackout_only.render(now).expect("render");
        let expected = presented(&blackout_only);

        let loader =
            ImmediateLoader::new().with_image("white.png", LoadedImage::solid(4, 4, [255; 4]));
        let mut everything = surface_with(loader);
        everything
            .set_program(ProgramSlot::shader(solid_program(RED)))
            .expect("program");
        everything
            .tile_init(
                TileLayout::new(2, 2, 1),
                vec![TileState::with_slot(ProgramSlot::shader(solid_program(BLUE)))],
            )
            .expect("tiles");
        everything
            .mixer_update(
                0,
                ChannelUpdate {
                    slot: Some(ProgramSlot::shader(solid_program(RED))),
                    ..ChannelUpdate::default()
                },
            )
            .expect("mixer");
        everything.set_asset(AssetRef::image("white.png"));
        everything.set_blackout(true);

        let report = everything.render(now).expect("render");

        assert_eq!(report.path, RenderPath::Blackout);
        assert_eq!(presented(&everything), expected);
        let context = everything.manager().context().expect("context");
        assert!(context.draws().is_empty());
    }

    #[test]
    fn frame_state_is_captured_once_per_tick() {
        let start = Instant::now();
        let mut surface = surface();
        surface
            .tile_init(
                TileLayout::new(2, 2, 0),
                (0..4)
                    .map(|_| TileState::with_slot(ProgramSlot::shader(solid_program(RED))))
                    .collect(),
            )
            .expect("tiles");

        let report = surface
            .render(start + Duration::from_millis(1500))
            .expect("render");

        let draws = surface.manager().context().expect("context").draws();
        assert_eq!(draws.len(), 4);
        assert!(draws.iter().all(|draw| draw.time == report.time));
        assert_eq!(report.tiles.map(|stats| stats.drawn), Some(4));
    }

    #[test]
    fn preset_recall_applies_every_key() {
        let mut surface = surface();
        surface
            .set_program(ProgramSlot::shader(format!(
                "// @param tint color 0 0 0\n// @param warp float 0.3\n{}",
                param_program("tint")
            )))
            .expect("program");
        let preset: ParameterSet = [
            (SPEED, ParamValue::Scalar(2.0)),
            ("tint", ParamValue::Vector(vec![1.0, 0.0, 0.0])),
        ]
        .into_iter()
        .collect();

        surface.apply_preset(PresetScope::Local, 0, preset);

        assert_eq!(surface.params().get(SPEED), Some(&ParamValue::Scalar(2.0)));
        assert_eq!(
            surface.params().get("tint"),
            Some(&ParamValue::Vector(vec![1.0, 0.0, 0.0]))
        );
        assert_eq!(surface.params().get("warp"), Some(&ParamValue::Scalar(0.3)));
        assert_eq!(surface.presets(PresetScope::Local).active(), Some(0));
        assert!(surface.recall_preset(PresetScope::Local, 7).is_none());
    }

    #[test]
    fn repeated_param_update_is_idempotent() {
        let mut surface = surface();
        surface
            .set_program(ProgramSlot::shader(solid_program(RED)))
            .expect("program");
        surface.set_param(SPEED, &ParamValue::Scalar(1.5));
        let once = surface.params().clone();
        surface.set_param(SPEED, &ParamValue::Scalar(1.5));
        assert_eq!(surface.params(), &once);
    }

    #[test]
    fn compile_failure_in_normal_mode_draws_placeholder() {
        let mut surface = surface();
        assert!(surface.set_program(ProgramSlot::shader("broken")).is_err());
        let report = surface.render(Instant::now()).expect("render");
        assert_eq!(report.path, RenderPath::Normal);
        assert_eq!(
            surface.manager().context().expect("context").placeholders().len(),
            1
        );
    }

    #[test]
    fn switching_to_scene_hands_context_to_scene_owner() {
        let mut surface = surface();
        surface
            .set_program(ProgramSlot::shader(solid_program(RED)))
            .expect("shader");
        surface
            .set_program(ProgramSlot::scene(solid_program(BLUE)))
            .expect("scene");
        surface.render(Instant::now()).expect("render");

        let context = surface.manager().context().expect("context");
        assert_eq!(context.live_programs(), 1);
        assert_eq!(context.draws()[0].owner, ContextOwner::Scene);
        assert_eq!(context.draws()[0].kind, ProgramKind::Scene);
    }

    #[test]
    fn unavailable_context_skips_rendering() {
        let mut surface: RenderSurface<RasterContext> = RenderSurface::new(
            ContextManager::unavailable("no adapter"),
            Box::new(CommentDirectiveParser),
            Box::new(ImmediateLoader::new()),
            Instant::now(),
        );
        let err = surface.render(Instant::now()).expect_err("unavailable");
        assert!(matches!(err, RenderError::ContextUnavailable(_)));
        assert!(matches!(surface.status(), ContextStatus::Unavailable(_)));
    }

    #[test]
    fn failed_channel_load_keeps_previous_texture() {
        let loader =
            ImmediateLoader::new().with_image("noise.png", LoadedImage::solid(2, 3, [1, 2, 3, 4]));
        let mut surface = surface_with(loader);
        surface.set_channel(0, Some("noise.png".into()));
        surface.render(Instant::now()).expect("render");
        let first = surface.channel_inputs();
        assert_eq!(first.resolutions[0], [2.0, 3.0, 1.0]);

        surface.set_channel(0, Some("missing.png".into()));
        surface.render(Instant::now()).expect("render");
        assert_eq!(surface.channel_inputs().textures[0], first.textures[0]);
    }

    #[test]
    fn failed_channel_upload_still_reaches_the_asset_layer() {
        let mut surface = surface();
        surface.set_channel(0, Some("white.png".into()));
        surface.set_asset(AssetRef::image("white.png"));
        surface.manager.acquire().expect("context").fail_uploads(1);

        surface.deliver(&LoadResult {
            reference: "white.png".into(),
            image: Ok(LoadedImage::solid(2, 2, [255; 4])),
        });
        assert!(surface.channels[0].texture.is_none());
        assert!(surface.asset.as_ref().is_some_and(|layer| layer.image.is_some()));
    }

    #[test]
    fn snapshot_restore_reproduces_state() {
        let now = Instant::now();
        let mut control = surface();
        control
            .set_program(ProgramSlot::shader(format!(
                "// @param warp float 0.1\n{}",
                solid_program(RED)
            )))
            .expect("program");
        control.set_param("warp", &ParamValue::Scalar(0.8));
        control.snapshot_preset(PresetScope::Local, Some("a".into()));
        control
            .tile_init(TileLayout::new(1, 2, 2), vec![TileState::default()])
            .expect("tiles");
        control.set_blackout(true);
        let snapshot = control.snapshot(now);

        let mut display = surface();
        display.restore(snapshot.clone(), now).expect("restore");

        assert_eq!(display.snapshot(now), snapshot);
    }

    #[test]
    fn exiting_tiled_mode_releases_programs() {
        let mut surface = surface();
        surface
            .tile_init(
                TileLayout::new(1, 2, 0),
                vec![
                    TileState::with_slot(ProgramSlot::shader(solid_program(RED))),
                    TileState::with_slot(ProgramSlot::shader(solid_program(BLUE))),
                ],
            )
            .expect("tiles");
        assert_eq!(surface.manager().context().expect("context").live_programs(), 2);
        surface.tile_exit();
        assert_eq!(surface.manager().context().expect("context").live_programs(), 0);
        assert_eq!(surface.render(Instant::now()).expect("render").path, RenderPath::Normal);
    }
}
