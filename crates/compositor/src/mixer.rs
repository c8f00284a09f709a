use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::asset::{plan_draws, AssetKind, AssetParams};
use crate::blend::BlendMode;
use crate::context::{Backend, ContextManager, ContextOwner, DrawTarget, GraphicsContext};
use crate::error::RenderError;
use crate::frame::{SharedFrameState, TextureId};
use crate::layout::Bounds;
use crate::loader::{LoadResult, TextureLoader};
use crate::params::ParameterSet;
use crate::program::{DirectiveParser, ProgramRenderer, ProgramSlot, RenderOutcome};

/// Static media shown by a mixer channel or the asset layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    #[serde(rename = "type", default)]
    pub kind: AssetKind,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub params: AssetParams,
}

impl AssetRef {
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            kind: AssetKind::Image,
            reference: reference.into(),
            params: AssetParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerChannelState {
    #[serde(default = "full_alpha")]
    pub alpha: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<ProgramSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
    #[serde(default, skip_serializing_if = "ParameterSet::is_empty")]
    pub params: ParameterSet,
    #[serde(default, skip_serializing_if = "ParameterSet::is_empty")]
    pub custom_params: ParameterSet,
}

/// NaN counts as fully transparent.
fn sanitize_alpha(alpha: f32) -> f32 {
    if alpha.is_nan() {
        0.0
    } else {
        alpha.clamp(0.0, 1.0)
    }
}

fn full_alpha() -> f32 {
    1.0
}

impl Default for MixerChannelState {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            slot: None,
            asset: None,
            params: ParameterSet::new(),
            custom_params: ParameterSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerConfig {
    #[serde(default)]
    pub blend_mode: BlendMode,
    #[serde(default)]
    pub channels: Vec<MixerChannelState>,
}

/// Partial change to one channel; absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelUpdate {
    pub slot: Option<ProgramSlot>,
    pub params: Option<ParameterSet>,
    pub asset: Option<AssetRef>,
    pub clear: bool,
}

/// Upper bound on channel indices accepted from updates.
pub const MAX_CHANNELS: usize = 16;

struct MixerChannel<C: GraphicsContext> {
    state: MixerChannelState,
    renderer: ProgramRenderer<C>,
    image: Option<TextureId>,
}

impl<C: GraphicsContext> MixerChannel<C> {
    fn new(index: usize, area: Bounds) -> Self {
        Self {
            state: MixerChannelState::default(),
            renderer: ProgramRenderer::new(ContextOwner::Channel(index), area),
            image: None,
        }
    }

    fn release_image(&mut self, manager: &mut ContextManager<C>) {
        if let Some(image) = self.image.take() {
            if let Ok(context) = manager.acquire() {
                context.dispose_image(image);
            }
        }
    }

    fn merge_params(&mut self) {
        self.renderer
            .apply_layers([&self.state.params, &self.state.custom_params]);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerRenderStats {
    pub composited: usize,
    pub skipped: usize,
}

/// Alpha-blended stack of program and asset channels.
pub struct MixerCompositor<C: GraphicsContext> {
    blend_mode: BlendMode,
    area: Bounds,
    channels: Vec<MixerChannel<C>>,
}

impl<C: GraphicsContext> MixerCompositor<C> {
    pub fn new(area: Bounds) -> Self {
        Self {
            blend_mode: BlendMode::Normal,
            area,
            channels: Vec::new(),
        }
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&MixerChannelState> {
        self.channels.get(index).map(|channel| &channel.state)
    }

    pub fn renderer(&self, index: usize) -> Option<&ProgramRenderer<C>> {
        self.channels.get(index).map(|channel| &channel.renderer)
    }

    pub fn config(&self) -> MixerConfig {
        MixerConfig {
            blend_mode: self.blend_mode,
            channels: self
                .channels
                .iter()
                .map(|channel| channel.state.clone())
                .collect(),
        }
    }

    /// Replaces every channel with `config`.
    pub fn init(
        &mut self,
        manager: &mut ContextManager<C>,
        parser: &dyn DirectiveParser,
        loader: &mut dyn TextureLoader,
        config: MixerConfig,
    ) -> Result<(), RenderError> {
        self.exit(manager);
        self.blend_mode = config.blend_mode;
        for (index, state) in config.channels.into_iter().enumerate() {
            let update = ChannelUpdate {
                slot: state.slot,
                params: Some(state.params),
                asset: state.asset,
                clear: false,
            };
            match self.update_channel(manager, parser, loader, index, update) {
                Err(err) if err.skips_tick() => return Err(err),
                _ => {}
            }
            if let Some(channel) = self.channels.get_mut(index) {
                channel.state.alpha = sanitize_alpha(state.alpha);
                channel.state.custom_params = state.custom_params;
                channel.merge_params();
            }
        }
        Ok(())
    }

    pub fn set_area(&mut self, area: Bounds) {
        self.area = area;
        for channel in &mut self.channels {
            channel.renderer.set_resolution(area);
        }
    }

    /// Applies a partial channel update, growing the channel list as needed.
    ///
    /// Assigning a program drops the channel's asset and vice versa. Asset
    /// images are requested from `loader` and attached by [`Self::deliver`].
    pub fn update_channel(
        &mut self,
        manager: &mut ContextManager<C>,
        parser: &dyn DirectiveParser,
        loader: &mut dyn TextureLoader,
        index: usize,
        update: ChannelUpdate,
    ) -> Result<(), RenderError> {
        if index >= MAX_CHANNELS {
            warn!(index, "ignoring update for out-of-range mixer channel");
            return Ok(());
        }
        while self.channels.len() <= index {
            let next = self.channels.len();
            self.channels.push(MixerChannel::new(next, self.area));
        }
        let channel = &mut self.channels[index];

        if update.clear {
            channel.renderer.dispose(manager);
            channel.release_image(manager);
            channel.state = MixerChannelState {
                alpha: channel.state.alpha,
                ..MixerChannelState::default()
            };
        }
        if let Some(params) = update.params {
            channel.state.params = params;
        }

        let mut result = Ok(());
        if let Some(slot) = update.slot {
            channel.release_image(manager);
            channel.state.asset = None;
            if channel.state.slot.as_ref() != Some(&slot) || channel.renderer.slot().is_none() {
                channel.state.slot = Some(slot.clone());
                result = channel.renderer.compile(manager, parser, slot);
            }
        } else if let Some(asset) = update.asset {
            channel.renderer.dispose(manager);
            channel.state.slot = None;
            let same_media = channel
                .state
                .asset
                .as_ref()
                .is_some_and(|current| current.reference == asset.reference);
            if !same_media {
                channel.release_image(manager);
                loader.request(&asset.reference);
                debug!(index, reference = %asset.reference, "requested mixer asset");
            }
            channel.state.asset = Some(asset);
        }
        channel.merge_params();
        result
    }

    /// Attaches a completed load to every channel waiting on its reference.
    pub fn deliver(
        &mut self,
        manager: &mut ContextManager<C>,
        result: &LoadResult,
    ) -> Result<bool, RenderError> {
        let mut attached = false;
        for (index, channel) in self.channels.iter_mut().enumerate() {
            let waiting = channel.image.is_none()
                && channel
                    .state
                    .asset
                    .as_ref()
                    .is_some_and(|asset| asset.reference == result.reference);
            if !waiting {
                continue;
            }
            match &result.image {
                Ok(image) => match manager.acquire().and_then(|context| context.upload_image(image)) {
                    Ok(texture) => {
                        channel.image = Some(texture);
                        attached = true;
                    }
                    Err(err) if err.skips_tick() => return Err(err),
                    Err(err) => warn!(channel = index, error = %err, "failed to attach mixer image"),
                },
                Err(message) => {
                    let err = RenderError::ChannelLoad {
                        channel: index,
                        reference: result.reference.clone(),
                        message: message.clone(),
                    };
                    warn!(error = %err, "mixer asset failed to load");
                }
            }
        }
        Ok(attached)
    }

    /// Forgets images from a replaced context and requests them again.
    pub fn reload_assets(&mut self, loader: &mut dyn TextureLoader) {
        for channel in &mut self.channels {
            if let Some(asset) = &channel.state.asset {
                channel.image = None;
                loader.request(&asset.reference);
            }
        }
    }

    /// Sets a channel's opacity, creating the channel if it does not exist yet.
    pub fn set_alpha(&mut self, index: usize, alpha: f32) {
        if index >= MAX_CHANNELS {
            warn!(index, "ignoring alpha for out-of-range mixer channel");
            return;
        }
        while self.channels.len() <= index {
            let next = self.channels.len();
            self.channels.push(MixerChannel::new(next, self.area));
        }
        self.channels[index].state.alpha = sanitize_alpha(alpha);
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend_mode = mode;
    }

    /// Composites every channel, in index order, onto the accumulation surface.
    pub fn render(
        &mut self,
        manager: &mut ContextManager<C>,
        frame: &SharedFrameState,
    ) -> Result<MixerRenderStats, RenderError> {
        let mut stats = MixerRenderStats::default();
        {
            let token = manager.claim(ContextOwner::Compositor, Backend::Raster)?;
            manager
                .context_for(&token)?
                .clear(DrawTarget::Accumulation, [0.0, 0.0, 0.0, 1.0])?;
        }
        for (index, channel) in self.channels.iter_mut().enumerate() {
            let alpha = channel.state.alpha;
            if alpha <= 0.0 {
                stats.skipped += 1;
                continue;
            }
            let result = if let (Some(asset), Some(image)) = (&channel.state.asset, channel.image)
            {
                draw_asset(manager, image, &asset.params, self.area, frame.time, alpha, self.blend_mode)
            } else if channel.state.slot.is_some() {
                render_program(manager, &mut channel.renderer, frame, alpha, self.blend_mode)
            } else {
                Ok(false)
            };
            match result {
                Ok(true) => stats.composited += 1,
                Ok(false) => stats.skipped += 1,
                Err(err) if err.skips_tick() => return Err(err),
                Err(err) => {
                    warn!(index, error = %err, "mixer channel failed");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Disposes every channel's program and image.
    pub fn exit(&mut self, manager: &mut ContextManager<C>) {
        for channel in &mut self.channels {
            channel.renderer.dispose(manager);
            channel.release_image(manager);
        }
        self.channels.clear();
    }
}

fn draw_asset<C: GraphicsContext>(
    manager: &mut ContextManager<C>,
    image: TextureId,
    params: &AssetParams,
    area: Bounds,
    elapsed: f64,
    alpha: f32,
    mode: BlendMode,
) -> Result<bool, RenderError> {
    let token = manager.claim(ContextOwner::Compositor, Backend::Raster)?;
    let context = manager.context_for(&token)?;
    let Some(native) = context.image_size(image) else {
        return Ok(false);
    };
    let draws = plan_draws(native, area, params, elapsed);
    context.draw_image(image, &draws, area, alpha, mode, DrawTarget::Accumulation)?;
    Ok(true)
}

fn render_program<C: GraphicsContext>(
    manager: &mut ContextManager<C>,
    renderer: &mut ProgramRenderer<C>,
    frame: &SharedFrameState,
    alpha: f32,
    mode: BlendMode,
) -> Result<bool, RenderError> {
    {
        let token = manager.claim(ContextOwner::Compositor, Backend::Raster)?;
        manager
            .context_for(&token)?
            .clear(DrawTarget::Canvas, [0.0, 0.0, 0.0, 0.0])?;
    }
    if renderer.render(manager, frame, DrawTarget::Canvas)? != RenderOutcome::Drawn {
        return Ok(false);
    }
    let token = manager.claim(ContextOwner::Compositor, Backend::Raster)?;
    manager.context_for(&token)?.composite_canvas(alpha, mode)?;
    Ok(true)
}
