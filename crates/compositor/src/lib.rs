//! Multi-surface shader compositor for duoshade.
//!
//! Every window (the control surface and the display surface) owns one
//! [`RenderSurface`], which multiplexes a single [`GraphicsContext`] across
//! its default program, a grid of tiles, an ordered stack of mixer channels
//! and an asset layer:
//!
//! ```text
//!   RenderSurface::render(now)
//!          │ FrameClock::capture ──▶ SharedFrameState (one per tick)
//!          ▼
//!   select_path ──▶ blackout │ mixer │ tiled │ asset │ normal
//!          │                    │        │
//!          │          MixerCompositor  TileCompositor ──▶ ProgramRenderer
//!          ▼                    └──────────┴─────────────▶ ContextManager::claim
//!   finish_frame ──▶ present (+ SinkRegistry capture)
//! ```
//!
//! The [`ContextManager`] hands out [`OwnershipToken`]s and reinitializes
//! the context on every owner change, so renderers never observe state left
//! behind by another tile or channel. [`gpu::WgpuContext`] is the wgpu
//! implementation; the `testing` module (behind the `test-support` feature)
//! provides a CPU rasterizer with the same contract.

mod asset;
mod blend;
mod capture;
mod context;
mod directives;
mod error;
mod frame;
pub mod gpu;
mod layout;
mod loader;
mod mixer;
mod params;
mod program;
mod surface;
mod tiles;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use asset::{
    cover_crop, plan_draws, scroll_offset, AssetKind, AssetParams, ImageDraw, Rect,
};
pub use blend::{blend_pixel, BlendMode, UnknownBlendMode};
pub use capture::{CapturedFrame, FrameSink, PngSnapshotSink, SinkRegistry};
pub use context::{
    Backend, ContextManager, ContextOwner, ContextStatus, DrawTarget, GraphicsContext,
    OwnershipToken,
};
pub use directives::CommentDirectiveParser;
pub use error::RenderError;
pub use frame::{
    ChannelInputs, FrameClock, PointerState, SharedFrameState, TextureId, CHANNEL_COUNT,
};
pub use layout::{render_area, Bounds, TileLayout, MAX_GRID_SIDE};
pub use loader::{LoadResult, LoadedImage, TextureLoader};
pub use mixer::{
    AssetRef, ChannelUpdate, MixerChannelState, MixerCompositor, MixerConfig, MixerRenderStats,
    MAX_CHANNELS,
};
pub use params::{
    ParamDef, ParamKind, ParamValue, ParameterSet, Preset, PresetBank, PresetScope,
    ProgramParams, SPEED,
};
pub use program::{
    ChannelDirective, ChannelKind, DirectiveParser, ProgramInterface, ProgramKind,
    ProgramRenderer, ProgramSlot, RenderOutcome,
};
pub use surface::{
    select_path, FrameReport, ModeFlags, RenderPath, RenderSurface, SurfaceSnapshot,
    TiledConfig,
};
pub use tiles::{Tile, TileCompositor, TileRenderStats, TileState};
