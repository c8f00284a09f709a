//! Shared graphics context and its ownership protocol.
//!
//! One [`GraphicsContext`] per surface is multiplexed across the default
//! renderer, the scene back-end, every tile and mixer channel renderer and
//! the compositor's own blending passes. Each of those owners leaves
//! context-global state behind (pipeline, bound buffers, viewport), so the
//! [`ContextManager`] tracks who currently owns the context and calls
//! [`GraphicsContext::reinitialize`] on every handoff. Drawing requires an
//! [`OwnershipToken`], which can only be obtained through a claim.

use std::fmt;

use tracing::{debug, warn};

use crate::asset::ImageDraw;
use crate::blend::BlendMode;
use crate::capture::CapturedFrame;
use crate::error::RenderError;
use crate::frame::{SharedFrameState, TextureId};
use crate::layout::Bounds;
use crate::loader::LoadedImage;
use crate::params::ParameterSet;
use crate::program::{ProgramInterface, ProgramKind};

/// Party whose state is currently valid on the shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextOwner {
    Default,
    Scene,
    Tile(usize),
    Channel(usize),
    Compositor,
}

impl fmt::Display for ContextOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextOwner::Default => f.write_str("default renderer"),
            ContextOwner::Scene => f.write_str("scene renderer"),
            ContextOwner::Tile(index) => write!(f, "tile {index}"),
            ContextOwner::Channel(index) => write!(f, "mixer channel {index}"),
            ContextOwner::Compositor => f.write_str("compositor"),
        }
    }
}

/// Back-end family an owner drives the context with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Full-screen fragment programs.
    Shader,
    /// Vertex-driven scene programs with a depth buffer.
    Scene,
    /// Image and canvas compositing.
    Raster,
}

impl From<ProgramKind> for Backend {
    fn from(kind: ProgramKind) -> Self {
        match kind {
            ProgramKind::Shader => Backend::Shader,
            ProgramKind::Scene => Backend::Scene,
        }
    }
}

/// Proof that the context was reinitialized for `owner` at `generation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipToken {
    owner: ContextOwner,
    backend: Backend,
    generation: u64,
}

impl OwnershipToken {
    pub fn owner(&self) -> ContextOwner {
        self.owner
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Where a draw lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawTarget {
    /// Shared canvas that programs render into.
    Canvas,
    /// Mixer accumulation surface.
    Accumulation,
}

/// Operations the compositor needs from a rendering back-end.
pub trait GraphicsContext {
    /// Compiled program handle; only valid for the context that produced it.
    type Program;

    fn canvas_size(&self) -> (u32, u32);

    fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError>;

    /// True once the underlying device has been lost.
    fn is_lost(&self) -> bool;

    /// Restores the context-global state `owner` depends on.
    fn reinitialize(&mut self, owner: ContextOwner, backend: Backend) -> Result<(), RenderError>;

    fn compile(
        &mut self,
        kind: ProgramKind,
        source: &str,
        interface: &ProgramInterface,
    ) -> Result<Self::Program, RenderError>;

    fn dispose_program(&mut self, program: Self::Program);

    fn draw_program(
        &mut self,
        program: &Self::Program,
        token: &OwnershipToken,
        frame: &SharedFrameState,
        params: &ParameterSet,
        viewport: Bounds,
        target: DrawTarget,
    ) -> Result<(), RenderError>;

    /// Fills `viewport` with the neutral placeholder pattern.
    fn draw_placeholder(&mut self, viewport: Bounds, target: DrawTarget)
        -> Result<(), RenderError>;

    fn clear(&mut self, target: DrawTarget, color: [f32; 4]) -> Result<(), RenderError>;

    /// Blends the whole canvas onto the accumulation surface.
    fn composite_canvas(&mut self, alpha: f32, mode: BlendMode) -> Result<(), RenderError>;

    fn upload_image(&mut self, image: &LoadedImage) -> Result<TextureId, RenderError>;

    fn image_size(&self, image: TextureId) -> Option<(u32, u32)>;

    fn dispose_image(&mut self, image: TextureId);

    /// Draws `image` once per entry of `draws`, clipped to `clip`.
    fn draw_image(
        &mut self,
        image: TextureId,
        draws: &[ImageDraw],
        clip: Bounds,
        alpha: f32,
        mode: BlendMode,
        target: DrawTarget,
    ) -> Result<(), RenderError>;

    fn begin_frame(&mut self) -> Result<(), RenderError>;

    /// Presents `source`, optionally reading it back for capture sinks.
    fn finish_frame(
        &mut self,
        source: DrawTarget,
        capture: bool,
    ) -> Result<Option<CapturedFrame>, RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextStatus {
    Ready,
    Unavailable(String),
}

/// Owner of a surface's single graphics context.
pub struct ContextManager<C> {
    context: Option<C>,
    failure: Option<String>,
    current: Option<(ContextOwner, Backend)>,
    generation: u64,
    reinitializations: u64,
}

impl<C: GraphicsContext> ContextManager<C> {
    pub fn new(context: C) -> Self {
        Self {
            context: Some(context),
            failure: None,
            current: None,
            generation: 1,
            reinitializations: 0,
        }
    }

    /// Manager for a surface whose context could not be created.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            context: None,
            failure: Some(reason.into()),
            current: None,
            generation: 0,
            reinitializations: 0,
        }
    }

    pub fn status(&self) -> ContextStatus {
        match (&self.context, &self.failure) {
            (Some(context), _) if !context.is_lost() => ContextStatus::Ready,
            (_, Some(reason)) => ContextStatus::Unavailable(reason.clone()),
            _ => ContextStatus::Unavailable("graphics device lost".to_string()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_owner(&self) -> Option<ContextOwner> {
        self.current.map(|(owner, _)| owner)
    }

    pub fn reinitializations(&self) -> u64 {
        self.reinitializations
    }

    /// Returns the context, or [`RenderError::ContextUnavailable`].
    pub fn acquire(&mut self) -> Result<&mut C, RenderError> {
        let lost = match &self.context {
            Some(context) => context.is_lost(),
            None => {
                let reason = self
                    .failure
                    .clone()
                    .unwrap_or_else(|| "no graphics context".to_string());
                return Err(RenderError::ContextUnavailable(reason));
            }
        };
        if lost {
            self.mark_lost("graphics device lost");
            return Err(RenderError::ContextUnavailable(
                "graphics device lost".to_string(),
            ));
        }
        match self.context.as_mut() {
            Some(context) => Ok(context),
            None => Err(RenderError::ContextUnavailable(
                "no graphics context".to_string(),
            )),
        }
    }

    pub fn context(&self) -> Option<&C> {
        self.context.as_ref()
    }

    /// Hands the context to `owner`, reinitializing when ownership or back-end changes.
    pub fn claim(
        &mut self,
        owner: ContextOwner,
        backend: Backend,
    ) -> Result<OwnershipToken, RenderError> {
        if self.current == Some((owner, backend)) {
            self.acquire()?;
            return Ok(self.token(owner, backend));
        }
        self.reinitialize(owner, backend)
    }

    /// Unconditionally restores `owner`'s state on the context.
    pub fn reinitialize(
        &mut self,
        owner: ContextOwner,
        backend: Backend,
    ) -> Result<OwnershipToken, RenderError> {
        let context = self.acquire()?;
        if let Err(err) = context.reinitialize(owner, backend) {
            self.current = None;
            warn!(%owner, error = %err, "context reinitialize failed");
            return Err(match err {
                RenderError::ContextUnavailable(_) | RenderError::ContextCorrupted { .. } => err,
                other => RenderError::ContextCorrupted {
                    owner,
                    message: other.to_string(),
                },
            });
        }
        self.current = Some((owner, backend));
        self.reinitializations += 1;
        Ok(self.token(owner, backend))
    }

    /// Resolves the context for a previously claimed token.
    pub fn context_for(&mut self, token: &OwnershipToken) -> Result<&mut C, RenderError> {
        if token.generation != self.generation
            || self.current != Some((token.owner, token.backend))
        {
            return Err(RenderError::ContextCorrupted {
                owner: token.owner,
                message: "ownership token is stale".to_string(),
            });
        }
        self.acquire()
    }

    /// Invalidates every program compiled so far.
    pub fn mark_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(generation = self.generation, %reason, "graphics context lost");
        self.context = None;
        self.failure = Some(reason);
        self.current = None;
        self.generation += 1;
    }

    /// Installs a freshly created context; existing programs recompile on next use.
    pub fn replace_context(&mut self, context: C) {
        self.context = Some(context);
        self.failure = None;
        self.current = None;
        self.generation += 1;
    }

    fn token(&self, owner: ContextOwner, backend: Backend) -> OwnershipToken {
        OwnershipToken {
            owner,
            backend,
            generation: self.generation,
        }
    }
}
