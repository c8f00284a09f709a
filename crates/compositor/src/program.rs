use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{Backend, ContextManager, ContextOwner, DrawTarget, GraphicsContext};
use crate::error::RenderError;
use crate::frame::SharedFrameState;
use crate::layout::Bounds;
use crate::params::{ParamDef, ParamValue, ParameterSet, ProgramParams};

/// Back-end a program source targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramKind {
    /// ShaderToy-style GLSL `mainImage`.
    #[default]
    Shader,
    /// WGSL scene with its own vertex stage.
    Scene,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramKind::Shader => f.write_str("shader"),
            ProgramKind::Scene => f.write_str("scene"),
        }
    }
}

/// What a tile or mixer channel is assigned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSlot {
    #[serde(default)]
    pub kind: ProgramKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "ParameterSet::is_empty")]
    pub defaults: ParameterSet,
    #[serde(default, skip_serializing_if = "ParameterSet::is_empty")]
    pub custom_defaults: ParameterSet,
}

impl ProgramSlot {
    pub fn new(kind: ProgramKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            defaults: ParameterSet::new(),
            custom_defaults: ParameterSet::new(),
        }
    }

    pub fn shader(source: impl Into<String>) -> Self {
        Self::new(ProgramKind::Shader, source)
    }

    pub fn scene(source: impl Into<String>) -> Self {
        Self::new(ProgramKind::Scene, source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Texture,
    Audio,
}

/// Texture input requested by program source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDirective {
    pub channel: usize,
    pub texture_name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fft_size: Option<u32>,
}

/// Interface a program declares through its directives.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgramInterface {
    pub params: Vec<ParamDef>,
    pub channels: Vec<ChannelDirective>,
    /// Vertex count for scene programs; shaders always draw a fullscreen triangle.
    pub vertex_count: Option<u32>,
}

/// Extracts a [`ProgramInterface`] from program source.
pub trait DirectiveParser {
    fn parse(&self, source: &str) -> ProgramInterface;
}

/// Result of asking a renderer to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Drawn,
    /// No program assigned.
    Empty,
    /// Assigned program failed to compile.
    Failed,
}

struct Compiled<P> {
    program: P,
    generation: u64,
}

/// One compiled program bound to a viewport on the shared context.
pub struct ProgramRenderer<C: GraphicsContext> {
    owner: ContextOwner,
    viewport: Bounds,
    slot: Option<ProgramSlot>,
    interface: ProgramInterface,
    params: ProgramParams,
    compiled: Option<Compiled<C::Program>>,
    last_error: Option<RenderError>,
}

impl<C: GraphicsContext> ProgramRenderer<C> {
    pub fn new(owner: ContextOwner, viewport: Bounds) -> Self {
        Self {
            owner,
            viewport,
            slot: None,
            interface: ProgramInterface::default(),
            params: ProgramParams::new(&[]),
            compiled: None,
            last_error: None,
        }
    }

    pub fn owner(&self) -> ContextOwner {
        self.owner
    }

    pub fn viewport(&self) -> Bounds {
        self.viewport
    }

    pub fn slot(&self) -> Option<&ProgramSlot> {
        self.slot.as_ref()
    }

    pub fn interface(&self) -> &ProgramInterface {
        &self.interface
    }

    pub fn params(&self) -> &ParameterSet {
        self.params.values()
    }

    pub fn param_defs(&self) -> &[ParamDef] {
        self.params.defs()
    }

    pub fn last_error(&self) -> Option<&RenderError> {
        self.last_error.as_ref()
    }

    /// True when a program is assigned and compiled.
    pub fn is_ready(&self) -> bool {
        self.compiled.is_some()
    }

    /// Replaces the assigned program.
    ///
    /// The previous program is disposed first. Parameters reset to the new
    /// program's declared defaults, then the slot's defaults and custom
    /// defaults are layered on. A compile failure keeps the slot assigned so
    /// the owner keeps rendering its placeholder.
    pub fn compile(
        &mut self,
        manager: &mut ContextManager<C>,
        parser: &dyn DirectiveParser,
        slot: ProgramSlot,
    ) -> Result<(), RenderError> {
        self.dispose(manager);
        self.interface = parser.parse(&slot.source);
        self.params = ProgramParams::new(&self.interface.params);
        self.params.apply(&slot.defaults);
        self.params.apply(&slot.custom_defaults);
        let kind = slot.kind;
        self.slot = Some(slot);
        self.build(manager, kind)
    }

    fn build(
        &mut self,
        manager: &mut ContextManager<C>,
        kind: ProgramKind,
    ) -> Result<(), RenderError> {
        let Some(slot) = self.slot.as_ref() else {
            return Ok(());
        };
        let token = manager.claim(self.owner, Backend::from(kind))?;
        let context = manager.context_for(&token)?;
        match context.compile(kind, &slot.source, &self.interface) {
            Ok(program) => {
                debug!(owner = %self.owner, %kind, "program compiled");
                self.compiled = Some(Compiled {
                    program,
                    generation: token.generation(),
                });
                self.last_error = None;
                Ok(())
            }
            Err(err) if err.skips_tick() => Err(err),
            Err(err) => {
                warn!(owner = %self.owner, error = %err, "program failed to compile");
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Draws into the renderer's viewport with the tick's shared frame state.
    pub fn render(
        &mut self,
        manager: &mut ContextManager<C>,
        frame: &SharedFrameState,
        target: DrawTarget,
    ) -> Result<RenderOutcome, RenderError> {
        let Some(kind) = self.slot.as_ref().map(|slot| slot.kind) else {
            return Ok(RenderOutcome::Empty);
        };
        let stale = match &self.compiled {
            Some(compiled) => compiled.generation != manager.generation(),
            None => self.last_error.is_none(),
        };
        if stale {
            // Programs from a lost context are gone with it; rebuild on this one.
            self.compiled = None;
            match self.build(manager, kind) {
                Ok(()) => {}
                Err(err) if err.skips_tick() => return Err(err),
                Err(_) => return Ok(RenderOutcome::Failed),
            }
        }
        let Some(compiled) = self.compiled.as_ref() else {
            return Ok(RenderOutcome::Failed);
        };
        let token = manager.claim(self.owner, Backend::from(kind))?;
        let context = manager.context_for(&token)?;
        context.draw_program(
            &compiled.program,
            &token,
            frame,
            self.params.values(),
            self.viewport,
            target,
        )?;
        Ok(RenderOutcome::Drawn)
    }

    /// Sets one parameter; unknown names are ignored.
    pub fn set_param(&mut self, name: &str, value: &ParamValue) -> bool {
        self.params.set(name, value)
    }

    pub fn apply(&mut self, params: &ParameterSet) -> usize {
        self.params.apply(params)
    }

    /// Resets to the program's defaults, then applies the slot layers and `overrides`.
    pub fn apply_layers<'a>(&mut self, overrides: impl IntoIterator<Item = &'a ParameterSet>) {
        let (defaults, custom) = match &self.slot {
            Some(slot) => (slot.defaults.clone(), slot.custom_defaults.clone()),
            None => (ParameterSet::new(), ParameterSet::new()),
        };
        self.params.reset();
        self.params.apply(&defaults);
        self.params.apply(&custom);
        for layer in overrides {
            self.params.apply(layer);
        }
    }

    pub fn set_resolution(&mut self, viewport: Bounds) {
        self.viewport = viewport;
    }

    /// Forces a state restore for this renderer's owner.
    pub fn reinitialize(&mut self, manager: &mut ContextManager<C>) -> Result<(), RenderError> {
        let backend = self
            .slot
            .as_ref()
            .map(|slot| Backend::from(slot.kind))
            .unwrap_or(Backend::Shader);
        manager.reinitialize(self.owner, backend).map(|_| ())
    }

    /// Releases the program and forgets the assignment.
    pub fn dispose(&mut self, manager: &mut ContextManager<C>) {
        if let Some(compiled) = self.compiled.take() {
            if compiled.generation == manager.generation() {
                if let Ok(context) = manager.acquire() {
                    context.dispose_program(compiled.program);
                }
            }
        }
        self.slot = None;
        self.last_error = None;
        self.interface = ProgramInterface::default();
        self.params = ProgramParams::new(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::CommentDirectiveParser;
    use crate::params::SPEED;
    use crate::testing::{solid_program, RasterContext, BROKEN_PROGRAM};

    fn manager() -> ContextManager<RasterContext> {
        ContextManager::new(RasterContext::new(16, 16))
    }

    #[test]
    fn compile_failure_is_recorded_and_render_reports_failed() {
        let mut manager = manager();
        let mut renderer = ProgramRenderer::new(ContextOwner::Default, Bounds::new(0, 0, 16, 16));

        let err = renderer
            .compile(&mut manager, &CommentDirectiveParser, ProgramSlot::shader(BROKEN_PROGRAM))
            .expect_err("broken program");
        assert!(matches!(err, RenderError::Compile { .. }));

        let outcome = renderer
            .render(&mut manager, &SharedFrameState::at(0.0, 0), DrawTarget::Canvas)
            .expect("render");
        assert_eq!(outcome, RenderOutcome::Failed);
        assert!(renderer.last_error().is_some());
    }

    #[test]
    fn unassigned_renderer_is_empty() {
        let mut manager = manager();
        let mut renderer: ProgramRenderer<RasterContext> =
            ProgramRenderer::new(ContextOwner::Tile(0), Bounds::new(0, 0, 4, 4));
        let outcome = renderer
            .render(&mut manager, &SharedFrameState::at(0.0, 0), DrawTarget::Canvas)
            .expect("render");
        assert_eq!(outcome, RenderOutcome::Empty);
    }

    #[test]
    fn context_replacement_triggers_recompile() {
        let mut manager = manager();
        let mut renderer = ProgramRenderer::new(ContextOwner::Default, Bounds::new(0, 0, 16, 16));
        renderer
            .compile(
                &mut manager,
                &CommentDirectiveParser,
                ProgramSlot::shader(solid_program([1.0, 0.0, 0.0, 1.0])),
            )
            .expect("compile");

        manager.replace_context(RasterContext::new(16, 16));
        let outcome = renderer
            .render(&mut manager, &SharedFrameState::at(0.0, 0), DrawTarget::Canvas)
            .expect("render");

        assert_eq!(outcome, RenderOutcome::Drawn);
        let context = manager.context().expect("context");
        assert_eq!(context.compile_count(), 1);
        assert_eq!(context.pixel(DrawTarget::Canvas, 3, 3), [255, 0, 0, 255]);
    }

    #[test]
    fn slot_layers_apply_over_declared_defaults() {
        let mut manager = manager();
        let mut renderer = ProgramRenderer::new(ContextOwner::Default, Bounds::new(0, 0, 16, 16));
        let mut slot = ProgramSlot::shader(format!(
            "// @param warp float 0.5\n{}",
            solid_program([0.0, 0.0, 1.0, 1.0])
        ));
        slot.defaults.set("warp", 0.6);
        slot.custom_defaults.set(SPEED, 2.0);

        renderer
            .compile(&mut manager, &CommentDirectiveParser, slot)
            .expect("compile");

        assert_eq!(renderer.params().get("warp"), Some(&ParamValue::Scalar(0.6)));
        assert_eq!(renderer.params().get(SPEED), Some(&ParamValue::Scalar(2.0)));

        renderer.apply_layers([&[("warp", 0.9)].into_iter().collect::<ParameterSet>()]);
        assert_eq!(renderer.params().get("warp"), Some(&ParamValue::Scalar(0.9)));
        assert_eq!(renderer.params().get(SPEED), Some(&ParamValue::Scalar(2.0)));
    }

    #[test]
    fn dispose_releases_program() {
        let mut manager = manager();
        let mut renderer = ProgramRenderer::new(ContextOwner::Default, Bounds::new(0, 0, 16, 16));
        renderer
            .compile(
                &mut manager,
                &CommentDirectiveParser,
                ProgramSlot::shader(solid_program([1.0, 1.0, 1.0, 1.0])),
            )
            .expect("compile");
        renderer.dispose(&mut manager);
        assert!(!renderer.is_ready());
        assert_eq!(manager.context().expect("context").live_programs(), 0);
    }
}
