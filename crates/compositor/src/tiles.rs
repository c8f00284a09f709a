use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{Backend, ContextManager, ContextOwner, DrawTarget, GraphicsContext};
use crate::error::RenderError;
use crate::frame::SharedFrameState;
use crate::layout::{Bounds, TileLayout};
use crate::params::{ParamValue, ParameterSet};
use crate::program::{DirectiveParser, ProgramRenderer, ProgramSlot, RenderOutcome};

/// Authoritative, serializable content of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<ProgramSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParameterSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_params: Option<ParameterSet>,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
}

fn visible_by_default() -> bool {
    true
}

impl Default for TileState {
    fn default() -> Self {
        Self {
            slot: None,
            params: None,
            custom_params: None,
            visible: true,
        }
    }
}

impl TileState {
    pub fn with_slot(slot: ProgramSlot) -> Self {
        Self {
            slot: Some(slot),
            ..Self::default()
        }
    }
}

pub struct Tile<C: GraphicsContext> {
    index: usize,
    bounds: Bounds,
    state: TileState,
    renderer: ProgramRenderer<C>,
}

impl<C: GraphicsContext> Tile<C> {
    fn new(index: usize, bounds: Bounds) -> Self {
        Self {
            index,
            bounds,
            state: TileState::default(),
            renderer: ProgramRenderer::new(ContextOwner::Tile(index), bounds),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn state(&self) -> &TileState {
        &self.state
    }

    pub fn renderer(&self) -> &ProgramRenderer<C> {
        &self.renderer
    }

    fn rebind(&mut self, bounds: Bounds) {
        self.bounds = bounds;
        self.renderer.set_resolution(bounds);
    }

    fn merge_params(&mut self) {
        let layers = [self.state.params.as_ref(), self.state.custom_params.as_ref()];
        self.renderer.apply_layers(layers.into_iter().flatten());
    }
}

/// Outcome counts of one tiled render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileRenderStats {
    pub drawn: usize,
    pub placeholders: usize,
}

/// Grid of independently programmed tiles sharing one context.
pub struct TileCompositor<C: GraphicsContext> {
    layout: TileLayout,
    area: Bounds,
    tiles: Vec<Tile<C>>,
}

impl<C: GraphicsContext> TileCompositor<C> {
    pub fn new(layout: TileLayout, area: Bounds) -> Self {
        let mut compositor = Self {
            layout,
            area,
            tiles: Vec::new(),
        };
        compositor.tiles = compositor
            .layout
            .tile_bounds(area)
            .into_iter()
            .enumerate()
            .map(|(index, bounds)| Tile::new(index, bounds))
            .collect();
        compositor
    }

    pub fn layout(&self) -> TileLayout {
        self.layout
    }

    pub fn area(&self) -> Bounds {
        self.area
    }

    pub fn tiles(&self) -> &[Tile<C>] {
        &self.tiles
    }

    pub fn tile(&self, index: usize) -> Option<&Tile<C>> {
        self.tiles.get(index)
    }

    pub fn states(&self) -> Vec<TileState> {
        self.tiles.iter().map(|tile| tile.state.clone()).collect()
    }

    /// Establishes `layout` and assigns `states` by index.
    ///
    /// Compile failures stay local to their tile; only context failures abort.
    pub fn init(
        &mut self,
        manager: &mut ContextManager<C>,
        parser: &dyn DirectiveParser,
        layout: TileLayout,
        states: Vec<TileState>,
    ) -> Result<(), RenderError> {
        self.set_layout(manager, layout);
        for (index, state) in states.into_iter().enumerate().take(self.tiles.len()) {
            let tile = &mut self.tiles[index];
            tile.state.visible = state.visible;
            tile.state.custom_params = state.custom_params;
            self.assign(manager, parser, index, state.slot, state.params)
                .or_else(non_fatal)?;
        }
        Ok(())
    }

    /// Resizes the grid: kept tiles are rebound, new ones built, removed ones disposed.
    pub fn set_layout(&mut self, manager: &mut ContextManager<C>, layout: TileLayout) {
        let layout = TileLayout::new(layout.rows, layout.cols, layout.gap);
        let bounds = layout.tile_bounds(self.area);
        while self.tiles.len() > bounds.len() {
            if let Some(mut removed) = self.tiles.pop() {
                removed.renderer.dispose(manager);
                debug!(index = removed.index, "disposed tile");
            }
        }
        for (tile, bounds) in self.tiles.iter_mut().zip(&bounds) {
            tile.rebind(*bounds);
        }
        for index in self.tiles.len()..bounds.len() {
            self.tiles.push(Tile::new(index, bounds[index]));
        }
        self.layout = layout;
    }

    /// Recomputes bounds for a new render area (canvas resize).
    pub fn set_area(&mut self, area: Bounds) {
        self.area = area;
        let bounds = self.layout.tile_bounds(area);
        for (tile, bounds) in self.tiles.iter_mut().zip(bounds) {
            tile.rebind(bounds);
        }
    }

    /// Assigns (or with `None`, unassigns) a program and tile overrides.
    pub fn assign(
        &mut self,
        manager: &mut ContextManager<C>,
        parser: &dyn DirectiveParser,
        index: usize,
        slot: Option<ProgramSlot>,
        params: Option<ParameterSet>,
    ) -> Result<(), RenderError> {
        let Some(tile) = self.tiles.get_mut(index) else {
            warn!(index, "ignoring assignment to missing tile");
            return Ok(());
        };
        tile.state.params = params;
        let unchanged = tile.state.slot == slot && tile.renderer.slot().is_some();
        tile.state.slot = slot.clone();
        let result = match slot {
            Some(_) if unchanged => Ok(()),
            Some(slot) => tile.renderer.compile(manager, parser, slot),
            None => {
                tile.renderer.dispose(manager);
                Ok(())
            }
        };
        tile.merge_params();
        result
    }

    pub fn clear(&mut self, manager: &mut ContextManager<C>, index: usize) {
        if let Some(tile) = self.tiles.get_mut(index) {
            tile.renderer.dispose(manager);
            tile.state = TileState {
                visible: tile.state.visible,
                ..TileState::default()
            };
        }
    }

    /// Sets a tile override; returns false for a missing tile or unknown name.
    pub fn set_param(&mut self, index: usize, name: &str, value: &ParamValue) -> bool {
        let Some(tile) = self.tiles.get_mut(index) else {
            return false;
        };
        if tile.renderer.param_defs().iter().all(|def| def.name != name) {
            return false;
        }
        tile.state
            .params
            .get_or_insert_with(ParameterSet::new)
            .set(name, value.clone());
        tile.merge_params();
        true
    }

    pub fn set_custom_params(&mut self, index: usize, params: Option<ParameterSet>) {
        if let Some(tile) = self.tiles.get_mut(index) {
            tile.state.custom_params = params;
            tile.merge_params();
        }
    }

    pub fn set_visible(&mut self, index: usize, visible: bool) {
        if let Some(tile) = self.tiles.get_mut(index) {
            tile.state.visible = visible;
        }
    }

    /// Draws every tile with the same frame state.
    ///
    /// Tiles that are hidden, unassigned, or failed to compile get a
    /// placeholder. A context failure aborts the pass.
    pub fn render(
        &mut self,
        manager: &mut ContextManager<C>,
        frame: &SharedFrameState,
        target: DrawTarget,
    ) -> Result<TileRenderStats, RenderError> {
        let mut stats = TileRenderStats::default();
        {
            let token = manager.claim(ContextOwner::Compositor, Backend::Raster)?;
            manager
                .context_for(&token)?
                .clear(target, [0.0, 0.0, 0.0, 1.0])?;
        }
        for tile in &mut self.tiles {
            let outcome = if tile.state.visible {
                match tile.renderer.render(manager, frame, target) {
                    Ok(outcome) => outcome,
                    Err(err) if err.skips_tick() => return Err(err),
                    Err(err) => {
                        warn!(index = tile.index, error = %err, "tile render failed");
                        RenderOutcome::Failed
                    }
                }
            } else {
                RenderOutcome::Empty
            };
            if outcome == RenderOutcome::Drawn {
                stats.drawn += 1;
                continue;
            }
            let token = manager.claim(ContextOwner::Compositor, Backend::Raster)?;
            manager
                .context_for(&token)?
                .draw_placeholder(tile.bounds, target)?;
            stats.placeholders += 1;
        }
        Ok(stats)
    }

    /// Disposes every tile renderer.
    pub fn exit(&mut self, manager: &mut ContextManager<C>) {
        for tile in &mut self.tiles {
            tile.renderer.dispose(manager);
        }
        self.tiles.clear();
    }
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
    use super::*;
    use crate::directives::CommentDirectiveParser;
    use crate::params::SPEED;
    use crate::testing::{
        param_program, solid_program, RasterContext, BROKEN_PROGRAM, PLACEHOLDER_COLOR,
    };

    const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
    const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

    fn setup(layout: TileLayout) -> (ContextManager<RasterContext>, TileCompositor<RasterContext>) {
        let manager = ContextManager::new(RasterContext::new(40, 20));
        let compositor = TileCompositor::new(layout, Bounds::full(40, 20));
        (manager, compositor)
    }

    #[test]
    fn every_tile_observes_the_same_time() {
        let (mut manager, mut tiles) = setup(TileLayout::new(2, 2, 0));
        let states = (0..4)
            .map(|_| TileState::with_slot(ProgramSlot::shader(solid_program(RED))))
            .collect();
        tiles
            .init(&mut manager, &CommentDirectiveParser, TileLayout::new(2, 2, 0), states)
            .expect("init");

        let frame = SharedFrameState::at(12.75, 99);
        let stats = tiles
            .render(&mut manager, &frame, DrawTarget::Canvas)
            .expect("render");

        assert_eq!(stats.drawn, 4);
        let draws = manager.context().expect("context").draws();
        assert_eq!(draws.len(), 4);
        assert!(draws.iter().all(|draw| draw.time == 12.75 && draw.frame == 99));
    }

    #[test]
    fn compile_failure_is_isolated_to_its_tile() {
        let (mut manager, mut tiles) = setup(TileLayout::new(1, 2, 0));
        let states = vec![
            TileState::with_slot(ProgramSlot::shader(BROKEN_PROGRAM)),
            TileState::with_slot(ProgramSlot::shader(solid_program(GREEN))),
        ];
        tiles
            .init(&mut manager, &CommentDirectiveParser, TileLayout::new(1, 2, 0), states)
            .expect("init tolerates compile errors");

        let stats = tiles
            .render(&mut manager, &SharedFrameState::at(0.0, 0), DrawTarget::Canvas)
            .expect("render");

        assert_eq!(stats, TileRenderStats { drawn: 1, placeholders: 1 });
        let context = manager.context().expect("context");
        let placeholder = PLACEHOLDER_COLOR.map(|c| (c * 255.0).round() as u8);
        assert_eq!(context.pixel(DrawTarget::Canvas, 5, 5), placeholder);
        assert_eq!(context.pixel(DrawTarget::Canvas, 25, 5), [0, 255, 0, 255]);
    }

    #[test]
    fn hidden_tiles_do_not_invoke_programs() {
        let (mut manager, mut tiles) = setup(TileLayout::new(1, 2, 0));
        tiles
            .assign(
                &mut manager,
                &CommentDirectiveParser,
                0,
                Some(ProgramSlot::shader(solid_program(RED))),
                None,
            )
            .expect("assign");
        tiles.set_visible(0, false);

        tiles
            .render(&mut manager, &SharedFrameState::at(0.0, 0), DrawTarget::Canvas)
            .expect("render");

        let context = manager.context().expect("context");
        assert!(context.draws().is_empty());
        assert_eq!(context.placeholders().len(), 2);
    }

    #[test]
    fn layout_change_keeps_existing_and_disposes_removed() {
        let (mut manager, mut tiles) = setup(TileLayout::new(2, 2, 0));
        for index in 0..4 {
            tiles
                .assign(
                    &mut manager,
                    &CommentDirectiveParser,
                    index,
                    Some(ProgramSlot::shader(solid_program(RED))),
                    None,
                )
                .expect("assign");
        }
        assert_eq!(manager.context().expect("context").live_programs(), 4);

        tiles.set_layout(&mut manager, TileLayout::new(1, 2, 2));

        assert_eq!(tiles.tiles().len(), 2);
        assert_eq!(manager.context().expect("context").live_programs(), 2);
        assert!(tiles.tiles().iter().all(|tile| tile.renderer().is_ready()));
        assert_eq!(tiles.tile(1).map(Tile::bounds), Some(Bounds::new(21, 0, 19, 20)));

        tiles.set_layout(&mut manager, TileLayout::new(1, 3, 0));
        assert_eq!(tiles.tiles().len(), 3);
        assert!(tiles.tile(2).map(|tile| tile.state().slot.is_none()).unwrap_or(false));
    }

    #[test]
    fn tile_overrides_win_over_slot_defaults() {
        let (mut manager, mut tiles) = setup(TileLayout::new(1, 1, 0));
        let mut slot = ProgramSlot::shader(format!(
            "// @param tint color 0 0 0\n{}",
            param_program("tint")
        ));
        slot.defaults.set("tint", ParamValue::Vector(vec![0.0, 0.0, 1.0]));
        let overrides: ParameterSet = [(SPEED, 2.0)].into_iter().collect();

        tiles
            .assign(&mut manager, &CommentDirectiveParser, 0, Some(slot), Some(overrides))
            .expect("assign");
        assert!(tiles.set_param(0, "tint", &ParamValue::Vector(vec![1.0, 0.0, 0.0])));
        assert!(!tiles.set_param(0, "unknown", &ParamValue::Scalar(1.0)));

        let params = tiles.tile(0).expect("tile").renderer().params().clone();
        assert_eq!(params.get(SPEED), Some(&ParamValue::Scalar(2.0)));
        assert_eq!(params.get("tint"), Some(&ParamValue::Vector(vec![1.0, 0.0, 0.0])));

        tiles
            .render(&mut manager, &SharedFrameState::at(0.0, 0), DrawTarget::Canvas)
            .expect("render");
        assert_eq!(
            manager.context().expect("context").pixel(DrawTarget::Canvas, 1, 1),
            [255, 0, 0, 255]
        );
    }

    #[test]
    fn exit_disposes_every_program() {
        let (mut manager, mut tiles) = setup(TileLayout::new(1, 2, 0));
        for index in 0..2 {
            tiles
                .assign(
                    &mut manager,
                    &CommentDirectiveParser,
                    index,
                    Some(ProgramSlot::shader(solid_program(RED))),
                    None,
                )
                .expect("assign");
        }
        tiles.exit(&mut manager);
        assert!(tiles.tiles().is_empty());
        assert_eq!(manager.context().expect("context").live_programs(), 0);
    }

    #[test]
    fn reassigning_same_slot_does_not_recompile() {
        let (mut manager, mut tiles) = setup(TileLayout::new(1, 1, 0));
        let slot = ProgramSlot::shader(solid_program(RED));
        for _ in 0..2 {
            tiles
                .assign(&mut manager, &CommentDirectiveParser, 0, Some(slot.clone()), None)
                .expect("assign");
        }
        assert_eq!(manager.context().expect("context").compile_count(), 1);
    }
}
