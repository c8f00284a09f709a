//! Software raster context for pixel-exact compositor tests.
//!
//! Program sources understood by [`RasterContext`] (directive comments are
//! ignored):
//!
//! * `solid r g b a` fills the viewport with a constant colour;
//! * `param NAME` fills the viewport with the value of a vec3/vec4 parameter;
//! * anything else, including [`BROKEN_PROGRAM`], fails to compile.

use std::collections::{HashMap, VecDeque};

use crate::asset::ImageDraw;
use crate::blend::{blend_pixel, BlendMode};
use crate::capture::CapturedFrame;
use crate::context::{Backend, ContextOwner, DrawTarget, GraphicsContext, OwnershipToken};
use crate::error::RenderError;
use crate::frame::{SharedFrameState, TextureId};
use crate::layout::Bounds;
use crate::loader::{LoadResult, LoadedImage, TextureLoader};
use crate::params::ParameterSet;
use crate::program::{ProgramInterface, ProgramKind};

pub const BROKEN_PROGRAM: &str = "broken";
pub const PLACEHOLDER_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

pub fn solid_program(color: [f32; 4]) -> String {
    format!("solid {} {} {} {}", color[0], color[1], color[2], color[3])
}

pub fn param_program(name: &str) -> String {
    format!("param {name}")
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Solid([f32; 4]),
    Param(String),
}

#[derive(Debug)]
pub struct RasterProgram {
    id: u64,
    op: Op,
}

/// One program invocation, as observed by the context.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub owner: ContextOwner,
    pub kind: ProgramKind,
    pub time: f64,
    pub frame: u64,
    pub viewport: Bounds,
    pub target: DrawTarget,
    pub params: ParameterSet,
}

pub struct RasterContext {
    width: u32,
    height: u32,
    canvas: Vec<[f32; 4]>,
    accumulation: Vec<[f32; 4]>,
    bound: Option<(ContextOwner, Backend)>,
    programs: HashMap<u64, ProgramKind>,
    next_id: u64,
    images: HashMap<TextureId, LoadedImage>,
    compile_count: usize,
    reinit_log: Vec<ContextOwner>,
    draws: Vec<DrawRecord>,
    placeholders: Vec<Bounds>,
    presented: Option<CapturedFrame>,
    fail_reinitialize: bool,
    failed_uploads: usize,
    lost: bool,
}

impl RasterContext {
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            canvas: vec![[0.0; 4]; pixels],
            accumulation: vec![[0.0; 4]; pixels],
            bound: None,
            programs: HashMap::new(),
            next_id: 1,
            images: HashMap::new(),
            compile_count: 0,
            reinit_log: Vec::new(),
            draws: Vec::new(),
            placeholders: Vec::new(),
            presented: None,
            fail_reinitialize: false,
            failed_uploads: 0,
            lost: false,
        }
    }

    pub fn fail_next_reinitialize(&mut self) {
        self.fail_reinitialize = true;
    }

    /// Makes the next `count` image uploads fail.
    pub fn fail_uploads(&mut self, count: usize) {
        self.failed_uploads = count;
    }

    pub fn set_lost(&mut self, lost: bool) {
        self.lost = lost;
    }

    pub fn reinit_log(&self) -> &[ContextOwner] {
        &self.reinit_log
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn placeholders(&self) -> &[Bounds] {
        &self.placeholders
    }

    pub fn clear_logs(&mut self) {
        self.draws.clear();
        self.placeholders.clear();
        self.reinit_log.clear();
    }

    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn presented(&self) -> Option<&CapturedFrame> {
        self.presented.as_ref()
    }

    /// Quantized pixel at `(x, y)` with a bottom-left origin.
    pub fn pixel(&self, target: DrawTarget, x: u32, y: u32) -> [u8; 4] {
        quantize(self.buffer(target)[self.index(x, y)])
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn buffer(&self, target: DrawTarget) -> &[[f32; 4]] {
        match target {
            DrawTarget::Canvas => &self.canvas,
            DrawTarget::Accumulation => &self.accumulation,
        }
    }

    fn buffer_mut(&mut self, target: DrawTarget) -> &mut Vec<[f32; 4]> {
        match target {
            DrawTarget::Canvas => &mut self.canvas,
            DrawTarget::Accumulation => &mut self.accumulation,
        }
    }

    fn fill(&mut self, target: DrawTarget, viewport: Bounds, color: [f32; 4]) {
        let area = Bounds::full(self.width, self.height);
        let Some(clip) = viewport.intersect(&area) else {
            return;
        };
        let width = self.width as usize;
        let buffer = self.buffer_mut(target);
        for y in clip.y..clip.top() {
            for x in clip.x..clip.right() {
                buffer[y as usize * width + x as usize] = color;
            }
        }
    }
}

fn quantize(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

fn parse_op(source: &str) -> Option<Op> {
    let line = source
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("//"))?;
    let mut words = line.split_whitespace();
    match words.next()? {
        "solid" => {
            let values = words
                .map(|raw| raw.parse::<f32>().ok())
                .collect::<Option<Vec<f32>>>()?;
            let color: [f32; 4] = values.try_into().ok()?;
            Some(Op::Solid(color))
        }
        "param" => Some(Op::Param(words.next()?.to_string())),
        _ => None,
    }
}

impl GraphicsContext for RasterContext {
    type Program = RasterProgram;

    fn canvas_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        let pixels = width as usize * height as usize;
        self.width = width;
        self.height = height;
        self.canvas = vec![[0.0; 4]; pixels];
        self.accumulation = vec![[0.0; 4]; pixels];
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.lost
    }

    fn reinitialize(&mut self, owner: ContextOwner, backend: Backend) -> Result<(), RenderError> {
        if std::mem::take(&mut self.fail_reinitialize) {
            self.bound = None;
            return Err(RenderError::Surface("bindings could not be restored".into()));
        }
        self.bound = Some((owner, backend));
        self.reinit_log.push(owner);
        Ok(())
    }

    fn compile(
        &mut self,
        kind: ProgramKind,
        source: &str,
        _interface: &ProgramInterface,
    ) -> Result<Self::Program, RenderError> {
        let op = parse_op(source)
            .ok_or_else(|| RenderError::compile(kind, "unsupported program source"))?;
        let id = self.next_id;
        self.next_id += 1;
        self.programs.insert(id, kind);
        self.compile_count += 1;
        Ok(RasterProgram { id, op })
    }

    fn dispose_program(&mut self, program: Self::Program) {
        self.programs.remove(&program.id);
    }

    fn draw_program(
        &mut self,
        program: &Self::Program,
        token: &OwnershipToken,
        frame: &SharedFrameState,
        params: &ParameterSet,
        viewport: Bounds,
        target: DrawTarget,
    ) -> Result<(), RenderError> {
        if self.bound != Some((token.owner(), token.backend())) {
            return Err(RenderError::ContextCorrupted {
                owner: token.owner(),
                message: "draw without reinitialize".into(),
            });
        }
        let kind = self
            .programs
            .get(&program.id)
            .copied()
            .ok_or_else(|| RenderError::Surface("program was disposed".into()))?;
        let color = match &program.op {
            Op::Solid(color) => *color,
            Op::Param(name) => match params.get(name).map(|value| value.components()) {
                Some([r, g, b]) => [*r, *g, *b, 1.0],
                Some([r, g, b, a]) => [*r, *g, *b, *a],
                _ => [0.0, 0.0, 0.0, 1.0],
            },
        };
        self.fill(target, viewport, color);
        self.draws.push(DrawRecord {
            owner: token.owner(),
            kind,
            time: frame.time,
            frame: frame.frame,
            viewport,
            target,
            params: params.clone(),
        });
        Ok(())
    }

    fn draw_placeholder(
        &mut self,
        viewport: Bounds,
        target: DrawTarget,
    ) -> Result<(), RenderError> {
        self.fill(target, viewport, PLACEHOLDER_COLOR);
        self.placeholders.push(viewport);
        Ok(())
    }

    fn clear(&mut self, target: DrawTarget, color: [f32; 4]) -> Result<(), RenderError> {
        self.buffer_mut(target).fill(color);
        Ok(())
    }

    fn composite_canvas(&mut self, alpha: f32, mode: BlendMode) -> Result<(), RenderError> {
        for (dst, src) in self.accumulation.iter_mut().zip(&self.canvas) {
            *dst = blend_pixel(*dst, *src, alpha, mode);
        }
        Ok(())
    }

    fn upload_image(&mut self, image: &LoadedImage) -> Result<TextureId, RenderError> {
        if self.failed_uploads > 0 {
            self.failed_uploads -= 1;
            return Err(RenderError::Surface("upload rejected".into()));
        }
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.images.insert(id, image.clone());
        Ok(id)
    }

    fn image_size(&self, image: TextureId) -> Option<(u32, u32)> {
        self.images
            .get(&image)
            .map(|image| (image.width, image.height))
    }

    fn dispose_image(&mut self, image: TextureId) {
        self.images.remove(&image);
    }

    fn draw_image(
        &mut self,
        image: TextureId,
        draws: &[ImageDraw],
        clip: Bounds,
        alpha: f32,
        mode: BlendMode,
        target: DrawTarget,
    ) -> Result<(), RenderError> {
        let source = self
            .images
            .get(&image)
            .cloned()
            .ok_or_else(|| RenderError::Surface(format!("unknown image {image:?}")))?;
        let Some(clip) = clip.intersect(&Bounds::full(self.width, self.height)) else {
            return Ok(());
        };
        let width = self.width as usize;
        let buffer = self.buffer_mut(target);
        for draw in draws {
            for y in clip.y..clip.top() {
                let cy = f64::from(y) + 0.5;
                if cy < draw.dst.y || cy >= draw.dst.y + draw.dst.height {
                    continue;
                }
                for x in clip.x..clip.right() {
                    let cx = f64::from(x) + 0.5;
                    if cx < draw.dst.x || cx >= draw.dst.x + draw.dst.width {
                        continue;
                    }
                    let u = (cx - draw.dst.x) / draw.dst.width;
                    let v = (cy - draw.dst.y) / draw.dst.height;
                    let sx = (draw.src.x + u * draw.src.width).floor() as u32;
                    let sy = (draw.src.y + (1.0 - v) * draw.src.height).floor() as u32;
                    let texel = source.pixel(
                        sx.min(source.width.saturating_sub(1)),
                        sy.min(source.height.saturating_sub(1)),
                    );
                    let src = texel.map(|c| f32::from(c) / 255.0);
                    let index = y as usize * width + x as usize;
                    buffer[index] = blend_pixel(buffer[index], src, alpha, mode);
                }
            }
        }
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn finish_frame(
        &mut self,
        source: DrawTarget,
        capture: bool,
    ) -> Result<Option<CapturedFrame>, RenderError> {
        let mut rgba = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in (0..self.height).rev() {
            for x in 0..self.width {
                rgba.extend_from_slice(&self.pixel(source, x, y));
            }
        }
        let frame = CapturedFrame {
            width: self.width,
            height: self.height,
            rgba,
        };
        self.presented = Some(frame.clone());
        Ok(capture.then_some(frame))
    }
}

/// Loader backed by an in-memory library; completes on the next drain.
#[derive(Default)]
pub struct ImmediateLoader {
    library: HashMap<String, LoadedImage>,
    completed: VecDeque<LoadResult>,
    requests: Vec<String>,
}

impl ImmediateLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, reference: &str, image: LoadedImage) -> Self {
        self.library.insert(reference.to_string(), image);
        self
    }

    pub fn requests(&self) -> &[String] {
        &self.requests
    }
}

impl TextureLoader for ImmediateLoader {
    fn request(&mut self, reference: &str) {
        self.requests.push(reference.to_string());
        let image = self
            .library
            .get(reference)
            .cloned()
            .ok_or_else(|| format!("no image named '{reference}'"));
        self.completed.push_back(LoadResult {
            reference: reference.to_string(),
            image,
        });
    }

    fn drain(&mut self) -> Vec<LoadResult> {
        self.completed.drain(..).collect()
    }
}
