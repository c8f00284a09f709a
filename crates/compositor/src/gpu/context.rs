use std::borrow::Cow;
use std::collections::HashMap;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, trace, warn};
use wgpu::naga::ShaderStage;
use wgpu::util::{DeviceExt, TextureDataOrder};

use crate::asset::ImageDraw;
use crate::blend::BlendMode;
use crate::capture::CapturedFrame;
use crate::context::{Backend, ContextOwner, DrawTarget, GraphicsContext, OwnershipToken};
use crate::error::RenderError;
use crate::frame::{SharedFrameState, TextureId, CHANNEL_COUNT};
use crate::layout::Bounds;
use crate::loader::LoadedImage;
use crate::params::{ParamValue, ParameterSet, SPEED};
use crate::program::{ProgramInterface, ProgramKind};

use super::compile;
use super::device::{DeviceContext, GpuOptions};
use super::pipeline::{
    self, CompositeUniforms, CompositorPipelines, ImageVertex, PipelineLayouts,
};
use super::targets::{Readback, RenderTargets, TARGET_FORMAT};
use super::uniforms::{FrameUniforms, ParamBlockLayout};

const PLACEHOLDER_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

/// Compiled program on a [`WgpuContext`].
pub struct WgpuProgram {
    pipeline: wgpu::RenderPipeline,
    kind: ProgramKind,
    params: ParamBlockLayout,
    vertex_count: u32,
}

impl WgpuProgram {
    pub fn kind(&self) -> ProgramKind {
        self.kind
    }
}

struct ImageTexture {
    /// Rows top to bottom, as decoded; used for asset drawing.
    view: wgpu::TextureView,
    /// Rows bottom to top, matching ShaderToy's channel orientation.
    channel_view: wgpu::TextureView,
    size: (u32, u32),
}

impl ImageTexture {
    fn upload(gpu: &DeviceContext, label: &str, image: &LoadedImage) -> Self {
        let (width, height, rgba) = if image.width == 0 || image.height == 0 {
            (1, 1, Cow::Owned(vec![0; 4]))
        } else {
            (image.width, image.height, Cow::Borrowed(image.rgba.as_slice()))
        };
        let row = width as usize * 4;
        let flipped: Vec<u8> = rgba.chunks(row).rev().flatten().copied().collect();
        let create = |data: &[u8]| {
            gpu.device
                .create_texture_with_data(
                    &gpu.queue,
                    &wgpu::TextureDescriptor {
                        label: Some(label),
                        size: wgpu::Extent3d {
                            width,
                            height,
                            depth_or_array_layers: 1,
                        },
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension: wgpu::TextureDimension::D2,
                        format: TARGET_FORMAT,
                        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                        view_formats: &[],
                    },
                    TextureDataOrder::LayerMajor,
                    data,
                )
                .create_view(&wgpu::TextureViewDescriptor::default())
        };
        Self {
            view: create(rgba.as_ref()),
            channel_view: create(flipped.as_slice()),
            size: (image.width, image.height),
        }
    }
}

/// [`GraphicsContext`] backed by one wgpu device.
///
/// Every draw is recorded into a single command encoder that
/// [`GraphicsContext::finish_frame`] submits, so ordering between tiles,
/// mixer channels and blend passes follows call order exactly.
pub struct WgpuContext {
    gpu: DeviceContext,
    layouts: PipelineLayouts,
    passes: CompositorPipelines,
    targets: RenderTargets,
    images: HashMap<TextureId, ImageTexture>,
    next_image: u64,
    empty_channel: ImageTexture,
    channel_sampler: wgpu::Sampler,
    channel_group: Option<([Option<TextureId>; CHANNEL_COUNT], wgpu::BindGroup)>,
    encoder: Option<wgpu::CommandEncoder>,
    bound: Option<(ContextOwner, Backend)>,
}

impl WgpuContext {
    /// Creates a context presenting to `target`, which must outlive it.
    pub fn new<T>(target: &T, size: (u32, u32), options: &GpuOptions) -> anyhow::Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let gpu = DeviceContext::new(target, size, options)?;
        Ok(Self::from_device(gpu, size))
    }

    /// Creates an offscreen context; frames are only available through capture.
    pub fn headless(size: (u32, u32), options: &GpuOptions) -> anyhow::Result<Self> {
        let gpu = DeviceContext::headless(options)?;
        Ok(Self::from_device(gpu, size))
    }

    fn from_device(gpu: DeviceContext, (width, height): (u32, u32)) -> Self {
        let layouts = PipelineLayouts::new(&gpu.device);
        let passes = CompositorPipelines::new(&gpu.device, gpu.surface_format());
        let targets = RenderTargets::new(&gpu.device, width, height);
        let empty_channel =
            ImageTexture::upload(&gpu, "empty channel", &LoadedImage::solid(1, 1, [0, 0, 0, 255]));
        let channel_sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("channel sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        debug!(adapter = %gpu.adapter_name, width, height, "wgpu context ready");
        Self {
            gpu,
            layouts,
            passes,
            targets,
            images: HashMap::new(),
            next_image: 1,
            empty_channel,
            channel_sampler,
            channel_group: None,
            encoder: None,
            bound: None,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.gpu.adapter_name
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        let device = &self.gpu.device;
        self.encoder.take().unwrap_or_else(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("surface frame"),
            })
        })
    }

    fn ensure_available(&self) -> Result<(), RenderError> {
        if self.gpu.is_lost() {
            return Err(RenderError::ContextUnavailable("GPU device lost".into()));
        }
        Ok(())
    }

    fn ensure_bound(&self, token: &OwnershipToken) -> Result<(), RenderError> {
        self.ensure_available()?;
        if self.bound != Some((token.owner(), token.backend())) {
            return Err(RenderError::ContextCorrupted {
                owner: token.owner(),
                message: format!("context state belongs to {:?}", self.bound),
            });
        }
        Ok(())
    }

    fn clip_to_canvas(&self, bounds: Bounds) -> Option<Bounds> {
        let (width, height) = self.targets.size();
        bounds.intersect(&Bounds::full(width, height))
    }

    fn uniform_buffer(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn channel_bind_group(&mut self, textures: &[Option<TextureId>; CHANNEL_COUNT]) -> wgpu::BindGroup {
        if let Some((key, group)) = &self.channel_group {
            if key == textures {
                return group.clone();
            }
        }
        let group = {
            let mut entries = Vec::with_capacity(CHANNEL_COUNT * 2);
            for (index, texture) in textures.iter().enumerate() {
                let view = texture
                    .and_then(|id| self.images.get(&id))
                    .map_or(&self.empty_channel.channel_view, |image| &image.channel_view);
                entries.push(wgpu::BindGroupEntry {
                    binding: index as u32 * 2,
                    resource: wgpu::BindingResource::TextureView(view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: index as u32 * 2 + 1,
                    resource: wgpu::BindingResource::Sampler(&self.channel_sampler),
                });
            }
            self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("channel bind group"),
                layout: &self.layouts.channel_layout,
                entries: &entries,
            })
        };
        self.channel_group = Some((*textures, group.clone()));
        group
    }

    /// Bind group for a compositor pass sampling `source` over the backdrop.
    fn sample_group(&self, source: &wgpu::TextureView, uniforms: CompositeUniforms) -> wgpu::BindGroup {
        let buffer = self.uniform_buffer("composite uniforms", bytemuck::bytes_of(&uniforms));
        self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("compositor sample group"),
            layout: &self.passes.sample_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&self.targets.backdrop.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.passes.sampler),
                },
            ],
        })
    }

    fn acquire_surface_frame(&self) -> Result<Option<wgpu::SurfaceTexture>, RenderError> {
        let Some(surface) = &self.gpu.surface else {
            return Ok(None);
        };
        match surface.get_current_texture() {
            Ok(frame) => Ok(Some(frame)),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.gpu.reconfigure();
                Err(RenderError::Surface("swapchain out of date".into()))
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                self.gpu.mark_lost();
                Err(RenderError::ContextUnavailable("GPU out of memory".into()))
            }
            Err(err) => Err(RenderError::Surface(err.to_string())),
        }
    }
}

fn color_attachment(
    view: &wgpu::TextureView,
    load: wgpu::LoadOp<wgpu::Color>,
) -> Option<wgpu::RenderPassColorAttachment<'_>> {
    Some(wgpu::RenderPassColorAttachment {
        view,
        depth_slice: None,
        resolve_target: None,
        ops: wgpu::Operations {
            load,
            store: wgpu::StoreOp::Store,
        },
    })
}

/// Converts bottom-left `bounds` to framebuffer rows and clips the pass to it.
fn scissor(pass: &mut wgpu::RenderPass<'_>, bounds: Bounds, canvas_height: u32) {
    let top = canvas_height.saturating_sub(bounds.top());
    pass.set_scissor_rect(bounds.x, top, bounds.width, bounds.height);
}

fn viewport(pass: &mut wgpu::RenderPass<'_>, bounds: Bounds, canvas_height: u32) {
    let top = canvas_height.saturating_sub(bounds.top());
    pass.set_viewport(
        bounds.x as f32,
        top as f32,
        bounds.width as f32,
        bounds.height as f32,
        0.0,
        1.0,
    );
    scissor(pass, bounds, canvas_height);
}

/// Two triangles mapping `draw.src` (image pixels, top-left origin) onto
/// `draw.dst` (canvas pixels, bottom-left origin).
fn image_quad(draw: &ImageDraw, canvas: (u32, u32), image: (u32, u32)) -> [ImageVertex; 6] {
    let (canvas_w, canvas_h) = (f64::from(canvas.0), f64::from(canvas.1));
    let (image_w, image_h) = (f64::from(image.0.max(1)), f64::from(image.1.max(1)));
    let vertex = |x: f64, y: f64, u: f64, v: f64| ImageVertex {
        position: [(x / canvas_w * 2.0 - 1.0) as f32, (y / canvas_h * 2.0 - 1.0) as f32],
        uv: [(u / image_w) as f32, (v / image_h) as f32],
    };
    let (left, right) = (draw.dst.x, draw.dst.x + draw.dst.width);
    let (bottom, top) = (draw.dst.y, draw.dst.y + draw.dst.height);
    let (u0, u1) = (draw.src.x, draw.src.x + draw.src.width);
    let (v_top, v_bottom) = (draw.src.y, draw.src.y + draw.src.height);
    let bottom_left = vertex(left, bottom, u0, v_bottom);
    let bottom_right = vertex(right, bottom, u1, v_bottom);
    let top_right = vertex(right, top, u1, v_top);
    let top_left = vertex(left, top, u0, v_top);
    [
        bottom_left,
        bottom_right,
        top_right,
        bottom_left,
        top_right,
        top_left,
    ]
}

impl GraphicsContext for WgpuContext {
    type Program = WgpuProgram;

    fn canvas_size(&self) -> (u32, u32) {
        self.targets.size()
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.ensure_available()?;
        self.gpu.resize(width, height);
        self.targets = RenderTargets::new(&self.gpu.device, width, height);
        debug!(width, height, "resized render targets");
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.gpu.is_lost()
    }

    fn reinitialize(&mut self, owner: ContextOwner, backend: Backend) -> Result<(), RenderError> {
        self.ensure_available()?;
        // Channel bindings belong to the previous owner's frame inputs.
        self.channel_group = None;
        self.bound = Some((owner, backend));
        trace!(%owner, ?backend, "context state restored");
        Ok(())
    }

    fn compile(
        &mut self,
        kind: ProgramKind,
        source: &str,
        interface: &ProgramInterface,
    ) -> Result<WgpuProgram, RenderError> {
        self.ensure_available()?;
        let params = ParamBlockLayout::new(&interface.params);
        let device = &self.gpu.device;

        let pipeline = match kind {
            ProgramKind::Shader => {
                let wrapped = compile::wrap_shader(source, &params);
                compile::validate_glsl(&wrapped, ShaderStage::Fragment)
                    .map_err(|message| RenderError::compile(kind, message))?;
                device.push_error_scope(wgpu::ErrorFilter::Validation);
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("shader program"),
                    source: wgpu::ShaderSource::Glsl {
                        shader: Cow::Owned(wrapped),
                        stage: ShaderStage::Fragment,
                        defines: &[],
                    },
                });
                pipeline::shader_pipeline(device, &self.layouts, &module)
            }
            ProgramKind::Scene => {
                let wrapped = compile::wrap_scene(source, &params);
                compile::validate_wgsl(&wrapped)
                    .map_err(|message| RenderError::compile(kind, message))?;
                device.push_error_scope(wgpu::ErrorFilter::Validation);
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("scene program"),
                    source: wgpu::ShaderSource::Wgsl(Cow::Owned(wrapped)),
                });
                pipeline::scene_pipeline(device, &self.layouts, &module)
            }
        };
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(RenderError::compile(kind, error.to_string()));
        }

        let vertex_count = match kind {
            ProgramKind::Shader => 3,
            ProgramKind::Scene => interface.vertex_count.unwrap_or(3).max(1),
        };
        debug!(%kind, params = params.slots().len(), vertex_count, "compiled program");
        Ok(WgpuProgram {
            pipeline,
            kind,
            params,
            vertex_count,
        })
    }

    fn dispose_program(&mut self, program: WgpuProgram) {
        drop(program);
    }

    fn draw_program(
        &mut self,
        program: &WgpuProgram,
        token: &OwnershipToken,
        frame: &SharedFrameState,
        params: &ParameterSet,
        viewport_bounds: Bounds,
        target: DrawTarget,
    ) -> Result<(), RenderError> {
        self.ensure_bound(token)?;
        if Backend::from(program.kind) != token.backend() {
            return Err(RenderError::ContextCorrupted {
                owner: token.owner(),
                message: format!("{} program drawn with {:?} state", program.kind, token.backend()),
            });
        }
        let Some(bounds) = self.clip_to_canvas(viewport_bounds) else {
            return Ok(());
        };
        let (_, canvas_height) = self.targets.size();
        let speed = params
            .get(SPEED)
            .and_then(ParamValue::as_scalar)
            .unwrap_or(1.0);
        let uniforms = FrameUniforms::for_draw(frame, bounds, canvas_height, speed);

        let channel_group = self.channel_bind_group(&frame.channel_textures);
        let frame_buffer = self.uniform_buffer("frame uniforms", bytemuck::bytes_of(&uniforms));
        let param_buffer = self.uniform_buffer("param uniforms", &program.params.write(params));
        let uniform_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("program uniforms"),
            layout: &self.layouts.uniform_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: frame_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: param_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self.take_encoder();
        {
            let depth = (program.kind == ProgramKind::Scene).then(|| {
                wgpu::RenderPassDepthStencilAttachment {
                    view: &self.targets.depth.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }
            });
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("program pass"),
                color_attachments: &[color_attachment(
                    &self.targets.get(target).view,
                    wgpu::LoadOp::Load,
                )],
                depth_stencil_attachment: depth,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            viewport(&mut pass, bounds, canvas_height);
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &uniform_group, &[]);
            pass.set_bind_group(1, &channel_group, &[]);
            pass.draw(0..program.vertex_count, 0..1);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn draw_placeholder(&mut self, bounds: Bounds, target: DrawTarget) -> Result<(), RenderError> {
        self.ensure_available()?;
        let Some(bounds) = self.clip_to_canvas(bounds) else {
            return Ok(());
        };
        let (_, canvas_height) = self.targets.size();
        let uniforms = CompositeUniforms {
            color: PLACEHOLDER_COLOR,
            ..CompositeUniforms::default()
        };
        let buffer = self.uniform_buffer("placeholder uniforms", bytemuck::bytes_of(&uniforms));
        let group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("placeholder group"),
            layout: &self.passes.fill_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        let mut encoder = self.take_encoder();
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("placeholder pass"),
                color_attachments: &[color_attachment(
                    &self.targets.get(target).view,
                    wgpu::LoadOp::Load,
                )],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            scissor(&mut pass, bounds, canvas_height);
            pass.set_pipeline(&self.passes.fill);
            pass.set_bind_group(0, &group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn clear(&mut self, target: DrawTarget, color: [f32; 4]) -> Result<(), RenderError> {
        self.ensure_available()?;
        let [r, g, b, a] = color.map(f64::from);
        let mut encoder = self.take_encoder();
        // An empty pass with a clear load op is the clear.
        drop(encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear pass"),
            color_attachments: &[color_attachment(
                &self.targets.get(target).view,
                wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
            )],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        }));
        self.encoder = Some(encoder);
        Ok(())
    }

    fn composite_canvas(&mut self, alpha: f32, mode: BlendMode) -> Result<(), RenderError> {
        self.ensure_available()?;
        if alpha <= 0.0 {
            return Ok(());
        }
        let group = self.sample_group(
            &self.targets.get(DrawTarget::Canvas).view,
            CompositeUniforms {
                alpha,
                mode: mode.index(),
                ..CompositeUniforms::default()
            },
        );

        let mut encoder = self.take_encoder();
        self.targets
            .snapshot_backdrop(&mut encoder, DrawTarget::Accumulation);
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("composite pass"),
                color_attachments: &[color_attachment(
                    &self.targets.get(DrawTarget::Accumulation).view,
                    wgpu::LoadOp::Load,
                )],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.passes.composite);
            pass.set_bind_group(0, &group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn upload_image(&mut self, image: &LoadedImage) -> Result<TextureId, RenderError> {
        self.ensure_available()?;
        let id = TextureId(self.next_image);
        self.next_image += 1;
        let texture = ImageTexture::upload(&self.gpu, "uploaded image", image);
        self.images.insert(id, texture);
        debug!(id = id.0, width = image.width, height = image.height, "uploaded image");
        Ok(id)
    }

    fn image_size(&self, image: TextureId) -> Option<(u32, u32)> {
        self.images.get(&image).map(|texture| texture.size)
    }

    fn dispose_image(&mut self, image: TextureId) {
        self.images.remove(&image);
        let stale = self
            .channel_group
            .as_ref()
            .is_some_and(|(key, _)| key.contains(&Some(image)));
        if stale {
            self.channel_group = None;
        }
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
        self.ensure_available()?;
        if draws.is_empty() || alpha <= 0.0 {
            return Ok(());
        }
        let Some(texture) = self.images.get(&image) else {
            warn!(id = image.0, "draw requested for unknown image");
            return Ok(());
        };
        let Some(clip) = self.clip_to_canvas(clip) else {
            return Ok(());
        };
        let canvas = self.targets.size();
        let vertices: Vec<ImageVertex> = draws
            .iter()
            .flat_map(|draw| image_quad(draw, canvas, texture.size))
            .collect();
        let vertex_buffer = self
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("image quads"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let group = self.sample_group(
            &texture.view,
            CompositeUniforms {
                alpha,
                mode: mode.index(),
                ..CompositeUniforms::default()
            },
        );

        let mut encoder = self.take_encoder();
        self.targets.snapshot_backdrop(&mut encoder, target);
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("image pass"),
                color_attachments: &[color_attachment(
                    &self.targets.get(target).view,
                    wgpu::LoadOp::Load,
                )],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            scissor(&mut pass, clip, canvas.1);
            pass.set_pipeline(&self.passes.image);
            pass.set_bind_group(0, &group, &[]);
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            pass.draw(0..vertices.len() as u32, 0..1);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), RenderError> {
        self.ensure_available()?;
        let encoder = self.take_encoder();
        self.encoder = Some(encoder);
        Ok(())
    }

    fn finish_frame(
        &mut self,
        source: DrawTarget,
        capture: bool,
    ) -> Result<Option<CapturedFrame>, RenderError> {
        if let Err(err) = self.ensure_available() {
            self.encoder = None;
            return Err(err);
        }
        let mut encoder = self.take_encoder();
        let readback =
            capture.then(|| Readback::record(&self.gpu.device, &mut encoder, &self.targets, source));
        let surface_frame = self.acquire_surface_frame()?;

        if let (Some(frame), Some(blit)) = (&surface_frame, &self.passes.blit) {
            let view = frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            let group = self.sample_group(&self.targets.get(source).view, CompositeUniforms::default());
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present pass"),
                color_attachments: &[color_attachment(
                    &view,
                    wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                )],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(blit);
            pass.set_bind_group(0, &group, &[]);
            pass.draw(0..3, 0..1);
        }

        self.gpu.queue.submit(Some(encoder.finish()));
        if let Some(frame) = surface_frame {
            frame.present();
        }

        let captured = readback.and_then(|readback| match readback.finish(&self.gpu.device) {
            Ok((width, height, rgba)) => Some(CapturedFrame {
                width,
                height,
                rgba,
            }),
            Err(message) => {
                warn!(%message, "frame capture failed");
                None
            }
        });
        Ok(captured)
    }
}
