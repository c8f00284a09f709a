use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use wgpu::naga::ShaderStage;

use crate::frame::CHANNEL_COUNT;

use super::compile::{SCENE_FRAGMENT_ENTRY, SCENE_VERTEX_ENTRY, VERTEX_SHADER_GLSL};
use super::targets::{DEPTH_FORMAT, TARGET_FORMAT};

/// Bind group layouts shared by every program on a context.
pub(crate) struct PipelineLayouts {
    pub uniform_layout: wgpu::BindGroupLayout,
    pub channel_layout: wgpu::BindGroupLayout,
    pub program_layout: wgpu::PipelineLayout,
    pub vertex_module: wgpu::ShaderModule,
}

impl PipelineLayouts {
    pub(crate) fn new(device: &wgpu::Device) -> Self {
        let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame and param uniforms"),
            entries: &[uniform_entry(0), uniform_entry(1)],
        });
        let channel_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("channel layout"),
            entries: &build_channel_layout_entries(),
        });
        let program_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("program pipeline layout"),
            bind_group_layouts: &[&uniform_layout, &channel_layout],
            push_constant_ranges: &[],
        });
        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fullscreen triangle vertex"),
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Borrowed(VERTEX_SHADER_GLSL),
                stage: ShaderStage::Vertex,
                defines: &[],
            },
        });
        Self {
            uniform_layout,
            channel_layout,
            program_layout,
            vertex_module,
        }
    }
}

fn build_channel_layout_entries() -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(CHANNEL_COUNT * 2);
    for index in 0..CHANNEL_COUNT as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: index * 2,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: index * 2 + 1,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    entries
}

fn primitive_state() -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: wgpu::PrimitiveTopology::TriangleList,
        strip_index_format: None,
        front_face: wgpu::FrontFace::Ccw,
        cull_mode: None,
        polygon_mode: wgpu::PolygonMode::Fill,
        unclipped_depth: false,
        conservative: false,
    }
}

fn replace_target(format: wgpu::TextureFormat) -> [Option<wgpu::ColorTargetState>; 1] {
    [Some(wgpu::ColorTargetState {
        format,
        blend: None,
        write_mask: wgpu::ColorWrites::ALL,
    })]
}

/// Pipeline for a wrapped ShaderToy fragment program.
pub(crate) fn shader_pipeline(
    device: &wgpu::Device,
    layouts: &PipelineLayouts,
    fragment_module: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("shader program pipeline"),
        layout: Some(&layouts.program_layout),
        vertex: wgpu::VertexState {
            module: &layouts.vertex_module,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: primitive_state(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: fragment_module,
            entry_point: Some("main"),
            targets: &replace_target(TARGET_FORMAT),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// Pipeline for a WGSL scene program, depth-tested.
pub(crate) fn scene_pipeline(
    device: &wgpu::Device,
    layouts: &PipelineLayouts,
    module: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("scene program pipeline"),
        layout: Some(&layouts.program_layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some(SCENE_VERTEX_ENTRY),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: primitive_state(),
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(SCENE_FRAGMENT_ENTRY),
            targets: &replace_target(TARGET_FORMAT),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// Uniforms of the compositor passes; mirrors `Composite` in [`COMPOSITOR_WGSL`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub(crate) struct CompositeUniforms {
    pub color: [f32; 4],
    pub alpha: f32,
    pub mode: u32,
    pub _padding: [f32; 2],
}

/// Textured quad vertex in clip space.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub(crate) struct ImageVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

const IMAGE_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

/// Blending, image, placeholder and presentation passes.
pub(crate) struct CompositorPipelines {
    pub sample_layout: wgpu::BindGroupLayout,
    pub fill_layout: wgpu::BindGroupLayout,
    pub sampler: wgpu::Sampler,
    pub composite: wgpu::RenderPipeline,
    pub image: wgpu::RenderPipeline,
    pub fill: wgpu::RenderPipeline,
    /// Present pass; only built when the context owns a window surface.
    pub blit: Option<wgpu::RenderPipeline>,
}

impl CompositorPipelines {
    pub(crate) fn new(device: &wgpu::Device, surface_format: Option<wgpu::TextureFormat>) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("compositor passes"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(COMPOSITOR_WGSL)),
        });

        let uniform_entry = wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let sample_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compositor sample layout"),
            entries: &[
                uniform_entry,
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let fill_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compositor fill layout"),
            entries: &[uniform_entry],
        });
        let sample_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("compositor sample pipeline layout"),
                bind_group_layouts: &[&sample_layout],
                push_constant_ranges: &[],
            });
        let fill_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("compositor fill pipeline layout"),
            bind_group_layouts: &[&fill_layout],
            push_constant_ranges: &[],
        });

        let build = |label: &str,
                     layout: &wgpu::PipelineLayout,
                     vertex_entry: &str,
                     buffers: &[wgpu::VertexBufferLayout<'_>],
                     fragment_entry: &str,
                     format: wgpu::TextureFormat| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some(vertex_entry),
                    buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: primitive_state(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some(fragment_entry),
                    targets: &replace_target(format),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache: None,
            })
        };

        let image_buffers = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<ImageVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &IMAGE_ATTRIBUTES,
        }];

        let composite = build(
            "canvas composite",
            &sample_pipeline_layout,
            "vs_fullscreen",
            &[],
            "fs_composite",
            TARGET_FORMAT,
        );
        let image = build(
            "image draw",
            &sample_pipeline_layout,
            "vs_image",
            &image_buffers,
            "fs_image",
            TARGET_FORMAT,
        );
        let fill = build(
            "placeholder fill",
            &fill_pipeline_layout,
            "vs_fullscreen",
            &[],
            "fs_fill",
            TARGET_FORMAT,
        );
        let blit = surface_format.map(|format| {
            build(
                "present blit",
                &sample_pipeline_layout,
                "vs_fullscreen",
                &[],
                "fs_blit",
                format,
            )
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("compositor sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            sample_layout,
            fill_layout,
            sampler,
            composite,
            image,
            fill,
            blit,
        }
    }
}

/// Compositor passes. `composite` must stay in sync with
/// [`crate::blend::blend_pixel`], the CPU reference the tests pin down.
const COMPOSITOR_WGSL: &str = r"
struct Composite {
    color: vec4<f32>,
    alpha: f32,
    mode: u32,
    _padding: vec2<f32>,
}

@group(0) @binding(0) var<uniform> params: Composite;
@group(0) @binding(1) var source_texture: texture_2d<f32>;
@group(0) @binding(2) var backdrop_texture: texture_2d<f32>;
@group(0) @binding(3) var linear_sampler: sampler;

struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_fullscreen(@builtin(vertex_index) index: u32) -> VertexOut {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    let pos = positions[index];
    var out: VertexOut;
    out.position = vec4<f32>(pos, 0.0, 1.0);
    out.uv = vec2<f32>(pos.x * 0.5 + 0.5, 0.5 - pos.y * 0.5);
    return out;
}

@vertex
fn vs_image(@location(0) position: vec2<f32>, @location(1) uv: vec2<f32>) -> VertexOut {
    var out: VertexOut;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.uv = uv;
    return out;
}

fn blend_channel(mode: u32, d: vec3<f32>, s: vec3<f32>) -> vec3<f32> {
    var out = s;
    switch mode {
        case 1u: { out = min(d + s, vec3<f32>(1.0)); }
        case 2u: { out = d * s; }
        case 3u: { out = 1.0 - (1.0 - d) * (1.0 - s); }
        case 4u: {
            out = select(1.0 - 2.0 * (1.0 - d) * (1.0 - s), 2.0 * d * s, d < vec3<f32>(0.5));
        }
        case 5u: { out = min(d, s); }
        case 6u: { out = max(d, s); }
        case 7u: { out = abs(d - s); }
        case 8u: { out = d + s - 2.0 * d * s; }
        default: {}
    }
    return out;
}

fn composite(dst: vec4<f32>, src: vec4<f32>) -> vec4<f32> {
    let a = clamp(params.alpha * src.a, 0.0, 1.0);
    let blended = blend_channel(params.mode, dst.rgb, src.rgb);
    let rgb = clamp(dst.rgb + (blended - dst.rgb) * a, vec3<f32>(0.0), vec3<f32>(1.0));
    return vec4<f32>(rgb, clamp(dst.a + a * (1.0 - dst.a), 0.0, 1.0));
}

@fragment
fn fs_composite(input: VertexOut) -> @location(0) vec4<f32> {
    let coords = vec2<i32>(input.position.xy);
    let src = textureLoad(source_texture, coords, 0);
    let dst = textureLoad(backdrop_texture, coords, 0);
    return composite(dst, src);
}

@fragment
fn fs_image(input: VertexOut) -> @location(0) vec4<f32> {
    let src = textureSample(source_texture, linear_sampler, input.uv);
    let dst = textureLoad(backdrop_texture, vec2<i32>(input.position.xy), 0);
    return composite(dst, src);
}

@fragment
fn fs_fill() -> @location(0) vec4<f32> {
    return params.color;
}

@fragment
fn fs_blit(input: VertexOut) -> @location(0) vec4<f32> {
    return textureSample(source_texture, linear_sampler, input.uv);
}
";

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn compositor_module_validates() {
        let module = wgpu::naga::front::wgsl::parse_str(COMPOSITOR_WGSL).unwrap();
        wgpu::naga::valid::Validator::new(
            wgpu::naga::valid::ValidationFlags::all(),
            wgpu::naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();
    }

    #[test]
    fn composite_uniforms_match_wgsl_size() {
        assert_eq!(size_of::<CompositeUniforms>(), 32);
        assert_eq!(size_of::<ImageVertex>(), 16);
    }
}
