//! Source wrapping and front-end validation for both program kinds.
//!
//! Shader programs are ShaderToy-style GLSL: we strip the uniforms the user
//! may have declared, prepend [`HEADER`] plus a parameter block generated
//! from the program's directives, and append [`FOOTER`], which computes a
//! viewport-local `fragCoord` and calls `mainImage`.
//!
//! Scene programs are WGSL with their own `vs_main`/`fs_main`; they get a
//! prelude declaring the same frame uniforms, parameters and channels.

use std::fmt::Write as _;

use wgpu::naga;

use crate::error::RenderError;
use crate::params::{ParamKind, SPEED};
use crate::program::{ProgramInterface, ProgramKind};

use super::uniforms::ParamBlockLayout;

/// Entry point names a scene program must export.
pub(crate) const SCENE_VERTEX_ENTRY: &str = "vs_main";
pub(crate) const SCENE_FRAGMENT_ENTRY: &str = "fs_main";

const SHADERTOY_UNIFORMS: [&str; 13] = [
    "iResolution",
    "iTimeDelta",
    "iTime",
    "iFrame",
    "iMouse",
    "iDate",
    "iSampleRate",
    "iChannelTime",
    "iChannelResolution",
    "iChannel0",
    "iChannel1",
    "iChannel2",
    "iChannel3",
];

/// Produces a self-contained GLSL fragment shader from ShaderToy code.
pub(crate) fn wrap_shader(source: &str, params: &ParamBlockLayout) -> String {
    let declared = |line: &str, name: &str| {
        line.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|token| token == name)
    };

    let mut sanitized = String::new();
    let mut skipped_version = false;
    for line in source.lines() {
        let trimmed = line.trim_start();
        if !skipped_version && trimmed.starts_with("#version") {
            skipped_version = true;
            continue;
        }
        if trimmed.starts_with("uniform ") {
            let shadertoy = SHADERTOY_UNIFORMS.iter().any(|&name| declared(trimmed, name));
            let param = params
                .slots()
                .iter()
                .any(|slot| declared(trimmed, slot.name.as_str()));
            if shadertoy || param {
                continue;
            }
        }
        sanitized.push_str(line);
        sanitized.push('\n');
    }

    format!(
        "{HEADER}\n{params}\n#line 1\n{sanitized}{FOOTER}",
        params = glsl_param_block(params)
    )
}

fn glsl_param_block(layout: &ParamBlockLayout) -> String {
    let mut block = String::from("layout(std140, set = 0, binding = 1) uniform ParamBlock {\n");
    let mut defines = String::new();
    for slot in layout.slots() {
        let ty = match slot.kind.component_count() {
            1 => "float",
            2 => "vec2",
            3 => "vec3",
            _ => "vec4",
        };
        let _ = match slot.array_size {
            Some(count) => writeln!(block, "    {ty} p_{}[{count}];", slot.name),
            None => writeln!(block, "    {ty} p_{};", slot.name),
        };
        if slot.name == SPEED {
            continue;
        }
        let member = format!("duoshade_params.p_{}", slot.name);
        let _ = match (slot.kind, slot.array_size) {
            (ParamKind::Int, None) => writeln!(defines, "#define {} int({member})", slot.name),
            (ParamKind::Bool, None) => {
                writeln!(defines, "#define {} ({member} > 0.5)", slot.name)
            }
            _ => writeln!(defines, "#define {} {member}", slot.name),
        };
    }
    block.push_str("} duoshade_params;\n");
    block.push_str(&defines);
    block
}

/// Prepends the scene prelude to WGSL program source.
pub(crate) fn wrap_scene(source: &str, params: &ParamBlockLayout) -> String {
    let mut block = String::from("struct Params {\n");
    for slot in params.slots() {
        let ty = match (slot.array_size, slot.kind.component_count()) {
            (Some(count), _) => format!("array<vec4<f32>, {count}>"),
            (None, 1) => "f32".to_string(),
            (None, 2) => "vec2<f32>".to_string(),
            (None, 3) => "vec3<f32>".to_string(),
            (None, _) => "vec4<f32>".to_string(),
        };
        let _ = writeln!(block, "    {}: {ty},", slot.name);
    }
    block.push_str("}\n@group(0) @binding(1) var<uniform> params: Params;\n");
    format!("{SCENE_PRELUDE}\n{block}\n{source}")
}

/// Runs the naga front end over `source` exactly as compilation would,
/// without touching a device.
pub fn validate_program(
    kind: ProgramKind,
    source: &str,
    interface: &ProgramInterface,
) -> Result<(), RenderError> {
    let params = ParamBlockLayout::new(&interface.params);
    let result = match kind {
        ProgramKind::Shader => {
            validate_glsl(&wrap_shader(source, &params), naga::ShaderStage::Fragment)
        }
        ProgramKind::Scene => validate_wgsl(&wrap_scene(source, &params)),
    };
    result.map_err(|message| RenderError::compile(kind, message))
}

/// Parses and validates wrapped GLSL so compile errors carry line context.
pub(crate) fn validate_glsl(wrapped: &str, stage: naga::ShaderStage) -> Result<(), String> {
    let module = naga::front::glsl::Frontend::default()
        .parse(&naga::front::glsl::Options::from(stage), wrapped)
        .map_err(|errors| errors.emit_to_string(wrapped))?;
    validate_module(&module, wrapped)
}

/// Parses and validates wrapped WGSL, checking both scene entry points exist.
pub(crate) fn validate_wgsl(wrapped: &str) -> Result<(), String> {
    let module = naga::front::wgsl::parse_str(wrapped).map_err(|err| err.emit_to_string(wrapped))?;
    for (entry, stage) in [
        (SCENE_VERTEX_ENTRY, naga::ShaderStage::Vertex),
        (SCENE_FRAGMENT_ENTRY, naga::ShaderStage::Fragment),
    ] {
        let found = module
            .entry_points
            .iter()
            .any(|point| point.name == entry && point.stage == stage);
        if !found {
            return Err(format!("scene program is missing `{entry}`"));
        }
    }
    validate_module(&module, wrapped)
}

fn validate_module(module: &naga::Module, source: &str) -> Result<(), String> {
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(module)
    .map(|_| ())
    .map_err(|err| err.emit_to_string(source))
}

/// GLSL prologue injected ahead of every shader program.
///
/// The uniform block layout must match [`super::uniforms::FrameUniforms`].
const HEADER: &str = r"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform FrameBlock {
    vec4 _iResolution;
    vec4 _iMouse;
    vec4 _iDate;
    vec4 _iViewport;
    float _iTime;
    float _iTimeDelta;
    int _iFrame;
    float _iSampleRate;
    float _iChannelTime[4];
    vec3 _iChannelResolution[4];
} ubo;

// Map ShaderToy names to our UBO fields via macros to avoid name clashes.
#define iResolution ubo._iResolution.xyz
#define iTime ubo._iTime
#define iTimeDelta ubo._iTimeDelta
#define iFrame ubo._iFrame
#define iMouse ubo._iMouse
#define iDate ubo._iDate
#define iSampleRate ubo._iSampleRate
#define iChannelTime ubo._iChannelTime
#define iChannelResolution ubo._iChannelResolution

layout(set = 1, binding = 0) uniform texture2D duoshade_channel0_texture;
layout(set = 1, binding = 1) uniform sampler duoshade_channel0_sampler;
layout(set = 1, binding = 2) uniform texture2D duoshade_channel1_texture;
layout(set = 1, binding = 3) uniform sampler duoshade_channel1_sampler;
layout(set = 1, binding = 4) uniform texture2D duoshade_channel2_texture;
layout(set = 1, binding = 5) uniform sampler duoshade_channel2_sampler;
layout(set = 1, binding = 6) uniform texture2D duoshade_channel3_texture;
layout(set = 1, binding = 7) uniform sampler duoshade_channel3_sampler;

#define iChannel0 sampler2D(duoshade_channel0_texture, duoshade_channel0_sampler)
#define iChannel1 sampler2D(duoshade_channel1_texture, duoshade_channel1_sampler)
#define iChannel2 sampler2D(duoshade_channel2_texture, duoshade_channel2_sampler)
#define iChannel3 sampler2D(duoshade_channel3_texture, duoshade_channel3_sampler)

vec4 duoshade_gl_FragCoord;
#define gl_FragCoord duoshade_gl_FragCoord
";

/// GLSL epilogue: viewport-local bottom-left `fragCoord`, then `mainImage`.
const FOOTER: &str = r"void main() {
    #undef gl_FragCoord
    vec2 builtinFC = vec2(gl_FragCoord.x, gl_FragCoord.y);
    #define gl_FragCoord duoshade_gl_FragCoord

    // Framebuffer rows run top to bottom; _iResolution.w holds the canvas height.
    vec2 fragCoord = vec2(
        builtinFC.x - ubo._iViewport.x,
        ubo._iResolution.w - builtinFC.y - ubo._iViewport.y
    );
    duoshade_gl_FragCoord = vec4(fragCoord, 0.0, 1.0);

    vec4 color = vec4(0.0);
    mainImage(color, fragCoord);
    outColor = vec4(color.rgb, 1.0);
}
";

/// Minimal full-screen triangle vertex shader.
pub(crate) const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) out vec2 v_uv;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    v_uv = pos * 0.5 + vec2(0.5, 0.5);
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// WGSL declarations shared by every scene program.
const SCENE_PRELUDE: &str = r"struct Frame {
    resolution: vec4<f32>,
    mouse: vec4<f32>,
    date: vec4<f32>,
    viewport: vec4<f32>,
    time: f32,
    time_delta: f32,
    frame: i32,
    sample_rate: f32,
    channel_time: array<vec4<f32>, 4>,
    channel_resolution: array<vec4<f32>, 4>,
}
@group(0) @binding(0) var<uniform> frame: Frame;

@group(1) @binding(0) var channel0_texture: texture_2d<f32>;
@group(1) @binding(1) var channel0_sampler: sampler;
@group(1) @binding(2) var channel1_texture: texture_2d<f32>;
@group(1) @binding(3) var channel1_sampler: sampler;
@group(1) @binding(4) var channel2_texture: texture_2d<f32>;
@group(1) @binding(5) var channel2_sampler: sampler;
@group(1) @binding(6) var channel3_texture: texture_2d<f32>;
@group(1) @binding(7) var channel3_sampler: sampler;
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamDef, ParamKind};

    fn layout() -> ParamBlockLayout {
        ParamBlockLayout::new(&[
            ParamDef::vector("tint", ParamKind::Vec3, vec![1.0, 1.0, 1.0]),
            ParamDef {
                kind: ParamKind::Int,
                ..ParamDef::scalar("steps", 4.0)
            },
        ])
    }

    #[test]
    fn wrap_strips_shadertoy_and_param_uniforms() {
        let source = r#"
            #version 300 es
            uniform float iTime;
            uniform vec3 iResolution;
            uniform vec3 tint;
            uniform float unrelated;
            void mainImage(out vec4 fragColor, in vec2 fragCoord) {
                fragColor = vec4(tint * fragCoord.x, 1.0);
            }
        "#;

        let wrapped = wrap_shader(source, &layout());
        assert!(!wrapped.contains("uniform float iTime"));
        assert!(!wrapped.contains("uniform vec3 tint"));
        assert!(wrapped.contains("uniform float unrelated"));
        assert!(wrapped.contains("vec3 p_tint;"));
        assert!(wrapped.contains("#define steps int(duoshade_params.p_steps)"));
        assert!(!wrapped.contains("#define speed"));
    }

    #[test]
    fn wrapped_shader_passes_front_end_validation() {
        let source = r#"
            void mainImage(out vec4 fragColor, in vec2 fragCoord) {
                vec2 uv = fragCoord / iResolution.xy;
                fragColor = vec4(tint * uv.x, float(steps) * 0.1);
            }
        "#;
        let wrapped = wrap_shader(source, &layout());
        validate_glsl(&wrapped, naga::ShaderStage::Fragment).unwrap();
    }

    #[test]
    fn glsl_errors_are_reported() {
        let wrapped = wrap_shader("void mainImage(out vec4 c, in vec2 p) { c = nope; }", &layout());
        assert!(validate_glsl(&wrapped, naga::ShaderStage::Fragment).is_err());
    }

    #[test]
    fn scene_requires_both_entry_points() {
        let source = r#"
            @vertex
            fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
                let x = f32(index) - 1.0;
                return vec4<f32>(x, params.tint.x, 0.5, 1.0);
            }
        "#;
        let wrapped = wrap_scene(source, &layout());
        let err = validate_wgsl(&wrapped).unwrap_err();
        assert!(err.contains("fs_main"));
    }

    #[test]
    fn scene_prelude_exposes_frame_and_params() {
        let source = r#"
            @vertex
            fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
                let x = f32(index) - 1.0;
                return vec4<f32>(x, sin(frame.time), 0.5, 1.0);
            }

            @fragment
            fn fs_main() -> @location(0) vec4<f32> {
                let base = textureSample(channel0_texture, channel0_sampler, vec2<f32>(0.5, 0.5));
                return vec4<f32>(params.tint * params.speed, 1.0) + base * 0.0;
            }
        "#;
        let wrapped = wrap_scene(source, &layout());
        validate_wgsl(&wrapped).unwrap();
    }

    #[test]
    fn validate_program_reports_compile_errors_by_kind() {
        let interface = ProgramInterface::default();
        validate_program(
            ProgramKind::Shader,
            "void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }",
            &interface,
        )
        .unwrap();
        let err = validate_program(ProgramKind::Scene, "fn nothing() {}", &interface).unwrap_err();
        assert!(matches!(err, RenderError::Compile { kind: ProgramKind::Scene, .. }));
    }
}
