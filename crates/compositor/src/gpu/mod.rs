//! wgpu back-end for [`crate::GraphicsContext`].
//!
//! - `device` owns instance/adapter/device/surface wiring and tracks device loss.
//! - `compile` wraps ShaderToy GLSL and WGSL scene sources with our preludes
//!   and validates them through naga before wgpu sees them.
//! - `uniforms` mirrors the preludes' frame block and lays out the
//!   per-program parameter block.
//! - `pipeline` builds program pipelines plus the blend, image, placeholder
//!   and present passes.
//! - `targets` owns the canvas/accumulation textures and capture readback.
//! - `context` records every operation into one encoder per frame.

mod compile;
mod context;
mod device;
mod pipeline;
mod targets;
mod uniforms;

pub use compile::validate_program;
pub use context::{WgpuContext, WgpuProgram};
pub use device::{GpuOptions, GpuPower};
