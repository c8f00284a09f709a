use bytemuck::{Pod, Zeroable};

use crate::frame::{SharedFrameState, CHANNEL_COUNT};
use crate::layout::Bounds;
use crate::params::{ParamDef, ParamKind, ParameterSet, SPEED};

/// Per-draw ShaderToy uniforms.
///
/// Field order matches the `FrameBlock` declared by the GLSL prelude and the
/// `Frame` struct of the scene prelude. Every vec4 sits on a 16-byte
/// boundary so the std140 and WGSL uniform layouts agree without padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub(crate) struct FrameUniforms {
    pub i_resolution: [f32; 4],
    pub i_mouse: [f32; 4],
    pub i_date: [f32; 4],
    /// `x, y, width, height` of the draw in canvas pixels, bottom-left origin.
    pub i_viewport: [f32; 4],
    pub i_time: f32,
    pub i_time_delta: f32,
    pub i_frame: i32,
    pub i_sample_rate: f32,
    pub i_channel_time: [[f32; 4]; CHANNEL_COUNT],
    pub i_channel_resolution: [[f32; 4]; CHANNEL_COUNT],
}

const SAMPLE_RATE: f32 = 44_100.0;

impl FrameUniforms {
    /// Builds the uniforms one program sees for `frame` inside `viewport`.
    ///
    /// `iTime` is scaled by the program's `speed`; every other field is the
    /// shared frame state verbatim so tiles stay in lockstep. The fourth
    /// component of `iResolution` carries the canvas height, which the
    /// prelude needs to flip framebuffer rows into a bottom-left origin.
    pub(crate) fn for_draw(
        frame: &SharedFrameState,
        viewport: Bounds,
        canvas_height: u32,
        speed: f32,
    ) -> Self {
        let time = (frame.time * f64::from(speed)) as f32;
        let mut channel_resolution = [[0.0; 4]; CHANNEL_COUNT];
        for (slot, resolution) in channel_resolution
            .iter_mut()
            .zip(frame.channel_resolutions.iter())
        {
            *slot = [resolution[0], resolution[1], resolution[2], 0.0];
        }
        let offset = [viewport.x as f32, viewport.y as f32];
        let mouse = frame.mouse;
        // Click origin keeps its sign convention; zero means "never clicked".
        let local_click = |value: f32, origin: f32| {
            if value == 0.0 {
                0.0
            } else {
                value.signum() * (value.abs() - origin)
            }
        };
        Self {
            i_resolution: [
                viewport.width as f32,
                viewport.height as f32,
                1.0,
                canvas_height as f32,
            ],
            i_mouse: [
                mouse[0] - offset[0],
                mouse[1] - offset[1],
                local_click(mouse[2], offset[0]),
                local_click(mouse[3], offset[1]),
            ],
            i_date: frame.date,
            i_viewport: [
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
            ],
            i_time: time,
            i_time_delta: frame.time_delta * speed,
            i_frame: (frame.frame & i32::MAX as u64) as i32,
            i_sample_rate: SAMPLE_RATE,
            i_channel_time: [[time, 0.0, 0.0, 0.0]; CHANNEL_COUNT],
            i_channel_resolution: channel_resolution,
        }
    }
}

/// One member of the generated parameter block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamSlot {
    pub name: String,
    pub kind: ParamKind,
    pub array_size: Option<usize>,
    pub offset: usize,
}

/// std140 layout of a program's declared parameters.
///
/// Arrays use a 16-byte element stride, which WGSL reproduces by declaring
/// them as `array<vec4<f32>, N>`. All components are stored as `f32`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamBlockLayout {
    slots: Vec<ParamSlot>,
    size: usize,
}

impl ParamBlockLayout {
    /// Lays out `speed` followed by `defs` in declaration order.
    pub(crate) fn new(defs: &[ParamDef]) -> Self {
        let mut slots = Vec::with_capacity(defs.len() + 1);
        let mut cursor = 0usize;
        let mut push = |name: &str, kind: ParamKind, array_size: Option<usize>| {
            let (align, size) = match array_size {
                Some(count) => (16, 16 * count.max(1)),
                None => match kind.component_count() {
                    1 => (4, 4),
                    2 => (8, 8),
                    3 => (16, 12),
                    _ => (16, 16),
                },
            };
            cursor = cursor.next_multiple_of(align);
            slots.push(ParamSlot {
                name: name.to_string(),
                kind,
                array_size,
                offset: cursor,
            });
            cursor += size;
        };
        push(SPEED, ParamKind::Float, None);
        for def in defs.iter().filter(|def| def.name != SPEED) {
            push(&def.name, def.kind, def.array_size);
        }
        Self {
            slots,
            size: cursor.next_multiple_of(16).max(16),
        }
    }

    pub(crate) fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Serializes `values`; missing or mis-shaped entries stay zero.
    pub(crate) fn write(&self, values: &ParameterSet) -> Vec<u8> {
        let mut floats = vec![0.0f32; self.size / 4];
        for slot in &self.slots {
            let Some(value) = values.get(&slot.name) else {
                if slot.name == SPEED {
                    floats[slot.offset / 4] = 1.0;
                }
                continue;
            };
            let components = value.components();
            let width = slot.kind.component_count();
            match slot.array_size {
                Some(count) => {
                    for (element, chunk) in components.chunks(width).take(count).enumerate() {
                        let base = (slot.offset + element * 16) / 4;
                        floats[base..base + chunk.len()].copy_from_slice(chunk);
                    }
                }
                None => {
                    let base = slot.offset / 4;
                    let len = components.len().min(width);
                    floats[base..base + len].copy_from_slice(&components[..len]);
                }
            }
        }
        bytemuck::cast_slice(&floats).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use super::*;
    use crate::params::{ParamValue, ParameterSet};

    #[test]
    fn frame_uniforms_match_prelude_offsets() {
        assert_eq!(offset_of!(FrameUniforms, i_viewport), 48);
        assert_eq!(offset_of!(FrameUniforms, i_time), 64);
        assert_eq!(offset_of!(FrameUniforms, i_frame), 72);
        assert_eq!(offset_of!(FrameUniforms, i_channel_time), 80);
        assert_eq!(offset_of!(FrameUniforms, i_channel_resolution), 144);
        assert_eq!(size_of::<FrameUniforms>(), 208);
    }

    #[test]
    fn tile_local_uniforms_use_viewport_size() {
        let mut frame = SharedFrameState::at(2.0, 7);
        frame.mouse = [110.0, 60.0, 0.0, 0.0];
        let uniforms = FrameUniforms::for_draw(&frame, Bounds::new(100, 50, 300, 200), 600, 0.5);
        assert_eq!(uniforms.i_resolution, [300.0, 200.0, 1.0, 600.0]);
        assert_eq!(uniforms.i_time, 1.0);
        assert_eq!(uniforms.i_frame, 7);
        assert_eq!(&uniforms.i_mouse[..2], &[10.0, 10.0]);
    }

    #[test]
    fn param_block_follows_std140_alignment() {
        let defs = vec![
            ParamDef::scalar("gain", 1.0),
            ParamDef::vector("tint", ParamKind::Vec3, vec![1.0, 0.5, 0.25]),
            ParamDef::scalar("warp", 0.0),
            ParamDef {
                array_size: Some(3),
                ..ParamDef::scalar("bands", 0.0)
            },
        ];
        let layout = ParamBlockLayout::new(&defs);
        let offsets: Vec<usize> = layout.slots().iter().map(|slot| slot.offset).collect();
        assert_eq!(offsets, vec![0, 4, 16, 28, 32]);
        assert_eq!(layout.size(), 80);
    }

    #[test]
    fn param_block_writes_values_and_defaults_speed() {
        let defs = vec![
            ParamDef::vector("tint", ParamKind::Vec3, vec![0.0; 3]),
            ParamDef {
                array_size: Some(2),
                ..ParamDef::scalar("bands", 0.0)
            },
        ];
        let layout = ParamBlockLayout::new(&defs);
        let mut values = ParameterSet::new();
        values.set("tint", ParamValue::Vector(vec![0.25, 0.5, 0.75]));
        values.set("bands", ParamValue::Vector(vec![3.0, 4.0]));
        let bytes = layout.write(&values);
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(floats[0], 1.0);
        assert_eq!(&floats[4..7], &[0.25, 0.5, 0.75]);
        assert_eq!(floats[8], 3.0);
        assert_eq!(floats[12], 4.0);
    }
}
