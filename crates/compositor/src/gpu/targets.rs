use std::sync::mpsc;

use crate::context::DrawTarget;

/// Colour format of every offscreen surface; matches [`crate::CapturedFrame`].
pub(crate) const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub(crate) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const BYTES_PER_PIXEL: u32 = 4;

pub(crate) struct Target {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl Target {
    fn new(
        device: &wgpu::Device,
        label: &str,
        (width, height): (u32, u32),
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

/// Canvas, accumulation and helper textures sized to the surface.
///
/// Blending reads the destination through `backdrop`, a copy taken right
/// before each blend pass, since a pass cannot sample its own attachment.
pub(crate) struct RenderTargets {
    size: (u32, u32),
    canvas: Target,
    accumulation: Target,
    pub backdrop: Target,
    pub depth: Target,
}

impl RenderTargets {
    pub(crate) fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = (width.max(1), height.max(1));
        let color_usage = wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST;
        Self {
            size,
            canvas: Target::new(device, "canvas", size, TARGET_FORMAT, color_usage),
            accumulation: Target::new(device, "accumulation", size, TARGET_FORMAT, color_usage),
            backdrop: Target::new(
                device,
                "blend backdrop",
                size,
                TARGET_FORMAT,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            ),
            depth: Target::new(
                device,
                "scene depth",
                size,
                DEPTH_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ),
        }
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        self.size
    }

    pub(crate) fn get(&self, target: DrawTarget) -> &Target {
        match target {
            DrawTarget::Canvas => &self.canvas,
            DrawTarget::Accumulation => &self.accumulation,
        }
    }

    /// Records a copy of `target` into the backdrop texture.
    pub(crate) fn snapshot_backdrop(&self, encoder: &mut wgpu::CommandEncoder, target: DrawTarget) {
        encoder.copy_texture_to_texture(
            self.get(target).texture.as_image_copy(),
            self.backdrop.texture.as_image_copy(),
            self.extent(),
        );
    }

    pub(crate) fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.size.0,
            height: self.size.1,
            depth_or_array_layers: 1,
        }
    }
}

/// Pending copy of a target into a mappable buffer.
pub(crate) struct Readback {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
}

impl Readback {
    pub(crate) fn record(
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargets,
        target: DrawTarget,
    ) -> Self {
        let (width, height) = targets.size();
        let unpadded_row = width * BYTES_PER_PIXEL;
        let padded_row = unpadded_row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("capture readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_texture_to_buffer(
            targets.get(target).texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            targets.extent(),
        );
        Self {
            buffer,
            width,
            height,
            padded_row,
        }
    }

    /// Blocks until the copy is visible, then strips the row padding.
    pub(crate) fn finish(self, device: &wgpu::Device) -> Result<(u32, u32, Vec<u8>), String> {
        let slice = self.buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| format!("failed to wait for readback: {err}"))?;
        rx.recv()
            .map_err(|_| "readback callback dropped".to_string())?
            .map_err(|err| format!("failed to map readback buffer: {err}"))?;

        let row = (self.width * BYTES_PER_PIXEL) as usize;
        let mut rgba = Vec::with_capacity(row * self.height as usize);
        {
            let mapped = slice.get_mapped_range();
            for chunk in mapped.chunks(self.padded_row as usize).take(self.height as usize) {
                rgba.extend_from_slice(&chunk[..row]);
            }
        }
        self.buffer.unmap();
        Ok((self.width, self.height, rgba))
    }
}
