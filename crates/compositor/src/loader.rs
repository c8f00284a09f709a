use std::path::Path;

use anyhow::{Context, Result};

/// Decoded RGBA8 image, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl LoadedImage {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        anyhow::ensure!(
            rgba.len() == expected,
            "expected {expected} bytes for {width}x{height} RGBA image, got {}",
            rgba.len()
        );
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn solid(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            width,
            height,
            rgba: color.repeat(width as usize * height as usize),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?
            .to_rgba8();
        let (width, height) = image.dimensions();
        Ok(Self {
            width,
            height,
            rgba: image.into_raw(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .context("failed to decode image bytes")?
            .to_rgba8();
        let (width, height) = image.dimensions();
        Ok(Self {
            width,
            height,
            rgba: image.into_raw(),
        })
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.rgba[offset],
            self.rgba[offset + 1],
            self.rgba[offset + 2],
            self.rgba[offset + 3],
        ]
    }

    /// Removes a uniform border whose colour matches the most common corner.
    ///
    /// Corners are visited top-left, top-right, bottom-left, bottom-right and
    /// the earliest one wins a tied vote. Pixels within `tolerance` on every
    /// RGB component count as border; alpha is ignored. An image made
    /// entirely of border is returned unchanged.
    pub fn autocrop(&self, tolerance: u8) -> LoadedImage {
        if self.width == 0 || self.height == 0 {
            return self.clone();
        }
        let corners = [
            self.pixel(0, 0),
            self.pixel(self.width - 1, 0),
            self.pixel(0, self.height - 1),
            self.pixel(self.width - 1, self.height - 1),
        ];
        let background = corners
            .iter()
            .rev()
            .max_by_key(|corner| corners.iter().filter(|other| other == corner).count())
            .copied()
            .unwrap_or(corners[0]);

        let differs = |pixel: [u8; 4]| {
            (0..3).any(|i| pixel[i].abs_diff(background[i]) > tolerance)
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
        for y in 0..self.height {
            for x in 0..self.width {
                if differs(self.pixel(x, y)) {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        if min_x == u32::MAX {
            return self.clone();
        }

        let width = max_x - min_x + 1;
        let height = max_y - min_y + 1;
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for y in min_y..=max_y {
            let start = (y as usize * self.width as usize + min_x as usize) * 4;
            rgba.extend_from_slice(&self.rgba[start..start + width as usize * 4]);
        }
        LoadedImage {
            width,
            height,
            rgba,
        }
    }

    pub fn to_rgba_image(&self) -> Option<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.rgba.clone())
    }
}

/// Completion of one asynchronous load.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub reference: String,
    pub image: Result<LoadedImage, String>,
}

/// Resolves logical texture names to images off the render thread.
///
/// `request` must not block; completed loads are observed by the next tick
/// through `drain`.
pub trait TextureLoader {
    fn request(&mut self, reference: &str);

    fn drain(&mut self) -> Vec<LoadResult>;
}
