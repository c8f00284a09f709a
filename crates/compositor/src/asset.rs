//! Crop, tile and scroll planning for static media.
//!
//! Planning is pure and done in `f64`; back-ends only receive the resulting
//! source/destination rectangles plus a clip rectangle.

use serde::{Deserialize, Serialize};

use crate::layout::Bounds;

/// Most copies of an asset a tiled layer draws along one axis.
pub const MAX_REPEAT: f64 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    #[default]
    Image,
    /// Videos are shown as a still of the loaded frame.
    Video,
}

/// Placement of an asset within its target rectangle.
///
/// Offsets and crops are fractions of the target and of the native image
/// respectively; speeds are pixels per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssetParams {
    pub x: f64,
    pub y: f64,
    pub repeat_x: f64,
    pub repeat_y: f64,
    pub speed_x: f64,
    pub speed_y: f64,
    pub crop_left: f64,
    pub crop_right: f64,
    pub crop_top: f64,
    pub crop_bottom: f64,
}

impl Default for AssetParams {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            repeat_x: 1.0,
            repeat_y: 1.0,
            speed_x: 0.0,
            speed_y: 0.0,
            crop_left: 0.0,
            crop_right: 0.0,
            crop_top: 0.0,
            crop_bottom: 0.0,
        }
    }
}

impl AssetParams {
    pub fn is_tiled(&self) -> bool {
        self.repeat_x > 1.0 || self.repeat_y > 1.0 || self.speed_x != 0.0 || self.speed_y != 0.0
    }
}

/// Rectangle in `f64` pixels.
///
/// Source rectangles use the image's top-left origin; destination
/// rectangles use the canvas's bottom-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<Bounds> for Rect {
    fn from(bounds: Bounds) -> Self {
        Rect::new(
            f64::from(bounds.x),
            f64::from(bounds.y),
            f64::from(bounds.width),
            f64::from(bounds.height),
        )
    }
}

/// One textured quad: `src` of the image stretched onto `dst`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageDraw {
    pub src: Rect,
    pub dst: Rect,
}

/// Wraps a scroll distance into `[0, tile)`.
pub fn scroll_offset(speed: f64, elapsed: f64, tile: f64) -> f64 {
    let distance = speed * elapsed;
    if tile.is_nan() || tile <= 0.0 || !distance.is_finite() {
        return 0.0;
    }
    (distance % tile + tile) % tile
}

fn repeat_count(repeat: f64) -> f64 {
    if repeat.is_finite() {
        repeat.clamp(1.0, MAX_REPEAT)
    } else {
        1.0
    }
}

/// Start and length of the native span left after cropping `lead` and
/// `trail` fractions off either end; at least one pixel always remains.
fn crop_span(native: f64, lead: f64, trail: f64) -> (f64, f64) {
    let fraction = |value: f64| if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let (mut lead, mut trail) = (fraction(lead), fraction(trail));
    let limit = (1.0 - 1.0 / native).max(0.0);
    let total = lead + trail;
    if total > limit {
        lead *= limit / total;
        trail *= limit / total;
    }
    (native * lead, native * (1.0 - lead - trail))
}

/// Source rectangle that fills a `target_w`×`target_h` box without distortion.
///
/// The user crop narrows the native image first; the remaining region is then
/// trimmed symmetrically on its long axis.
pub fn cover_crop(
    native: (u32, u32),
    target_w: f64,
    target_h: f64,
    params: &AssetParams,
) -> Rect {
    let (nat_w, nat_h) = (f64::from(native.0), f64::from(native.1));
    let (x, width) = crop_span(nat_w, params.crop_left, params.crop_right);
    let (y, height) = crop_span(nat_h, params.crop_top, params.crop_bottom);

    let mut src = Rect::new(x, y, width, height);
    if target_w <= 0.0 || target_h <= 0.0 || src.width <= 0.0 || src.height <= 0.0 {
        return src;
    }

    let target_aspect = target_w / target_h;
    let src_aspect = src.width / src.height;
    if src_aspect > target_aspect {
        let width = src.height * target_aspect;
        src.x += (src.width - width) / 2.0;
        src.width = width;
    } else if src_aspect < target_aspect {
        let height = src.width / target_aspect;
        src.y += (src.height - height) / 2.0;
        src.height = height;
    }
    src
}

/// Draw list covering `target`; the caller clips every draw to `target`.
pub fn plan_draws(
    native: (u32, u32),
    target: Bounds,
    params: &AssetParams,
    elapsed: f64,
) -> Vec<ImageDraw> {
    let area = Rect::from(target);
    if area.width <= 0.0 || area.height <= 0.0 || native.0 == 0 || native.1 == 0 {
        return Vec::new();
    }
    let shift_x = params.x * area.width;
    let shift_y = params.y * area.height;

    if !params.is_tiled() {
        return vec![ImageDraw {
            src: cover_crop(native, area.width, area.height, params),
            dst: Rect::new(area.x + shift_x, area.y + shift_y, area.width, area.height),
        }];
    }

    let tile_w = area.width / repeat_count(params.repeat_x);
    let tile_h = area.height / repeat_count(params.repeat_y);
    if tile_w <= 0.0 || tile_h <= 0.0 {
        return Vec::new();
    }
    let src = cover_crop(native, tile_w, tile_h, params);
    let off_x = scroll_offset(params.speed_x, elapsed, tile_w);
    let off_y = scroll_offset(params.speed_y, elapsed, tile_h);
    let start_x = area.x + scroll_offset(1.0, off_x + shift_x, tile_w) - tile_w;
    let start_y = area.y + scroll_offset(1.0, off_y + shift_y, tile_h) - tile_h;

    let mut draws = Vec::new();
    let mut y = start_y;
    while y < area.y + area.height {
        let mut x = start_x;
        while x < area.x + area.width {
            draws.push(ImageDraw {
                src,
                dst: Rect::new(x, y, tile_w, tile_h),
            });
            x += tile_w;
        }
        y += tile_h;
    }
    draws
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped_distance(a: f64, b: f64, tile: f64) -> f64 {
        let d = (a - b).abs();
        d.min(tile - d)
    }

    #[test]
    fn scroll_wraps_after_one_tile_of_travel() {
        let first = scroll_offset(30.0, 10.0, 100.0);
        let second = scroll_offset(30.0, 10.0 + 100.0 / 30.0, 100.0);
        assert!(wrapped_distance(first, second, 100.0) < 1e-9);
    }

    #[test]
    fn scroll_offset_is_never_negative() {
        for elapsed in [0.0, 0.5, 7.25, 1.0e6, 3.3e9] {
            let offset = scroll_offset(-45.0, elapsed, 64.0);
            assert!((0.0..64.0).contains(&offset), "offset {offset}");
        }
    }

    #[test]
    fn cover_crop_trims_wide_source_horizontally() {
        let src = cover_crop((400, 100), 100.0, 100.0, &AssetParams::default());
        assert_eq!(src, Rect::new(150.0, 0.0, 100.0, 100.0));
    }

    #[test]
    fn cover_crop_honours_user_crop_first() {
        let params = AssetParams {
            crop_top: 0.5,
            ..AssetParams::default()
        };
        let src = cover_crop((200, 200), 200.0, 100.0, &params);
        assert_eq!(src, Rect::new(0.0, 100.0, 200.0, 100.0));
    }

    #[test]
    fn untiled_asset_is_drawn_once() {
        let draws = plan_draws((64, 64), Bounds::full(128, 128), &AssetParams::default(), 5.0);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].dst, Rect::new(0.0, 0.0, 128.0, 128.0));
    }

    #[test]
    fn tiled_asset_covers_target() {
        let params = AssetParams {
            repeat_x: 2.0,
            repeat_y: 2.0,
            speed_x: 10.0,
            ..AssetParams::default()
        };
        let target = Bounds::full(100, 100);
        let draws = plan_draws((10, 10), target, &params, 1.0);

        for (px, py) in [(0.5, 0.5), (99.5, 0.5), (0.5, 99.5), (50.0, 50.0)] {
            assert!(draws.iter().any(|draw| {
                px >= draw.dst.x
                    && px < draw.dst.x + draw.dst.width
                    && py >= draw.dst.y
                    && py < draw.dst.y + draw.dst.height
            }));
        }
        assert!(draws.iter().all(|draw| draw.dst.x < 100.0 && draw.dst.y < 100.0));
    }

    #[test]
    fn opposing_crops_keep_a_pixel_inside_the_image() {
        let params = AssetParams {
            crop_left: 0.8,
            crop_right: 0.6,
            crop_top: 1.0,
            crop_bottom: 1.0,
            ..AssetParams::default()
        };
        let src = cover_crop((100, 50), 0.0, 0.0, &params);
        assert!(src.width >= 1.0 - 1e-9 && src.height >= 1.0 - 1e-9);
        assert!(src.x >= 0.0 && src.x + src.width <= 100.0 + 1e-9);
        assert!(src.y >= 0.0 && src.y + src.height <= 50.0 + 1e-9);
    }

    #[test]
    fn extreme_repeats_produce_a_bounded_draw_list() {
        let side = MAX_REPEAT as usize + 1;
        for repeat in [1e300, f64::INFINITY, f64::NAN] {
            let params = AssetParams {
                repeat_x: repeat,
                repeat_y: repeat,
                speed_x: 1e308,
                ..AssetParams::default()
            };
            let draws = plan_draws((16, 16), Bounds::full(640, 480), &params, 2.0);
            assert!(!draws.is_empty());
            assert!(draws.len() <= side * side, "{repeat}: {} draws", draws.len());
        }
    }
}
