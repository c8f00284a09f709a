use serde::{Deserialize, Serialize};

/// Pixel rectangle with a bottom-left origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn top(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.top()
    }

    pub fn offset(self, dx: u32, dy: u32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..self
        }
    }

    pub fn intersect(&self, other: &Bounds) -> Option<Bounds> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let top = self.top().min(other.top());
        (right > x && top > y).then(|| Bounds::new(x, y, right - x, top - y))
    }
}

/// Largest number of rows or columns a grid may have.
pub const MAX_GRID_SIDE: u32 = 64;

/// Grid configuration for tiled mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLayout {
    pub rows: u32,
    pub cols: u32,
    #[serde(default)]
    pub gap: u32,
}

impl Default for TileLayout {
    fn default() -> Self {
        Self {
            rows: 2,
            cols: 2,
            gap: 0,
        }
    }
}

impl TileLayout {
    /// Builds a layout, clamping rows and cols to `1..=MAX_GRID_SIDE`.
    pub fn new(rows: u32, cols: u32, gap: u32) -> Self {
        Self {
            rows: rows.clamp(1, MAX_GRID_SIDE),
            cols: cols.clamp(1, MAX_GRID_SIDE),
            gap,
        }
    }

    fn grid(&self) -> (u32, u32) {
        (
            self.rows.clamp(1, MAX_GRID_SIDE),
            self.cols.clamp(1, MAX_GRID_SIDE),
        )
    }

    pub fn tile_count(&self) -> usize {
        let (rows, cols) = self.grid();
        rows as usize * cols as usize
    }

    /// Per-tile width and height inside `width`×`height`.
    ///
    /// Remainder pixels of the floor division stay unused.
    pub fn tile_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (rows, cols) = self.grid();
        let tile_w = width.saturating_sub(self.gap.saturating_mul(cols - 1)) / cols;
        let tile_h = height.saturating_sub(self.gap.saturating_mul(rows - 1)) / rows;
        (tile_w, tile_h)
    }

    /// Bounds of every tile, indexed `row * cols + col`; row 0 is the top row.
    pub fn tile_bounds(&self, area: Bounds) -> Vec<Bounds> {
        let (rows, cols) = self.grid();
        let (tile_w, tile_h) = self.tile_size(area.width, area.height);
        let step_x = tile_w.saturating_add(self.gap);
        let step_y = tile_h.saturating_add(self.gap);
        let mut bounds = Vec::with_capacity(self.tile_count());
        for row in 0..rows {
            for col in 0..cols {
                let x = col.saturating_mul(step_x);
                let y = (rows - 1 - row).saturating_mul(step_y);
                bounds.push(Bounds::new(x, y, tile_w, tile_h).offset(area.x, area.y));
            }
        }
        bounds
    }
}

/// Largest centered `aspect` rectangle inside `width`×`height`.
///
/// Without an aspect the whole canvas is used.
pub fn render_area(width: u32, height: u32, aspect: Option<f64>) -> Bounds {
    let Some(aspect) = aspect.filter(|aspect| aspect.is_finite() && *aspect > 0.0) else {
        return Bounds::full(width, height);
    };
    if width == 0 || height == 0 {
        return Bounds::full(width, height);
    }
    let canvas_aspect = f64::from(width) / f64::from(height);
    if canvas_aspect > aspect {
        // Pillarbox.
        let inner = ((f64::from(height) * aspect).round() as u32).min(width);
        Bounds::new((width - inner) / 2, 0, inner, height)
    } else {
        // Letterbox.
        let inner = ((f64::from(width) / aspect).round() as u32).min(height);
        Bounds::new(0, (height - inner) / 2, width, inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_flip_mapping_matches_reference_grid() {
        let layout = TileLayout::new(2, 3, 4);
        let bounds = layout.tile_bounds(Bounds::full(800, 600));

        assert_eq!(layout.tile_size(800, 600), (264, 298));
        assert_eq!(bounds[0], Bounds::new(0, 302, 264, 298));
        assert_eq!(bounds[5], Bounds::new(536, 0, 264, 298));
    }

    #[test]
    fn oversized_gap_and_grid_do_not_overflow() {
        let wide_gap = TileLayout {
            rows: 1,
            cols: 3,
            gap: 3_000_000_000,
        };
        let bounds = wide_gap.tile_bounds(Bounds::full(800, 600));
        assert_eq!(bounds.len(), 3);
        assert!(bounds.iter().all(Bounds::is_empty));

        let huge = TileLayout {
            rows: u32::MAX,
            cols: u32::MAX,
            gap: 0,
        };
        assert_eq!(huge.tile_count(), (MAX_GRID_SIDE * MAX_GRID_SIDE) as usize);
        assert_eq!(huge.tile_bounds(Bounds::full(640, 640)).len(), huge.tile_count());
        assert_eq!(TileLayout::new(500, 0, 0), TileLayout::new(MAX_GRID_SIDE, 1, 0));
    }

    #[test]
    fn tile_bounds_never_exceed_canvas_and_slack_is_bounded() {
        for (width, height) in [(800u32, 600u32), (1921, 1079), (37, 29), (3, 3)] {
            for rows in 1..=5u32 {
                for cols in 1..=5u32 {
                    for gap in [0u32, 1, 4] {
                        let layout = TileLayout::new(rows, cols, gap);
                        let used_w = gap * (cols - 1);
                        let used_h = gap * (rows - 1);
                        if used_w > width || used_h > height {
                            continue;
                        }
                        let (tile_w, tile_h) = layout.tile_size(width, height);
                        let span_w = cols * tile_w + used_w;
                        let span_h = rows * tile_h + used_h;
                        assert!(span_w <= width);
                        assert!(width - span_w < cols);
                        assert!(span_h <= height);
                        assert!(height - span_h < rows);
                    }
                }
            }
        }
    }

    #[test]
    fn render_area_offset_applies_to_every_tile() {
        let area = render_area(1000, 500, Some(1.0));
        assert_eq!(area, Bounds::new(250, 0, 500, 500));

        let bounds = TileLayout::new(1, 2, 0).tile_bounds(area);
        assert_eq!(bounds[0], Bounds::new(250, 0, 250, 500));
        assert_eq!(bounds[1], Bounds::new(500, 0, 250, 500));
    }

    #[test]
    fn letterbox_centers_vertically() {
        assert_eq!(
            render_area(800, 800, Some(2.0)),
            Bounds::new(0, 200, 800, 400)
        );
    }

    #[test]
    fn intersection_clips_to_overlap() {
        let a = Bounds::new(0, 0, 10, 10);
        assert_eq!(
            a.intersect(&Bounds::new(5, 5, 10, 10)),
            Some(Bounds::new(5, 5, 5, 5))
        );
        assert_eq!(a.intersect(&Bounds::new(10, 0, 5, 5)), None);
    }

    #[test]
    fn layout_deserializes_with_default_gap() {
        let layout: TileLayout = serde_json::from_str(r#"{"rows":3,"cols":2}"#).expect("layout");
        assert_eq!(layout, TileLayout::new(3, 2, 0));
    }
}
