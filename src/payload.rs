//! The frame payload shared between the producer API and the present
//! layer: row store, color bitmaps, and per-frame dirty state.

use std::sync::Arc;

use crate::font::FontStore;
use crate::row::ShapedRow;
use crate::settings::{Generational, Settings};

/// Number of cells the color bitmap row stride is rounded up to.
/// `8 * size_of::<u32>() == 32` bytes keeps rows 32-byte aligned, which
/// favors vectorized row copies during scrolling and upload.
const COLOR_BITMAP_ALIGNMENT: usize = 8;

/// Background tile index in the color bitmap (premultiplied alpha).
pub const TILE_BACKGROUND: usize = 0;
/// Foreground tile index in the color bitmap (straight alpha).
pub const TILE_FOREGROUND: usize = 1;

/// An axis-aligned rectangle. Both cell and pixel rects use this; pixel
/// rects may go out of bounds (glyph overhang) and get clamped at present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn non_empty(&self) -> bool {
        !self.empty()
    }
}

/// An inclusive-start, exclusive-end row range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowRange {
    pub start: u16,
    pub end: u16,
}

impl RowRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn non_empty(&self) -> bool {
        self.start < self.end
    }

    pub fn contains(&self, y: u16) -> bool {
        y >= self.start && y < self.end
    }
}

/// Everything the render thread needs to draw one frame.
///
/// The producer writes this between `start_paint` and `end_paint`; the
/// render thread reads it during `present`. The only render-thread writes
/// are `ShapedRow::dirty_top`/`dirty_bottom` and `BitmapSlice::active`,
/// which the producer resets on the next frame.
pub struct RenderPayload {
    /// Settings snapshot, synced from the producer at `start_paint`.
    pub settings: Generational<Settings>,
    /// Immutable font face snapshot for rasterization on the render thread.
    pub font_store: Option<Arc<FontStore>>,

    /// Backing storage for the viewport rows, in allocation order.
    rows_storage: Vec<ShapedRow>,
    /// Visual top-to-bottom order: `order[y]` indexes `rows_storage`.
    /// Scrolling rotates this ring; the storage never moves.
    order: Vec<u16>,
    order_scratch: Vec<u16>,

    /// Two row-major `u32` tiles back to back: background (premultiplied)
    /// then foreground (straight). Row stride is padded to a multiple of
    /// [`COLOR_BITMAP_ALIGNMENT`] cells.
    color_bitmap: Vec<u32>,
    pub color_bitmap_row_stride: usize,
    pub color_bitmap_depth_stride: usize,
    /// Bumped only when a tile's bytes actually change.
    pub color_bitmap_generations: [u64; 2],

    /// Cursor rectangle in cells; empty when the cursor is off.
    pub cursor_rect: Rect,
    /// The swap chain area to present, in pixels.
    pub dirty_rect_px: Rect,
    pub invalidated_rows: RowRange,
    /// Scroll delta applied this frame, in rows.
    pub scroll_offset: i16,
}

impl RenderPayload {
    pub fn new() -> Self {
        let mut payload = Self {
            settings: Generational::new(Settings::default()),
            font_store: None,
            rows_storage: Vec::new(),
            order: Vec::new(),
            order_scratch: Vec::new(),
            color_bitmap: Vec::new(),
            color_bitmap_row_stride: 0,
            color_bitmap_depth_stride: 0,
            color_bitmap_generations: [1, 1],
            cursor_rect: Rect::default(),
            dirty_rect_px: Rect::default(),
            invalidated_rows: RowRange::default(),
            scroll_offset: 0,
        };
        payload.resize_viewport();
        payload
    }

    /// Reallocate the row store and color bitmaps for the current viewport
    /// cell count. Contents are zeroed and both tile generations bumped.
    pub fn resize_viewport(&mut self) {
        let cols = usize::from(self.settings.viewport_cols);
        let rows = usize::from(self.settings.viewport_rows);
        let cell_height = self.settings.font.cell_height;

        self.rows_storage.clear();
        self.rows_storage.resize_with(rows, ShapedRow::default);
        for (y, row) in self.rows_storage.iter_mut().enumerate() {
            row.clear(y as u16, cell_height);
        }
        self.order = (0..rows as u16).collect();
        self.order_scratch = vec![0; rows];

        self.color_bitmap_row_stride = cols.next_multiple_of(COLOR_BITMAP_ALIGNMENT);
        self.color_bitmap_depth_stride = self.color_bitmap_row_stride * rows;
        self.color_bitmap.clear();
        self.color_bitmap.resize(self.color_bitmap_depth_stride * 2, 0);
        self.color_bitmap_generations[TILE_BACKGROUND] += 1;
        self.color_bitmap_generations[TILE_FOREGROUND] += 1;
    }

    pub fn row(&self, y: u16) -> &ShapedRow {
        &self.rows_storage[usize::from(self.order[usize::from(y)])]
    }

    pub fn row_mut(&mut self, y: u16) -> &mut ShapedRow {
        &mut self.rows_storage[usize::from(self.order[usize::from(y)])]
    }

    pub fn rows(&self) -> impl Iterator<Item = &ShapedRow> {
        self.order
            .iter()
            .map(|&i| &self.rows_storage[usize::from(i)])
    }

    /// All rows in storage order. Use when the visual order is irrelevant.
    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut ShapedRow> {
        self.rows_storage.iter_mut()
    }

    /// Rotate the visual row order by `offset` rows (positive scrolls
    /// content down) using the scratch ring.
    pub fn rotate_rows(&mut self, offset: i16) {
        let len = self.order.len();
        if offset == 0 || len == 0 {
            return;
        }
        self.order_scratch.clear();
        if offset < 0 {
            let n = usize::from(offset.unsigned_abs()).min(len);
            self.order_scratch.extend_from_slice(&self.order[n..]);
            self.order_scratch.extend_from_slice(&self.order[..n]);
        } else {
            let n = (offset as usize).min(len);
            self.order_scratch.extend_from_slice(&self.order[len - n..]);
            self.order_scratch.extend_from_slice(&self.order[..len - n]);
        }
        std::mem::swap(&mut self.order, &mut self.order_scratch);
    }

    /// One bitmap row of the given tile.
    pub fn tile_row(&self, tile: usize, y: usize) -> &[u32] {
        let start = tile * self.color_bitmap_depth_stride + y * self.color_bitmap_row_stride;
        &self.color_bitmap[start..start + self.color_bitmap_row_stride]
    }

    /// The whole background tile, for texture upload.
    pub fn background_tile(&self) -> &[u32] {
        &self.color_bitmap[..self.color_bitmap_depth_stride]
    }

    /// Fill `[x1, x2)` of one tile row with `color`. The tile generation
    /// is bumped only if any cell in the range differs, and the fill then
    /// covers the whole range. Returns whether anything changed.
    pub fn fill_tile_span(&mut self, tile: usize, y: usize, x1: usize, x2: usize, color: u32) -> bool {
        let start = tile * self.color_bitmap_depth_stride + y * self.color_bitmap_row_stride;
        let span = &mut self.color_bitmap[start + x1..start + x2];
        match span.iter().position(|&c| c != color) {
            Some(first) => {
                self.color_bitmap_generations[tile] += 1;
                span[first..].fill(color);
                true
            }
            None => false,
        }
    }

    /// Scroll both color bitmap tiles by `offset` rows via overlapping
    /// copy. A tile's generation is bumped only if its bytes changed.
    pub fn scroll_color_bitmap(&mut self, offset: i16) {
        if offset == 0 {
            return;
        }
        let stride = self.color_bitmap_row_stride;
        let depth = self.color_bitmap_depth_stride;
        let src_off = usize::from((-offset).max(0).unsigned_abs()) * stride;
        let dst_off = usize::from(offset.max(0).unsigned_abs()) * stride;
        let count = depth.saturating_sub(src_off.max(dst_off));
        if count == 0 {
            return;
        }

        for tile in 0..2 {
            let base = tile * depth;
            let src = base + src_off;
            let dst = base + dst_off;
            let changed = self.color_bitmap[src..src + count]
                != self.color_bitmap[dst..dst + count];
            if changed {
                self.color_bitmap.copy_within(src..src + count, dst);
                self.color_bitmap_generations[tile] += 1;
            }
        }
    }

    /// Mark the whole frame dirty: full-target dirty rect, all rows
    /// invalidated, and the scroll delta cancelled (scrolling the whole
    /// viewport is just a repaint).
    pub fn mark_all_dirty(&mut self) {
        self.dirty_rect_px = Rect::new(
            0,
            0,
            i32::from(self.settings.target_width),
            i32::from(self.settings.target_height),
        );
        self.invalidated_rows = RowRange::new(0, self.settings.viewport_rows);
        self.scroll_offset = 0;
    }
}

impl Default for RenderPayload {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(cols: u16, rows: u16) -> RenderPayload {
        let mut p = RenderPayload::new();
        {
            let s = p.settings.write();
            s.viewport_cols = cols;
            s.viewport_rows = rows;
            s.font.write().cell_height = 10;
        }
        p.resize_viewport();
        p
    }

    #[test]
    fn row_stride_rounds_to_alignment() {
        let p = payload(10, 3);
        assert_eq!(p.color_bitmap_row_stride, 16);
        assert_eq!(p.color_bitmap_depth_stride, 48);
    }

    #[test]
    fn rotate_down_moves_rows() {
        let mut p = payload(4, 5);
        p.row_mut(0).selection_from = 7;
        p.rotate_rows(2);
        assert_eq!(p.row(2).selection_from, 7);
        assert_eq!(p.row(0).selection_from, 0);
    }

    #[test]
    fn rotate_up_moves_rows() {
        let mut p = payload(4, 5);
        p.row_mut(3).selection_from = 9;
        p.rotate_rows(-2);
        assert_eq!(p.row(1).selection_from, 9);
    }

    #[test]
    fn rotate_round_trip_is_identity() {
        let mut p = payload(4, 6);
        for y in 0..6 {
            p.row_mut(y).selection_from = y + 100;
        }
        p.rotate_rows(4);
        p.rotate_rows(-4);
        for y in 0..6 {
            assert_eq!(p.row(y).selection_from, y + 100);
        }
    }

    #[test]
    fn fill_tile_span_bumps_generation_once() {
        let mut p = payload(8, 2);
        let g0 = p.color_bitmap_generations[TILE_BACKGROUND];
        assert!(p.fill_tile_span(TILE_BACKGROUND, 1, 2, 6, 0xff00_00ff));
        assert_eq!(p.color_bitmap_generations[TILE_BACKGROUND], g0 + 1);
        // Idempotent: same fill again changes nothing.
        assert!(!p.fill_tile_span(TILE_BACKGROUND, 1, 2, 6, 0xff00_00ff));
        assert_eq!(p.color_bitmap_generations[TILE_BACKGROUND], g0 + 1);
        assert_eq!(p.tile_row(TILE_BACKGROUND, 1)[2], 0xff00_00ff);
        assert_eq!(p.tile_row(TILE_BACKGROUND, 1)[1], 0);
    }

    #[test]
    fn scroll_color_bitmap_moves_rows_down() {
        let mut p = payload(8, 4);
        p.fill_tile_span(TILE_BACKGROUND, 0, 0, 8, 0xaa);
        p.fill_tile_span(TILE_BACKGROUND, 1, 0, 8, 0xbb);
        let g = p.color_bitmap_generations[TILE_BACKGROUND];
        p.scroll_color_bitmap(2);
        assert_eq!(p.tile_row(TILE_BACKGROUND, 2)[0], 0xaa);
        assert_eq!(p.tile_row(TILE_BACKGROUND, 3)[0], 0xbb);
        assert!(p.color_bitmap_generations[TILE_BACKGROUND] > g);
    }

    #[test]
    fn scroll_color_bitmap_unchanged_content_keeps_generation() {
        let mut p = payload(8, 4);
        let g = p.color_bitmap_generations[TILE_BACKGROUND];
        // All zeroes: a scroll moves identical bytes, no bump.
        p.scroll_color_bitmap(1);
        assert_eq!(p.color_bitmap_generations[TILE_BACKGROUND], g);
    }

    #[test]
    fn mark_all_dirty_clears_scroll() {
        let mut p = payload(8, 4);
        p.scroll_offset = 3;
        {
            let s = p.settings.write();
            s.target_width = 80;
            s.target_height = 40;
        }
        p.mark_all_dirty();
        assert_eq!(p.scroll_offset, 0);
        assert_eq!(p.dirty_rect_px, Rect::new(0, 0, 80, 40));
        assert_eq!(p.invalidated_rows, RowRange::new(0, 4));
    }
}
