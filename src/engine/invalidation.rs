//! Invalidation accumulators and the frame boundary: `start_paint` clamps
//! pending invalidations, applies scrolling to the row store and color
//! bitmaps, and clears invalidated rows; `end_paint` finalizes the dirty
//! pixel rectangle and publishes the frame.

use std::sync::Arc;

use crate::payload::{Rect, RenderPayload, RowRange};

use super::{ApiState, AtlasEngine, CURSOR_AREA_NONE, ROWS_NONE};

impl AtlasEngine {
    /// Widen the invalidated row range by a cell rectangle.
    /// Out-of-bounds coordinates are clamped, never rejected.
    pub fn invalidate_cells(&mut self, region: &Rect) {
        let api = &mut self.api;
        let top = region.top.max(0).min(i32::from(u16::MAX)) as u16;
        let bottom = region.bottom.max(0).min(i32::from(u16::MAX)) as u16;
        api.invalidated_rows.start = api.invalidated_rows.start.min(top);
        api.invalidated_rows.end = api.invalidated_rows.end.max(bottom);
    }

    /// Widen the invalidated cursor area by a cell rectangle.
    pub fn invalidate_cursor(&mut self, region: &Rect) {
        let a = &mut self.api.invalidated_cursor_area;
        a.left = a.left.min(region.left.max(0));
        a.top = a.top.min(region.top.max(0));
        a.right = a.right.max(region.right);
        a.bottom = a.bottom.max(region.bottom);
    }

    /// Invalidate rows covered by a pixel rectangle.
    pub fn invalidate_system(&mut self, pixel_region: &Rect) {
        let cell_height = i32::from(self.api.settings.font.cell_height).max(1);
        self.invalidate_cells(&Rect {
            left: 0,
            top: pixel_region.top / cell_height,
            right: 0,
            bottom: (pixel_region.bottom + cell_height - 1) / cell_height,
        });
    }

    /// Widen the row range by each selection rectangle. Negative
    /// coordinates (selection dragged outside the viewport during
    /// auto-scroll) are clamped to zero.
    pub fn invalidate_selection(&mut self, rectangles: &[Rect]) {
        for rect in rectangles {
            self.invalidate_cells(rect);
        }
    }

    /// Accumulate a scroll of `delta` rows (positive moves content down).
    /// Pending invalidations refer to the post-scroll viewport, so they
    /// are shifted along; rows scrolling into view are invalidated.
    pub fn invalidate_scroll(&mut self, delta: i32) {
        if delta == 0 {
            return;
        }
        let api = &mut self.api;
        api.scroll_offset = (api.scroll_offset + delta)
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX));

        let shift = |v: i32| v.saturating_add(delta).max(0);
        let a = &mut api.invalidated_cursor_area;
        if *a != CURSOR_AREA_NONE {
            a.top = shift(a.top);
            a.bottom = shift(a.bottom);
        }

        let rows = &mut api.invalidated_rows;
        if delta < 0 {
            rows.start = i32::from(rows.start)
                .saturating_add(delta)
                .clamp(0, i32::from(u16::MAX)) as u16;
            rows.end = api.settings.viewport_rows;
        } else {
            rows.start = 0;
            rows.end = i32::from(rows.end)
                .saturating_add(delta)
                .clamp(0, i32::from(u16::MAX)) as u16;
        }
    }

    /// Invalidate the entire viewport.
    pub fn invalidate_all(&mut self) {
        self.api.invalidated_rows = RowRange::new(0, u16::MAX);
    }

    /// Flag a title change; the callback fires at the next `start_paint`.
    pub fn invalidate_title(&mut self) {
        self.api.invalidated_title = true;
    }

    /// Begin a frame: sync settings, clamp invalidations, apply
    /// scrolling, and clear the rows about to be repainted.
    pub fn start_paint(&mut self) {
        if self.api.invalidated_title {
            if let Some(cb) = &mut self.api.title_callback {
                cb();
            }
            self.api.invalidated_title = false;
        }
        self.with_payload(ApiState::start_paint);
    }

    /// End the frame: flush the pending line, finalize the dirty pixel
    /// rectangle, reset the accumulators, and publish to the render
    /// thread.
    pub fn end_paint(&mut self) {
        self.with_payload(ApiState::end_paint);
        let link = Arc::clone(&self.link);
        link.notify_present_ready();
    }
}

impl ApiState {
    fn start_paint(&mut self, p: &mut RenderPayload) {
        if p.settings.generation() != self.settings.generation() {
            self.handle_settings_update(p);
        }

        let cols = i32::from(p.settings.viewport_cols);
        let rows_n = p.settings.viewport_rows;
        let cell_height = i32::from(p.settings.font.cell_height);

        // Clamp invalidation rects into valid value ranges.
        {
            let a = &mut self.invalidated_cursor_area;
            a.left = a.left.min(cols);
            a.top = a.top.min(i32::from(rows_n));
            a.right = a.right.clamp(a.left, cols);
            a.bottom = a.bottom.clamp(a.top, i32::from(rows_n));
        }
        {
            let r = &mut self.invalidated_rows;
            r.start = r.start.min(rows_n);
            r.end = r.end.clamp(r.start, rows_n);
        }

        if self.scroll_offset != 0 {
            let limit = i32::from(rows_n);
            let offset = self.scroll_offset.clamp(-limit, limit);
            let nothing_invalid = self.invalidated_rows.empty();
            self.scroll_offset = offset;

            // Mark the newly scrolled-in rows as invalidated.
            let r = &mut self.invalidated_rows;
            if offset < 0 {
                let first = (limit + offset) as u16;
                r.start = if nothing_invalid { first } else { r.start.min(first) };
                r.end = rows_n;
            } else {
                let last = offset as u16;
                r.start = 0;
                r.end = if nothing_invalid { last } else { r.end.max(last) };
            }
        }

        self.dirty_rows = self.invalidated_rows;

        p.dirty_rect_px = Rect {
            left: i32::MAX,
            top: i32::MAX,
            right: i32::MIN,
            bottom: i32::MIN,
        };
        p.invalidated_rows = self.invalidated_rows;
        p.cursor_rect = Rect::default();
        p.scroll_offset = self.scroll_offset as i16;

        // Scrolling the entire viewport is just a full repaint; this also
        // forces a clean first frame after any settings change.
        if p.invalidated_rows == RowRange::new(0, rows_n) {
            p.mark_all_dirty();
            self.scroll_offset = 0;
        }

        let offset = p.scroll_offset;
        if offset != 0 {
            p.rotate_rows(offset);

            // The rows moved, so their cached dirty extents move with
            // them. Out-of-bounds values are fine: cleared rows reset
            // them and the rest get clamped below.
            let delta_px = i32::from(offset) * cell_height;
            for row in p.rows_mut() {
                row.dirty_top += delta_px;
                row.dirty_bottom += delta_px;
            }

            p.scroll_color_bitmap(offset);
        }

        // For each invalidated row: remember where its old content was
        // (it is about to be replaced, possibly by nothing) and clear it.
        if p.invalidated_rows.non_empty() {
            let target_w = i32::from(p.settings.target_width);
            let target_h = i32::from(p.settings.target_height);
            let range = p.invalidated_rows;

            p.dirty_rect_px.left = 0;
            p.dirty_rect_px.top = p
                .dirty_rect_px
                .top
                .min(i32::from(range.start) * cell_height);
            p.dirty_rect_px.right = target_w;
            p.dirty_rect_px.bottom = p
                .dirty_rect_px
                .bottom
                .max(i32::from(range.end) * cell_height);

            for y in range.start..range.end {
                let (old_top, old_bottom) = {
                    let row = p.row_mut(y);
                    let top = row.dirty_top.clamp(0, target_h);
                    let bottom = row.dirty_bottom.clamp(0, target_h);
                    row.clear(y, p_cell_height(cell_height));
                    (top, bottom)
                };
                if old_top != old_bottom {
                    p.dirty_rect_px.top = p.dirty_rect_px.top.min(old_top);
                    p.dirty_rect_px.bottom = p.dirty_rect_px.bottom.max(old_bottom);
                }
            }
        }
    }

    fn end_paint(&mut self, p: &mut RenderPayload) {
        self.flush_buffer_line(p);

        // Image slices that were not repainted this frame are gone.
        for row in p.rows_mut() {
            if row
                .bitmap
                .as_ref()
                .is_some_and(|b| b.revision != 0 && !b.active)
            {
                row.bitmap = None;
            }
        }

        // The cursor area needs invalidating even when the cursor is off,
        // or a visible-to-hidden transition would never be drawn.
        let area = self.invalidated_cursor_area;
        if area != CURSOR_AREA_NONE && area.non_empty() {
            let cell_w = i32::from(p.settings.font.cell_width);
            let cell_h = i32::from(p.settings.font.cell_height);
            let d = &mut p.dirty_rect_px;
            d.left = d.left.min(area.left * cell_w);
            d.top = d.top.min(area.top * cell_h);
            d.right = d.right.max(area.right * cell_w);
            d.bottom = d.bottom.max(area.bottom * cell_h);
        }

        self.invalidated_cursor_area = CURSOR_AREA_NONE;
        self.invalidated_rows = ROWS_NONE;
        self.scroll_offset = 0;
    }

    fn handle_settings_update(&mut self, p: &mut RenderPayload) {
        let font_changed = p.settings.font.generation() != self.settings.font.generation();
        let cell_count_changed = p.settings.viewport_cols != self.settings.viewport_cols
            || p.settings.viewport_rows != self.settings.viewport_rows;

        p.settings = self.settings.clone();

        if font_changed {
            self.replacement = super::ReplacementCharacter::default();
            self.recompute_axis_variants();
            p.font_store = self.collection.as_ref().map(|c| Arc::clone(c.store()));
        }
        if font_changed || cell_count_changed {
            p.resize_viewport();
        }

        self.invalidated_rows = RowRange::new(0, u16::MAX);
    }
}

// Cell heights always fit u16; this keeps the clamp visible at the call.
fn p_cell_height(cell_height: i32) -> u16 {
    cell_height.clamp(1, i32::from(u16::MAX)) as u16
}
