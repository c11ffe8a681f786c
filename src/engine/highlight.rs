//! Color bitmap fills and highlight overlay layering.

use crate::color;
use crate::payload::{RenderPayload, TILE_BACKGROUND, TILE_FOREGROUND};

use super::ApiState;

/// Search highlight colors (all matches).
pub(crate) const HIGHLIGHT_FG: u32 = 0xff00_0000;
pub(crate) const HIGHLIGHT_BG: u32 = 0xff00_ffff;
/// Focused search match colors.
pub(crate) const HIGHLIGHT_FOCUS_FG: u32 = 0xff00_0000;
pub(crate) const HIGHLIGHT_FOCUS_BG: u32 = 0xff00_80ff;

/// A highlighted region in buffer coordinates: inclusive start and end
/// columns, possibly spanning multiple rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointSpan {
    pub start_col: i32,
    pub start_row: i32,
    pub end_col: i32,
    pub end_row: i32,
}

/// An ordered highlight list consumed front to back across a frame's
/// `paint_buffer_line` calls. A span that extends past the painted range
/// stays current so the next row resumes it.
#[derive(Debug, Default)]
pub(crate) struct SpanList {
    spans: Vec<PointSpan>,
    pos: usize,
}

impl SpanList {
    pub(crate) fn set(&mut self, spans: impl IntoIterator<Item = PointSpan>) {
        self.spans.clear();
        self.spans.extend(spans);
        self.pos = 0;
    }

    fn current(&self) -> Option<PointSpan> {
        self.spans.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Fill `[x1, x2)` of row `y` with the given brushes: premultiplied
/// background, straight foreground. Columns are shifted by the row's
/// line rendition before touching the bitmap.
pub(crate) fn fill_color_bitmap(
    p: &mut RenderPayload,
    y: u16,
    x1: u16,
    x2: u16,
    fg: u32,
    bg: u32,
) {
    let cols = usize::from(p.settings.viewport_cols);
    let shift = p.row(y).line_rendition.column_shift();
    let a = (usize::from(x1) << shift).min(cols);
    let b = (usize::from(x2) << shift).min(cols);
    if a >= b {
        return;
    }
    p.fill_tile_span(TILE_BACKGROUND, usize::from(y), a, b, color::premultiply(bg));
    p.fill_tile_span(TILE_FOREGROUND, usize::from(y), a, b, fg);
}

/// Fill a highlighted sub-range, additionally widening the row's
/// selection extent when this is the selection overlay.
fn fill_highlight(
    p: &mut RenderPayload,
    y: u16,
    x1: u16,
    x2: u16,
    fg: u32,
    bg: u32,
    is_selection: bool,
) {
    fill_color_bitmap(p, y, x1, x2, fg, bg);
    if !is_selection {
        return;
    }
    let cols = p.settings.viewport_cols;
    let shift = p.row(y).line_rendition.column_shift();
    let a = (x1 << shift).min(cols);
    let b = (x2 << shift).min(cols);
    if a >= b {
        return;
    }
    let row = p.row_mut(y);
    if row.selection_from == row.selection_to {
        row.selection_from = a;
        row.selection_to = b;
    } else {
        row.selection_from = row.selection_from.min(a);
        row.selection_to = row.selection_to.max(b);
    }
}

impl ApiState {
    /// Apply one highlight list to `[x1, x2)` of viewport row `row`,
    /// consuming spans that end inside the range and resuming multi-row
    /// spans left over from previous rows.
    pub(crate) fn draw_highlighted(
        &mut self,
        p: &mut RenderPayload,
        which: HighlightKind,
        row: u16,
        x1: u16,
        x2: u16,
    ) {
        let (fg, bg) = match which {
            HighlightKind::Search => (HIGHLIGHT_FG, HIGHLIGHT_BG),
            HighlightKind::SearchFocused => (HIGHLIGHT_FOCUS_FG, HIGHLIGHT_FOCUS_BG),
            HighlightKind::Selection => (
                p.settings.misc.selection_foreground,
                p.settings.misc.selection_color,
            ),
        };
        let is_selection = which == HighlightKind::Selection;
        let list = match which {
            HighlightKind::Search => &mut self.search_highlights,
            HighlightKind::SearchFocused => &mut self.search_focused,
            HighlightKind::Selection => &mut self.selection_spans,
        };

        let Some(mut span) = list.current() else { return };

        let off_x = i32::from(self.viewport_offset_x);
        let off_y = i32::from(self.viewport_offset_y);
        let y = i32::from(row);
        let x1i = i32::from(x1);
        let x2i = i32::from(x2);
        let clamp_col = |c: i32| c.clamp(0, x2i) as u16;

        loop {
            let hi_start = (span.start_col - off_x, span.start_row - off_y);
            // End columns are inclusive; work with the exclusive bound.
            let hi_end = (span.end_col - off_x + 1, span.end_row - off_y);

            if y < hi_start.1 {
                return;
            }

            if y > hi_start.1 {
                // Resuming a multi-row span painted partially before.
                let is_final_row = y == hi_end.1;
                let end = if is_final_row { hi_end.0.min(x2i) } else { x2i };
                if end > x1i {
                    fill_highlight(p, row, x1, clamp_col(end), fg, bg, is_selection);
                }
                // Leave the span current if it extends past this range.
                if !is_final_row || hi_end.0 > x2i {
                    return;
                }
                list.advance();
                match list.current() {
                    Some(s) => {
                        span = s;
                        continue;
                    }
                    None => return,
                }
            }

            // y == hi_start.1: the span begins on this row.
            let start_inside = hi_start.0 < x2i;
            let end_inside = y == hi_end.1 && hi_end.0 <= x2i;
            if start_inside && end_inside {
                fill_highlight(
                    p,
                    row,
                    clamp_col(hi_start.0.max(x1i)),
                    clamp_col(hi_end.0),
                    fg,
                    bg,
                    is_selection,
                );
                list.advance();
                match list.current() {
                    Some(s) => span = s,
                    None => return,
                }
            } else {
                if start_inside {
                    fill_highlight(
                        p,
                        row,
                        clamp_col(hi_start.0.max(x1i)),
                        x2,
                        fg,
                        bg,
                        is_selection,
                    );
                }
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HighlightKind {
    Search,
    SearchFocused,
    Selection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AtlasEngine;
    use crate::payload::TILE_FOREGROUND;

    fn engine(cols: u16, rows: u16) -> AtlasEngine {
        let mut e = AtlasEngine::new();
        e.update_viewport(cols, rows);
        e
    }

    #[test]
    fn single_row_highlight_fills_between_bounds() {
        let mut e = engine(10, 3);
        e.start_paint();
        e.with_payload(|api, p| {
            api.search_highlights.set([PointSpan {
                start_col: 2,
                start_row: 1,
                end_col: 4,
                end_row: 1,
            }]);
            api.draw_highlighted(p, HighlightKind::Search, 1, 0, 10);
            let fg = p.tile_row(TILE_FOREGROUND, 1);
            assert_eq!(fg[1], 0, "before span");
            assert_eq!(fg[2], HIGHLIGHT_FG);
            assert_eq!(fg[4], HIGHLIGHT_FG, "end column is inclusive");
            assert_eq!(fg[5], 0, "after span");
            // Span fully painted: consumed.
            assert!(api.search_highlights.current().is_none());
        });
        e.end_paint();
    }

    #[test]
    fn multi_row_span_resumes_on_next_row() {
        let mut e = engine(6, 3);
        e.start_paint();
        e.with_payload(|api, p| {
            api.selection_spans.set([PointSpan {
                start_col: 4,
                start_row: 0,
                end_col: 2,
                end_row: 1,
            }]);
            api.draw_highlighted(p, HighlightKind::Selection, 0, 0, 6);
            // Not consumed: it continues on row 1.
            assert!(api.selection_spans.current().is_some());
            let bg0 = p.tile_row(TILE_BACKGROUND, 0).to_vec();
            assert_ne!(bg0[4], 0);
            assert_ne!(bg0[5], 0);
            assert_eq!(bg0[3], 0);

            api.draw_highlighted(p, HighlightKind::Selection, 1, 0, 6);
            assert!(api.selection_spans.current().is_none());
            let bg1 = p.tile_row(TILE_BACKGROUND, 1);
            assert_ne!(bg1[0], 0);
            assert_ne!(bg1[2], 0);
            assert_eq!(bg1[3], 0);

            // Selection extents were recorded per row.
            assert_eq!((p.row(0).selection_from, p.row(0).selection_to), (4, 6));
            assert_eq!((p.row(1).selection_from, p.row(1).selection_to), (0, 3));
        });
        e.end_paint();
    }

    #[test]
    fn span_before_viewport_rows_is_skipped() {
        let mut e = engine(6, 3);
        e.start_paint();
        e.with_payload(|api, p| {
            api.search_highlights.set([PointSpan {
                start_col: 0,
                start_row: 5,
                end_col: 3,
                end_row: 5,
            }]);
            api.draw_highlighted(p, HighlightKind::Search, 1, 0, 6);
            assert!(api.search_highlights.current().is_some(), "span untouched");
            assert!(p.tile_row(TILE_FOREGROUND, 1).iter().all(|&c| c == 0));
        });
        e.end_paint();
    }

    #[test]
    fn viewport_offset_converts_buffer_rows() {
        let mut e = engine(6, 3);
        e.update_viewport_offset(0, 10);
        e.start_paint();
        e.with_payload(|api, p| {
            // Buffer row 11 is viewport row 1.
            api.search_highlights.set([PointSpan {
                start_col: 1,
                start_row: 11,
                end_col: 2,
                end_row: 11,
            }]);
            api.draw_highlighted(p, HighlightKind::Search, 1, 0, 6);
            let fg = p.tile_row(TILE_FOREGROUND, 1);
            assert_eq!(fg[1], HIGHLIGHT_FG);
            assert_eq!(fg[2], HIGHLIGHT_FG);
            assert_eq!(fg[3], 0);
        });
        e.end_paint();
    }

    #[test]
    fn negative_columns_are_clamped_not_rejected() {
        let mut e = engine(6, 3);
        e.update_viewport_offset(4, 0);
        e.start_paint();
        e.with_payload(|api, p| {
            // After offset subtraction the start column is negative
            // (selection dragged out of the viewport).
            api.selection_spans.set([PointSpan {
                start_col: 1,
                start_row: 0,
                end_col: 5,
                end_row: 0,
            }]);
            api.draw_highlighted(p, HighlightKind::Selection, 0, 0, 6);
            let bg = p.tile_row(TILE_BACKGROUND, 0);
            assert_ne!(bg[0], 0);
            assert_ne!(bg[1], 0);
            assert_eq!(bg[2], 0);
        });
        e.end_paint();
    }
}
