//! Buffer line assembly and row shaping: turns the accumulated UTF-16
//! line into glyph runs on the target [`ShapedRow`].

use crate::font::shaper::{self, ShapeScratch};
use crate::font::{collection, FontAttributes};
use crate::gpu::builtin_glyphs;
use crate::payload::{RenderPayload, TILE_FOREGROUND};
use crate::row::{GlyphOffset, ShapedRow};
use crate::settings::FontSettings;

use super::highlight::{fill_color_bitmap, HighlightKind};
use super::{ApiState, AtlasEngine, ReplacementCharacter};

/// One cell cluster handed to [`AtlasEngine::paint_buffer_line`]: the
/// cluster's text and how many terminal columns it occupies.
#[derive(Debug, Clone, Copy)]
pub struct Cluster<'a> {
    pub text: &'a str,
    pub columns: u16,
}

/// Everything the row mapping functions read while appending glyphs.
struct ShapeContext<'a> {
    faces: &'a [Option<rustybuzz::Face<'a>>],
    font: &'a FontSettings,
    fg_row: &'a [u32],
    units: &'a [u16],
    columns: &'a [u16],
    attrs: FontAttributes,
    size_px: f32,
}

impl ShapeContext<'_> {
    /// Foreground color for a glyph starting at buffer column `col`.
    fn color_at(&self, col: u16, shift: u8) -> u32 {
        let idx = usize::from(col) << shift;
        self.fg_row.get(idx).copied().unwrap_or(0xffff_ffff)
    }

    /// Pixel width of the column span `[col1, col2)`, rendition-scaled.
    fn span_width(&self, col1: u16, col2: u16, shift: u8) -> f32 {
        let cells = u32::from(col2.saturating_sub(col1));
        ((cells * u32::from(self.font.cell_width)) << shift) as f32
    }
}

impl AtlasEngine {
    /// Paint one span of clusters at the given buffer coordinate. The
    /// characters accumulate into the current line buffer; the actual
    /// shaping happens when the line is flushed (row change, attribute
    /// change, cursor paint, or `end_paint`).
    pub fn paint_buffer_line(&mut self, clusters: &[Cluster<'_>], col: i32, row: i32) {
        self.with_payload(|api, p| api.paint_buffer_line(p, clusters, col, row));
    }
}

impl ApiState {
    fn paint_buffer_line(
        &mut self,
        p: &mut RenderPayload,
        clusters: &[Cluster<'_>],
        col: i32,
        row: i32,
    ) {
        let cols = p.settings.viewport_cols;
        let max_row = p.settings.viewport_rows.saturating_sub(1);
        let y = row.clamp(0, i32::from(max_row)) as u16;

        if self.last_paint_row != y {
            self.flush_buffer_line(p);
        }

        let shift = self.line_rendition.column_shift();
        let x = (col - (i32::from(self.viewport_offset_x) >> shift))
            .clamp(0, i32::from(cols)) as u16;
        let mut column_end = x;

        // `buffer_line_column` holds one more entry than `buffer_line`:
        // the past-the-end column. Pop it before appending, re-add after.
        self.buffer_line_column.pop();
        for cluster in clusters {
            for unit in cluster.text.encode_utf16() {
                self.buffer_line.push(unit);
                self.buffer_line_column.push(column_end);
            }
            column_end = column_end.saturating_add(cluster.columns);
        }
        self.buffer_line_column.push(column_end);

        fill_color_bitmap(p, y, x, column_end, self.current_foreground, self.current_background);

        self.draw_highlighted(p, HighlightKind::Search, y, x, column_end);
        self.draw_highlighted(p, HighlightKind::SearchFocused, y, x, column_end);
        self.draw_highlighted(p, HighlightKind::Selection, y, x, column_end);

        self.last_paint_col = x;
        self.last_paint_row = y;
    }

    /// Shape the accumulated buffer line into the current row.
    pub(crate) fn flush_buffer_line(&mut self, p: &mut RenderPayload) {
        if self.buffer_line.is_empty() {
            return;
        }
        if self.buffer_line_column.len() != self.buffer_line.len() + 1 {
            debug_assert!(false, "column map out of sync with buffer line");
            self.buffer_line.clear();
            self.buffer_line_column.clear();
            return;
        }

        let y = self.last_paint_row.min(p.settings.viewport_rows.saturating_sub(1));
        self.fg_row.clear();
        self.fg_row
            .extend_from_slice(p.tile_row(TILE_FOREGROUND, usize::from(y)));

        let Self {
            buffer_line,
            buffer_line_column,
            fg_row,
            scratch,
            replacement,
            collection,
            settings,
            attributes,
            axis_variants,
            ..
        } = self;

        let Some(collection) = collection.as_ref() else {
            buffer_line.clear();
            buffer_line_column.clear();
            return;
        };

        let font: &FontSettings = &settings.font;
        let faces = collection.create_shaping_faces(&axis_variants[attributes.variant_index()]);
        let features = shaper::to_features(&font.features);
        let row = p.row_mut(y);

        let ctx = ShapeContext {
            faces: &faces,
            font,
            fg_row,
            units: buffer_line,
            columns: buffer_line_column,
            attrs: *attributes,
            size_px: collection.size_px,
        };

        // Split the line into maximal runs of builtin vs regular text.
        let len = ctx.units.len();
        let builtin_enabled = font.builtin_glyphs;
        let mut segment_beg = 0;
        let mut custom = false;
        while segment_beg < len {
            let mut segment_end = segment_beg;
            loop {
                let (c, l) = collection::next_codepoint(ctx.units, segment_end);
                let cp = c.map_or(0xFFFD, u32::from);
                let is_custom = (builtin_enabled && builtin_glyphs::is_builtin_glyph(cp))
                    || builtin_glyphs::is_soft_font_char(cp);
                if is_custom != custom {
                    break;
                }
                segment_end += l;
                if segment_end >= len {
                    break;
                }
            }

            if segment_beg != segment_end {
                if custom {
                    map_builtin_glyphs(&ctx, row, segment_beg, segment_end);
                } else {
                    map_regular_text(&ctx, scratch, replacement, row, &features, segment_beg, segment_end);
                }
            }

            segment_beg = segment_end;
            custom = !custom;
        }

        buffer_line.clear();
        buffer_line_column.clear();
    }
}

/// Emit one glyph per code unit, the code unit value doubling as the
/// glyph index. The present layer routes these to the builtin glyph
/// generator via the `None` font run.
fn map_builtin_glyphs(ctx: &ShapeContext<'_>, row: &mut ShapedRow, beg: usize, end: usize) {
    let initial = row.glyph_indices.len() as u32;
    let shift = row.line_rendition.column_shift();
    let advance = (u32::from(ctx.font.cell_width) << shift) as f32;

    for (&unit, &col) in ctx.units[beg..end].iter().zip(&ctx.columns[beg..end]) {
        row.glyph_indices.push(unit);
        row.glyph_advances.push(advance);
        row.glyph_offsets.push(GlyphOffset::default());
        row.colors.push(ctx.color_at(col, shift));
    }

    row.push_mapping(None, initial, row.glyph_indices.len() as u32);
}

/// Map a run of ordinary text: font fallback over maximal prefixes, then
/// the simple one-glyph-per-unit path or the full shaper per prefix.
fn map_regular_text(
    ctx: &ShapeContext<'_>,
    scratch: &mut ShapeScratch,
    replacement: &mut ReplacementCharacter,
    row: &mut ShapedRow,
    features: &[rustybuzz::Feature],
    beg: usize,
    end: usize,
) {
    let mut idx = beg;
    while idx < end {
        let (mapped_len, mapped_face) =
            collection::map_characters(ctx.faces, &ctx.units[idx..end], ctx.attrs);
        let mapped_end = idx + mapped_len as usize;

        let Some(face_idx) = mapped_face else {
            map_replacement_character(ctx, replacement, row, idx, mapped_end);
            idx = mapped_end;
            continue;
        };
        let Some(face) = ctx.faces[usize::from(face_idx.0)].as_ref() else {
            idx = mapped_end;
            continue;
        };

        let initial = row.glyph_indices.len() as u32;

        if ctx.font.features.is_empty() {
            let mut pos = idx;
            while pos < mapped_end {
                scratch.glyph_indices.clear();
                let (simple, consumed) =
                    shaper::text_complexity(face, &ctx.units[pos..mapped_end], &mut scratch.glyph_indices);
                if simple {
                    push_simple_run(ctx, row, &scratch.glyph_indices, pos);
                } else {
                    map_complex(ctx, scratch, row, face, features, pos, consumed);
                }
                pos += consumed;
            }
        } else {
            map_complex(ctx, scratch, row, face, features, idx, mapped_end - idx);
        }

        row.push_mapping(Some(face_idx), initial, row.glyph_indices.len() as u32);
        idx = mapped_end;
    }
}

/// Append pre-looked-up glyph indices for a simple prefix: one glyph per
/// code unit, advance from the column span, color from the start column.
fn push_simple_run(ctx: &ShapeContext<'_>, row: &mut ShapedRow, indices: &[u16], pos: usize) {
    let shift = row.line_rendition.column_shift();
    for (i, &glyph_index) in indices.iter().enumerate() {
        let col1 = ctx.columns[pos + i];
        let col2 = ctx.columns[pos + i + 1];
        row.glyph_indices.push(glyph_index);
        row.glyph_advances.push(ctx.span_width(col1, col2, shift));
        row.glyph_offsets.push(GlyphOffset::default());
        row.colors.push(ctx.color_at(col1, shift));
    }
}

/// The complex path: itemize by script, shape each run, then walk the
/// cluster map to assign colors and snap each cluster's advance sum to
/// its exact column span.
fn map_complex(
    ctx: &ShapeContext<'_>,
    scratch: &mut ShapeScratch,
    row: &mut ShapedRow,
    face: &rustybuzz::Face<'_>,
    features: &[rustybuzz::Feature],
    start: usize,
    len: usize,
) {
    for run in shaper::analyze_script(ctx.units, start, len) {
        let units = &ctx.units[run.start..run.start + run.len];
        let mut retries = 0;
        let count = loop {
            match shaper::shape_run(
                face,
                units,
                run.start as u32,
                run.script,
                ctx.size_px,
                features,
                scratch,
            ) {
                Ok(n) => break n,
                Err(_) if retries < 8 => {
                    scratch.grow();
                    retries += 1;
                }
                Err(e) => {
                    log::warn!("dropping unshapeable run of {} units: {e}", run.len);
                    break 0;
                }
            }
        };
        if count == 0 {
            continue;
        }

        let shift = row.line_rendition.column_shift();
        let run_end = (run.start + run.len) as u32;

        // Cluster walk: clusters are monotonic for a forced-LTR buffer.
        let mut group_start = 0usize;
        for i in 1..=count {
            if i < count && scratch.clusters[i] == scratch.clusters[group_start] {
                continue;
            }
            let c1 = scratch.clusters[group_start] as usize;
            let c2 = if i < count { scratch.clusters[i] as usize } else { run_end as usize };
            let col1 = ctx.columns[c1];
            let col2 = ctx.columns[c2];

            let expected = f32::from(col2.saturating_sub(col1)) * f32::from(ctx.font.cell_width);
            let actual: f32 = scratch.advances[group_start..i].iter().sum();
            scratch.advances[i - 1] += expected - actual;

            let color = ctx.color_at(col1, shift);
            for _ in group_start..i {
                row.colors.push(color);
            }
            group_start = i;
        }

        let hscale = f32::from(row.line_rendition.horizontal_scale());
        let vscale = f32::from(row.line_rendition.vertical_scale());
        row.glyph_indices.extend_from_slice(&scratch.glyph_indices[..count]);
        for (&advance, offset) in scratch.advances[..count]
            .iter()
            .zip(&scratch.offsets[..count])
        {
            row.glyph_advances.push(advance * hscale);
            row.glyph_offsets.push(GlyphOffset {
                advance_offset: offset.advance_offset * hscale,
                ascender_offset: offset.ascender_offset * vscale,
            });
        }
    }
}

/// Draw U+FFFD for an unmappable range, one glyph per occupied column
/// span. When even U+FFFD has no face, the glyphs are dropped and the
/// frame continues.
fn map_replacement_character(
    ctx: &ShapeContext<'_>,
    replacement: &mut ReplacementCharacter,
    row: &mut ShapedRow,
    from: usize,
    to: usize,
) {
    if !replacement.looked_up {
        replacement.looked_up = true;
        if let Some(face_idx) = collection::face_for_char(ctx.faces, '\u{FFFD}', ctx.attrs) {
            let glyph = ctx.faces[usize::from(face_idx.0)]
                .as_ref()
                .and_then(|f| f.glyph_index('\u{FFFD}'))
                .map_or(0, |g| g.0);
            replacement.face = Some(face_idx);
            replacement.glyph = glyph;
        } else {
            log::warn!("no face covers U+FFFD; unmappable text will be dropped");
        }
    }

    let Some(face_idx) = replacement.face else { return };

    let initial = row.glyph_indices.len() as u32;
    let shift = row.line_rendition.column_shift();
    let mut pos = from;
    let mut col1 = ctx.columns[from];

    while pos < to {
        pos += 1;
        let col2 = ctx.columns[pos];
        if col1 == col2 {
            continue;
        }
        row.glyph_indices.push(replacement.glyph);
        row.glyph_advances.push(ctx.span_width(col1, col2, shift));
        row.glyph_offsets.push(GlyphOffset::default());
        row.colors.push(ctx.color_at(col1, shift));
        col1 = col2;
    }

    row.push_mapping(Some(face_idx), initial, row.glyph_indices.len() as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FontRequest, TextAttributes};
    use crate::font::{FontSource, FontSources};
    use crate::row::LineRendition;

    fn engine_with_font(cols: u16, rows: u16) -> Option<AtlasEngine> {
        let bytes = crate::font::test_util::test_font_bytes()?;
        let mut e = AtlasEngine::new();
        e.update_font(
            &FontSources {
                regular: Some(FontSource::new(bytes)),
                ..FontSources::default()
            },
            &FontRequest { family: "test".into(), size_pt: 12.0, weight: 400 },
        )
        .ok()?;
        e.update_viewport(cols, rows);
        Some(e)
    }

    #[test]
    fn simple_text_produces_one_glyph_per_cell() {
        let Some(mut e) = engine_with_font(8, 2) else { return };
        e.update_drawing_brushes(0x00ff_ffff, 0, TextAttributes::default(), false);
        e.start_paint();
        e.paint_buffer_line(
            &[Cluster { text: "a", columns: 1 }, Cluster { text: "b", columns: 1 }],
            0,
            0,
        );
        e.end_paint();

        e.with_payload(|_, p| {
            let cell_w = f32::from(p.settings.font.cell_width);
            let row = p.row(0);
            assert_eq!(row.glyph_indices.len(), 2);
            assert_eq!(row.glyph_advances, vec![cell_w, cell_w]);
            assert_eq!(row.colors, vec![0xffff_ffff, 0xffff_ffff]);
            assert_eq!(row.mappings.len(), 1);
            assert_eq!(row.mappings[0].glyphs_from, 0);
            assert_eq!(row.mappings[0].glyphs_to, 2);
            assert!(row.mappings[0].face.is_some());
            // Row consistency invariant.
            assert_eq!(row.glyph_offsets.len(), 2);
            assert!(row.glyph_advances.iter().all(|&a| a >= 0.0));
        });
    }

    #[test]
    fn builtin_glyphs_bypass_the_font() {
        let Some(mut e) = engine_with_font(8, 2) else { return };
        e.update_drawing_brushes(0x0012_3456, 0, TextAttributes::default(), false);
        e.start_paint();
        e.paint_buffer_line(&[Cluster { text: "─", columns: 1 }], 0, 0);
        e.end_paint();

        e.with_payload(|_, p| {
            let row = p.row(0);
            assert_eq!(row.glyph_indices, vec![0x2500]);
            assert_eq!(row.mappings.len(), 1);
            assert_eq!(row.mappings[0].face, None);
            assert_eq!(row.glyph_advances[0], f32::from(p.settings.font.cell_width));
            assert_eq!(row.colors[0], 0xff12_3456);
        });
    }

    #[test]
    fn mixed_segments_produce_separate_mappings() {
        let Some(mut e) = engine_with_font(8, 2) else { return };
        e.start_paint();
        e.paint_buffer_line(
            &[
                Cluster { text: "a", columns: 1 },
                Cluster { text: "│", columns: 1 },
                Cluster { text: "b", columns: 1 },
            ],
            0,
            0,
        );
        e.end_paint();

        e.with_payload(|_, p| {
            let row = p.row(0);
            assert_eq!(row.glyph_indices.len(), 3);
            assert_eq!(row.mappings.len(), 3);
            assert!(row.mappings[0].face.is_some());
            assert_eq!(row.mappings[1].face, None);
            assert!(row.mappings[2].face.is_some());
            // Runs partition the glyph list.
            assert_eq!(row.mappings[0].glyphs_to, row.mappings[1].glyphs_from);
            assert_eq!(row.mappings[1].glyphs_to, row.mappings[2].glyphs_from);
            assert_eq!(row.mappings[2].glyphs_to, 3);
        });
    }

    #[test]
    fn unmappable_text_falls_back_to_replacement() {
        let Some(mut e) = engine_with_font(8, 2) else { return };
        e.start_paint();
        // Plane-15 private use: no ordinary font covers it.
        e.paint_buffer_line(&[Cluster { text: "\u{F0000}", columns: 1 }], 0, 0);
        e.end_paint();

        e.with_payload(|_, p| {
            let row = p.row(0);
            // Either U+FFFD was drawn (1 glyph filling the column span)
            // or the font lacks it entirely and the glyphs were dropped.
            if let Some(&advance) = row.glyph_advances.first() {
                assert_eq!(row.glyph_indices.len(), 1);
                assert_eq!(advance, f32::from(p.settings.font.cell_width));
            } else {
                assert!(row.mappings.is_empty());
            }
        });
    }

    #[test]
    fn advances_respect_cluster_columns() {
        let Some(mut e) = engine_with_font(10, 2) else { return };
        e.start_paint();
        // A two-column cluster: its glyph advance must span two cells.
        e.paint_buffer_line(&[Cluster { text: "木", columns: 2 }], 0, 0);
        e.end_paint();

        e.with_payload(|_, p| {
            let row = p.row(0);
            let cell_w = f32::from(p.settings.font.cell_width);
            if row.glyph_indices.is_empty() {
                return; // Font doesn't cover CJK; replacement was dropped.
            }
            let total: f32 = row.glyph_advances.iter().sum();
            assert!(
                (total - 2.0 * cell_w).abs() < 0.01,
                "cluster advance snapped to its columns: {total} vs {}",
                2.0 * cell_w,
            );
        });
    }

    #[test]
    fn double_width_rendition_scales_advances() {
        let Some(mut e) = engine_with_font(10, 2) else { return };
        e.start_paint();
        e.prepare_line_transform(LineRendition::DoubleWidth, 0);
        e.paint_buffer_line(&[Cluster { text: "x", columns: 1 }], 0, 0);
        e.end_paint();

        e.with_payload(|_, p| {
            let row = p.row(0);
            assert_eq!(row.line_rendition, LineRendition::DoubleWidth);
            assert_eq!(row.glyph_advances[0], 2.0 * f32::from(p.settings.font.cell_width));
        });
    }

    #[test]
    fn flush_clears_the_buffer_line() {
        let Some(mut e) = engine_with_font(8, 2) else { return };
        e.start_paint();
        e.paint_buffer_line(&[Cluster { text: "abc", columns: 3 }], 0, 0);
        assert_eq!(e.api.buffer_line.len(), 3);
        e.end_paint();
        assert!(e.api.buffer_line.is_empty());
        assert!(e.api.buffer_line_column.is_empty());
    }

    #[test]
    fn row_change_flushes_previous_row() {
        let Some(mut e) = engine_with_font(8, 3) else { return };
        e.start_paint();
        e.paint_buffer_line(&[Cluster { text: "a", columns: 1 }], 0, 0);
        e.paint_buffer_line(&[Cluster { text: "b", columns: 1 }], 0, 1);
        e.with_payload(|_, p| {
            assert_eq!(p.row(0).glyph_indices.len(), 1, "row 0 flushed on row change");
        });
        e.end_paint();
        e.with_payload(|_, p| {
            assert_eq!(p.row(1).glyph_indices.len(), 1);
        });
    }

    #[test]
    fn attribute_change_splits_runs_not_rows() {
        let Some(mut e) = engine_with_font(8, 2) else { return };
        e.start_paint();
        e.update_drawing_brushes(0x00ff_ffff, 0, TextAttributes::default(), false);
        e.paint_buffer_line(&[Cluster { text: "a", columns: 1 }], 0, 0);
        e.update_drawing_brushes(
            0x00ff_ffff,
            0,
            TextAttributes { bold: true, ..TextAttributes::default() },
            false,
        );
        e.paint_buffer_line(&[Cluster { text: "b", columns: 1 }], 1, 0);
        e.end_paint();

        e.with_payload(|_, p| {
            let row = p.row(0);
            assert_eq!(row.glyph_indices.len(), 2, "both halves landed on the row");
        });
    }
}
