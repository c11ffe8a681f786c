//! Per-row shaped glyph data and decoration spans.

use bitflags::bitflags;

use crate::font::FaceIdx;

/// Per-row horizontal/vertical scale mode (DECDWL/DECDHL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LineRendition {
    #[default]
    SingleWidth = 0,
    DoubleWidth = 1,
    DoubleHeightTop = 2,
    DoubleHeightBottom = 3,
}

impl LineRendition {
    /// 1 for single-width rows, 2 for all double renditions.
    pub fn horizontal_scale(self) -> u16 {
        if self == Self::SingleWidth { 1 } else { 2 }
    }

    /// 1 normally, 2 for the double-height renditions.
    pub fn vertical_scale(self) -> u16 {
        if self >= Self::DoubleHeightTop { 2 } else { 1 }
    }

    /// Column shift: buffer columns map to `col << shift` bitmap cells.
    pub fn column_shift(self) -> u8 {
        u8::from(self != Self::SingleWidth)
    }
}

bitflags! {
    /// Grid line and underline decorations requested for a column range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GridLines: u16 {
        const LEFT                = 0b0000_0000_0001;
        const RIGHT               = 0b0000_0000_0010;
        const TOP                 = 0b0000_0000_0100;
        const BOTTOM              = 0b0000_0000_1000;
        const UNDERLINE           = 0b0000_0001_0000;
        const DOUBLE_UNDERLINE    = 0b0000_0010_0000;
        const CURLY_UNDERLINE     = 0b0000_0100_0000;
        const DOTTED_UNDERLINE    = 0b0000_1000_0000;
        const DASHED_UNDERLINE    = 0b0001_0000_0000;
        const HYPERLINK_UNDERLINE = 0b0010_0000_0000;
        const STRIKETHROUGH       = 0b0100_0000_0000;
    }
}

/// A horizontal/vertical/underline decoration span over `[from, to)`
/// viewport columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLineRange {
    pub lines: GridLines,
    pub gridline_color: u32,
    pub underline_color: u32,
    pub from: u16,
    pub to: u16,
}

/// A contiguous slice of a row's glyphs sharing one font face.
/// `face == None` designates the built-in glyph generator (the glyph
/// indices are then UTF-16 code units, not font glyph ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontRun {
    pub face: Option<FaceIdx>,
    pub glyphs_from: u32,
    pub glyphs_to: u32,
}

/// Subpixel offset of a glyph from its baseline pen position, pre-scaled
/// by the row's line rendition.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlyphOffset {
    pub advance_offset: f32,
    pub ascender_offset: f32,
}

/// A sixel-style image slice snapshot attached to a row.
#[derive(Debug, Clone, Default)]
pub struct BitmapSlice {
    pub revision: u64,
    pub source: Vec<u32>,
    pub source_width: i32,
    pub source_height: i32,
    /// Target cell column of the slice's left edge.
    pub target_offset: i32,
    /// Width in cells.
    pub target_width: i32,
    /// Re-armed by each `paint_image_slice`; slices that were not painted
    /// this frame are deactivated at `end_paint`.
    pub active: bool,
}

/// One viewport row of shaped glyph data.
///
/// The four glyph vectors are parallel: `glyph_indices.len() ==
/// glyph_advances.len() == glyph_offsets.len() == colors.len()`, and the
/// `mappings` runs partition `0..glyph_indices.len()`.
#[derive(Debug, Clone, Default)]
pub struct ShapedRow {
    pub mappings: Vec<FontRun>,
    pub glyph_indices: Vec<u16>,
    /// Horizontal advances in pixels, pre-scaled by the line rendition.
    pub glyph_advances: Vec<f32>,
    pub glyph_offsets: Vec<GlyphOffset>,
    /// Straight-alpha foreground color per glyph.
    pub colors: Vec<u32>,
    pub gridline_ranges: Vec<GridLineRange>,
    pub line_rendition: LineRendition,
    pub selection_from: u16,
    pub selection_to: u16,
    /// Vertical extent of everything this row drew last frame, in pixels.
    pub dirty_top: i32,
    pub dirty_bottom: i32,
    pub bitmap: Option<BitmapSlice>,
}

impl ShapedRow {
    /// Reset the row for new content at visual position `y`.
    /// The dirty span collapses back to the row's own cell extent.
    pub fn clear(&mut self, y: u16, cell_height: u16) {
        self.mappings.clear();
        self.glyph_indices.clear();
        self.glyph_advances.clear();
        self.glyph_offsets.clear();
        self.colors.clear();
        self.gridline_ranges.clear();
        self.line_rendition = LineRendition::SingleWidth;
        self.selection_from = 0;
        self.selection_to = 0;
        self.dirty_top = i32::from(y) * i32::from(cell_height);
        self.dirty_bottom = self.dirty_top + i32::from(cell_height);
    }

    /// Append a glyph run for `face`, merging with the previous run when
    /// the face repeats (font fallback can return the same face for
    /// consecutive prefixes).
    pub fn push_mapping(&mut self, face: Option<FaceIdx>, glyphs_from: u32, glyphs_to: u32) {
        if glyphs_to <= glyphs_from {
            return;
        }
        if let Some(last) = self.mappings.last_mut() {
            if last.face == face && last.glyphs_to == glyphs_from {
                last.glyphs_to = glyphs_to;
                return;
            }
        }
        self.mappings.push(FontRun { face, glyphs_from, glyphs_to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendition_scales() {
        assert_eq!(LineRendition::SingleWidth.horizontal_scale(), 1);
        assert_eq!(LineRendition::DoubleWidth.horizontal_scale(), 2);
        assert_eq!(LineRendition::DoubleWidth.vertical_scale(), 1);
        assert_eq!(LineRendition::DoubleHeightTop.vertical_scale(), 2);
        assert_eq!(LineRendition::DoubleHeightBottom.vertical_scale(), 2);
        assert_eq!(LineRendition::SingleWidth.column_shift(), 0);
        assert_eq!(LineRendition::DoubleHeightBottom.column_shift(), 1);
    }

    #[test]
    fn clear_resets_dirty_span_to_cell_extent() {
        let mut row = ShapedRow::default();
        row.dirty_top = -50;
        row.dirty_bottom = 900;
        row.glyph_indices.push(3);
        row.clear(2, 20);
        assert_eq!(row.dirty_top, 40);
        assert_eq!(row.dirty_bottom, 60);
        assert!(row.glyph_indices.is_empty());
    }

    #[test]
    fn push_mapping_merges_same_face() {
        let mut row = ShapedRow::default();
        row.push_mapping(Some(FaceIdx(0)), 0, 3);
        row.push_mapping(Some(FaceIdx(0)), 3, 7);
        assert_eq!(row.mappings.len(), 1);
        assert_eq!(row.mappings[0].glyphs_to, 7);

        row.push_mapping(None, 7, 8);
        assert_eq!(row.mappings.len(), 2);
        assert_eq!(row.mappings[1].face, None);
    }

    #[test]
    fn push_mapping_ignores_empty_runs() {
        let mut row = ShapedRow::default();
        row.push_mapping(Some(FaceIdx(1)), 4, 4);
        assert!(row.mappings.is_empty());
    }
}
