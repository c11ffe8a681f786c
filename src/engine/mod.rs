//! The producer API surface.
//!
//! All entry points run on the buffer-owning thread. State that only the
//! producer touches lives in [`ApiState`]; anything the render thread
//! needs goes through the shared [`RenderPayload`] behind the
//! [`FrameLink`] mutex, which producer methods hold only briefly.

mod highlight;
mod invalidation;
mod shaping;

use std::sync::Arc;

pub use highlight::PointSpan;
pub use shaping::Cluster;

use crate::color;
use crate::error::RenderError;
use crate::font::shaper::ShapeScratch;
use crate::font::{FaceIdx, FontAttributes, FontCollection, FontSources};
use crate::payload::{Rect, RenderPayload, RowRange};
use crate::row::{GridLineRange, GridLines, LineRendition};
use crate::settings::{
    AntialiasingMode, CursorKind, CursorSettings, FontAxis, FontFeature, FontSettings,
    Generational, GraphicsApi, Settings, INVERT_CURSOR_COLOR,
};
use crate::sync::FrameLink;

use highlight::SpanList;

/// Sentinel for "no rows invalidated": min/max accumulation narrows it.
pub(crate) const ROWS_NONE: RowRange = RowRange { start: u16::MAX, end: 0 };
/// Sentinel for "no cursor area invalidated".
pub(crate) const CURSOR_AREA_NONE: Rect = Rect {
    left: i32::MAX,
    top: i32::MAX,
    right: 0,
    bottom: 0,
};

/// Text attributes relevant to brush updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextAttributes {
    pub bold: bool,
    pub italic: bool,
    pub intense: bool,
}

/// A font resolution request. The concrete font bytes are injected
/// alongside via [`FontSources`]; this carries the logical parameters.
#[derive(Debug, Clone)]
pub struct FontRequest {
    pub family: String,
    /// Size in points; converted to pixels at the current DPI.
    pub size_pt: f32,
    pub weight: u16,
}

/// Arguments to [`AtlasEngine::paint_cursor`].
#[derive(Debug, Clone, Copy)]
pub struct CursorPaintOptions {
    pub col: i32,
    pub row: i32,
    pub kind: CursorKind,
    pub height_percent: u16,
    /// `None` means "invert the cell underneath".
    pub color: Option<u32>,
    pub is_double_width: bool,
    pub is_on: bool,
}

/// A sixel-style image slice handed to [`AtlasEngine::paint_image_slice`].
#[derive(Debug, Clone, Copy)]
pub struct ImageSlice<'a> {
    pub revision: u64,
    /// Row-major RGBA pixels, `pixel_width * cell_height` of them.
    pub pixels: &'a [u32],
    pub pixel_width: i32,
    /// Size of one cell of the image in pixels.
    pub cell_width: i32,
    pub cell_height: i32,
    /// Column of the slice's left edge, in buffer coordinates.
    pub column_offset: i32,
}

/// Highlight state for the upcoming frame.
#[derive(Debug, Clone, Default)]
pub struct HighlightInfo {
    pub search: Vec<PointSpan>,
    pub search_focused: Option<PointSpan>,
    pub selection: Vec<PointSpan>,
    pub selection_background: u32,
}

type WarningCallback = Box<dyn FnMut(RenderError) + Send>;
type TitleCallback = Box<dyn FnMut() + Send>;

/// Cached replacement-character lookup for shaping fallback.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReplacementCharacter {
    pub looked_up: bool,
    pub face: Option<FaceIdx>,
    pub glyph: u16,
}

/// Producer-thread state: invalidation accumulators, the assembled buffer
/// line, shaping scratch, and the producer's settings copy.
pub(crate) struct ApiState {
    pub settings: Generational<Settings>,
    pub invalidated_cursor_area: Rect,
    pub invalidated_rows: RowRange,
    pub invalidated_title: bool,
    pub scroll_offset: i32,
    pub viewport_offset_x: u16,
    pub viewport_offset_y: u16,
    /// Row range of this frame's dirty region, for highlight clipping.
    pub dirty_rows: RowRange,

    pub current_foreground: u32,
    pub current_background: u32,
    pub background_opaque_mixin: u32,
    pub intense_is_bold: bool,
    pub attributes: FontAttributes,
    pub line_rendition: LineRendition,
    pub last_paint_col: u16,
    pub last_paint_row: u16,

    /// The current row's text as UTF-16 code units.
    pub buffer_line: Vec<u16>,
    /// Starting terminal column per code unit, plus the past-the-end
    /// column (always one longer than `buffer_line` between paints).
    pub buffer_line_column: Vec<u16>,
    /// Foreground bitmap row snapshot for color sampling during shaping.
    pub fg_row: Vec<u32>,
    pub scratch: ShapeScratch,
    /// Per-attribute-combination variable font axes.
    pub axis_variants: [Vec<FontAxis>; 4],
    pub pending_features: Vec<FontFeature>,
    pub pending_axes: Vec<FontAxis>,

    pub search_highlights: SpanList,
    pub search_focused: SpanList,
    pub selection_spans: SpanList,

    pub replacement: ReplacementCharacter,
    pub collection: Option<FontCollection>,
    pub warning_callback: Option<WarningCallback>,
    pub title_callback: Option<TitleCallback>,
}

impl ApiState {
    fn new() -> Self {
        Self {
            settings: Generational::new(Settings::default()),
            invalidated_cursor_area: CURSOR_AREA_NONE,
            invalidated_rows: ROWS_NONE,
            invalidated_title: false,
            scroll_offset: 0,
            viewport_offset_x: 0,
            viewport_offset_y: 0,
            dirty_rows: RowRange::default(),
            current_foreground: 0xffff_ffff,
            current_background: 0xff00_0000,
            background_opaque_mixin: 0xff00_0000,
            intense_is_bold: true,
            attributes: FontAttributes::empty(),
            line_rendition: LineRendition::SingleWidth,
            last_paint_col: 0,
            last_paint_row: 0,
            buffer_line: Vec::new(),
            buffer_line_column: Vec::new(),
            fg_row: Vec::new(),
            scratch: ShapeScratch::new(),
            axis_variants: [const { Vec::new() }; 4],
            pending_features: Vec::new(),
            pending_axes: Vec::new(),
            search_highlights: SpanList::default(),
            search_focused: SpanList::default(),
            selection_spans: SpanList::default(),
            replacement: ReplacementCharacter::default(),
            collection: None,
            warning_callback: None,
            title_callback: None,
        }
    }

    pub(crate) fn warn(&mut self, err: RenderError) {
        log::warn!("renderer warning: {err}");
        if let Some(cb) = &mut self.warning_callback {
            cb(err);
        }
    }

    /// Recompute the four per-attribute-combination axis vectors.
    ///
    /// For axes the user did not set, `wght` defaults to the font weight
    /// (bold forces 700), `ital` to 1 when italic else 0, and `slnt` to
    /// -12 when italic else 0.
    pub(crate) fn recompute_axis_variants(&mut self) {
        let user = &self.settings.font.axes;
        if user.is_empty() {
            self.axis_variants = [const { Vec::new() }; 4];
            return;
        }

        let weight = f32::from(self.settings.font.font_weight);
        let user_value = |tag: &[u8; 4]| user.iter().find(|a| a.tag == *tag).map(|a| a.value);

        for i in 0..4 {
            let bold = i & 0b01 != 0;
            let italic = i & 0b10 != 0;
            let mut axes = user.clone();
            let mut set = |tag: [u8; 4], value: f32| {
                match axes.iter_mut().find(|a| a.tag == tag) {
                    Some(a) => a.value = value,
                    None => axes.push(FontAxis { tag, value }),
                }
            };
            set(
                *b"wght",
                if bold { 700.0 } else { user_value(b"wght").unwrap_or(weight) },
            );
            set(*b"ital", if italic { 1.0 } else { user_value(b"ital").unwrap_or(0.0) });
            set(*b"slnt", if italic { -12.0 } else { user_value(b"slnt").unwrap_or(0.0) });
            self.axis_variants[i] = axes;
        }
    }
}

/// The renderer's producer handle.
pub struct AtlasEngine {
    link: Arc<FrameLink>,
    pub(crate) api: ApiState,
}

impl AtlasEngine {
    pub fn new() -> Self {
        Self { link: FrameLink::new(), api: ApiState::new() }
    }

    /// The shared frame link; hand a clone to the render thread.
    pub fn link(&self) -> Arc<FrameLink> {
        Arc::clone(&self.link)
    }

    /// Run `f` with the payload locked. Producer methods use this for
    /// anything that touches shared frame state.
    pub(crate) fn with_payload<R>(
        &mut self,
        f: impl FnOnce(&mut ApiState, &mut RenderPayload) -> R,
    ) -> R {
        let link = Arc::clone(&self.link);
        let mut payload = link.payload.lock();
        f(&mut self.api, &mut payload)
    }

    pub fn set_warning_callback(&mut self, cb: WarningCallback) {
        self.api.warning_callback = Some(cb);
    }

    pub fn set_title_callback(&mut self, cb: TitleCallback) {
        self.api.title_callback = Some(cb);
    }

    pub fn set_antialiasing_mode(&mut self, mode: AntialiasingMode) {
        if self.api.settings.font.antialiasing_mode != mode {
            self.api.settings.write().font.write().antialiasing_mode = mode;
        }
    }

    pub fn set_graphics_api(&mut self, api: GraphicsApi) {
        if self.api.settings.target.graphics_api != api {
            self.api.settings.write().target.write().graphics_api = api;
        }
    }

    pub fn set_hardware_acceleration(&mut self, enabled: bool) {
        if self.api.settings.target.hardware_acceleration != enabled {
            self.api.settings.write().target.write().hardware_acceleration = enabled;
        }
    }

    /// Whether the default background is forced opaque. Controls the
    /// mixin OR'd into every background brush.
    pub fn set_background_opaque(&mut self, opaque: bool) {
        self.api.background_opaque_mixin = if opaque { 0xff00_0000 } else { 0 };
    }

    pub fn set_intense_is_bold(&mut self, enabled: bool) {
        self.api.intense_is_bold = enabled;
    }

    pub fn set_builtin_glyphs(&mut self, enabled: bool) {
        if self.api.settings.font.builtin_glyphs != enabled {
            self.api.settings.write().font.write().builtin_glyphs = enabled;
        }
    }

    /// Font features applied at the next `update_font`.
    pub fn set_font_features(&mut self, features: &[([u8; 4], u32)]) {
        self.api.pending_features = features
            .iter()
            .map(|&(tag, value)| FontFeature { tag, value })
            .collect();
    }

    /// Variable font axes applied at the next `update_font`.
    pub fn set_font_axes(&mut self, axes: &[([u8; 4], f32)]) {
        self.api.pending_axes = axes
            .iter()
            .map(|&(tag, value)| FontAxis { tag, value })
            .collect();
    }

    /// Resolve a font from the injected sources: measure the reference
    /// glyph `M`, derive cell geometry, and publish the new font
    /// settings. On failure the prior font stays in place and the error
    /// is reported through the warning callback.
    ///
    /// Returns the resolved `(cell_width, cell_height)`.
    pub fn update_font(
        &mut self,
        sources: &FontSources,
        request: &FontRequest,
    ) -> Result<(u16, u16), RenderError> {
        let api = &mut self.api;
        let dpi = api.settings.font.dpi;
        let size_pt = if request.size_pt > 0.0 { request.size_pt } else { 12.0 };
        let size_px = size_pt * f32::from(dpi) / 72.0;

        let collection = FontCollection::new(sources, size_px, dpi).map_err(|e| {
            api.warn(e.clone());
            e
        })?;
        let metrics = collection.resolve_metrics().map_err(|e| {
            api.warn(e.clone());
            e
        })?;

        let features = build_feature_list(&api.pending_features);
        let axes = api.pending_axes.clone();
        {
            let s = api.settings.write();
            let f = s.font.write();
            f.family = request.family.clone();
            f.font_size = size_px;
            f.font_weight = if request.weight != 0 { request.weight } else { 400 };
            f.cell_width = metrics.cell_width;
            f.cell_height = metrics.cell_height;
            f.advance_width = metrics.advance_width;
            f.baseline = metrics.baseline;
            f.descender = metrics.descender;
            f.thin_line_width = metrics.thin_line_width;
            f.underline = metrics.underline;
            f.strikethrough = metrics.strikethrough;
            f.double_underline = metrics.double_underline;
            f.overline = metrics.overline;
            f.grid_top = crate::settings::DecorationPosition {
                position: 0,
                height: metrics.thin_line_width,
            };
            f.grid_bottom = crate::settings::DecorationPosition {
                position: metrics.cell_height.saturating_sub(metrics.thin_line_width),
                height: metrics.thin_line_width,
            };
            f.grid_left = crate::settings::DecorationPosition {
                position: 0,
                height: metrics.thin_line_width,
            };
            f.grid_right = crate::settings::DecorationPosition {
                position: metrics.cell_width.saturating_sub(metrics.thin_line_width),
                height: metrics.thin_line_width,
            };
            f.features = features;
            f.axes = axes;
            s.target_width = s.viewport_cols.saturating_mul(metrics.cell_width);
            s.target_height = s.viewport_rows.saturating_mul(metrics.cell_height);
        }
        api.collection = Some(collection);
        api.recompute_axis_variants();
        api.replacement = ReplacementCharacter::default();
        api.scratch.reserve(usize::from(api.settings.viewport_cols) * 3 + 16);

        Ok((metrics.cell_width, metrics.cell_height))
    }

    /// Install a DRCS soft font bit pattern for U+EF20..U+EF80.
    pub fn update_soft_font(&mut self, pattern: &[u16], cell_width: u16, cell_height: u16) {
        let s = self.api.settings.write();
        let f = s.font.write();
        f.soft_font_pattern = pattern.to_vec();
        f.soft_font_cell_width = cell_width;
        f.soft_font_cell_height = cell_height;
    }

    pub fn update_dpi(&mut self, dpi: u16) {
        if self.api.settings.font.dpi != dpi && dpi != 0 {
            self.api.settings.write().font.write().dpi = dpi;
        }
    }

    /// Resize the viewport, in cells. The target size in pixels follows
    /// from the current cell geometry.
    pub fn update_viewport(&mut self, cols: u16, rows: u16) {
        let api = &mut self.api;
        let cols = cols.max(1);
        let rows = rows.max(1);
        if api.settings.viewport_cols == cols && api.settings.viewport_rows == rows {
            return;
        }
        let s = api.settings.write();
        s.viewport_cols = cols;
        s.viewport_rows = rows;
        s.target_width = cols.saturating_mul(s.font.cell_width);
        s.target_height = rows.saturating_mul(s.font.cell_height);
        api.scratch.reserve(usize::from(cols) * 3 + 16);
    }

    /// The viewport's position inside the text buffer, in cells.
    pub fn update_viewport_offset(&mut self, x: u16, y: u16) {
        self.api.viewport_offset_x = x;
        self.api.viewport_offset_y = y;
    }

    /// Resize to a window size in pixels: derives the viewport cell count
    /// from the current cell geometry. A zero size is ignored (a hidden
    /// window reports an empty client rect). Oversized coordinates fail
    /// the narrowing instead of wrapping.
    pub fn update_window_size(&mut self, width_px: u32, height_px: u32) -> Result<(), RenderError> {
        if width_px == 0 || height_px == 0 {
            return Ok(());
        }
        let width = u16::try_from(width_px).map_err(|_| RenderError::ArithmeticOverflow)?;
        let height = u16::try_from(height_px).map_err(|_| RenderError::ArithmeticOverflow)?;

        let api = &mut self.api;
        let cell_w = api.settings.font.cell_width.max(1);
        let cell_h = api.settings.font.cell_height.max(1);
        let cols = (width / cell_w).max(1);
        let rows = (height / cell_h).max(1);
        if api.settings.viewport_cols != cols || api.settings.viewport_rows != rows {
            let s = api.settings.write();
            s.viewport_cols = cols;
            s.viewport_rows = rows;
            s.target_width = cols.saturating_mul(cell_w);
            s.target_height = rows.saturating_mul(cell_h);
            api.scratch.reserve(usize::from(cols) * 3 + 16);
        }
        Ok(())
    }

    /// Install this frame's highlight spans, clipped against the dirty
    /// row range, and derive the selection colors.
    pub fn prepare_render_info(&mut self, info: &HighlightInfo) {
        self.with_payload(|api, p| {
            let dirty_top = i32::from(api.dirty_rows.start) + i32::from(api.viewport_offset_y);
            let dirty_bottom = i32::from(api.dirty_rows.end) + i32::from(api.viewport_offset_y);
            let overlaps =
                |s: &PointSpan| s.end_row >= dirty_top && s.start_row < dirty_bottom;

            api.search_highlights
                .set(info.search.iter().filter(|s| overlaps(s)).copied());
            api.search_focused
                .set(info.search_focused.iter().filter(|s| overlaps(s)).copied());
            api.selection_spans
                .set(info.selection.iter().filter(|s| overlaps(s)).copied());

            let selection_color = info.selection_background | 0xff00_0000;
            if api.settings.misc.selection_color != selection_color {
                let foreground = if color::luminosity(selection_color) < 0.5 {
                    0xffff_ffff
                } else {
                    0xff00_0000
                };
                let am = api.settings.write().misc.write();
                am.selection_color = selection_color;
                am.selection_foreground = foreground;
                // The payload copied misc at start_paint; keep the two in
                // lockstep so this frame's fills already use the new colors.
                let pm = p.settings.write().misc.write();
                pm.selection_color = selection_color;
                pm.selection_foreground = foreground;
            }
        });
    }

    /// Update the brushes used by subsequent `paint_buffer_line` calls.
    /// A change of font-relevant attributes mid-line flushes the pending
    /// line first.
    pub fn update_drawing_brushes(
        &mut self,
        foreground: u32,
        background: u32,
        attrs: TextAttributes,
        is_default_brushes: bool,
    ) {
        let fg = foreground | 0xff00_0000;
        let bg = background | self.api.background_opaque_mixin;

        if is_default_brushes {
            let api = &mut self.api;
            if api.settings.misc.background_color != bg {
                api.settings.write().misc.write().background_color = bg;
            }
            if api.settings.misc.foreground_color != fg {
                api.settings.write().misc.write().foreground_color = fg;
            }
            return;
        }

        let mut attributes = FontAttributes::empty();
        attributes.set(
            FontAttributes::BOLD,
            attrs.bold || (attrs.intense && self.api.intense_is_bold),
        );
        attributes.set(FontAttributes::ITALIC, attrs.italic);

        if self.api.attributes != attributes {
            self.with_payload(|api, p| api.flush_buffer_line(p));
        }

        self.api.current_foreground = fg;
        self.api.current_background = bg;
        self.api.attributes = attributes;
    }

    /// Commit the row's line rendition before its glyphs are painted.
    /// Changing the rendition mid-row is not supported.
    pub fn prepare_line_transform(&mut self, rendition: LineRendition, row: i32) {
        self.with_payload(|api, p| {
            let max_row = p.settings.viewport_rows.saturating_sub(1);
            let y = row.clamp(0, i32::from(max_row)) as u16;
            p.row_mut(y).line_rendition = rendition;
            api.line_rendition = rendition;
        });
    }

    /// Append grid line decorations for `count` cells starting at the
    /// given buffer coordinate.
    pub fn paint_buffer_grid_lines(
        &mut self,
        lines: GridLines,
        gridline_color: u32,
        underline_color: u32,
        count: usize,
        col: i32,
        row: i32,
    ) {
        if lines.is_empty() {
            return;
        }
        self.with_payload(|api, p| {
            let cols = i32::from(p.settings.viewport_cols);
            let max_row = p.settings.viewport_rows.saturating_sub(1);
            let shift = api.line_rendition.column_shift();
            let x = (col - (i32::from(api.viewport_offset_x) >> shift)).max(0);
            let y = row.clamp(0, i32::from(max_row)) as u16;
            let from = (x << shift).clamp(0, cols - 1) as u16;
            let to = ((x + count as i32) << shift).clamp(i32::from(from), cols) as u16;
            p.row_mut(y).gridline_ranges.push(GridLineRange {
                lines,
                gridline_color: gridline_color | 0xff00_0000,
                underline_color: underline_color | 0xff00_0000,
                from,
                to,
            });
        });
    }

    /// Update the cursor settings and, when visible, the cursor rectangle.
    pub fn paint_cursor(&mut self, options: &CursorPaintOptions) {
        let options = *options;
        self.with_payload(|api, p| {
            // There is no call after the last paint_buffer_line of a frame,
            // so flush here to be sure the row is shaped.
            api.flush_buffer_line(p);

            let cached = CursorSettings {
                color: options.color.map_or(INVERT_CURSOR_COLOR, |c| c | 0xff00_0000),
                kind: options.kind,
                height_percent: options.height_percent,
            };
            if *api.settings.cursor != cached {
                *api.settings.write().cursor.write() = cached;
                *p.settings.write().cursor.write() = cached;
            }

            if !options.is_on {
                return;
            }

            let cols = i32::from(p.settings.viewport_cols);
            let rows = i32::from(p.settings.viewport_rows);
            let cell_w = i32::from(p.settings.font.cell_width);
            let cell_h = i32::from(p.settings.font.cell_height);

            let width = 1 + i32::from(
                options.is_double_width && options.kind != CursorKind::VerticalBar,
            );
            let top = options.row;
            let bottom = top + 1;
            let row_for_shift = top.clamp(0, rows - 1) as u16;
            let shift = p.row(row_for_shift).line_rendition.column_shift();
            let mut left = options.col - (i32::from(api.viewport_offset_x) >> shift);
            let mut right = left + width;
            left <<= shift;
            right <<= shift;

            p.cursor_rect = Rect {
                left: left.max(0),
                top: top.max(0),
                right: right.min(cols),
                bottom: bottom.min(rows),
            };

            if p.cursor_rect.non_empty() {
                let d = &mut p.dirty_rect_px;
                d.left = d.left.min(left * cell_w);
                d.top = d.top.min(top * cell_h);
                d.right = d.right.max(right * cell_w);
                d.bottom = d.bottom.max(bottom * cell_h);
            }
        });
    }

    /// Snapshot an image slice into its row. The pixel copy only happens
    /// when the slice revision changed.
    pub fn paint_image_slice(&mut self, slice: &ImageSlice<'_>, target_row: i32, viewport_left: i32) {
        let revision = slice.revision;
        let src_width = slice.pixel_width.max(0);
        let src_height = slice.cell_height.max(0);
        let expected = src_width as usize * src_height as usize;
        if slice.pixels.len() != expected || slice.cell_width <= 0 {
            debug_assert!(false, "image slice pixel count mismatch");
            return;
        }
        self.with_payload(|_, p| {
            let max_row = p.settings.viewport_rows.saturating_sub(1);
            let y = target_row.clamp(0, i32::from(max_row)) as u16;
            let row = p.row_mut(y);
            let bitmap = row.bitmap.get_or_insert_default();
            if bitmap.revision != revision {
                bitmap.source.clear();
                bitmap.source.extend_from_slice(slice.pixels);
                bitmap.revision = revision;
                bitmap.source_width = src_width;
                bitmap.source_height = src_height;
            }
            bitmap.target_offset = slice.column_offset - viewport_left;
            bitmap.target_width = src_width / slice.cell_width;
            bitmap.active = true;
        });
    }

    /// Whether a cluster's shaped advance exceeds one cell.
    pub fn is_glyph_wide(&self, text: &str) -> Result<bool, RenderError> {
        let collection = self.api.collection.as_ref().ok_or(RenderError::InvalidArgument)?;
        let advance = collection.measure_advance(text);
        Ok(advance.ceil() as i32 > i32::from(self.api.settings.font.cell_width))
    }

    /// Current cell size in pixels.
    pub fn font_size(&self) -> (u16, u16) {
        let f: &FontSettings = &self.api.settings.font;
        (f.cell_width, f.cell_height)
    }
}

impl Default for AtlasEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Combine user features with the defaults the shaper would otherwise
/// apply. An empty user set stays empty: the shaper's own defaults
/// (ligatures, kerning, contextual alternates) already cover it.
fn build_feature_list(user: &[FontFeature]) -> Vec<FontFeature> {
    if user.is_empty() {
        return Vec::new();
    }
    const DEFAULTS: [[u8; 4]; 4] = [*b"liga", *b"clig", *b"kern", *b"calt"];
    let mut features = user.to_vec();
    for tag in DEFAULTS {
        if !user.iter().any(|f| f.tag == tag) {
            features.push(FontFeature { tag, value: 1 });
        }
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::TILE_FOREGROUND;

    #[test]
    fn feature_list_empty_stays_empty() {
        assert!(build_feature_list(&[]).is_empty());
    }

    #[test]
    fn feature_list_fills_unset_defaults() {
        let user = [FontFeature { tag: *b"liga", value: 0 }];
        let features = build_feature_list(&user);
        assert_eq!(features.len(), 4);
        assert_eq!(features[0], FontFeature { tag: *b"liga", value: 0 });
        assert!(features.iter().any(|f| f.tag == *b"kern" && f.value == 1));
        assert!(features.iter().any(|f| f.tag == *b"calt" && f.value == 1));
    }

    #[test]
    fn axis_variants_default_weight_italic_slant() {
        let mut api = ApiState::new();
        api.settings.write().font.write().axes =
            vec![FontAxis { tag: *b"opsz", value: 14.0 }];
        api.recompute_axis_variants();

        let regular = &api.axis_variants[0];
        assert!(regular.iter().any(|a| a.tag == *b"opsz" && a.value == 14.0));
        assert!(regular.iter().any(|a| a.tag == *b"wght" && a.value == 400.0));
        assert!(regular.iter().any(|a| a.tag == *b"ital" && a.value == 0.0));

        let bold_italic = &api.axis_variants[3];
        assert!(bold_italic.iter().any(|a| a.tag == *b"wght" && a.value == 700.0));
        assert!(bold_italic.iter().any(|a| a.tag == *b"ital" && a.value == 1.0));
        assert!(bold_italic.iter().any(|a| a.tag == *b"slnt" && a.value == -12.0));
    }

    #[test]
    fn axis_variants_empty_without_user_axes() {
        let mut api = ApiState::new();
        api.recompute_axis_variants();
        assert!(api.axis_variants.iter().all(Vec::is_empty));
    }

    #[test]
    fn brush_update_applies_opaque_mixin() {
        let mut engine = AtlasEngine::new();
        engine.update_drawing_brushes(0x0012_3456, 0x0065_4321, TextAttributes::default(), false);
        assert_eq!(engine.api.current_foreground, 0xff12_3456);
        assert_eq!(engine.api.current_background, 0xff65_4321);

        engine.set_background_opaque(false);
        engine.update_drawing_brushes(0x0012_3456, 0x0065_4321, TextAttributes::default(), false);
        assert_eq!(engine.api.current_background, 0x0065_4321);
    }

    #[test]
    fn intense_promotes_to_bold_when_enabled() {
        let mut engine = AtlasEngine::new();
        let attrs = TextAttributes { intense: true, ..TextAttributes::default() };
        engine.update_drawing_brushes(0, 0, attrs, false);
        assert!(engine.api.attributes.contains(FontAttributes::BOLD));

        engine.set_intense_is_bold(false);
        engine.update_drawing_brushes(0, 0, attrs, false);
        assert!(!engine.api.attributes.contains(FontAttributes::BOLD));
    }

    #[test]
    fn window_size_derives_cell_count_and_rejects_overflow() {
        let mut engine = AtlasEngine::new();
        {
            let s = engine.api.settings.write();
            let f = s.font.write();
            f.cell_width = 8;
            f.cell_height = 16;
        }
        engine.update_window_size(640, 480).expect("valid size");
        assert_eq!(engine.api.settings.viewport_cols, 80);
        assert_eq!(engine.api.settings.viewport_rows, 30);
        assert_eq!(engine.api.settings.target_width, 640);

        // Win+D reports a 0x0 client rect; that must not tear down state.
        engine.update_window_size(0, 0).expect("zero size ignored");
        assert_eq!(engine.api.settings.viewport_cols, 80);

        assert_eq!(
            engine.update_window_size(100_000, 480),
            Err(RenderError::ArithmeticOverflow),
        );
    }

    #[test]
    fn default_brushes_update_misc_settings() {
        let mut engine = AtlasEngine::new();
        let gen0 = engine.api.settings.generation();
        engine.update_drawing_brushes(0x00aa_bbcc, 0x0011_2233, TextAttributes::default(), true);
        assert_eq!(engine.api.settings.misc.background_color, 0xff11_2233);
        assert_eq!(engine.api.settings.misc.foreground_color, 0xffaa_bbcc);
        assert!(engine.api.settings.generation() > gen0);
    }

    #[test]
    fn grid_lines_land_on_the_target_row() {
        let mut engine = AtlasEngine::new();
        engine.update_viewport(10, 4);
        engine.start_paint();
        engine.paint_buffer_grid_lines(GridLines::UNDERLINE, 0x123456, 0x654321, 3, 2, 1);
        engine.with_payload(|_, p| {
            let row = p.row(1);
            assert_eq!(row.gridline_ranges.len(), 1);
            let r = &row.gridline_ranges[0];
            assert_eq!((r.from, r.to), (2, 5));
            assert_eq!(r.underline_color, 0xff65_4321);
            assert!(r.lines.contains(GridLines::UNDERLINE));
        });
        engine.end_paint();
    }

    #[test]
    fn cursor_paint_sets_rect_and_dirty() {
        let mut engine = AtlasEngine::new();
        engine.update_viewport(10, 4);
        engine.start_paint();
        engine.paint_cursor(&CursorPaintOptions {
            col: 5,
            row: 1,
            kind: CursorKind::FullBox,
            height_percent: 20,
            color: None,
            is_double_width: false,
            is_on: true,
        });
        engine.with_payload(|_, p| {
            assert_eq!(p.cursor_rect, Rect::new(5, 1, 6, 2));
            assert_eq!(*p.settings.cursor, CursorSettings {
                color: INVERT_CURSOR_COLOR,
                kind: CursorKind::FullBox,
                height_percent: 20,
            });
        });
        engine.end_paint();
    }

    #[test]
    fn cursor_off_leaves_rect_empty() {
        let mut engine = AtlasEngine::new();
        engine.update_viewport(10, 4);
        engine.start_paint();
        engine.paint_cursor(&CursorPaintOptions {
            col: 5,
            row: 1,
            kind: CursorKind::Legacy,
            height_percent: 20,
            color: Some(0x00ff_0000),
            is_double_width: false,
            is_on: false,
        });
        engine.with_payload(|_, p| {
            assert!(p.cursor_rect.empty());
            assert_eq!(p.settings.cursor.color, 0xffff_0000);
        });
        engine.end_paint();
    }

    #[test]
    fn image_slice_copies_once_per_revision() {
        let mut engine = AtlasEngine::new();
        engine.update_viewport(10, 4);
        let pixels = vec![0xff00_00ffu32; 8 * 2];
        let slice = ImageSlice {
            revision: 7,
            pixels: &pixels,
            pixel_width: 8,
            cell_width: 4,
            cell_height: 2,
            column_offset: 3,
        };
        engine.start_paint();
        engine.paint_image_slice(&slice, 2, 1);
        engine.with_payload(|_, p| {
            let b = p.row(2).bitmap.as_ref().expect("bitmap");
            assert_eq!(b.revision, 7);
            assert_eq!(b.source.len(), 16);
            assert_eq!(b.target_offset, 2);
            assert_eq!(b.target_width, 2);
            assert!(b.active);
        });
        engine.end_paint();
    }

    #[test]
    fn stale_image_slice_deactivates_at_end_paint() {
        let mut engine = AtlasEngine::new();
        engine.update_viewport(10, 4);
        let pixels = vec![0u32; 4];
        let slice = ImageSlice {
            revision: 1,
            pixels: &pixels,
            pixel_width: 2,
            cell_width: 1,
            cell_height: 2,
            column_offset: 0,
        };
        engine.start_paint();
        engine.paint_image_slice(&slice, 0, 0);
        engine.end_paint();

        // Render thread consumed the slice and cleared `active`.
        engine.with_payload(|_, p| {
            p.row_mut(0).bitmap.as_mut().expect("bitmap").active = false;
        });

        // Next frame doesn't repaint the slice: it is dropped.
        engine.start_paint();
        engine.end_paint();
        engine.with_payload(|_, p| assert!(p.row(0).bitmap.is_none()));
    }

    #[test]
    fn selection_colors_derive_foreground() {
        let mut engine = AtlasEngine::new();
        engine.update_viewport(8, 2);
        engine.start_paint();
        engine.prepare_render_info(&HighlightInfo {
            selection_background: 0x0000_0000, // black selection
            ..HighlightInfo::default()
        });
        assert_eq!(engine.api.settings.misc.selection_color, 0xff00_0000);
        assert_eq!(engine.api.settings.misc.selection_foreground, 0xffff_ffff);
        engine.end_paint();
    }

    #[test]
    fn fill_color_bitmap_applies_premultiplied_background() {
        // §8 color mapping: after a brush update and a painted line, the
        // foreground CB holds fg|ff000000 and the background CB holds
        // premultiply(bg|mixin).
        let mut engine = AtlasEngine::new();
        engine.update_viewport(6, 2);
        engine.set_background_opaque(false);
        engine.update_drawing_brushes(0x0011_2233, 0x8044_5566, TextAttributes::default(), false);
        engine.start_paint();
        engine.paint_buffer_line(
            &[Cluster { text: "ab", columns: 2 }],
            1,
            0,
        );
        engine.with_payload(|_, p| {
            let fg = p.tile_row(TILE_FOREGROUND, 0);
            assert_eq!(fg[1], 0xff11_2233);
            assert_eq!(fg[2], 0xff11_2233);
            assert_eq!(fg[0], 0, "columns before the span untouched");
            let bg = p.tile_row(crate::payload::TILE_BACKGROUND, 0);
            assert_eq!(bg[1], crate::color::premultiply(0x8044_5566));
        });
        engine.end_paint();
    }
}
