//! Font face storage and fallback mapping.
//!
//! The host injects raw font bytes (font enumeration and file loading are
//! host concerns); the collection keeps them alive in `Arc`s so transient
//! `rustybuzz` faces can borrow them during shaping and the render thread
//! can rasterize from the same snapshot via [`FontStore`].

use std::sync::Arc;

use crate::error::RenderError;
use crate::settings::{DecorationPosition, FontAxis};

use super::{FaceIdx, FontAttributes};

/// Raw bytes of one font file plus the face index within a collection
/// file (0 for plain .ttf/.otf).
#[derive(Debug, Clone)]
pub struct FontSource {
    pub bytes: Arc<Vec<u8>>,
    pub face_index: u32,
}

impl FontSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes: Arc::new(bytes), face_index: 0 }
    }
}

/// The font data handed to `update_font`.
#[derive(Debug, Clone, Default)]
pub struct FontSources {
    pub regular: Option<FontSource>,
    pub bold: Option<FontSource>,
    pub italic: Option<FontSource>,
    pub bold_italic: Option<FontSource>,
    pub fallbacks: Vec<FontSource>,
}

/// Immutable face snapshot shared with the render thread.
///
/// Slots `0..4` hold the primary style variants (absent variants are
/// `None`); fallbacks follow. [`FaceIdx`] values index this table, which
/// doubles as the integer-keyed face arena the atlas maps are keyed by.
#[derive(Debug, Default)]
pub struct FontStore {
    slots: Vec<Option<FontSource>>,
}

impl FontStore {
    fn from_sources(sources: &FontSources) -> Self {
        let mut slots = vec![
            sources.regular.clone(),
            sources.bold.clone(),
            sources.italic.clone(),
            sources.bold_italic.clone(),
        ];
        slots.extend(sources.fallbacks.iter().cloned().map(Some));
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn source(&self, idx: FaceIdx) -> Option<&FontSource> {
        self.slots.get(usize::from(idx.0)).and_then(Option::as_ref)
    }

    /// A swash view of the face for rasterization.
    pub fn swash_ref(&self, idx: FaceIdx) -> Option<swash::FontRef<'_>> {
        let src = self.source(idx)?;
        swash::FontRef::from_index(&src.bytes, src.face_index as usize)
    }

    /// A transient rustybuzz face borrowing the stored bytes.
    pub fn shaping_face(&self, idx: FaceIdx) -> Option<rustybuzz::Face<'_>> {
        let src = self.source(idx)?;
        rustybuzz::Face::from_slice(&src.bytes, src.face_index)
    }
}

/// Cell geometry and decoration metrics derived from the regular face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMetrics {
    pub cell_width: u16,
    pub cell_height: u16,
    pub advance_width: u16,
    pub baseline: u16,
    pub descender: u16,
    pub thin_line_width: u16,
    pub underline: DecorationPosition,
    pub strikethrough: DecorationPosition,
    pub double_underline: [DecorationPosition; 2],
    pub overline: DecorationPosition,
}

/// Producer-side font service: fallback mapping, metrics, measurement.
pub struct FontCollection {
    store: Arc<FontStore>,
    /// Em size in device pixels.
    pub size_px: f32,
    pub dpi: u16,
}

impl FontCollection {
    /// Build a collection from injected font bytes. Fails with
    /// [`RenderError::NoFontFace`] when the regular face is missing or
    /// unparsable.
    pub fn new(sources: &FontSources, size_px: f32, dpi: u16) -> Result<Self, RenderError> {
        let store = Arc::new(FontStore::from_sources(sources));
        if store.shaping_face(FaceIdx(0)).is_none() {
            return Err(RenderError::NoFontFace);
        }
        Ok(Self { store, size_px, dpi })
    }

    pub fn store(&self) -> &Arc<FontStore> {
        &self.store
    }

    /// Derive cell geometry from the regular face. The reference layout is
    /// the advance of `M`; the line gap is split evenly around the cell.
    pub fn resolve_metrics(&self) -> Result<ResolvedMetrics, RenderError> {
        let face = self
            .store
            .shaping_face(FaceIdx(0))
            .ok_or(RenderError::NoFontFace)?;

        let upem = face.units_per_em() as f32;
        let scale = self.size_px / upem;
        let ascent = f32::from(face.ascender()) * scale;
        let descent = f32::from(-face.descender()) * scale;
        let line_gap = f32::from(face.line_gap()) * scale;

        let cell_height = (ascent + descent + line_gap).ceil().max(1.0) as u16;
        let baseline = (ascent + line_gap / 2.0).ceil() as u16;
        let baseline = baseline.min(cell_height);
        let descender = cell_height - baseline;

        let advance = face
            .glyph_index('M')
            .and_then(|gid| face.glyph_hor_advance(gid))
            .map_or(self.size_px / 2.0, |adv| f32::from(adv) * scale);
        let cell_width = advance.ceil().max(1.0) as u16;

        let thin_line_width = ((f32::from(self.dpi) / 96.0).round() as u16).max(1);

        let line_pos = |offset_units: f32, thickness_units: f32| {
            let position = (f32::from(baseline) - offset_units * scale).round();
            let height = (thickness_units * scale).round().max(1.0) as u16;
            DecorationPosition {
                position: position.clamp(0.0, f32::from(cell_height - 1)) as u16,
                height: height.min(cell_height),
            }
        };

        let underline = face.underline_metrics().map_or(
            DecorationPosition {
                position: baseline + descender / 2,
                height: thin_line_width,
            },
            |m| line_pos(f32::from(m.position), f32::from(m.thickness)),
        );
        let strikethrough = face.strikeout_metrics().map_or(
            DecorationPosition {
                position: cell_height / 2,
                height: thin_line_width,
            },
            |m| line_pos(f32::from(m.position), f32::from(m.thickness)),
        );

        // The two double-underline lines straddle the single underline
        // position, one thin line apart, clamped into the cell.
        let du_top = underline.position.saturating_sub(thin_line_width);
        let du_bottom = (underline.position + thin_line_width)
            .min(cell_height.saturating_sub(thin_line_width));
        let double_underline = [
            DecorationPosition { position: du_top, height: thin_line_width },
            DecorationPosition {
                position: du_bottom.max(du_top + thin_line_width),
                height: thin_line_width,
            },
        ];

        Ok(ResolvedMetrics {
            cell_width,
            cell_height,
            advance_width: cell_width,
            baseline,
            descender,
            thin_line_width,
            underline,
            strikethrough,
            double_underline,
            overline: DecorationPosition { position: 0, height: thin_line_width },
        })
    }

    /// Create transient shaping faces for every slot, with the given
    /// variable-font axes applied. Index-parallel to the store.
    pub fn create_shaping_faces(&self, axes: &[FontAxis]) -> Vec<Option<rustybuzz::Face<'_>>> {
        (0..self.store.len())
            .map(|i| {
                let mut face = self.store.shaping_face(FaceIdx(i as u16))?;
                for axis in axes {
                    let tag = rustybuzz::ttf_parser::Tag::from_bytes(&axis.tag);
                    // Ignored for non-variable faces.
                    let _ = face.set_variation(tag, axis.value);
                }
                Some(face)
            })
            .collect()
    }

    /// Total shaped advance of `text` with the regular face, in pixels.
    /// Used by the wide-glyph probe.
    pub fn measure_advance(&self, text: &str) -> f32 {
        let Some(face) = self.store.shaping_face(FaceIdx(0)) else {
            return 0.0;
        };
        let scale = self.size_px / face.units_per_em() as f32;
        let mut buffer = rustybuzz::UnicodeBuffer::new();
        buffer.push_str(text);
        buffer.set_direction(rustybuzz::Direction::LeftToRight);
        let glyphs = rustybuzz::shape(&face, &[], buffer);
        glyphs
            .glyph_positions()
            .iter()
            .map(|p| p.x_advance as f32 * scale)
            .sum()
    }
}

/// Decode one code point from a UTF-16 buffer at `i`.
/// Returns `None` for unpaired surrogates (consuming one unit).
pub fn next_codepoint(units: &[u16], i: usize) -> (Option<char>, usize) {
    let u = units[i];
    if (0xD800..0xDC00).contains(&u) {
        if let Some(&lo) = units.get(i + 1) {
            if (0xDC00..0xE000).contains(&lo) {
                let cp = 0x10000 + ((u32::from(u) - 0xD800) << 10) + (u32::from(lo) - 0xDC00);
                return (char::from_u32(cp), 2);
            }
        }
        (None, 1)
    } else if (0xDC00..0xE000).contains(&u) {
        (None, 1)
    } else {
        (char::from_u32(u32::from(u)), 1)
    }
}

/// Find the face covering `c` under the given attributes: requested style
/// variant first, then regular, then the fallback chain.
pub fn face_for_char(
    faces: &[Option<rustybuzz::Face<'_>>],
    c: char,
    attrs: FontAttributes,
) -> Option<FaceIdx> {
    let covers = |i: usize| {
        faces
            .get(i)
            .and_then(Option::as_ref)
            .is_some_and(|f| f.glyph_index(c).is_some())
    };

    let variant = attrs.variant_index();
    if covers(variant) {
        return Some(FaceIdx(variant as u16));
    }
    if variant != 0 && covers(0) {
        return Some(FaceIdx(0));
    }
    for i in 4..faces.len() {
        if covers(i) {
            return Some(FaceIdx(i as u16));
        }
    }
    None
}

/// Map the longest prefix of `units` that one face covers (or that no
/// face covers, yielding `None`). Returns the prefix length in code
/// units and the face.
pub fn map_characters(
    faces: &[Option<rustybuzz::Face<'_>>],
    units: &[u16],
    attrs: FontAttributes,
) -> (u32, Option<FaceIdx>) {
    debug_assert!(!units.is_empty());

    let (first, first_len) = next_codepoint(units, 0);
    let target = first.and_then(|c| face_for_char(faces, c, attrs));
    let mut len = first_len;

    while len < units.len() {
        let (c, l) = next_codepoint(units, len);
        let face = c.and_then(|ch| face_for_char(faces, ch, attrs));
        if face != target {
            break;
        }
        len += l;
    }

    (len as u32, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::test_util::test_collection;

    #[test]
    fn missing_regular_face_is_an_error() {
        let err = FontCollection::new(&FontSources::default(), 16.0, 96);
        assert!(matches!(err, Err(RenderError::NoFontFace)));
    }

    #[test]
    fn next_codepoint_decodes_bmp_and_pairs() {
        let units: Vec<u16> = "a€😀".encode_utf16().collect();
        let (c, l) = next_codepoint(&units, 0);
        assert_eq!((c, l), (Some('a'), 1));
        let (c, l) = next_codepoint(&units, 1);
        assert_eq!((c, l), (Some('€'), 1));
        let (c, l) = next_codepoint(&units, 2);
        assert_eq!((c, l), (Some('😀'), 2));
    }

    #[test]
    fn next_codepoint_rejects_lone_surrogate() {
        let units = [0xD800u16, 0x0041];
        let (c, l) = next_codepoint(&units, 0);
        assert_eq!((c, l), (None, 1));
    }

    #[test]
    fn metrics_are_positive() {
        let Some(fc) = test_collection() else { return };
        let m = fc.resolve_metrics().expect("metrics");
        assert!(m.cell_width > 0);
        assert!(m.cell_height >= m.baseline);
        assert!(m.baseline > 0);
        assert_eq!(m.cell_height, m.baseline + m.descender);
        assert!(m.underline.position >= m.baseline);
        assert!(m.strikethrough.position < m.baseline);
    }

    #[test]
    fn ascii_maps_to_regular_face() {
        let Some(fc) = test_collection() else { return };
        let faces = fc.create_shaping_faces(&[]);
        let units: Vec<u16> = "Hello".encode_utf16().collect();
        let (len, face) = map_characters(&faces, &units, FontAttributes::empty());
        assert_eq!(len, 5);
        assert_eq!(face, Some(FaceIdx(0)));
    }

    #[test]
    fn bold_falls_back_to_regular_when_absent() {
        let Some(fc) = test_collection() else { return };
        let faces = fc.create_shaping_faces(&[]);
        let face = face_for_char(&faces, 'A', FontAttributes::BOLD);
        assert_eq!(face, Some(FaceIdx(0)));
    }

    #[test]
    fn uncovered_prefix_maps_to_none() {
        let Some(fc) = test_collection() else { return };
        let faces = fc.create_shaping_faces(&[]);
        // A Private Use Area run no ordinary monospace font covers.
        let units: Vec<u16> = "\u{F0000}\u{F0001}A".encode_utf16().collect();
        let (len, face) = map_characters(&faces, &units, FontAttributes::empty());
        assert_eq!(face, None);
        assert_eq!(len, 4, "both supplementary-plane chars, not the 'A'");
    }
}
