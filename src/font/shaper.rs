//! Text complexity classification, script itemization, and the rustybuzz
//! shaping wrapper used by the complex path.

use unicode_width::UnicodeWidthChar;

use crate::error::RenderError;
use crate::row::GlyphOffset;
use crate::settings::FontFeature;

use super::collection::next_codepoint;

/// Reusable shaping output buffers, grown by the caller's retry loop.
///
/// `capacity` is a soft limit modeling the fixed-size output buffers of a
/// platform shaper: when one run produces more glyphs than `capacity`,
/// [`shape_run`] fails with [`RenderError::InsufficientBuffer`] and the
/// caller grows the scratch by 1.5x and retries.
#[derive(Debug, Default)]
pub struct ShapeScratch {
    pub glyph_indices: Vec<u16>,
    /// Absolute UTF-16 index of each glyph's first code unit.
    pub clusters: Vec<u32>,
    /// Advances in pixels (unscaled by line rendition).
    pub advances: Vec<f32>,
    /// Offsets in pixels (unscaled by line rendition).
    pub offsets: Vec<GlyphOffset>,
    capacity: usize,
}

impl ShapeScratch {
    pub fn new() -> Self {
        Self { capacity: 16, ..Self::default() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ensure room for at least `n` glyphs without a mid-run failure.
    pub fn reserve(&mut self, n: usize) {
        self.capacity = self.capacity.max(n);
    }

    /// Grow by 1.5x, as the retry loops do.
    pub fn grow(&mut self) {
        self.capacity += self.capacity / 2 + 1;
    }
}

/// Classify a single char as shapeable by the simple path: BMP, spacing
/// (not zero-width or control), one glyph per code unit.
fn is_simple_char(c: char) -> bool {
    u32::from(c) <= 0xFFFF && c.width().is_some_and(|w| w >= 1)
}

/// The complexity test: walk the longest prefix of `units` that shares
/// one classification. Returns `(is_simple, units_consumed)` and, for
/// simple prefixes, appends one glyph index per code unit to `indices`.
///
/// A face carrying a GSUB table is never simple: its substitutions
/// (ligatures, contextual alternates) require the full shaper.
pub fn text_complexity(
    face: &rustybuzz::Face<'_>,
    units: &[u16],
    indices: &mut Vec<u16>,
) -> (bool, usize) {
    let has_gsub = face.tables().gsub.is_some();
    let classify = |c: Option<char>| -> bool {
        !has_gsub && c.is_some_and(|c| is_simple_char(c) && face.glyph_index(c).is_some())
    };

    let (first, first_len) = next_codepoint(units, 0);
    let simple = classify(first);
    let mut len = first_len;
    if simple {
        if let Some(c) = first {
            indices.push(face.glyph_index(c).map_or(0, |g| g.0));
        }
    }

    while len < units.len() {
        let (c, l) = next_codepoint(units, len);
        if classify(c) != simple {
            break;
        }
        if simple {
            if let Some(ch) = c {
                indices.push(face.glyph_index(ch).map_or(0, |g| g.0));
            }
        }
        len += l;
    }

    (simple, len)
}

/// Coarse script classes for run itemization. Shaping is per-run, so the
/// granularity only needs to keep scripts with different shaping rules
/// out of each other's runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    Latin,
    Greek,
    Cyrillic,
    Hebrew,
    Arabic,
    Devanagari,
    Thai,
    Hangul,
    Cjk,
    Other,
}

impl ScriptClass {
    /// Strong script of a char, or `None` for common/inherited chars
    /// (digits, punctuation, spaces, marks) which extend the current run.
    fn of(c: char) -> Option<Self> {
        let cp = u32::from(c);
        match cp {
            0x0041..=0x024F | 0x1E00..=0x1EFF => {
                c.is_alphabetic().then_some(Self::Latin)
            }
            0x0370..=0x03FF | 0x1F00..=0x1FFF => Some(Self::Greek),
            0x0400..=0x052F => Some(Self::Cyrillic),
            0x0590..=0x05FF => Some(Self::Hebrew),
            0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF => Some(Self::Arabic),
            0x0900..=0x097F => Some(Self::Devanagari),
            0x0E00..=0x0E7F => Some(Self::Thai),
            0x1100..=0x11FF | 0xA960..=0xA97F | 0xAC00..=0xD7FF => Some(Self::Hangul),
            0x2E80..=0x9FFF | 0xF900..=0xFAFF | 0x20000..=0x2FA1F => Some(Self::Cjk),
            _ if c.is_alphabetic() => Some(Self::Other),
            _ => None,
        }
    }

    fn to_rustybuzz(self) -> Option<rustybuzz::Script> {
        match self {
            Self::Latin => Some(rustybuzz::script::LATIN),
            Self::Greek => Some(rustybuzz::script::GREEK),
            Self::Cyrillic => Some(rustybuzz::script::CYRILLIC),
            Self::Hebrew => Some(rustybuzz::script::HEBREW),
            Self::Arabic => Some(rustybuzz::script::ARABIC),
            Self::Devanagari => Some(rustybuzz::script::DEVANAGARI),
            Self::Thai => Some(rustybuzz::script::THAI),
            Self::Hangul => Some(rustybuzz::script::HANGUL),
            Self::Cjk => Some(rustybuzz::script::HAN),
            Self::Other => None,
        }
    }
}

/// A maximal same-script run within the analyzed range, in UTF-16 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptRun {
    pub start: usize,
    pub len: usize,
    pub script: ScriptClass,
}

/// Itemize `units[start..start+len]` into same-script runs. Common
/// characters inherit the script of the run they appear in.
pub fn analyze_script(units: &[u16], start: usize, len: usize) -> Vec<ScriptRun> {
    let end = start + len;
    let mut runs = Vec::new();
    let mut run_start = start;
    let mut run_script: Option<ScriptClass> = None;
    let mut i = start;

    while i < end {
        let (c, l) = next_codepoint(units, i);
        let script = c.and_then(ScriptClass::of);
        match (run_script, script) {
            (Some(a), Some(b)) if a != b => {
                runs.push(ScriptRun { start: run_start, len: i - run_start, script: a });
                run_start = i;
                run_script = Some(b);
            }
            (None, Some(b)) => run_script = Some(b),
            _ => {}
        }
        i += l;
    }

    if run_start < end {
        runs.push(ScriptRun {
            start: run_start,
            len: end - run_start,
            script: run_script.unwrap_or(ScriptClass::Latin),
        });
    }

    runs
}

/// Convert the settings feature list into rustybuzz features.
pub fn to_features(features: &[FontFeature]) -> Vec<rustybuzz::Feature> {
    features
        .iter()
        .map(|f| {
            rustybuzz::Feature::new(
                rustybuzz::ttf_parser::Tag::from_bytes(&f.tag),
                f.value,
                ..,
            )
        })
        .collect()
}

/// Shape one same-script run and fill the scratch buffers with glyph
/// indices, cluster map, advances, and offsets (all in pixels at
/// `em_size_px`). Clusters are `cluster_base +` the relative code-unit
/// index, i.e. absolute positions in the caller's line buffer.
///
/// Fails with [`RenderError::InsufficientBuffer`] when the run produced
/// more glyphs than the scratch capacity allows.
pub fn shape_run(
    face: &rustybuzz::Face<'_>,
    units: &[u16],
    cluster_base: u32,
    script: ScriptClass,
    em_size_px: f32,
    features: &[rustybuzz::Feature],
    scratch: &mut ShapeScratch,
) -> Result<usize, RenderError> {
    let mut buffer = rustybuzz::UnicodeBuffer::new();
    let mut i = 0usize;
    while i < units.len() {
        let (c, l) = next_codepoint(units, i);
        buffer.add(c.unwrap_or('\u{FFFD}'), cluster_base + i as u32);
        i += l;
    }
    buffer.set_direction(rustybuzz::Direction::LeftToRight);
    if let Some(script) = script.to_rustybuzz() {
        buffer.set_script(script);
    }

    let glyphs = rustybuzz::shape(face, features, buffer);
    let count = glyphs.len();
    if count > scratch.capacity() {
        return Err(RenderError::InsufficientBuffer);
    }

    let scale = em_size_px / face.units_per_em() as f32;
    scratch.glyph_indices.clear();
    scratch.clusters.clear();
    scratch.advances.clear();
    scratch.offsets.clear();

    for (info, pos) in glyphs.glyph_infos().iter().zip(glyphs.glyph_positions()) {
        scratch.glyph_indices.push(info.glyph_id as u16);
        scratch.clusters.push(info.cluster);
        scratch.advances.push(pos.x_advance as f32 * scale);
        scratch.offsets.push(GlyphOffset {
            advance_offset: pos.x_offset as f32 * scale,
            ascender_offset: pos.y_offset as f32 * scale,
        });
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn script_runs_split_on_script_change() {
        let units = utf16("abcЖЗИdef");
        let runs = analyze_script(&units, 0, units.len());
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], ScriptRun { start: 0, len: 3, script: ScriptClass::Latin });
        assert_eq!(runs[1], ScriptRun { start: 3, len: 3, script: ScriptClass::Cyrillic });
        assert_eq!(runs[2], ScriptRun { start: 6, len: 3, script: ScriptClass::Latin });
    }

    #[test]
    fn common_chars_inherit_run_script() {
        let units = utf16("ab12 cd");
        let runs = analyze_script(&units, 0, units.len());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].script, ScriptClass::Latin);
    }

    #[test]
    fn digits_only_run_defaults_to_latin() {
        let units = utf16("123");
        let runs = analyze_script(&units, 0, units.len());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].script, ScriptClass::Latin);
    }

    #[test]
    fn analyze_script_subrange() {
        let units = utf16("xxشييx");
        let runs = analyze_script(&units, 2, 3);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start, 2);
        assert_eq!(runs[0].len, 3);
        assert_eq!(runs[0].script, ScriptClass::Arabic);
    }

    #[test]
    fn scratch_grows_by_half() {
        let mut s = ShapeScratch::new();
        let c0 = s.capacity();
        s.grow();
        assert!(s.capacity() > c0);
        s.reserve(1000);
        assert_eq!(s.capacity(), 1000);
        // reserve never shrinks
        s.reserve(10);
        assert_eq!(s.capacity(), 1000);
    }

    #[test]
    fn simple_chars_classified() {
        assert!(is_simple_char('a'));
        assert!(is_simple_char(' '));
        assert!(!is_simple_char('\u{0301}'), "combining accents are complex");
        assert!(!is_simple_char('😀'), "supplementary plane is complex");
    }

    #[test]
    fn shape_run_reports_insufficient_buffer() {
        let Some(fc) = crate::font::test_util::test_collection() else {
            return;
        };
        let faces = fc.create_shaping_faces(&[]);
        let face = faces[0].as_ref().expect("regular face");
        let units = utf16("hello world");
        let mut scratch = ShapeScratch::default(); // capacity 0
        let r = shape_run(face, &units, 0, ScriptClass::Latin, 16.0, &[], &mut scratch);
        assert_eq!(r, Err(RenderError::InsufficientBuffer));

        scratch.reserve(64);
        let n = shape_run(face, &units, 0, ScriptClass::Latin, 16.0, &[], &mut scratch)
            .expect("shape");
        assert_eq!(n, scratch.glyph_indices.len());
        assert_eq!(n, scratch.advances.len());
        assert!(n >= 11, "one glyph per char for plain ASCII");
        assert!(scratch.advances.iter().all(|&a| a > 0.0));
        // Clusters are the absolute utf16 indices and monotonic.
        assert!(scratch.clusters.windows(2).all(|w| w[0] <= w[1]));
    }
}
