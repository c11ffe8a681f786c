//! Font face storage, fallback mapping, and text shaping.

pub mod collection;
pub mod shaper;

use bitflags::bitflags;

pub use collection::{FontCollection, FontSource, FontSources, FontStore, ResolvedMetrics};

bitflags! {
    /// The text attributes that select a different font face.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FontAttributes: u8 {
        const BOLD   = 0b01;
        const ITALIC = 0b10;
    }
}

impl FontAttributes {
    /// Index into the four per-attribute-combination slots
    /// (Regular/Bold/Italic/BoldItalic).
    pub fn variant_index(self) -> usize {
        usize::from(self.bits())
    }
}

/// Index of a face within a [`FontStore`]: `0..4` are the primary style
/// variants, `4..` the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceIdx(pub u16);

/// Shared helpers for tests that need real font data. Fonts are located
/// from well-known system paths; tests return early when none exists.
#[cfg(test)]
pub(crate) mod test_util {
    use super::collection::{FontCollection, FontSource, FontSources};

    pub(crate) fn test_font_bytes() -> Option<Vec<u8>> {
        const CANDIDATES: &[&str] = &[
            "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
            "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
            "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
            "/usr/share/fonts/liberation/LiberationMono-Regular.ttf",
            "/System/Library/Fonts/Menlo.ttc",
            "C:\\Windows\\Fonts\\consola.ttf",
        ];
        CANDIDATES.iter().find_map(|p| std::fs::read(p).ok())
    }

    pub(crate) fn test_collection() -> Option<FontCollection> {
        let bytes = test_font_bytes()?;
        let sources = FontSources {
            regular: Some(FontSource::new(bytes)),
            ..FontSources::default()
        };
        FontCollection::new(&sources, 16.0, 96).ok()
    }
}
