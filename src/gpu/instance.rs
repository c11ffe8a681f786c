//! The per-quad instance record and its byte serialization.

/// How the pixel shader treats one quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u16)]
pub enum ShadingKind {
    /// Whitespace: the quad is never emitted.
    #[default]
    Default = 0,
    /// Samples the background color bitmap.
    Background = 1,
    TextGrayscale = 2,
    TextClearType = 3,
    /// Color glyphs (emoji): the atlas texel is the final color.
    TextPassthrough = 4,
    TextBuiltinGlyph = 5,
    DottedLine = 6,
    DashedLine = 7,
    CurlyLine = 8,
    SolidLine = 9,
    Cursor = 10,
    Selection = 11,
}

impl ShadingKind {
    /// First/last of the contiguous text-drawing block, used when the
    /// cursor foreground pass locates the text quads.
    pub const TEXT_DRAWING_FIRST: Self = Self::TextGrayscale;
    pub const TEXT_DRAWING_LAST: Self = Self::TextBuiltinGlyph;

    pub fn is_text(self) -> bool {
        self >= Self::TEXT_DRAWING_FIRST && self <= Self::TEXT_DRAWING_LAST
    }
}

/// One rectangle of the instanced draw.
///
/// Positions may go negative (glyph overhang past the viewport edge);
/// sizes are never negative. 20 bytes per instance, uploaded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadInstance {
    pub shading: ShadingKind,
    pub rendition_scale: [u8; 2],
    pub position: [i16; 2],
    pub size: [u16; 2],
    pub texcoord: [u16; 2],
    pub color: u32,
}

impl Default for QuadInstance {
    fn default() -> Self {
        Self {
            shading: ShadingKind::Default,
            rendition_scale: [1, 1],
            position: [0, 0],
            size: [0, 0],
            texcoord: [0, 0],
            color: 0,
        }
    }
}

/// Instance stride in bytes. Layout:
///   [0..2]   shading:          u16
///   [2..4]   rendition_scale:  u8 x2
///   [4..8]   position:         i16 x2
///   [8..12]  size:             u16 x2
///   [12..16] texcoord:         u16 x2
///   [16..20] color:            u32
pub const INSTANCE_STRIDE: u64 = 20;

/// Serialize instances into the upload buffer without unsafe code.
pub fn serialize_instances(instances: &[QuadInstance], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(instances.len() * INSTANCE_STRIDE as usize);
    for q in instances {
        out.extend_from_slice(&(q.shading as u16).to_ne_bytes());
        out.push(q.rendition_scale[0]);
        out.push(q.rendition_scale[1]);
        out.extend_from_slice(&q.position[0].to_ne_bytes());
        out.extend_from_slice(&q.position[1].to_ne_bytes());
        out.extend_from_slice(&q.size[0].to_ne_bytes());
        out.extend_from_slice(&q.size[1].to_ne_bytes());
        out.extend_from_slice(&q.texcoord[0].to_ne_bytes());
        out.extend_from_slice(&q.texcoord[1].to_ne_bytes());
        out.extend_from_slice(&q.color.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_stride_matches_constant() {
        let quads = [QuadInstance::default(); 3];
        let mut bytes = Vec::new();
        serialize_instances(&quads, &mut bytes);
        assert_eq!(bytes.len(), 3 * INSTANCE_STRIDE as usize);
    }

    #[test]
    fn text_block_range() {
        assert!(ShadingKind::TextGrayscale.is_text());
        assert!(ShadingKind::TextClearType.is_text());
        assert!(ShadingKind::TextPassthrough.is_text());
        assert!(ShadingKind::TextBuiltinGlyph.is_text());
        assert!(!ShadingKind::Background.is_text());
        assert!(!ShadingKind::Cursor.is_text());
        assert!(!ShadingKind::SolidLine.is_text());
        assert!(!ShadingKind::Default.is_text());
    }

    #[test]
    fn serialization_roundtrips_fields() {
        let q = QuadInstance {
            shading: ShadingKind::Cursor,
            rendition_scale: [2, 1],
            position: [-5, 30],
            size: [11, 22],
            texcoord: [100, 200],
            color: 0xaabbccdd,
        };
        let mut bytes = Vec::new();
        serialize_instances(&[q], &mut bytes);
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 10);
        assert_eq!(bytes[2], 2);
        assert_eq!(i16::from_ne_bytes([bytes[4], bytes[5]]), -5);
        assert_eq!(u16::from_ne_bytes([bytes[8], bytes[9]]), 11);
        assert_eq!(
            u32::from_ne_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            0xaabbccdd
        );
    }
}
