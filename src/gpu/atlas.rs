//! The glyph atlas: one grown-on-demand GPU texture, a guillotine
//! rectangle packer, and the per-face glyph entry maps.

use std::collections::HashMap;

use crate::error::RenderError;
use crate::font::FaceIdx;
use crate::row::LineRendition;

use super::instance::ShadingKind;

/// Smallest atlas texture: a 64 KiB RGBA allocation.
const MIN_AREA: u32 = 128 * 128;
/// Largest atlas texture, within wgpu's default 2D dimension limit.
const MAX_AREA: u32 = 8192 * 8192;

// Axis-aligned rectangle for the packer's free-space tracking.
#[derive(Debug, Clone, Copy)]
struct FreeRect {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

/// 2D rectangle bin packer using the Guillotine best-short-side-fit
/// algorithm.
///
/// Maintains a list of free rectangles; when a glyph is packed, the
/// best-fitting free rectangle is split into two smaller ones along the
/// shorter leftover axis.
///
/// Reference: Jukka Jylanki, "A Thousand Ways to Pack the Bin" (2010).
pub struct RectPacker {
    width: u16,
    height: u16,
    free_rects: Vec<FreeRect>,
}

impl RectPacker {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            free_rects: vec![FreeRect { x: 0, y: 0, w: width, h: height }],
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Find space for a rectangle. Returns its top-left position, or
    /// `None` if no free rectangle can fit it.
    pub fn pack(&mut self, glyph_w: u16, glyph_h: u16) -> Option<(u16, u16)> {
        if glyph_w == 0 || glyph_h == 0 {
            return Some((0, 0));
        }

        let mut best_idx = None;
        let mut best_short = u16::MAX;
        let mut best_long = u16::MAX;

        for (i, r) in self.free_rects.iter().enumerate() {
            if r.w >= glyph_w && r.h >= glyph_h {
                let leftover_w = r.w - glyph_w;
                let leftover_h = r.h - glyph_h;
                let short = leftover_w.min(leftover_h);
                let long = leftover_w.max(leftover_h);
                if short < best_short || (short == best_short && long < best_long) {
                    best_idx = Some(i);
                    best_short = short;
                    best_long = long;
                }
            }
        }

        let idx = best_idx?;
        let r = self.free_rects[idx];
        let pos = (r.x, r.y);

        // Guillotine split: remove the chosen rect, add up to two children
        // along the shorter leftover axis.
        self.free_rects.swap_remove(idx);
        let leftover_w = r.w - glyph_w;
        let leftover_h = r.h - glyph_h;

        if leftover_w < leftover_h {
            if leftover_w > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x + glyph_w,
                    y: r.y,
                    w: leftover_w,
                    h: glyph_h,
                });
            }
            if leftover_h > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x,
                    y: r.y + glyph_h,
                    w: r.w,
                    h: leftover_h,
                });
            }
        } else {
            if leftover_h > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x,
                    y: r.y + glyph_h,
                    w: glyph_w,
                    h: leftover_h,
                });
            }
            if leftover_w > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x + glyph_w,
                    y: r.y,
                    w: leftover_w,
                    h: r.h,
                });
            }
        }

        Some(pos)
    }
}

/// Placement and shading of one rasterized glyph variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtlasGlyphEntry {
    pub shading: ShadingKind,
    /// Wide ligature: the present layer re-splits the quad per cell.
    pub overlap_split: bool,
    /// Offset of the bitmap's top-left from the baseline origin.
    pub offset: [i16; 2],
    pub size: [u16; 2],
    pub texcoord: [u16; 2],
}

/// Entry map key: a face from the store (or the builtin generator) under
/// one line rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtlasKey {
    pub face: Option<FaceIdx>,
    pub rendition: LineRendition,
}

struct PendingUpload {
    x: u16,
    y: u16,
    width: u16,
    height: u16,
    /// Premultiplied RGBA.
    pixels: Vec<u8>,
}

/// Compute the power-of-two texture size whose area covers the need:
/// at least the printable-ASCII working set (`cell_area * 95`), at least
/// double the previous texture when growing, and no more than 1.25x the
/// swap chain area.
fn desired_size(cell_area: u32, target_area: u32, current_area: u32) -> (u16, u16) {
    let min_by_font = cell_area.saturating_mul(95);
    let min_by_growth = current_area.saturating_mul(2);
    let max_by_font = target_area + target_area / 4;

    let area = min_by_font
        .max(min_by_growth)
        .min(max_by_font)
        .clamp(MIN_AREA, MAX_AREA);

    // Pick u x v power-of-two dimensions with u*v >= area and within a
    // factor of two of it.
    let index = 31 - (area - 1).leading_zeros();
    let u = 1u32 << ((index + 2) / 2);
    let v = 1u32 << ((index + 1) / 2);
    (u as u16, v as u16)
}

/// The atlas: texture + packer + glyph entry maps + staged uploads.
///
/// Rasterization happens between [`Atlas::begin_drawing`] and
/// [`Atlas::end_drawing`]; the staged bitmaps reach the GPU at
/// `end_drawing`, which must run before the quads referencing them are
/// drawn. A reset requires the drawing session to be closed.
pub struct Atlas {
    texture: Option<wgpu::Texture>,
    view: Option<wgpu::TextureView>,
    packer: RectPacker,
    entries: HashMap<AtlasKey, HashMap<u32, AtlasGlyphEntry>>,
    pending: Vec<PendingUpload>,
    drawing: bool,
    /// Bumped on every reset; consumers rebind the texture view.
    generation: u64,
}

impl Atlas {
    pub fn new() -> Self {
        Self {
            texture: None,
            view: None,
            packer: RectPacker::new(0, 0),
            entries: HashMap::new(),
            pending: Vec::new(),
            drawing: false,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn view(&self) -> Option<&wgpu::TextureView> {
        self.view.as_ref()
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing
    }

    /// Empty the atlas and size the texture for the current cell and
    /// target geometry. All glyph maps are cleared; the texture is
    /// recreated (clearing its contents) and the generation bumped.
    pub fn reset(
        &mut self,
        device: &wgpu::Device,
        cell_size: (u16, u16),
        target_size: (u16, u16),
    ) {
        assert!(!self.drawing, "atlas reset during an open drawing session");

        let cell_area = u32::from(cell_size.0) * u32::from(cell_size.1);
        let target_area = u32::from(target_size.0) * u32::from(target_size.1);
        let current_area = u32::from(self.packer.width()) * u32::from(self.packer.height());
        let (u, v) = desired_size(cell_area.max(1), target_area.max(1), current_area);

        self.reset_cpu(u, v);

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("glyph_atlas"),
            size: wgpu::Extent3d {
                width: u32::from(u),
                height: u32::from(v),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.view = Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
        self.texture = Some(texture);
    }

    /// The CPU half of a reset: repack and clear the glyph maps.
    fn reset_cpu(&mut self, u: u16, v: u16) {
        self.packer = RectPacker::new(u, v);
        // Keep the per-face maps, clear their contents: the face keys
        // stay valid for the lifetime of the font store.
        for glyphs in self.entries.values_mut() {
            glyphs.clear();
        }
        self.pending.clear();
        self.generation += 1;
    }

    pub fn find(&self, key: AtlasKey, glyph: u32) -> Option<AtlasGlyphEntry> {
        self.entries.get(&key)?.get(&glyph).copied()
    }

    pub fn insert(&mut self, key: AtlasKey, glyph: u32, entry: AtlasGlyphEntry) {
        self.entries.entry(key).or_default().insert(glyph, entry);
    }

    /// Reserve packer space. [`RenderError::AtlasFull`] triggers the
    /// overflow protocol in the present layer.
    pub fn allocate(&mut self, width: u16, height: u16) -> Result<(u16, u16), RenderError> {
        self.packer.pack(width, height).ok_or(RenderError::AtlasFull)
    }

    pub fn begin_drawing(&mut self) {
        self.drawing = true;
    }

    /// Stage a premultiplied-RGBA bitmap for upload at `(x, y)`.
    pub fn stage_upload(&mut self, x: u16, y: u16, width: u16, height: u16, pixels: Vec<u8>) {
        debug_assert!(self.drawing, "staging outside a drawing session");
        debug_assert_eq!(pixels.len(), usize::from(width) * usize::from(height) * 4);
        if width == 0 || height == 0 {
            return;
        }
        self.pending.push(PendingUpload { x, y, width, height, pixels });
    }

    /// Close the drawing session, flushing staged bitmaps to the GPU.
    pub fn end_drawing(&mut self, queue: &wgpu::Queue) {
        self.drawing = false;
        let Some(texture) = &self.texture else {
            self.pending.clear();
            return;
        };
        for upload in self.pending.drain(..) {
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: u32::from(upload.x),
                        y: u32::from(upload.y),
                        z: 0,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                &upload.pixels,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * u32::from(upload.width)),
                    rows_per_image: Some(u32::from(upload.height)),
                },
                wgpu::Extent3d {
                    width: u32::from(upload.width),
                    height: u32::from(upload.height),
                    depth_or_array_layers: 1,
                },
            );
        }
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_size_is_power_of_two_and_covers_ascii() {
        // 8x16 cells: 95 glyphs need 12160px; min area wins at 128x128.
        let (u, v) = desired_size(8 * 16, 640 * 480, 0);
        assert!(u.is_power_of_two() && v.is_power_of_two());
        assert!(u32::from(u) * u32::from(v) >= 128 * 128);
        assert!(u32::from(u) * u32::from(v) >= 8 * 16 * 95);
    }

    #[test]
    fn desired_size_covers_requested_area_within_2x() {
        // The documented example: an area of 985x1946 yields 2048x1024.
        let area: u32 = 985 * 1946;
        let (u, v) = desired_size(1, u32::MAX / 2, area / 2);
        let got = u32::from(u) * u32::from(v);
        assert_eq!((u, v), (2048, 1024));
        assert!(got >= area);
        assert!(got < area * 2);
    }

    #[test]
    fn desired_size_doubles_on_growth() {
        let (u0, v0) = desired_size(8 * 16, 4096 * 4096, 0);
        let (u1, v1) = desired_size(8 * 16, 4096 * 4096, u32::from(u0) * u32::from(v0));
        assert!(u32::from(u1) * u32::from(v1) >= 2 * u32::from(u0) * u32::from(v0));
    }

    #[test]
    fn desired_size_clamps_to_min() {
        let (u, v) = desired_size(1, 1, 0);
        assert_eq!(u32::from(u) * u32::from(v), MIN_AREA);
    }

    #[test]
    fn rect_packer_single_glyph() {
        let mut p = RectPacker::new(2048, 2048);
        assert_eq!(p.pack(16, 20), Some((0, 0)));
    }

    #[test]
    fn rect_packer_multiple_no_overlap() {
        let mut p = RectPacker::new(256, 256);
        let mut packed = Vec::new();
        for _ in 0..50 {
            if let Some((x, y)) = p.pack(16, 20) {
                packed.push((x, y, 16u16, 20u16));
            }
        }
        for (i, a) in packed.iter().enumerate() {
            for b in &packed[i + 1..] {
                let overlap_x = a.0 < b.0 + b.2 && b.0 < a.0 + a.2;
                let overlap_y = a.1 < b.1 + b.3 && b.1 < a.1 + a.3;
                assert!(
                    !(overlap_x && overlap_y),
                    "overlap: ({},{} {}x{}) vs ({},{} {}x{})",
                    a.0, a.1, a.2, a.3, b.0, b.1, b.2, b.3,
                );
            }
        }
    }

    #[test]
    fn rect_packer_reports_full() {
        let mut p = RectPacker::new(32, 32);
        let mut count = 0;
        while p.pack(16, 16).is_some() {
            count += 1;
            assert!(count <= 4, "packed too many");
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn zero_sized_rects_always_fit() {
        let mut p = RectPacker::new(1, 1);
        assert!(p.pack(1, 1).is_some());
        assert!(p.pack(1, 1).is_none());
        assert_eq!(p.pack(0, 5), Some((0, 0)));
    }

    #[test]
    fn entries_survive_until_reset() {
        let mut atlas = Atlas::new();
        atlas.reset_cpu(128, 128);
        let key = AtlasKey { face: None, rendition: LineRendition::SingleWidth };
        let entry = AtlasGlyphEntry {
            shading: ShadingKind::TextBuiltinGlyph,
            overlap_split: false,
            offset: [0, -12],
            size: [8, 16],
            texcoord: [0, 0],
        };
        atlas.insert(key, 0x2500, entry);

        // Repeated lookups return the same entry (atlas monotonicity).
        assert_eq!(atlas.find(key, 0x2500), Some(entry));
        assert_eq!(atlas.find(key, 0x2500), Some(entry));
        assert_eq!(
            atlas.find(AtlasKey { face: None, rendition: LineRendition::DoubleWidth }, 0x2500),
            None,
        );

        let generation = atlas.generation();
        atlas.reset_cpu(128, 128);
        assert_eq!(atlas.find(key, 0x2500), None);
        assert_eq!(atlas.generation(), generation + 1);
    }

    #[test]
    fn allocate_reports_atlas_full() {
        let mut atlas = Atlas::new();
        atlas.reset_cpu(32, 32);
        assert!(atlas.allocate(32, 32).is_ok());
        assert_eq!(atlas.allocate(1, 1), Err(RenderError::AtlasFull));
    }
}
