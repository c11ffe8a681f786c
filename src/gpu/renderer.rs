//! The present layer: consumes the frame payload on the render thread,
//! rasterizes unseen glyphs into the atlas, and issues one instanced
//! draw per flush.

use std::time::Duration;

use swash::scale::image::Content;
use swash::scale::{Render, ScaleContext, Source, StrikeWith};
use swash::zeno::Format;

use crate::color;
use crate::error::RenderError;
use crate::payload::{Rect, RenderPayload, TILE_BACKGROUND, TILE_FOREGROUND};
use crate::row::{GridLines, LineRendition};
use crate::settings::{
    AntialiasingMode, CursorKind, CursorSettings, DecorationPosition, FontSettings,
    INVERT_CURSOR_COLOR,
};
use crate::sync::FrameLink;

use super::atlas::{Atlas, AtlasGlyphEntry, AtlasKey};
use super::builtin_glyphs::{self, Canvas};
use super::context::GpuContext;
use super::instance::{serialize_instances, QuadInstance, ShadingKind, INSTANCE_STRIDE};
use super::pipeline::{self, UNIFORM_SIZE};

/// One cursor background rectangle. An empty-box cursor spanning a wide
/// glyph with different backgrounds on each side produces six of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRect {
    pub position: [i16; 2],
    pub size: [u16; 2],
    pub background: u32,
    pub foreground: u32,
}

/// The render-thread half of the renderer.
pub struct Presenter {
    ctx: GpuContext,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: Option<wgpu::BindGroup>,
    uniform_buffer: wgpu::Buffer,

    instance_buffer: Option<wgpu::Buffer>,
    instance_capacity: u64,
    instances: Vec<QuadInstance>,
    instance_bytes: Vec<u8>,

    atlas: Atlas,
    atlas_generation_bound: u64,
    scale_context: ScaleContext,

    background_texture: Option<wgpu::Texture>,
    background_view: Option<wgpu::TextureView>,
    background_cells: (u16, u16),
    background_generation: u64,
    background_upload: Vec<u8>,

    settings_generation: u64,
    font_generation: u64,
    font_changed_reset_atlas: bool,

    text_shading: ShadingKind,
    curly_underline: DecorationPosition,
    curly_half_height: f32,
    ligature_overhang_left: i32,
    ligature_overhang_right: i32,

    cursor_rects: Vec<CursorRect>,
    cursor_position: Rect,

    frame_view: Option<wgpu::TextureView>,
    frame_cleared: bool,
    clear_color: u32,
}

impl Presenter {
    pub fn new(ctx: GpuContext) -> Self {
        let bind_group_layout = pipeline::create_bind_group_layout(&ctx.device);
        let quad_pipeline =
            pipeline::create_quad_pipeline(&ctx.device, ctx.config.format, &bind_group_layout);
        let uniform_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("uniform_buffer"),
            size: UNIFORM_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            ctx,
            pipeline: quad_pipeline,
            bind_group_layout,
            bind_group: None,
            uniform_buffer,
            instance_buffer: None,
            instance_capacity: 0,
            instances: Vec::new(),
            instance_bytes: Vec::new(),
            atlas: Atlas::new(),
            atlas_generation_bound: 0,
            scale_context: ScaleContext::new(),
            background_texture: None,
            background_view: None,
            background_cells: (0, 0),
            background_generation: 0,
            background_upload: Vec::new(),
            settings_generation: 0,
            font_generation: 0,
            font_changed_reset_atlas: true,
            text_shading: ShadingKind::TextGrayscale,
            curly_underline: DecorationPosition::default(),
            curly_half_height: 1.5,
            ligature_overhang_left: i32::MIN / 2,
            ligature_overhang_right: i32::MAX / 2,
            cursor_rects: Vec::new(),
            cursor_position: Rect::default(),
            frame_view: None,
            frame_cleared: false,
            clear_color: 0,
        }
    }

    /// Drain one present-ready notification and present the frame.
    /// Returns whether a frame was presented. This is the render
    /// thread's loop body; `timeout` is the frame-latency wait.
    pub fn run_frame(&mut self, link: &FrameLink, timeout: Duration) -> Result<bool, RenderError> {
        if !link.wait_present_ready(timeout) {
            return Ok(false);
        }
        let mut payload = link.payload.lock();
        self.present(&mut payload).map(|()| true)
    }

    /// Render and present the current payload.
    pub fn present(&mut self, p: &mut RenderPayload) -> Result<(), RenderError> {
        if self.settings_generation != p.settings.generation() {
            self.handle_settings_update(p);
        }

        // Nothing dirty: skip the frame entirely.
        if p.dirty_rect_px.empty() {
            return Ok(());
        }

        let frame = match self.ctx.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Timeout) => return Ok(()),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.ctx.reconfigure();
                return Err(RenderError::DeviceLost);
            }
            Err(e) => {
                log::warn!("surface error: {e}");
                return Err(RenderError::DeviceLost);
            }
        };
        self.frame_view = Some(
            frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
        );
        self.frame_cleared = false;
        self.clear_color = p.settings.misc.background_color;
        self.instances.clear();

        let result = self.draw_frame(p);
        self.frame_view = None;
        result?;

        frame.present();
        Ok(())
    }

    fn draw_frame(&mut self, p: &mut RenderPayload) -> Result<(), RenderError> {
        self.draw_background(p);
        self.draw_cursor_background(p);
        self.draw_text(p)?;
        draw_selection(&mut self.instances, p);
        self.flush_quads()
    }

    /// Rebuild all GPU state after a device loss. CPU-side payload and
    /// atlas bookkeeping survive; glyphs re-rasterize lazily.
    pub fn rebuild_after_device_loss(&mut self, ctx: GpuContext) {
        let bind_group_layout = pipeline::create_bind_group_layout(&ctx.device);
        self.pipeline =
            pipeline::create_quad_pipeline(&ctx.device, ctx.config.format, &bind_group_layout);
        self.uniform_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("uniform_buffer"),
            size: UNIFORM_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.bind_group_layout = bind_group_layout;
        self.bind_group = None;
        self.instance_buffer = None;
        self.instance_capacity = 0;
        self.atlas = Atlas::new();
        self.background_texture = None;
        self.background_view = None;
        self.background_cells = (0, 0);
        self.background_generation = 0;
        self.settings_generation = 0;
        self.font_generation = 0;
        self.font_changed_reset_atlas = true;
        self.ctx = ctx;
    }

    fn handle_settings_update(&mut self, p: &RenderPayload) {
        let font_changed = self.font_generation != p.settings.font.generation();
        let cells = (p.settings.viewport_cols, p.settings.viewport_rows);
        let cells_changed = self.background_cells != cells;

        self.ctx.resize(
            u32::from(p.settings.target_width),
            u32::from(p.settings.target_height),
        );

        if font_changed {
            self.update_font_dependents(p);
        }
        if cells_changed || self.background_texture.is_none() {
            self.recreate_background_bitmap(cells);
        }
        self.update_uniforms(p);
        self.bind_group = None;

        self.settings_generation = p.settings.generation();
        self.font_generation = p.settings.font.generation();
    }

    fn update_font_dependents(&mut self, p: &RenderPayload) {
        let font = &p.settings.font;

        // The curly underline takes the double-underline band: same top,
        // same overall height, clamped so the wave stays inside the cell.
        {
            let du_top = f32::from(font.double_underline[0].position);
            let du_bottom = f32::from(font.double_underline[1].position);
            let du_height = f32::from(font.double_underline[0].height);
            let cell_height = f32::from(font.cell_height);

            let height = (du_bottom + du_height - du_top).max(3.0);
            let top = du_top.min((cell_height - height - du_height).floor());

            self.curly_half_height = height * 0.5;
            self.curly_underline = DecorationPosition {
                position: top.max(0.0).round() as u16,
                height: height.round() as u16,
            };
        }

        self.text_shading = if font.antialiasing_mode == AntialiasingMode::ClearType {
            ShadingKind::TextClearType
        } else {
            ShadingKind::TextGrayscale
        };

        // Thresholds at which a wide glyph counts as a coding ligature.
        if font.ligatures_disabled() {
            self.ligature_overhang_left = i32::MIN / 2;
            self.ligature_overhang_right = i32::MAX / 2;
        } else {
            let half_cell = i32::from(font.cell_width) / 2;
            self.ligature_overhang_left = -half_cell;
            self.ligature_overhang_right = i32::from(font.advance_width) + half_cell;
        }

        // Clearing the atlas is deferred until the next text draw.
        self.font_changed_reset_atlas = true;
    }

    fn update_uniforms(&mut self, p: &RenderPayload) {
        let s = &p.settings;
        let mut data = [0u8; UNIFORM_SIZE as usize];
        let mut write_f32 = |offset: usize, v: f32| {
            data[offset..offset + 4].copy_from_slice(&v.to_ne_bytes());
        };
        write_f32(0, f32::from(s.target_width));
        write_f32(4, f32::from(s.target_height));
        write_f32(8, f32::from(s.font.cell_width));
        write_f32(12, f32::from(s.font.cell_height));
        write_f32(16, f32::from(s.viewport_cols));
        write_f32(20, f32::from(s.viewport_rows));
        write_f32(24, f32::from(s.font.thin_line_width));
        write_f32(28, f32::from(s.font.cell_width));
        write_f32(32, self.curly_half_height);
        self.ctx.queue.write_buffer(&self.uniform_buffer, 0, &data);
    }

    fn recreate_background_bitmap(&mut self, cells: (u16, u16)) {
        let texture = self.ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("background_bitmap"),
            size: wgpu::Extent3d {
                width: u32::from(cells.0.max(1)),
                height: u32::from(cells.1.max(1)),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.background_view = Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
        self.background_texture = Some(texture);
        self.background_cells = cells;
        self.background_generation = 0;
        self.bind_group = None;
    }

    fn ensure_bind_group(&mut self) {
        if self.bind_group.is_some() && self.atlas_generation_bound == self.atlas.generation() {
            return;
        }
        let (Some(background), Some(atlas)) = (&self.background_view, self.atlas.view()) else {
            return;
        };
        self.bind_group = Some(self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quad_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(background),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(atlas),
                },
            ],
        }));
        self.atlas_generation_bound = self.atlas.generation();
    }

    fn draw_background(&mut self, p: &RenderPayload) {
        if self.background_generation != p.color_bitmap_generations[TILE_BACKGROUND] {
            self.upload_background_bitmap(p);
        }
        self.instances.push(QuadInstance {
            shading: ShadingKind::Background,
            size: [p.settings.target_width, p.settings.target_height],
            ..QuadInstance::default()
        });
    }

    /// Row-by-row copy honoring the 8-cell-aligned row stride, so the
    /// GPU texture never sees the padding cells.
    fn upload_background_bitmap(&mut self, p: &RenderPayload) {
        let Some(texture) = &self.background_texture else { return };
        let cols = usize::from(self.background_cells.0.max(1));
        let rows = usize::from(self.background_cells.1.max(1));

        self.background_upload.clear();
        self.background_upload.reserve(cols * rows * 4);
        for y in 0..rows.min(usize::from(p.settings.viewport_rows)) {
            let row = p.tile_row(TILE_BACKGROUND, y);
            for &px in &row[..cols.min(row.len())] {
                self.background_upload.extend_from_slice(&px.to_le_bytes());
            }
        }
        self.background_upload.resize(cols * rows * 4, 0);

        self.ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &self.background_upload,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * cols as u32),
                rows_per_image: Some(rows as u32),
            },
            wgpu::Extent3d {
                width: cols as u32,
                height: rows as u32,
                depth_or_array_layers: 1,
            },
        );
        self.background_generation = p.color_bitmap_generations[TILE_BACKGROUND];
    }

    fn draw_cursor_background(&mut self, p: &RenderPayload) {
        self.cursor_rects.clear();
        if p.cursor_rect.empty() {
            return;
        }

        let font = &p.settings.font;
        self.cursor_position = Rect {
            left: p.cursor_rect.left * i32::from(font.cell_width),
            top: p.cursor_rect.top * i32::from(font.cell_height),
            right: p.cursor_rect.right * i32::from(font.cell_width),
            bottom: p.cursor_rect.bottom * i32::from(font.cell_height),
        };

        let row = p.tile_row(TILE_BACKGROUND, p.cursor_rect.top.max(0) as usize);
        build_cursor_rects(
            &mut self.cursor_rects,
            font,
            &p.settings.cursor,
            p.cursor_rect,
            row,
        );

        for c in &self.cursor_rects {
            self.instances.push(QuadInstance {
                shading: ShadingKind::Cursor,
                position: c.position,
                size: c.size,
                color: c.background,
                ..QuadInstance::default()
            });
        }
    }

    fn draw_text(&mut self, p: &mut RenderPayload) -> Result<(), RenderError> {
        if self.font_changed_reset_atlas || self.atlas.view().is_none() {
            self.reset_atlas(p);
            self.font_changed_reset_atlas = false;
        }
        self.ensure_bind_group();

        let mut dirty_top = i32::MAX;
        let mut dirty_bottom = i32::MIN;
        let invalidated = p.invalidated_rows;

        for y in 0..p.settings.viewport_rows {
            let (glyph_top, glyph_bottom) = self.draw_text_row(p, y)?;

            if !p.row(y).gridline_ranges.is_empty() {
                draw_gridline_row(
                    &mut self.instances,
                    p,
                    y,
                    self.curly_underline,
                );
            }

            let row = p.row_mut(y);
            row.dirty_top = row.dirty_top.min(glyph_top);
            row.dirty_bottom = row.dirty_bottom.max(glyph_bottom);
            // The image slice was consumed by this frame; the producer
            // drops it at the next end_paint unless it is repainted.
            if let Some(bitmap) = row.bitmap.as_mut() {
                bitmap.active = false;
            }

            if invalidated.contains(y) {
                dirty_top = dirty_top.min(row.dirty_top);
                dirty_bottom = dirty_bottom.max(row.dirty_bottom);
            }
        }

        if dirty_top < dirty_bottom {
            p.dirty_rect_px.top = p.dirty_rect_px.top.min(dirty_top);
            p.dirty_rect_px.bottom = p.dirty_rect_px.bottom.max(dirty_bottom);
        }

        self.atlas.end_drawing(&self.ctx.queue);
        Ok(())
    }

    /// Emit the glyph quads of one row. Returns the vertical extent the
    /// row's quads covered.
    fn draw_text_row(&mut self, p: &RenderPayload, y: u16) -> Result<(i32, i32), RenderError> {
        let font = &p.settings.font;
        let row = p.row(y);
        let rendition = row.line_rendition;
        let baseline_y =
            f32::from(y) * f32::from(font.cell_height) + f32::from(font.baseline);
        let scale = [
            rendition.horizontal_scale() as u8,
            rendition.vertical_scale() as u8,
        ];

        let mut baseline_x = 0.0f32;
        let mut glyph_top = i32::MAX;
        let mut glyph_bottom = i32::MIN;

        for mapping in &row.mappings {
            let key = AtlasKey { face: mapping.face, rendition };
            let mut x = mapping.glyphs_from as usize;
            let glyphs_to = mapping.glyphs_to as usize;

            while x < glyphs_to {
                let mut dx = 1;
                let mut glyph_index = u32::from(row.glyph_indices[x]);

                // Builtin runs store UTF-16 code units; recombine
                // surrogate pairs into the real code point. Actual font
                // glyph ids can't collide with this range check because
                // the face is `None` here.
                if mapping.face.is_none()
                    && (0xD800..0xDC00).contains(&glyph_index)
                    && x + 1 < glyphs_to
                {
                    let low = u32::from(row.glyph_indices[x + 1]);
                    glyph_index = 0x10000 + ((glyph_index - 0xD800) << 10) + (low - 0xDC00);
                    dx = 2;
                }

                let entry = match self.atlas.find(key, glyph_index) {
                    Some(entry) => entry,
                    None => self.draw_glyph(p, key, glyph_index)?,
                };

                if entry.shading != ShadingKind::Default {
                    let offsets = row.glyph_offsets[x];
                    let left = (baseline_x + offsets.advance_offset).round() as i32
                        + i32::from(entry.offset[0]);
                    let top = (baseline_y - offsets.ascender_offset).round() as i32
                        + i32::from(entry.offset[1]);

                    glyph_top = glyph_top.min(top);
                    glyph_bottom = glyph_bottom.max(top + i32::from(entry.size[1]));

                    self.instances.push(QuadInstance {
                        shading: entry.shading,
                        rendition_scale: scale,
                        position: [left as i16, top as i16],
                        size: entry.size,
                        texcoord: entry.texcoord,
                        color: row.colors[x],
                    });

                    if entry.overlap_split {
                        overlap_split(
                            &mut self.instances,
                            p.tile_row(TILE_FOREGROUND, usize::from(y)),
                            rendition,
                            font.cell_width,
                            p.settings.viewport_cols,
                        );
                    }
                }

                baseline_x += row.glyph_advances[x];
                x += dx;
            }
        }

        Ok((glyph_top, glyph_bottom))
    }

    fn reset_atlas(&mut self, p: &RenderPayload) {
        let font = &p.settings.font;
        self.atlas.reset(
            &self.ctx.device,
            (font.cell_width, font.cell_height),
            (p.settings.target_width, p.settings.target_height),
        );
        self.bind_group = None;
    }

    /// Reserve atlas space, running the overflow protocol on failure:
    /// close the drawing session, flush the quads drawn so far, reset
    /// the atlas, and retry exactly once.
    fn allocate_atlas_rect(
        &mut self,
        p: &RenderPayload,
        width: u16,
        height: u16,
    ) -> Result<(u16, u16), RenderError> {
        match self.atlas.allocate(width, height) {
            Ok(pos) => Ok(pos),
            Err(RenderError::AtlasFull) => {
                self.atlas.end_drawing(&self.ctx.queue);
                self.flush_quads()?;
                self.reset_atlas(p);
                self.ensure_bind_group();
                self.atlas
                    .allocate(width, height)
                    .map_err(|_| RenderError::PossibleDeadlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Rasterize a glyph into the atlas and record its entry, splitting
    /// double-height variants in two.
    fn draw_glyph(
        &mut self,
        p: &RenderPayload,
        key: AtlasKey,
        glyph_index: u32,
    ) -> Result<AtlasGlyphEntry, RenderError> {
        let Some(face) = key.face else {
            return self.draw_builtin_glyph(p, key.rendition, glyph_index);
        };

        let font = &p.settings.font;
        let raster = p
            .font_store
            .as_ref()
            .and_then(|store| store.swash_ref(face))
            .and_then(|font_ref| {
                rasterize_font_glyph(
                    &mut self.scale_context,
                    font_ref,
                    glyph_index as u16,
                    font.font_size,
                    key.rendition,
                    font.antialiasing_mode,
                )
            });

        let Some(raster) = raster else {
            // Whitespace or an unrasterizable glyph: a Default entry
            // skips the quad entirely.
            let entry = AtlasGlyphEntry::default();
            self.atlas.insert(key, glyph_index, entry);
            return Ok(entry);
        };

        let (x, y) = self.allocate_atlas_rect(p, raster.width, raster.height)?;
        self.atlas.begin_drawing();
        self.atlas
            .stage_upload(x, y, raster.width, raster.height, raster.pixels);

        let horizontal_shift = u8::from(key.rendition != LineRendition::SingleWidth);
        let overlap_split = i32::from(raster.width) >= i32::from(font.cell_width)
            && (i32::from(raster.left) <= (self.ligature_overhang_left << horizontal_shift)
                || i32::from(raster.left) + i32::from(raster.width)
                    >= (self.ligature_overhang_right << horizontal_shift));

        let mut entry = AtlasGlyphEntry {
            shading: if raster.is_color {
                ShadingKind::TextPassthrough
            } else {
                self.text_shading
            },
            overlap_split,
            offset: [raster.left, raster.top],
            size: [raster.width, raster.height],
            texcoord: [x, y],
        };

        if key.rendition >= LineRendition::DoubleHeightTop {
            entry = split_double_height_glyph(&mut self.atlas, font, key, glyph_index, entry);
        } else {
            self.atlas.insert(key, glyph_index, entry);
        }
        Ok(entry)
    }

    /// Rasterize a builtin or soft-font glyph procedurally.
    fn draw_builtin_glyph(
        &mut self,
        p: &RenderPayload,
        rendition: LineRendition,
        codepoint: u32,
    ) -> Result<AtlasGlyphEntry, RenderError> {
        let font = &p.settings.font;
        let mut width = u32::from(font.cell_width);
        let mut height = u32::from(font.cell_height);
        let mut baseline = i32::from(font.baseline);
        if rendition != LineRendition::SingleWidth {
            width <<= 1;
            if rendition >= LineRendition::DoubleHeightTop {
                height <<= 1;
                baseline <<= 1;
            }
        }

        let mut coverage = vec![0u8; (width * height) as usize];
        let mut canvas = Canvas::new(&mut coverage, width, height);
        let shading = if builtin_glyphs::is_soft_font_char(codepoint) {
            builtin_glyphs::draw_soft_font_glyph(
                &mut canvas,
                &font.soft_font_pattern,
                u32::from(font.soft_font_cell_width),
                u32::from(font.soft_font_cell_height),
                codepoint - 0xEF20,
                font.antialiasing_mode == AntialiasingMode::Aliased,
            );
            ShadingKind::TextGrayscale
        } else {
            builtin_glyphs::draw_builtin_glyph(codepoint, &mut canvas);
            ShadingKind::TextBuiltinGlyph
        };

        // Coverage to premultiplied white.
        let mut pixels = Vec::with_capacity(coverage.len() * 4);
        for &a in &coverage {
            pixels.extend_from_slice(&[a, a, a, a]);
        }

        let key = AtlasKey { face: None, rendition };
        let (x, y) = self.allocate_atlas_rect(p, width as u16, height as u16)?;
        self.atlas.begin_drawing();
        self.atlas.stage_upload(x, y, width as u16, height as u16, pixels);

        let mut entry = AtlasGlyphEntry {
            shading,
            overlap_split: false,
            offset: [0, -baseline as i16],
            size: [width as u16, height as u16],
            texcoord: [x, y],
        };

        if rendition >= LineRendition::DoubleHeightTop {
            entry = split_double_height_glyph(&mut self.atlas, font, key, codepoint, entry);
        } else {
            self.atlas.insert(key, codepoint, entry);
        }
        Ok(entry)
    }

    /// Upload the accumulated instances and draw them. Called once at
    /// the end of every frame and once per mid-frame atlas overflow.
    fn flush_quads(&mut self) -> Result<(), RenderError> {
        if self.instances.is_empty() {
            return Ok(());
        }
        if !self.cursor_rects.is_empty() {
            draw_cursor_foreground(&mut self.instances, &self.cursor_rects, self.cursor_position);
        }

        self.ensure_bind_group();
        let Some(view) = &self.frame_view else {
            return Err(RenderError::InvalidArgument);
        };
        let Some(bind_group) = &self.bind_group else {
            return Err(RenderError::DeviceLost);
        };

        serialize_instances(&self.instances, &mut self.instance_bytes);

        // Grow the GPU buffer in 64 KiB steps, starting from a
        // viewport-cell-count estimate.
        let needed = self.instance_bytes.len() as u64;
        if self.instance_buffer.is_none() || self.instance_capacity < needed {
            let size = needed.max(INSTANCE_STRIDE * 256).next_multiple_of(0x10000);
            self.instance_buffer = Some(self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("quad_instances"),
                size,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            self.instance_capacity = size;
        }
        let buffer = self.instance_buffer.as_ref().expect("instance buffer just created");
        self.ctx.queue.write_buffer(buffer, 0, &self.instance_bytes);

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame_encoder"),
            });
        {
            let clear = color::premultiply(self.clear_color);
            let load = if self.frame_cleared {
                wgpu::LoadOp::Load
            } else {
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: f64::from(clear & 0xff) / 255.0,
                    g: f64::from((clear >> 8) & 0xff) / 255.0,
                    b: f64::from((clear >> 16) & 0xff) / 255.0,
                    a: f64::from(clear >> 24) / 255.0,
                })
            };
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("quad_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            rpass.set_pipeline(&self.pipeline);
            rpass.set_bind_group(0, bind_group, &[]);
            rpass.set_vertex_buffer(0, buffer.slice(..));
            rpass.draw(0..4, 0..self.instances.len() as u32);
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.frame_cleared = true;
        self.instances.clear();
        Ok(())
    }
}

/// A rasterized glyph bitmap with its placement relative to the
/// baseline origin (the glyph's black box).
struct RasterizedGlyph {
    left: i16,
    top: i16,
    width: u16,
    height: u16,
    /// Premultiplied RGBA.
    pixels: Vec<u8>,
    is_color: bool,
}

/// Rasterize one glyph with swash. Line renditions scale the output:
/// double-height rasterizes at twice the size; double-width duplicates
/// columns of a single-height rasterization.
fn rasterize_font_glyph(
    context: &mut ScaleContext,
    font_ref: swash::FontRef<'_>,
    glyph_id: u16,
    size_px: f32,
    rendition: LineRendition,
    antialiasing: AntialiasingMode,
) -> Option<RasterizedGlyph> {
    let vertical_scale = rendition.vertical_scale();
    let mut scaler = context
        .builder(font_ref)
        .size(size_px * f32::from(vertical_scale))
        .hint(true)
        .build();

    let image = Render::new(&[
        Source::ColorOutline(0),
        Source::ColorBitmap(StrikeWith::BestFit),
        Source::Outline,
    ])
    .format(Format::Alpha)
    .render(&mut scaler, glyph_id)?;

    if image.placement.width == 0 || image.placement.height == 0 {
        return None;
    }

    let width = image.placement.width as usize;
    let height = image.placement.height as usize;
    let aliased = antialiasing == AntialiasingMode::Aliased;

    let (pixels, is_color) = match image.content {
        Content::Mask => {
            let mut pixels = Vec::with_capacity(width * height * 4);
            for &mask in &image.data {
                let a = if aliased {
                    if mask > 127 { 255 } else { 0 }
                } else {
                    mask
                };
                pixels.extend_from_slice(&[a, a, a, a]);
            }
            (pixels, false)
        }
        Content::Color => {
            // Color bitmaps arrive straight-alpha; premultiply for the
            // passthrough blend.
            let mut pixels = Vec::with_capacity(width * height * 4);
            for chunk in image.data.chunks_exact(4) {
                let a = u32::from(chunk[3]);
                pixels.push((u32::from(chunk[0]) * a / 255) as u8);
                pixels.push((u32::from(chunk[1]) * a / 255) as u8);
                pixels.push((u32::from(chunk[2]) * a / 255) as u8);
                pixels.push(chunk[3]);
            }
            (pixels, true)
        }
        Content::SubpixelMask => {
            // Fold the RGB weights to a single coverage via luminance.
            let stride = if width * height > 0 { image.data.len() / (width * height) } else { 0 };
            let mut pixels = Vec::with_capacity(width * height * 4);
            if stride < 3 {
                return None;
            }
            for chunk in image.data.chunks_exact(stride) {
                let a = ((u32::from(chunk[0]) * 299
                    + u32::from(chunk[1]) * 587
                    + u32::from(chunk[2]) * 114)
                    / 1000) as u8;
                pixels.extend_from_slice(&[a, a, a, a]);
            }
            (pixels, false)
        }
    };

    let mut out = RasterizedGlyph {
        left: image.placement.left as i16,
        top: (-image.placement.top) as i16,
        width: image.placement.width as u16,
        height: image.placement.height as u16,
        pixels,
        is_color,
    };

    // Double-width rows rasterized at single height: stretch columns 2x.
    if rendition == LineRendition::DoubleWidth {
        let mut doubled = Vec::with_capacity(out.pixels.len() * 2);
        for row in out.pixels.chunks_exact(width * 4) {
            for px in row.chunks_exact(4) {
                doubled.extend_from_slice(px);
                doubled.extend_from_slice(px);
            }
        }
        out.pixels = doubled;
        out.width *= 2;
        out.left *= 2;
    }

    Some(out)
}

/// Clip a double-height glyph into top and bottom halves, one entry per
/// rendition. A half with no coverage (a diacritic living entirely in
/// the other half) becomes whitespace.
fn split_double_height_glyph(
    atlas: &mut Atlas,
    font: &FontSettings,
    key: AtlasKey,
    glyph_index: u32,
    mut entry: AtlasGlyphEntry,
) -> AtlasGlyphEntry {
    // Twice the line height, twice the descender gap.
    entry.offset[1] -= font.descender as i16;

    let is_top = key.rendition == LineRendition::DoubleHeightTop;
    let other_rendition = if is_top {
        LineRendition::DoubleHeightBottom
    } else {
        LineRendition::DoubleHeightTop
    };

    let top_size = (-i32::from(entry.offset[1]) - i32::from(font.baseline))
        .clamp(0, i32::from(entry.size[1])) as u16;

    let mut top = entry;
    let mut bottom = entry;

    top.offset[1] += font.cell_height as i16;
    top.size[1] = top_size;
    bottom.offset[1] += top_size as i16;
    bottom.size[1] = entry.size[1].saturating_sub(top_size);
    bottom.texcoord[1] += top_size;

    if top.size[1] == 0 {
        top.shading = ShadingKind::Default;
    }
    if bottom.size[1] == 0 {
        bottom.shading = ShadingKind::Default;
    }

    let (this, other) = if is_top { (top, bottom) } else { (bottom, top) };
    atlas.insert(key, glyph_index, this);
    atlas.insert(AtlasKey { face: key.face, rendition: other_rendition }, glyph_index, other);
    this
}

/// Segment the cursor row into runs of identical background and build
/// the per-kind cursor rectangles.
fn build_cursor_rects(
    out: &mut Vec<CursorRect>,
    font: &FontSettings,
    cursor: &CursorSettings,
    cursor_cells: Rect,
    background_row: &[u32],
) {
    let cell_w = i32::from(font.cell_width);
    let cell_h = i32::from(font.cell_height);
    let thin = font.thin_line_width;

    let mut x1 = cursor_cells.left.max(0);
    while x1 < cursor_cells.right {
        let x0 = x1;
        let run_bg = background_row
            .get(x1 as usize)
            .copied()
            .unwrap_or_default()
            | 0xff00_0000;
        while x1 < cursor_cells.right
            && (background_row.get(x1 as usize).copied().unwrap_or_default() | 0xff00_0000)
                == run_bg
        {
            x1 += 1;
        }

        let position = [(x0 * cell_w) as i16, (cursor_cells.top * cell_h) as i16];
        let size = [((x1 - x0) * cell_w) as u16, cell_h as u16];

        let (mut background, foreground) = if cursor.color == INVERT_CURSOR_COLOR {
            (run_bg ^ 0x00ff_ffff, 0xffff_ffff)
        } else {
            (cursor.color, run_bg)
        };
        // The legacy console's `bg ^ 0xc0c0c0` inversion bottomed out at
        // a squared distance of 0.0292; enforce a real minimum.
        background = color::get_perceivable_color(background, run_bg, 0.25 * 0.25);

        let mut c0 = CursorRect { position, size, background, foreground };

        match cursor.kind {
            CursorKind::Legacy => {
                let height = (u32::from(c0.size[1]) * u32::from(cursor.height_percent) + 50) / 100;
                let height = (height as u16).min(c0.size[1]);
                c0.position[1] += (c0.size[1] - height) as i16;
                c0.size[1] = height;
                out.push(c0);
            }
            CursorKind::VerticalBar => {
                c0.size[0] = thin;
                out.push(c0);
            }
            CursorKind::Underscore => {
                c0.position[1] += font.underline.position as i16;
                c0.size[1] = font.underline.height;
                out.push(c0);
            }
            CursorKind::DoubleUnderscore => {
                let mut c1 = c0;
                c0.position[1] += font.double_underline[0].position as i16;
                c0.size[1] = thin;
                c1.position[1] += font.double_underline[1].position as i16;
                c1.size[1] = thin;
                out.push(c0);
                out.push(c1);
            }
            CursorKind::EmptyBox => {
                let mut top = c0;
                top.size[1] = thin;
                let mut bottom = c0;
                bottom.position[1] += (c0.size[1] - thin) as i16;
                bottom.size[1] = thin;
                out.push(top);
                out.push(bottom);
                // Vertical edges only at the cursor's own boundary,
                // shortened so they don't overlap the horizontal lines.
                if x0 == cursor_cells.left {
                    let mut left = c0;
                    left.position[1] += thin as i16;
                    left.size[1] = c0.size[1].saturating_sub(2 * thin);
                    left.size[0] = thin;
                    out.push(left);
                }
                if x1 == cursor_cells.right {
                    let mut right = c0;
                    right.position[1] += thin as i16;
                    right.size[1] = c0.size[1].saturating_sub(2 * thin);
                    right.position[0] += (c0.size[0] - thin) as i16;
                    right.size[0] = thin;
                    out.push(right);
                }
            }
            CursorKind::FullBox => {
                out.push(c0);
            }
        }
    }
}

/// Split the last quad (a wide ligature) into per-cell segments so each
/// inherits the foreground color of its own cell.
///
/// Appending may reallocate the instance vector, so everything works
/// through indices, never held references.
fn overlap_split(
    instances: &mut Vec<QuadInstance>,
    foreground_row: &[u32],
    rendition: LineRendition,
    cell_width: u16,
    viewport_cols: u16,
) {
    let mut column_advance = 1usize;
    let mut column_advance_px = i32::from(cell_width);
    let mut cell_count = i32::from(viewport_cols);
    if rendition != LineRendition::SingleWidth {
        column_advance = 2;
        column_advance_px <<= 1;
        cell_count >>= 1;
    }
    if column_advance_px == 0 {
        return;
    }

    let last = instances.len() - 1;
    let original_left = i32::from(instances[last].position[0]).max(0);
    let original_right = (i32::from(instances[last].position[0])
        + i32::from(instances[last].size[0]))
    .min(cell_count * column_advance_px);
    if original_left >= original_right {
        return;
    }

    let mut column = (original_left / column_advance_px) as usize * column_advance;
    let mut clip_left = (original_left / column_advance_px) * column_advance_px;

    // Some fonts implement ligatures as a padding glyph followed by the
    // combined glyph with a one-column advance; the emitted quad then
    // carries the last column's color. Re-anchor to the first cell.
    let mut last_fg = foreground_row.get(column).copied().unwrap_or_default();
    instances[last].color = last_fg;
    column += column_advance;
    clip_left += column_advance_px;

    while clip_left < original_right {
        let fg = foreground_row.get(column).copied().unwrap_or_default();
        if last_fg != fg {
            let prev_idx = instances.len() - 1;
            let prev = instances[prev_idx];
            let prev_width = clip_left - i32::from(prev.position[0]);
            let next_width = i32::from(prev.size[0]) - prev_width;
            if prev_width <= 0 || next_width <= 0 {
                break;
            }

            instances[prev_idx].size[0] = prev_width as u16;

            let mut next = prev;
            next.position[0] = (i32::from(prev.position[0]) + prev_width) as i16;
            next.texcoord[0] = (i32::from(prev.texcoord[0]) + prev_width) as u16;
            next.size[0] = next_width as u16;
            next.color = fg;
            instances.push(next);

            last_fg = fg;
        }
        column += column_advance;
        clip_left += column_advance_px;
    }
}

/// Emit decoration quads for one row's grid line ranges.
fn draw_gridline_row(
    instances: &mut Vec<QuadInstance>,
    p: &RenderPayload,
    y: u16,
    curly_underline: DecorationPosition,
) {
    let row = p.row(y);
    let font = &p.settings.font;
    let rendition = row.line_rendition;
    let horizontal_shift = u8::from(rendition != LineRendition::SingleWidth);
    let vertical_shift = u8::from(rendition >= LineRendition::DoubleHeightTop);
    let scale = [1u8 << horizontal_shift, 1u8 << vertical_shift];

    let cell_w = i32::from(font.cell_width);
    let cell_h = i32::from(font.cell_height);
    let row_top = i32::from(y) * cell_h;
    let row_bottom = row_top + cell_h;

    // Double-height halves draw decorations positioned against the full
    // double-size text cell, clipped to their own row.
    let text_cell_top = if rendition == LineRendition::DoubleHeightBottom {
        row_top - cell_h
    } else {
        row_top
    };
    let clip_top = if rendition == LineRendition::DoubleHeightBottom { row_top } else { 0 };
    let clip_bottom = if rendition == LineRendition::DoubleHeightTop {
        row_bottom
    } else {
        i32::from(p.settings.target_height)
    };

    for range in &row.gridline_ranges {
        let mut vertical_lines = |pos: DecorationPosition| {
            let text_cell_width = cell_w << horizontal_shift;
            let offset = i32::from(pos.position) << horizontal_shift;
            let width = pos.height << horizontal_shift;
            let mut x = i32::from(range.from) * cell_w + offset;
            let end = i32::from(range.to) * cell_w;
            while x < end {
                instances.push(QuadInstance {
                    shading: ShadingKind::SolidLine,
                    rendition_scale: scale,
                    position: [x as i16, row_top as i16],
                    size: [width, cell_h as u16],
                    color: range.gridline_color,
                    ..QuadInstance::default()
                });
                x += text_cell_width;
            }
        };
        if range.lines.contains(GridLines::LEFT) {
            vertical_lines(font.grid_left);
        }
        if range.lines.contains(GridLines::RIGHT) {
            vertical_lines(font.grid_right);
        }

        let mut horizontal_line = |pos: DecorationPosition, shading: ShadingKind, color: u32| {
            let offset = i32::from(pos.position) << vertical_shift;
            let height = i32::from(pos.height) << vertical_shift;
            let left = i32::from(range.from) * cell_w;
            let width = i32::from(range.to - range.from) * cell_w;

            let top = (text_cell_top + offset).clamp(clip_top, clip_bottom);
            let bottom = (text_cell_top + offset + height).clamp(clip_top, clip_bottom);
            if top < bottom {
                instances.push(QuadInstance {
                    shading,
                    rendition_scale: scale,
                    position: [left as i16, top as i16],
                    size: [width as u16, (bottom - top) as u16],
                    color,
                    ..QuadInstance::default()
                });
            }
        };

        if range.lines.contains(GridLines::TOP) {
            horizontal_line(font.grid_top, ShadingKind::SolidLine, range.gridline_color);
        }
        if range.lines.contains(GridLines::BOTTOM) {
            horizontal_line(font.grid_bottom, ShadingKind::SolidLine, range.gridline_color);
        }
        if range.lines.contains(GridLines::STRIKETHROUGH) {
            horizontal_line(font.strikethrough, ShadingKind::SolidLine, range.gridline_color);
        }

        if range.lines.contains(GridLines::UNDERLINE) {
            horizontal_line(font.underline, ShadingKind::SolidLine, range.underline_color);
        } else if range
            .lines
            .intersects(GridLines::DOTTED_UNDERLINE | GridLines::HYPERLINK_UNDERLINE)
        {
            horizontal_line(font.underline, ShadingKind::DottedLine, range.underline_color);
        } else if range.lines.contains(GridLines::DASHED_UNDERLINE) {
            horizontal_line(font.underline, ShadingKind::DashedLine, range.underline_color);
        } else if range.lines.contains(GridLines::CURLY_UNDERLINE) {
            horizontal_line(curly_underline, ShadingKind::CurlyLine, range.underline_color);
        } else if range.lines.contains(GridLines::DOUBLE_UNDERLINE) {
            for pos in font.double_underline {
                horizontal_line(pos, ShadingKind::SolidLine, range.underline_color);
            }
        }
    }
}

/// Selection overlay quads: one per contiguous region, with identical
/// regions on successive rows merged into taller quads.
fn draw_selection(instances: &mut Vec<QuadInstance>, p: &RenderPayload) {
    let cell_w = p.settings.font.cell_width;
    let cell_h = p.settings.font.cell_height;
    let color = p.settings.misc.selection_color;

    let mut last_from = 0u16;
    let mut last_to = 0u16;
    let mut merged_previous = false;

    for (y, row) in p.rows().enumerate() {
        if row.selection_to > row.selection_from {
            if merged_previous && row.selection_from == last_from && row.selection_to == last_to {
                let last = instances.len() - 1;
                instances[last].size[1] += cell_h;
            } else {
                instances.push(QuadInstance {
                    shading: ShadingKind::Selection,
                    position: [
                        (row.selection_from * cell_w) as i16,
                        (y as u16 * cell_h) as i16,
                    ],
                    size: [(row.selection_to - row.selection_from) * cell_w, cell_h],
                    color,
                    ..QuadInstance::default()
                });
                last_from = row.selection_from;
                last_to = row.selection_to;
                merged_previous = true;
            }
        } else {
            merged_previous = false;
        }
    }
}

/// Replace the text quads under each cursor rectangle with up to four
/// surrounding cutouts plus one clipped overlay in the inverted or
/// contrasting cursor foreground color. Emoji quads stay untouched.
fn draw_cursor_foreground(
    instances: &mut Vec<QuadInstance>,
    cursor_rects: &[CursorRect],
    cursor_position: Rect,
) {
    // Everything works on indices: appending reallocates the vector.
    let mut instances_count = instances.len();
    let mut instances_offset = 0;

    // The text quads form one contiguous block after the background and
    // cursor background; find it once, then narrow by the cursor rows.
    while instances_offset < instances_count
        && !instances[instances_offset].shading.is_text()
    {
        instances_offset += 1;
    }
    while instances_offset < instances_count {
        let it = &instances[instances_offset];
        if i32::from(it.position[1]) + i32::from(it.size[1]) > cursor_position.top {
            break;
        }
        instances_offset += 1;
    }
    while instances_count > instances_offset
        && !instances[instances_count - 1].shading.is_text()
    {
        instances_count -= 1;
    }
    while instances_count > instances_offset {
        if i32::from(instances[instances_count - 1].position[1]) < cursor_position.bottom {
            break;
        }
        instances_count -= 1;
    }

    for c in cursor_rects {
        let cursor_l = i32::from(c.position[0]);
        let cursor_t = i32::from(c.position[1]);
        let cursor_r = cursor_l + i32::from(c.size[0]);
        let cursor_b = cursor_t + i32::from(c.size[1]);

        let mut i = instances_offset;
        while i < instances_count {
            let it = &instances[i];
            let l = i32::from(it.position[0]);
            let t = i32::from(it.position[1]);
            let r = l + i32::from(it.size[0]);
            let b = t + i32::from(it.size[1]);

            if l < cursor_r && r > cursor_l && t < cursor_b && b > cursor_t {
                let added = cursor_foreground_slow_path(instances, c, i);
                i += added;
                instances_count += added;
            }
            i += 1;
        }
    }
}

/// Cut a cursor-shaped hole into the text quad at `offset` and draw the
/// clipped intersection in the cursor foreground. Returns how many
/// instances were added before `offset + 1`.
fn cursor_foreground_slow_path(
    instances: &mut Vec<QuadInstance>,
    c: &CursorRect,
    offset: usize,
) -> usize {
    let it = instances[offset];

    // Colored glyphs can't be meaningfully inverted; leave them whole.
    if it.shading == ShadingKind::TextPassthrough {
        return 0;
    }

    let cursor_l = i32::from(c.position[0]);
    let cursor_t = i32::from(c.position[1]);
    let cursor_r = cursor_l + i32::from(c.size[0]);
    let cursor_b = cursor_t + i32::from(c.size[1]);

    let l = i32::from(it.position[0]);
    let t = i32::from(it.position[1]);
    let r = l + i32::from(it.size[0]);
    let b = t + i32::from(it.size[1]);

    let ix_l = cursor_l.max(l);
    let ix_t = cursor_t.max(t);
    let ix_r = cursor_r.min(r);
    let ix_b = cursor_b.min(b);
    debug_assert!(ix_l < ix_r && ix_t < ix_b);

    // A cutout per protruding side; their union with the intersection
    // tiles the original quad exactly, with disjoint interiors.
    let mut cutouts = [Rect::default(); 4];
    let mut cutout_count = 0;
    if t < ix_t {
        cutouts[cutout_count] = Rect::new(l, t, r, ix_t);
        cutout_count += 1;
    }
    if b > ix_b {
        cutouts[cutout_count] = Rect::new(l, ix_b, r, b);
        cutout_count += 1;
    }
    if l < ix_l {
        cutouts[cutout_count] = Rect::new(l, ix_t, ix_l, ix_b);
        cutout_count += 1;
    }
    if r > ix_r {
        cutouts[cutout_count] = Rect::new(ix_r, ix_t, r, ix_b);
        cutout_count += 1;
    }

    let quad_for = |rect: &Rect| QuadInstance {
        shading: it.shading,
        rendition_scale: it.rendition_scale,
        position: [rect.left as i16, rect.top as i16],
        size: [(rect.right - rect.left) as u16, (rect.bottom - rect.top) as u16],
        texcoord: [
            (i32::from(it.texcoord[0]) + rect.left - l) as u16,
            (i32::from(it.texcoord[1]) + rect.top - t) as u16,
        ],
        color: it.color,
    };

    let mut color = if c.foreground == 0xffff_ffff {
        it.color ^ 0x00ff_ffff
    } else {
        c.foreground
    };
    color = color::get_perceivable_color(color, c.background, 0.5 * 0.5);

    let mut overlay = quad_for(&Rect::new(ix_l, ix_t, ix_r, ix_b));
    overlay.color = color;

    if cutout_count == 0 {
        // The cursor covers the whole glyph: recolor it in place.
        instances[offset] = overlay;
        return 0;
    }

    let replacement: Vec<QuadInstance> =
        cutouts[..cutout_count].iter().map(|r| quad_for(r)).collect();
    instances.splice(offset..offset + 1, replacement);
    instances.push(overlay);
    cutout_count - 1
}
