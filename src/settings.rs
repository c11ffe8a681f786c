//! Generation-counted settings shared between the producer API and the
//! present layer.
//!
//! Every mutable settings struct is wrapped in [`Generational`]; consumers
//! cache the last generation they observed and re-run dependent setup only
//! when it differs.

use std::ops::Deref;

/// A value paired with a monotonically increasing generation counter.
///
/// Reads go through `Deref`; every call to [`Generational::write`] bumps
/// the generation by exactly one, whether or not the value changes.
#[derive(Debug, Clone)]
pub struct Generational<T> {
    value: T,
    generation: u64,
}

impl<T> Generational<T> {
    pub fn new(value: T) -> Self {
        Self { value, generation: 1 }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mutable access; bumps the generation.
    pub fn write(&mut self) -> &mut T {
        self.generation += 1;
        &mut self.value
    }
}

impl<T> Deref for Generational<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default> Default for Generational<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Glyph rasterization pipeline selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntialiasingMode {
    ClearType,
    #[default]
    Grayscale,
    Aliased,
}

/// Backend adapter preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphicsApi {
    #[default]
    Automatic,
    SoftwareOnly,
    Vulkan,
    Metal,
    Dx12,
}

/// An OpenType feature tag with its value (0 disables, 1 enables).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontFeature {
    pub tag: [u8; 4],
    pub value: u32,
}

/// A variable-font axis tag with its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontAxis {
    pub tag: [u8; 4],
    pub value: f32,
}

/// A horizontal decoration line: offset from the cell top plus thickness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecorationPosition {
    pub position: u16,
    pub height: u16,
}

/// Everything derived from the resolved font: cell geometry, decoration
/// metrics, shaping features, and the soft-font pattern.
#[derive(Debug, Clone)]
pub struct FontSettings {
    pub family: String,
    /// Em size in device pixels.
    pub font_size: f32,
    pub font_weight: u16,
    pub dpi: u16,

    pub cell_width: u16,
    pub cell_height: u16,
    pub advance_width: u16,
    pub baseline: u16,
    pub descender: u16,
    pub thin_line_width: u16,

    pub grid_top: DecorationPosition,
    pub grid_bottom: DecorationPosition,
    pub grid_left: DecorationPosition,
    pub grid_right: DecorationPosition,
    pub underline: DecorationPosition,
    pub double_underline: [DecorationPosition; 2],
    pub strikethrough: DecorationPosition,
    pub overline: DecorationPosition,

    pub antialiasing_mode: AntialiasingMode,
    pub builtin_glyphs: bool,
    pub features: Vec<FontFeature>,
    pub axes: Vec<FontAxis>,

    /// DRCS soft font: one `u16` bit row per scanline, glyphs back to back.
    pub soft_font_pattern: Vec<u16>,
    pub soft_font_cell_width: u16,
    pub soft_font_cell_height: u16,
}

impl Default for FontSettings {
    fn default() -> Self {
        Self {
            family: String::new(),
            font_size: 0.0,
            font_weight: 400,
            dpi: 96,
            cell_width: 1,
            cell_height: 1,
            advance_width: 1,
            baseline: 1,
            descender: 0,
            thin_line_width: 1,
            grid_top: DecorationPosition::default(),
            grid_bottom: DecorationPosition::default(),
            grid_left: DecorationPosition::default(),
            grid_right: DecorationPosition::default(),
            underline: DecorationPosition::default(),
            double_underline: [DecorationPosition::default(); 2],
            strikethrough: DecorationPosition::default(),
            overline: DecorationPosition::default(),
            antialiasing_mode: AntialiasingMode::default(),
            builtin_glyphs: true,
            features: Vec::new(),
            axes: Vec::new(),
            soft_font_pattern: Vec::new(),
            soft_font_cell_width: 0,
            soft_font_cell_height: 0,
        }
    }
}

impl FontSettings {
    /// Whether the user feature set disables standard ligatures (`liga 0`).
    pub fn ligatures_disabled(&self) -> bool {
        self.features
            .iter()
            .any(|f| f.tag == *b"liga" && f.value == 0)
    }
}

/// The cursor color value that means "invert the cell underneath".
pub const INVERT_CURSOR_COLOR: u32 = 0xffff_ffff;

/// Cursor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorKind {
    #[default]
    Legacy,
    VerticalBar,
    Underscore,
    DoubleUnderscore,
    EmptyBox,
    FullBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSettings {
    /// Opaque cursor color, or [`INVERT_CURSOR_COLOR`].
    pub color: u32,
    pub kind: CursorKind,
    /// Height of the `Legacy` cursor in percent of the cell height.
    pub height_percent: u16,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            color: INVERT_CURSOR_COLOR,
            kind: CursorKind::Legacy,
            height_percent: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiscSettings {
    pub background_color: u32,
    pub foreground_color: u32,
    pub selection_color: u32,
    pub selection_foreground: u32,
}

impl Default for MiscSettings {
    fn default() -> Self {
        Self {
            background_color: 0,
            foreground_color: 0xffff_ffff,
            selection_color: 0x7fff_ffff,
            selection_foreground: 0xff00_0000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetSettings {
    pub graphics_api: GraphicsApi,
    pub hardware_acceleration: bool,
}

/// The full settings tree. The producer edits its copy through
/// [`Generational::write`]; `start_paint` detects the outer generation
/// change and syncs the payload's copy.
#[derive(Debug, Clone)]
pub struct Settings {
    pub target: Generational<TargetSettings>,
    pub font: Generational<FontSettings>,
    pub cursor: Generational<CursorSettings>,
    pub misc: Generational<MiscSettings>,
    /// Swap chain size in pixels.
    pub target_width: u16,
    pub target_height: u16,
    /// Viewport size in cells.
    pub viewport_cols: u16,
    pub viewport_rows: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: Generational::default(),
            font: Generational::default(),
            cursor: Generational::default(),
            misc: Generational::default(),
            target_width: 1,
            target_height: 1,
            viewport_cols: 1,
            viewport_rows: 1,
        }
    }
}
