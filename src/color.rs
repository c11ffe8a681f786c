//! 32-bit RGBA color math: premultiplication, oklab-based perceptual
//! distance, and contrast enforcement for cursor/selection colors.
//!
//! All `u32` colors in this crate are laid out as `0xAABBGGRR`: red in the
//! low byte, alpha in the high byte. This is the byte order an
//! `Rgba8Unorm` texture expects on little-endian hosts.

/// Extract `(r, g, b, a)` channels as `u32`s in `0..=255`.
#[inline]
fn channels(c: u32) -> (u32, u32, u32, u32) {
    (c & 0xff, (c >> 8) & 0xff, (c >> 16) & 0xff, c >> 24)
}

/// Premultiply the color channels by alpha: `(r*a/255, g*a/255, b*a/255, a)`.
pub fn premultiply(c: u32) -> u32 {
    let (r, g, b, a) = channels(c);
    (a << 24) | ((b * a / 255) << 16) | ((g * a / 255) << 8) | (r * a / 255)
}

/// sRGB transfer function, single channel in `[0, 1]`.
fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

/// Inverse sRGB transfer function, single channel in `[0, 1]`.
fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// A color in the oklab perceptual space.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Oklab {
    l: f32,
    a: f32,
    b: f32,
}

fn oklab_from_u32(c: u32) -> Oklab {
    let (r8, g8, b8, _) = channels(c);
    let r = srgb_to_linear(r8 as f32 / 255.0);
    let g = srgb_to_linear(g8 as f32 / 255.0);
    let b = srgb_to_linear(b8 as f32 / 255.0);

    let l = 0.412_221_47 * r + 0.536_332_54 * g + 0.051_445_995 * b;
    let m = 0.211_903_5 * r + 0.680_699_55 * g + 0.107_396_96 * b;
    let s = 0.088_302_46 * r + 0.281_718_84 * g + 0.629_978_7 * b;

    let l = l.cbrt();
    let m = m.cbrt();
    let s = s.cbrt();

    Oklab {
        l: 0.210_454_26 * l + 0.793_617_8 * m - 0.004_072_047 * s,
        a: 1.977_998_5 * l - 2.428_592_2 * m + 0.450_593_7 * s,
        b: 0.025_904_037 * l + 0.782_771_77 * m - 0.808_675_77 * s,
    }
}

fn oklab_to_u32(c: Oklab, alpha: u32) -> u32 {
    let l = c.l + 0.396_337_78 * c.a + 0.215_803_76 * c.b;
    let m = c.l - 0.105_561_346 * c.a - 0.063_854_17 * c.b;
    let s = c.l - 0.089_484_18 * c.a - 1.291_485_5 * c.b;

    let l = l * l * l;
    let m = m * m * m;
    let s = s * s * s;

    let r = 4.076_741_7 * l - 3.307_711_6 * m + 0.230_969_94 * s;
    let g = -1.268_438 * l + 2.609_757_4 * m - 0.341_319_38 * s;
    let b = -0.004_196_086_3 * l - 0.703_418_6 * m + 1.707_614_7 * s;

    let to_u8 = |v: f32| -> u32 {
        (linear_to_srgb(v.clamp(0.0, 1.0)) * 255.0).round() as u32
    };

    (alpha << 24) | (to_u8(b) << 16) | (to_u8(g) << 8) | to_u8(r)
}

/// Squared perceptual distance between two colors in oklab space.
pub fn distance_sq(c1: u32, c2: u32) -> f32 {
    let x = oklab_from_u32(c1);
    let y = oklab_from_u32(c2);
    let dl = x.l - y.l;
    let da = x.a - y.a;
    let db = x.b - y.b;
    dl * dl + da * da + db * db
}

/// Perceptual lightness of a color in `[0, 1]` (oklab L).
pub fn luminosity(c: u32) -> f32 {
    oklab_from_u32(c).l
}

/// Adjust `color` so its squared perceptual distance from `reference` is at
/// least `min_distance_sq`, by pushing its lightness away from the
/// reference. The hue is preserved; alpha is taken from `color`.
///
/// The legacy console inverted colors with `bg ^ 0xc0c0c0`, which bottomed
/// out at a squared distance of ~0.029. Callers pass 0.25² for the cursor
/// background and 0.5² for the cursor foreground.
pub fn get_perceivable_color(color: u32, reference: u32, min_distance_sq: f32) -> u32 {
    if distance_sq(color, reference) >= min_distance_sq {
        return color;
    }

    let mut lab = oklab_from_u32(color);
    let ref_l = oklab_from_u32(reference).l;
    let delta = min_distance_sq.sqrt();

    lab.l = if lab.l >= ref_l {
        let up = ref_l + delta;
        if up <= 1.0 { up } else { ref_l - delta }
    } else {
        let down = ref_l - delta;
        if down >= 0.0 { down } else { ref_l + delta }
    };

    oklab_to_u32(lab, color >> 24)
}
