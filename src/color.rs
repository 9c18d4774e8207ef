/// Color space conversion utilities
///
/// This module handles the conversions the sharpness pipeline relies on:
/// - 8-bit RGBA (decoder output) to premultiplied BGRA (canonical frame layout)
/// - sRGB encoded values to linear light
/// - Linear RGB to a single luma channel (Rec. 709 / sRGB primaries)
///
/// The WGSL kernels in `gpu::shaders` carry the same constants; keep both in sync.

/// Rec. 709 luma weights for linear RGB (sum to 1.0)
pub const LUMA_WEIGHTS: [f64; 3] = [0.2126, 0.7152, 0.0722];

/// Bytes per pixel of the canonical BGRA layout
pub const BYTES_PER_PIXEL: usize = 4;

/// Convert one sRGB encoded channel (0.0-1.0) to linear light
///
/// IEC 61966-2-1 piecewise transfer curve.
pub fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Linear luma of one BGRA8 pixel
///
/// Color is used as stored (premultiplied); alpha is ignored, which matches
/// treating every pixel as opaque.
pub fn luma_from_bgra(px: &[u8]) -> f64 {
    let b = srgb_to_linear(px[0] as f64 / 255.0);
    let g = srgb_to_linear(px[1] as f64 / 255.0);
    let r = srgb_to_linear(px[2] as f64 / 255.0);
    LUMA_WEIGHTS[0] * r + LUMA_WEIGHTS[1] * g + LUMA_WEIGHTS[2] * b
}

/// Multiply a color channel by alpha with rounding
#[inline]
pub fn premultiply(channel: u8, alpha: u8) -> u8 {
    ((channel as u16 * alpha as u16 + 127) / 255) as u8
}

/// Pack one straight-alpha RGBA pixel into premultiplied BGRA order
pub fn rgba_to_bgra_premultiplied(rgba: [u8; 4]) -> [u8; 4] {
    let [r, g, b, a] = rgba;
    [
        premultiply(b, a),
        premultiply(g, a),
        premultiply(r, a),
        a,
    ]
}
