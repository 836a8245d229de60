//! Brightness offset and sharpening (unsharp mask, Laplacian).

use tracing::debug;

use super::helpers::{clamp_channel, luminance_plane, mean_std};
use super::settings::{BrightnessConfig, SharpenMethod, SharpeningConfig};
use super::types::{PixelBuffer, ProcessingContext};

/// Auto brightness never shifts by more than this many levels.
pub const MAX_AUTO_OFFSET: f32 = 64.0;

/// Auto brightness aims the mean luminance here.
const TARGET_MEAN: f32 = 128.0;

/// Offsets smaller than this leave every channel unchanged after rounding.
const MIN_EFFECTIVE_OFFSET: f32 = 0.5;

// ═══════════════════════════════════════════════════════════
// Brightness
// ═══════════════════════════════════════════════════════════

/// Shift R, G and B by a uniform offset.
///
/// Returns the offset applied in levels, or `None` when it was too small to
/// change anything.
pub fn apply_brightness(ctx: &mut ProcessingContext, config: &BrightnessConfig) -> Option<f32> {
    let offset = brightness_offset(ctx.buffer(), config);
    if offset.abs() < MIN_EFFECTIVE_OFFSET {
        debug!(offset, "Brightness already balanced");
        return None;
    }
    shift_brightness(ctx.buffer_mut(), offset);
    debug!(offset, auto = config.auto_adjust, "Brightness adjusted");
    Some(offset)
}

/// Auto mode pulls mean luminance toward mid-gray, capped at
/// [`MAX_AUTO_OFFSET`]; manual mode scales `adjustment` to full range.
pub fn brightness_offset(buf: &PixelBuffer, config: &BrightnessConfig) -> f32 {
    if config.auto_adjust {
        let (mean, _) = mean_std(&luminance_plane(buf));
        (TARGET_MEAN - mean as f32).clamp(-MAX_AUTO_OFFSET, MAX_AUTO_OFFSET)
    } else {
        config.adjustment.clamp(-1.0, 1.0) * 255.0
    }
}

pub fn shift_brightness(buf: &mut PixelBuffer, offset: f32) {
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        *slot = clamp_channel(v as f32 + offset);
    }
    for p in buf.data_mut().chunks_exact_mut(4) {
        p[0] = lut[p[0] as usize];
        p[1] = lut[p[1] as usize];
        p[2] = lut[p[2] as usize];
    }
}

// ═══════════════════════════════════════════════════════════
// Sharpening
// ═══════════════════════════════════════════════════════════

/// Returns false when strength is zero and nothing was done.
pub fn apply_sharpening(ctx: &mut ProcessingContext, config: &SharpeningConfig) -> bool {
    if config.strength <= 0.0 {
        return false;
    }
    match config.method {
        SharpenMethod::UnsharpMask => unsharp_mask(ctx.buffer_mut(), config.strength, config.radius),
        SharpenMethod::Laplacian => laplacian_sharpen(ctx.buffer_mut(), config.strength),
    }
    debug!(method = ?config.method, strength = config.strength, radius = config.radius, "Sharpened");
    true
}

/// `out = orig + strength * (orig - blur)`, blur being a separable box blur
/// of the given radius. Edges clamp.
pub fn unsharp_mask(buf: &mut PixelBuffer, strength: f32, radius: u32) {
    let radius = radius.max(1) as i64;
    let blurred = box_blur(buf, radius);
    for (p, b) in buf
        .data_mut()
        .chunks_exact_mut(4)
        .zip(blurred.chunks_exact(3))
    {
        for c in 0..3 {
            let orig = p[c] as f32;
            p[c] = clamp_channel(orig + strength * (orig - b[c]));
        }
    }
}

/// `out = orig + strength * (4*center - up - down - left - right)`. Edges clamp.
pub fn laplacian_sharpen(buf: &mut PixelBuffer, strength: f32) {
    let src = buf.clone();
    let (w, h) = src.dimensions();
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as i64, y as i64);
            let center = src.pixel(x, y);
            let up = src.pixel_clamped(xi, yi - 1);
            let down = src.pixel_clamped(xi, yi + 1);
            let left = src.pixel_clamped(xi - 1, yi);
            let right = src.pixel_clamped(xi + 1, yi);
            let mut out = center;
            for c in 0..3 {
                let response = 4.0 * center[c] as f32
                    - up[c] as f32
                    - down[c] as f32
                    - left[c] as f32
                    - right[c] as f32;
                out[c] = clamp_channel(center[c] as f32 + strength * response);
            }
            buf.set_pixel(x, y, out);
        }
    }
}

/// Separable box blur of the RGB channels. Returns 3 floats per pixel.
fn box_blur(buf: &PixelBuffer, radius: i64) -> Vec<f32> {
    let (w, h) = (buf.width() as i64, buf.height() as i64);
    let span = (2 * radius + 1) as f32;
    let mut horizontal = vec![0f32; (w * h * 3) as usize];
    for y in 0..h {
        for x in 0..w {
            let mut sum = [0f32; 3];
            for dx in -radius..=radius {
                let p = buf.pixel_clamped(x + dx, y);
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            let i = ((y * w + x) * 3) as usize;
            for c in 0..3 {
                horizontal[i + c] = sum[c] / span;
            }
        }
    }

    let mut out = vec![0f32; horizontal.len()];
    for y in 0..h {
        for x in 0..w {
            let mut sum = [0f32; 3];
            for dy in -radius..=radius {
                let yy = (y + dy).clamp(0, h - 1);
                let i = ((yy * w + x) * 3) as usize;
                for c in 0..3 {
                    sum[c] += horizontal[i + c];
                }
            }
            let i = ((y * w + x) * 3) as usize;
            for c in 0..3 {
                out[i + c] = sum[c] / span;
            }
        }
    }
    out
}
