//! Contrast enhancement: linear stretch around mid-gray, tiled contrast-limited
//! histogram equalization, and a per-channel min/max histogram stretch.

use tracing::debug;

use super::helpers::{clamp_channel, luminance, luminance_plane, mean_std};
use super::settings::ContrastConfig;
use super::types::{PixelBuffer, ProcessingContext};

/// Tile edge for adaptive equalization, in pixels.
pub const CLAHE_TILE_SIZE: u32 = 64;

/// Luminance std-dev normalizer (half the 8-bit range).
pub const CONTRAST_NORMALIZER: f64 = 127.5;

/// Default low-contrast threshold for [`needs_enhancement`].
pub const DEFAULT_ENHANCEMENT_THRESHOLD: f32 = 0.4;

/// Luminance below this is treated as black when scaling channels by ratio.
const MIN_LUMINANCE: f32 = 1e-3;

/// Returns whether any pixel changed.
pub fn apply(ctx: &mut ProcessingContext, config: &ContrastConfig) -> bool {
    if is_identity(config) {
        return false;
    }
    let before = ctx.buffer().clone();
    if config.adaptive {
        equalize_adaptive(ctx.buffer_mut(), config.clip_limit);
    } else {
        linear(ctx.buffer_mut(), config.factor);
    }
    let changed = *ctx.buffer() != before;
    debug!(
        adaptive = config.adaptive,
        factor = config.factor,
        clip_limit = config.clip_limit,
        changed,
        "Contrast enhanced"
    );
    changed
}

/// Whether `apply` would leave the image untouched.
pub fn is_identity(config: &ContrastConfig) -> bool {
    !config.adaptive && (config.factor - 1.0).abs() < f32::EPSILON
}

/// `v -> clamp(factor * (v - 128) + 128)` on R, G and B. Alpha untouched.
pub fn linear(buf: &mut PixelBuffer, factor: f32) {
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        *slot = clamp_channel(factor * (v as f32 - 128.0) + 128.0);
    }
    for p in buf.data_mut().chunks_exact_mut(4) {
        p[0] = lut[p[0] as usize];
        p[1] = lut[p[1] as usize];
        p[2] = lut[p[2] as usize];
    }
}

// ═══════════════════════════════════════════════════════════
// Adaptive (tiled, contrast-limited) equalization
// ═══════════════════════════════════════════════════════════

/// Equalize luminance independently per 64x64 tile.
///
/// Histogram bins above `clip_limit * pixels / 256` are clipped and the excess
/// spread evenly over all bins. Each pixel's new luminance comes from the
/// tile's normalized CDF and is applied to R, G, B as a ratio.
pub fn equalize_adaptive(buf: &mut PixelBuffer, clip_limit: f32) {
    let (w, h) = buf.dimensions();
    let mut ty = 0;
    while ty < h {
        let tile_h = CLAHE_TILE_SIZE.min(h - ty);
        let mut tx = 0;
        while tx < w {
            let tile_w = CLAHE_TILE_SIZE.min(w - tx);
            equalize_tile(buf, tx, ty, tile_w, tile_h, clip_limit);
            tx += CLAHE_TILE_SIZE;
        }
        ty += CLAHE_TILE_SIZE;
    }
}

fn equalize_tile(buf: &mut PixelBuffer, x0: u32, y0: u32, tw: u32, th: u32, clip_limit: f32) {
    let pixel_count = (tw * th) as f32;
    let mut hist = [0f32; 256];
    for y in y0..y0 + th {
        for x in x0..x0 + tw {
            let [r, g, b, _] = buf.pixel(x, y);
            hist[clamp_channel(luminance(r, g, b)) as usize] += 1.0;
        }
    }

    // Single-level tile: nothing to redistribute.
    if hist.iter().filter(|&&c| c > 0.0).count() <= 1 {
        return;
    }

    clip_histogram(&mut hist, clip_limit * pixel_count / 256.0);

    let mut cdf = [0f32; 256];
    let mut running = 0.0;
    for (i, count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0.0).unwrap_or(0.0);
    let cdf_max = cdf[255];
    let range = cdf_max - cdf_min;
    if range <= 0.0 {
        return;
    }

    for y in y0..y0 + th {
        for x in x0..x0 + tw {
            let [r, g, b, a] = buf.pixel(x, y);
            let lum = luminance(r, g, b);
            let bin = clamp_channel(lum) as usize;
            let mapped = ((cdf[bin] - cdf_min) / range * 255.0).clamp(0.0, 255.0);
            let out = if lum < MIN_LUMINANCE {
                let v = clamp_channel(mapped);
                [v, v, v, a]
            } else {
                let ratio = mapped / lum;
                [
                    clamp_channel(r as f32 * ratio),
                    clamp_channel(g as f32 * ratio),
                    clamp_channel(b as f32 * ratio),
                    a,
                ]
            };
            buf.set_pixel(x, y, out);
        }
    }
}

/// Cap every bin at `limit`, then share the clipped mass across all bins.
fn clip_histogram(hist: &mut [f32; 256], limit: f32) {
    if limit <= 0.0 {
        return;
    }
    let mut excess = 0.0;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }
    let share = excess / 256.0;
    for count in hist.iter_mut() {
        *count += share;
    }
}

// ═══════════════════════════════════════════════════════════
// Histogram stretch
// ═══════════════════════════════════════════════════════════

/// Per-channel min/max stretch to the full 0..=255 range.
///
/// Cheaper than adaptive equalization and never reorders intensities.
/// Channels with a single value are left alone.
pub fn stretch_histogram(buf: &mut PixelBuffer) {
    let mut min = [255u8; 3];
    let mut max = [0u8; 3];
    for p in buf.data().chunks_exact(4) {
        for c in 0..3 {
            min[c] = min[c].min(p[c]);
            max[c] = max[c].max(p[c]);
        }
    }
    let mut luts = [[0u8; 256]; 3];
    for c in 0..3 {
        let span = max[c] as f32 - min[c] as f32;
        for (v, slot) in luts[c].iter_mut().enumerate() {
            *slot = if span <= 0.0 {
                v as u8
            } else {
                clamp_channel((v as f32 - min[c] as f32) * 255.0 / span)
            };
        }
    }
    for p in buf.data_mut().chunks_exact_mut(4) {
        for c in 0..3 {
            p[c] = luts[c][p[c] as usize];
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Heuristics
// ═══════════════════════════════════════════════════════════

/// Luminance std-dev normalized to [0, 1].
pub fn normalized_contrast(buf: &PixelBuffer) -> f32 {
    let (_, std) = mean_std(&luminance_plane(buf));
    (std / CONTRAST_NORMALIZER).clamp(0.0, 1.0) as f32
}

/// Linear factor suited to the image's current contrast.
pub fn optimal_factor(buf: &PixelBuffer) -> f32 {
    let contrast = normalized_contrast(buf);
    if contrast > 0.6 {
        1.1
    } else if contrast < 0.3 {
        1.8
    } else {
        1.4
    }
}

/// True when normalized contrast falls below `threshold`.
pub fn needs_enhancement(buf: &PixelBuffer, threshold: f32) -> bool {
    normalized_contrast(buf) < threshold
}
