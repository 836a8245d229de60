//! Noise reduction: median, Gaussian and bilateral filters, plus grayscale
//! morphological opening / closing for speckle cleanup.

use tracing::debug;

use super::helpers::{clamp_channel, edge_ratio, luminance, luminance_plane};
use super::settings::{NoiseMethod, NoiseReductionConfig};
use super::types::{PixelBuffer, ProcessingContext};

/// 3x3 Gaussian (binomial) weights, sum 16.
const GAUSSIAN_3: [f32; 3] = [1.0, 2.0, 1.0];
const GAUSSIAN_3_SUM: f32 = 16.0;

/// 5x5 Gaussian (binomial) weights, sum 256.
const GAUSSIAN_5: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
const GAUSSIAN_5_SUM: f32 = 256.0;

/// Bilateral range sigma per unit of strength.
const BILATERAL_RANGE_SCALE: f32 = 50.0;

/// Floor on the bilateral range sigma so strength 0 stays well-defined.
const MIN_RANGE_SIGMA: f32 = 1.0;

/// Edge ratio above which the edge-preserving filter is preferred.
const EDGE_RATIO_BILATERAL: f32 = 0.3;

/// Mean 3x3 luminance variance above which impulse noise is assumed.
const LOCAL_VARIANCE_MEDIAN: f64 = 500.0;

/// Returns whether the filter changed any pixel.
pub fn apply(ctx: &mut ProcessingContext, config: &NoiseReductionConfig) -> bool {
    let before = ctx.buffer().clone();
    let buf = ctx.buffer_mut();
    match config.method {
        NoiseMethod::Median => median(buf, config.kernel_size),
        NoiseMethod::Gaussian => gaussian(buf, config.kernel_size, config.strength),
        NoiseMethod::Bilateral => bilateral(buf, config.kernel_size, config.strength),
    }
    let changed = *ctx.buffer() != before;
    debug!(
        method = ?config.method,
        kernel = config.kernel_size,
        strength = config.strength,
        changed,
        "Noise reduction applied"
    );
    changed
}

// ═══════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════

/// Per-channel median over a `kernel_size` square window.
///
/// Pixels within `kernel_size / 2` of the border have no full window and are
/// left as they are. Alpha is never touched.
pub fn median(buf: &mut PixelBuffer, kernel_size: u32) {
    let radius = (kernel_size / 2) as i64;
    let (w, h) = (buf.width() as i64, buf.height() as i64);
    if radius == 0 || w <= 2 * radius || h <= 2 * radius {
        return;
    }

    let src = buf.clone();
    let window = (kernel_size * kernel_size) as usize;
    let mut samples: [Vec<u8>; 3] = [
        Vec::with_capacity(window),
        Vec::with_capacity(window),
        Vec::with_capacity(window),
    ];

    for y in radius..h - radius {
        for x in radius..w - radius {
            for s in samples.iter_mut() {
                s.clear();
            }
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let p = src.pixel((x + dx) as u32, (y + dy) as u32);
                    for c in 0..3 {
                        samples[c].push(p[c]);
                    }
                }
            }
            let mut out = src.pixel(x as u32, y as u32);
            let mid = window / 2;
            for c in 0..3 {
                let (_, m, _) = samples[c].select_nth_unstable(mid);
                out[c] = *m;
            }
            buf.set_pixel(x as u32, y as u32, out);
        }
    }
}

/// Gaussian blur (3x3 for kernel 3, else 5x5) blended with the original.
///
/// `strength` 1 is the pure blur, 0 the identity. Borders are clamped.
pub fn gaussian(buf: &mut PixelBuffer, kernel_size: u32, strength: f32) {
    let strength = strength.clamp(0.0, 1.0);
    if strength == 0.0 {
        return;
    }
    let (weights, norm): (&[f32], f32) = if kernel_size <= 3 {
        (&GAUSSIAN_3, GAUSSIAN_3_SUM)
    } else {
        (&GAUSSIAN_5, GAUSSIAN_5_SUM)
    };
    let radius = (weights.len() / 2) as i64;

    let src = buf.clone();
    for y in 0..src.height() as i64 {
        for x in 0..src.width() as i64 {
            let mut acc = [0f32; 3];
            for (ky, wy) in weights.iter().enumerate() {
                for (kx, wx) in weights.iter().enumerate() {
                    let p = src.pixel_clamped(x + kx as i64 - radius, y + ky as i64 - radius);
                    let wgt = wy * wx;
                    for c in 0..3 {
                        acc[c] += p[c] as f32 * wgt;
                    }
                }
            }
            let orig = src.pixel(x as u32, y as u32);
            let mut out = orig;
            for c in 0..3 {
                let blurred = acc[c] / norm;
                out[c] = clamp_channel(orig[c] as f32 * (1.0 - strength) + blurred * strength);
            }
            buf.set_pixel(x as u32, y as u32, out);
        }
    }
}

/// Edge-preserving bilateral filter.
///
/// Neighbor weight = spatial Gaussian (sigma `kernel_size / 3`) times range
/// Gaussian over the channel difference (sigma `strength * 50`). Out-of-image
/// neighbors are skipped.
pub fn bilateral(buf: &mut PixelBuffer, kernel_size: u32, strength: f32) {
    let radius = (kernel_size / 2) as i64;
    if radius == 0 {
        return;
    }
    let spatial_sigma = (kernel_size as f32 / 3.0).max(f32::EPSILON);
    let range_sigma = (strength * BILATERAL_RANGE_SCALE).max(MIN_RANGE_SIGMA);
    let spatial_den = 2.0 * spatial_sigma * spatial_sigma;
    let range_den = 2.0 * range_sigma * range_sigma;

    let side = (2 * radius + 1) as usize;
    let mut spatial = vec![0f32; side * side];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let d2 = (dx * dx + dy * dy) as f32;
            spatial[((dy + radius) as usize) * side + (dx + radius) as usize] =
                (-d2 / spatial_den).exp();
        }
    }
    // Range weights depend only on |difference|.
    let range: Vec<f32> = (0..256)
        .map(|d| (-((d * d) as f32) / range_den).exp())
        .collect();

    let src = buf.clone();
    let (w, h) = (src.width() as i64, src.height() as i64);
    for y in 0..h {
        for x in 0..w {
            let center = src.pixel(x as u32, y as u32);
            let mut sums = [0f32; 3];
            let mut weights = [0f32; 3];
            for dy in -radius..=radius {
                let ny = y + dy;
                if ny < 0 || ny >= h {
                    continue;
                }
                for dx in -radius..=radius {
                    let nx = x + dx;
                    if nx < 0 || nx >= w {
                        continue;
                    }
                    let sw = spatial[((dy + radius) as usize) * side + (dx + radius) as usize];
                    let n = src.pixel(nx as u32, ny as u32);
                    for c in 0..3 {
                        let diff = (n[c] as i16 - center[c] as i16).unsigned_abs() as usize;
                        let wgt = sw * range[diff];
                        sums[c] += n[c] as f32 * wgt;
                        weights[c] += wgt;
                    }
                }
            }
            let mut out = center;
            for c in 0..3 {
                if weights[c] > 0.0 {
                    out[c] = clamp_channel(sums[c] / weights[c]);
                }
            }
            buf.set_pixel(x as u32, y as u32, out);
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Morphology (grayscale)
// ═══════════════════════════════════════════════════════════

/// Erosion then dilation: removes bright specks smaller than the window.
pub fn morphological_open(buf: &mut PixelBuffer, kernel_size: u32) {
    let (w, h) = buf.dimensions();
    let gray = gray_plane(buf);
    let eroded = local_extreme(&gray, w, h, kernel_size, u8::min);
    let opened = local_extreme(&eroded, w, h, kernel_size, u8::max);
    write_gray(buf, &opened);
}

/// Dilation then erosion: fills dark specks smaller than the window.
pub fn morphological_close(buf: &mut PixelBuffer, kernel_size: u32) {
    let (w, h) = buf.dimensions();
    let gray = gray_plane(buf);
    let dilated = local_extreme(&gray, w, h, kernel_size, u8::max);
    let closed = local_extreme(&dilated, w, h, kernel_size, u8::min);
    write_gray(buf, &closed);
}

fn gray_plane(buf: &PixelBuffer) -> Vec<u8> {
    buf.data()
        .chunks_exact(4)
        .map(|p| clamp_channel(luminance(p[0], p[1], p[2])))
        .collect()
}

fn write_gray(buf: &mut PixelBuffer, gray: &[u8]) {
    for (p, &g) in buf.data_mut().chunks_exact_mut(4).zip(gray) {
        p[0] = g;
        p[1] = g;
        p[2] = g;
    }
}

/// Square-window min or max with border-clamped indices.
fn local_extreme(plane: &[u8], w: u32, h: u32, kernel_size: u32, pick: fn(u8, u8) -> u8) -> Vec<u8> {
    let radius = (kernel_size / 2) as i64;
    let (wi, hi) = (w as i64, h as i64);
    let mut out = vec![0u8; plane.len()];
    for y in 0..hi {
        for x in 0..wi {
            let mut acc = plane[(y * wi + x) as usize];
            for dy in -radius..=radius {
                let ny = (y + dy).clamp(0, hi - 1);
                for dx in -radius..=radius {
                    let nx = (x + dx).clamp(0, wi - 1);
                    acc = pick(acc, plane[(ny * wi + nx) as usize]);
                }
            }
            out[(y * wi + x) as usize] = acc;
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════
// Heuristics
// ═══════════════════════════════════════════════════════════

/// Mean luminance variance over 3x3 neighborhoods of interior pixels.
pub fn mean_local_variance(buf: &PixelBuffer) -> f64 {
    let (w, h) = (buf.width() as usize, buf.height() as usize);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let plane = luminance_plane(buf);
    let mut total = 0.0f64;
    let mut count = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut sum = 0.0f64;
            let mut sum_sq = 0.0f64;
            for dy in 0..3 {
                for dx in 0..3 {
                    let v = plane[(y + dy - 1) * w + (x + dx - 1)] as f64;
                    sum += v;
                    sum_sq += v * v;
                }
            }
            let mean = sum / 9.0;
            total += (sum_sq / 9.0 - mean * mean).max(0.0);
            count += 1;
        }
    }
    total / count as f64
}

/// Pick a filter: bilateral for edge-dense images, median for impulse-like
/// noise, Gaussian otherwise.
pub fn recommend_method(buf: &PixelBuffer) -> NoiseMethod {
    if edge_ratio(buf) > EDGE_RATIO_BILATERAL {
        NoiseMethod::Bilateral
    } else if mean_local_variance(buf) > LOCAL_VARIANCE_MEDIAN {
        NoiseMethod::Median
    } else {
        NoiseMethod::Gaussian
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speckled(width: u32, height: u32, spacing: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::filled(width, height, [0, 0, 0, 255]);
        for y in (spacing..height - spacing).step_by(spacing as usize) {
            for x in (spacing..width - spacing).step_by(spacing as usize) {
                buf.set_pixel(x, y, [255, 255, 255, 255]);
            }
        }
        buf
    }

    /// Checkerboard with 2px cells (1px cells cancel out under Sobel).
    fn checkerboard(size: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::filled(size, size, [0, 0, 0, 255]);
        for y in 0..size {
            for x in 0..size {
                if (x / 2 + y / 2) % 2 == 0 {
                    buf.set_pixel(x, y, [255, 255, 255, 255]);
                }
            }
        }
        buf
    }

    #[test]
    fn median_removes_isolated_outlier() {
        let mut buf = PixelBuffer::filled(20, 20, [40, 40, 40, 255]);
        buf.set_pixel(10, 10, [255, 255, 255, 255]);
        median(&mut buf, 3);
        assert_eq!(buf.pixel(10, 10), [40, 40, 40, 255]);
    }

    #[test]
    fn median_removes_dark_outlier_with_larger_kernel() {
        let mut buf = PixelBuffer::filled(20, 20, [200, 200, 200, 255]);
        buf.set_pixel(7, 12, [0, 0, 0, 255]);
        median(&mut buf, 5);
        assert_eq!(buf.pixel(7, 12), [200, 200, 200, 255]);
    }

    #[test]
    fn median_leaves_border_untouched() {
        let mut buf = PixelBuffer::filled(10, 10, [40, 40, 40, 255]);
        buf.set_pixel(0, 5, [255, 255, 255, 255]);
        buf.set_pixel(5, 9, [255, 255, 255, 255]);
        median(&mut buf, 3);
        assert_eq!(buf.pixel(0, 5), [255, 255, 255, 255]);
        assert_eq!(buf.pixel(5, 9), [255, 255, 255, 255]);
    }

    #[test]
    fn median_keeps_alpha() {
        let mut buf = PixelBuffer::filled(8, 8, [40, 40, 40, 99]);
        buf.set_pixel(4, 4, [255, 0, 0, 3]);
        median(&mut buf, 3);
        assert_eq!(buf.pixel(4, 4), [40, 40, 40, 3]);
    }

    #[test]
    fn gaussian_zero_strength_is_identity() {
        let before = speckled(30, 30, 5);
        let mut buf = before.clone();
        gaussian(&mut buf, 3, 0.0);
        assert_eq!(buf, before);
    }

    #[test]
    fn gaussian_spreads_impulse() {
        let mut buf = PixelBuffer::filled(9, 9, [0, 0, 0, 255]);
        buf.set_pixel(4, 4, [160, 160, 160, 255]);
        gaussian(&mut buf, 3, 1.0);
        assert_eq!(buf.pixel(4, 4)[0], 40); // 160 * 4/16
        assert_eq!(buf.pixel(5, 4)[0], 20); // 160 * 2/16
        assert_eq!(buf.pixel(5, 5)[0], 10); // 160 * 1/16
    }

    #[test]
    fn gaussian_five_by_five_preserves_flat_image() {
        let mut buf = PixelBuffer::filled(12, 12, [77, 88, 99, 255]);
        gaussian(&mut buf, 5, 1.0);
        assert_eq!(buf.pixel(0, 0), [77, 88, 99, 255]);
        assert_eq!(buf.pixel(6, 6), [77, 88, 99, 255]);
    }

    #[test]
    fn bilateral_uniform_unchanged() {
        let mut buf = PixelBuffer::filled(20, 20, [100, 150, 200, 255]);
        bilateral(&mut buf, 5, 0.5);
        assert!(buf.data().chunks_exact(4).all(|p| p == [100, 150, 200, 255]));
    }

    #[test]
    fn bilateral_preserves_hard_edges() {
        let mut buf = PixelBuffer::filled(40, 20, [255, 255, 255, 255]);
        for y in 0..20 {
            for x in 0..20 {
                buf.set_pixel(x, y, [0, 0, 0, 255]);
            }
        }
        bilateral(&mut buf, 5, 0.3);
        assert!(buf.pixel(19, 10)[0] < 5, "dark side of edge bled");
        assert!(buf.pixel(20, 10)[0] > 250, "bright side of edge bled");
    }

    #[test]
    fn bilateral_smooths_low_amplitude_noise() {
        let mut buf = PixelBuffer::filled(30, 30, [0, 0, 0, 255]);
        for y in 0..30u32 {
            for x in 0..30u32 {
                let v = 118 + ((x * 31 + y * 17) % 20) as u8;
                buf.set_pixel(x, y, [v, v, v, 255]);
            }
        }
        let before = buf.clone();
        bilateral(&mut buf, 5, 0.5);
        assert_ne!(buf, before);
        let spread = |b: &PixelBuffer| {
            let vals: Vec<u8> = b.data().chunks_exact(4).map(|p| p[0]).collect();
            vals.iter().max().unwrap() - vals.iter().min().unwrap()
        };
        assert!(spread(&buf) < spread(&before));
    }

    #[test]
    fn opening_removes_bright_speck() {
        let mut buf = PixelBuffer::filled(15, 15, [0, 0, 0, 255]);
        buf.set_pixel(7, 7, [255, 255, 255, 255]);
        morphological_open(&mut buf, 3);
        assert_eq!(buf.pixel(7, 7)[0], 0);
    }

    #[test]
    fn closing_fills_dark_speck() {
        let mut buf = PixelBuffer::filled(15, 15, [255, 255, 255, 255]);
        buf.set_pixel(7, 7, [0, 0, 0, 255]);
        morphological_close(&mut buf, 3);
        assert_eq!(buf.pixel(7, 7)[0], 255);
    }

    #[test]
    fn opening_keeps_large_shapes() {
        let mut buf = PixelBuffer::filled(20, 20, [0, 0, 0, 255]);
        for y in 5..15 {
            for x in 5..15 {
                buf.set_pixel(x, y, [255, 255, 255, 255]);
            }
        }
        morphological_open(&mut buf, 3);
        assert_eq!(buf.pixel(10, 10)[0], 255);
        assert_eq!(buf.pixel(5, 5)[0], 255);
    }

    #[test]
    fn recommend_bilateral_for_edge_dense() {
        assert_eq!(recommend_method(&checkerboard(20)), NoiseMethod::Bilateral);
    }

    #[test]
    fn recommend_median_for_sparse_impulses() {
        assert_eq!(recommend_method(&speckled(60, 60, 6)), NoiseMethod::Median);
    }

    #[test]
    fn recommend_gaussian_for_flat() {
        let buf = PixelBuffer::filled(20, 20, [128, 128, 128, 255]);
        assert_eq!(recommend_method(&buf), NoiseMethod::Gaussian);
    }

    #[test]
    fn apply_reports_whether_pixels_changed() {
        let flat = PixelBuffer::filled(20, 20, [128, 128, 128, 255]);
        for method in [NoiseMethod::Median, NoiseMethod::Gaussian, NoiseMethod::Bilateral] {
            let mut ctx = ProcessingContext::new(flat.clone());
            let config = NoiseReductionConfig {
                enabled: true,
                method,
                kernel_size: 3,
                strength: 0.5,
            };
            assert!(!apply(&mut ctx, &config), "{method:?}");
        }

        let mut ctx = ProcessingContext::new(speckled(30, 30, 6));
        let zero_strength = NoiseReductionConfig {
            enabled: true,
            method: NoiseMethod::Gaussian,
            kernel_size: 5,
            strength: 0.0,
        };
        assert!(!apply(&mut ctx, &zero_strength));
        assert_eq!(ctx.buffer(), &speckled(30, 30, 6));

        let median3 = NoiseReductionConfig {
            method: NoiseMethod::Median,
            ..zero_strength
        };
        assert!(apply(&mut ctx, &median3));
    }
}
