//! Skew detection and rotation correction.
//!
//! Three competing detectors search `[-max_angle, max_angle]` in `precision`
//! steps and return the angle of the dominant text-line direction:
//! - projection: variance of the rotated row-projection of ink
//! - edge detection: alignment of rotated scan lines with the Sobel edge map
//! - Hough: (angle, offset) vote accumulator over edge pixels
//!
//! Angle convention: a detected angle `a` means content lines run along
//! `(cos a, sin a)` in image coordinates (y down). Correction rotates by `-a`.

use std::borrow::Cow;

use image::imageops::FilterType;
use tracing::debug;

use super::helpers::{edge_map, edge_ratio, luminance_plane, mean_std};
use super::raster::MAX_PIXELS;
use super::settings::{RotationConfig, RotationMethod};
use super::types::{PixelBuffer, ProcessingContext, CHANNELS};
use super::PreprocessError;

/// Detection runs on a copy no larger than this on its longest side.
/// Angles are scale-invariant, so this only trades resolution for speed.
const DETECTION_MAX_DIM: u32 = 600;

/// Below this size there is not enough structure to measure skew.
const MIN_DETECTION_DIM: u32 = 16;

/// Share of the cross dimension covered by scan-line offsets.
const SCAN_OFFSET_FRACTION: f32 = 0.8;

/// Share of the line direction sampled along each scan line.
const SCAN_SPAN_FRACTION: f32 = 0.6;

/// Edge ratio above which Hough voting is preferred.
const EDGE_RATIO_HOUGH: f32 = 0.3;

/// Share of text-like rows above which projection is preferred.
const TEXT_RATIO_PROJECTION: f32 = 0.4;

/// Dark/light transitions a row needs to look like it crosses text.
const TEXT_ROW_TRANSITIONS: usize = 4;

/// Luminance a pixel must sit below the mean to count as ink.
const INK_MARGIN: f64 = 1.0;

/// Upper bound on angles a single detection may evaluate.
pub const MAX_ANGLE_CANDIDATES: f64 = 10_000.0;

/// Canvas fill for areas uncovered by rotation.
const BACKGROUND: [u8; 4] = [255, 255, 255, 255];

/// Detect skew and, when it exceeds `precision`, rotate the buffer upright.
///
/// Returns the detected angle in degrees, clamped to `±max_angle`.
pub fn apply(ctx: &mut ProcessingContext, config: &RotationConfig) -> Result<f32, PreprocessError> {
    let angle = detect_angle(ctx.buffer(), config);
    if exceeds_precision(angle, config.precision) {
        let rotated = rotate(ctx.buffer(), -angle)?;
        debug!(
            angle,
            from = %format!("{}x{}", ctx.width(), ctx.height()),
            to = %format!("{}x{}", rotated.width(), rotated.height()),
            "Rotation corrected"
        );
        ctx.replace_buffer(rotated);
    } else {
        debug!(angle, precision = config.precision, "Skew below precision, left as is");
    }
    Ok(angle)
}

/// Whether an angle is large enough to be worth correcting.
pub fn exceeds_precision(angle: f32, precision: f32) -> bool {
    angle.abs() > precision
}

/// Measured skew in degrees, clamped to `±max_angle`. Zero for degenerate input.
pub fn detect_angle(buf: &PixelBuffer, config: &RotationConfig) -> f32 {
    let max_angle = config.max_angle.abs();
    if !(max_angle.is_finite() && config.precision.is_finite() && config.precision > 0.0) {
        return 0.0;
    }
    if candidate_count(max_angle, config.precision) > MAX_ANGLE_CANDIDATES {
        return 0.0;
    }
    if buf.width() < MIN_DETECTION_DIM || buf.height() < MIN_DETECTION_DIM {
        return 0.0;
    }

    let view = detection_view(buf);
    let candidates = candidate_angles(max_angle, config.precision);
    let angle = match config.method {
        RotationMethod::Projection => detect_by_projection(&view, &candidates),
        RotationMethod::EdgeDetection => detect_by_edge_alignment(&view, &candidates),
        RotationMethod::Hough => detect_by_hough(&view, &candidates),
    };
    angle.clamp(-max_angle, max_angle)
}

/// Never fails: degenerate buffers report `false`.
pub fn needs_rotation_correction(buf: &PixelBuffer, config: &RotationConfig) -> bool {
    exceeds_precision(detect_angle(buf, config), config.precision)
}

/// Hough for edge-dense images, projection for text-heavy ones, else edge alignment.
pub fn recommend_method(buf: &PixelBuffer) -> RotationMethod {
    if edge_ratio(buf) > EDGE_RATIO_HOUGH {
        RotationMethod::Hough
    } else if text_like_ratio(buf) > TEXT_RATIO_PROJECTION {
        RotationMethod::Projection
    } else {
        RotationMethod::EdgeDetection
    }
}

/// Share of rows with enough dark/light alternation to be crossing text.
pub fn text_like_ratio(buf: &PixelBuffer) -> f32 {
    let (w, h) = (buf.width() as usize, buf.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let plane = luminance_plane(buf);
    let (mean, _) = mean_std(&plane);
    let threshold = (mean - INK_MARGIN) as f32;

    let mut text_rows = 0usize;
    for row in plane.chunks_exact(w) {
        let mut transitions = 0usize;
        let mut dark = row[0] < threshold;
        for &v in &row[1..] {
            let now_dark = v < threshold;
            if now_dark != dark {
                transitions += 1;
                dark = now_dark;
            }
        }
        if transitions >= TEXT_ROW_TRANSITIONS {
            text_rows += 1;
        }
    }
    text_rows as f32 / h as f32
}

// ═══════════════════════════════════════════════════════════
// Candidate search
// ═══════════════════════════════════════════════════════════

/// Number of angles swept for a `±max_angle` search at `precision` steps.
pub fn candidate_count(max_angle: f32, precision: f32) -> f64 {
    (2.0 * max_angle.abs() as f64) / precision as f64 + 1.0
}

/// `-max, -max + step, ..., max`, computed by index to avoid drift.
fn candidate_angles(max_angle: f32, precision: f32) -> Vec<f32> {
    let steps = ((2.0 * max_angle) / precision + 1e-4).floor() as usize;
    (0..=steps)
        .map(|i| -max_angle + i as f32 * precision)
        .collect()
}

/// Highest score wins; exact ties go to the angle nearest zero.
fn best_angle(candidates: &[f32], mut score: impl FnMut(f32) -> f64) -> f32 {
    let mut best = 0.0f32;
    let mut best_score = f64::NEG_INFINITY;
    for &angle in candidates {
        let s = score(angle);
        if s > best_score || (s == best_score && angle.abs() < best.abs()) {
            best_score = s;
            best = angle;
        }
    }
    best
}

fn detection_view(buf: &PixelBuffer) -> Cow<'_, PixelBuffer> {
    let (w, h) = buf.dimensions();
    let largest = w.max(h);
    if largest <= DETECTION_MAX_DIM {
        return Cow::Borrowed(buf);
    }
    let scale = DETECTION_MAX_DIM as f32 / largest as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    let small = image::imageops::resize(&buf.to_rgba_image(), new_w, new_h, FilterType::Triangle);
    Cow::Owned(PixelBuffer::from_rgba_image(small))
}

// ── Projection ───────────────────────────────────────────

/// Pixel darker than the mean, weighted by inverted intensity.
struct InkPixel {
    dx: f32,
    dy: f32,
    weight: f32,
}

fn detect_by_projection(buf: &PixelBuffer, candidates: &[f32]) -> f32 {
    let (w, h) = buf.dimensions();
    let plane = luminance_plane(buf);
    let (mean, _) = mean_std(&plane);
    let (cx, cy) = center(w, h);

    let ink: Vec<InkPixel> = plane
        .iter()
        .enumerate()
        .filter(|&(_, &lum)| (lum as f64) < mean - INK_MARGIN)
        .map(|(i, &lum)| InkPixel {
            dx: (i % w as usize) as f32 - cx,
            dy: (i / w as usize) as f32 - cy,
            weight: 255.0 - lum,
        })
        .collect();
    if ink.is_empty() {
        return 0.0;
    }

    let bins = projection_bins(w, h);
    let mut hist = vec![0f64; bins];
    best_angle(candidates, |angle| {
        hist.fill(0.0);
        let (s, c) = angle.to_radians().sin_cos();
        let offset = (bins / 2) as f32;
        for p in &ink {
            let r = -p.dx * s + p.dy * c;
            let bin = (r + offset).round();
            if bin >= 0.0 && (bin as usize) < bins {
                hist[bin as usize] += p.weight as f64;
            }
        }
        variance(&hist)
    })
}

// ── Edge alignment ───────────────────────────────────────

fn detect_by_edge_alignment(buf: &PixelBuffer, candidates: &[f32]) -> f32 {
    let (w, h) = buf.dimensions();
    let edges = edge_map(buf);
    if !edges.iter().any(|&e| e) {
        return 0.0;
    }
    let (cx, cy) = center(w, h);
    let is_edge = |x: f32, y: f32| -> bool {
        let (xi, yi) = (x.round(), y.round());
        if xi < 0.0 || yi < 0.0 || xi >= w as f32 || yi >= h as f32 {
            return false;
        }
        edges[yi as usize * w as usize + xi as usize]
    };

    // Rows scan along the text direction, columns across it.
    let row_offsets = half_extent(h, SCAN_OFFSET_FRACTION);
    let row_span = half_extent(w, SCAN_SPAN_FRACTION);
    let col_offsets = half_extent(w, SCAN_OFFSET_FRACTION);
    let col_span = half_extent(h, SCAN_SPAN_FRACTION);

    best_angle(candidates, |angle| {
        let (s, c) = angle.to_radians().sin_cos();
        let mut score = 0.0f64;
        for o in -row_offsets..=row_offsets {
            let (bx, by) = (cx - o as f32 * s, cy + o as f32 * c);
            let hits = (-row_span..=row_span)
                .filter(|&t| is_edge(bx + t as f32 * c, by + t as f32 * s))
                .count() as f64;
            score += hits * hits;
        }
        for o in -col_offsets..=col_offsets {
            let (bx, by) = (cx + o as f32 * c, cy + o as f32 * s);
            let hits = (-col_span..=col_span)
                .filter(|&t| is_edge(bx - t as f32 * s, by + t as f32 * c))
                .count() as f64;
            score += hits * hits;
        }
        score
    })
}

// ── Hough ────────────────────────────────────────────────

fn detect_by_hough(buf: &PixelBuffer, candidates: &[f32]) -> f32 {
    let (w, h) = buf.dimensions();
    let edges = edge_map(buf);
    let (cx, cy) = center(w, h);
    let points: Vec<(f32, f32)> = edges
        .iter()
        .enumerate()
        .filter(|&(_, &e)| e)
        .map(|(i, _)| ((i % w as usize) as f32 - cx, (i / w as usize) as f32 - cy))
        .collect();
    if points.is_empty() {
        return 0.0;
    }

    let bins = projection_bins(w, h);
    let offset = (bins / 2) as f32;
    let mut row = vec![0u32; bins];
    let mut peak_votes = 0u32;
    let mut peak_angle = 0.0f32;
    for &angle in candidates {
        row.fill(0);
        let (s, c) = angle.to_radians().sin_cos();
        for &(dx, dy) in &points {
            let rho = (-dx * s + dy * c + offset).round();
            if rho >= 0.0 && (rho as usize) < bins {
                row[rho as usize] += 1;
            }
        }
        let votes = row.iter().copied().max().unwrap_or(0);
        if votes > peak_votes || (votes == peak_votes && angle.abs() < peak_angle.abs()) {
            peak_votes = votes;
            peak_angle = angle;
        }
    }
    peak_angle
}

// ── Shared geometry ──────────────────────────────────────

fn center(w: u32, h: u32) -> (f32, f32) {
    ((w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0)
}

/// Offset bins spanning the image diagonal, so every rotation fits.
fn projection_bins(w: u32, h: u32) -> usize {
    let diag = ((w as f64).powi(2) + (h as f64).powi(2)).sqrt();
    diag.ceil() as usize + 3
}

fn half_extent(dim: u32, fraction: f32) -> i32 {
    ((dim as f32 * fraction) / 2.0).floor() as i32
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

// ═══════════════════════════════════════════════════════════
// Rotation rewrite
// ═══════════════════════════════════════════════════════════

/// Rotate by `angle_deg` about the image center onto a white canvas sized to
/// the rotated bounding box. Bilinear sampling.
pub fn rotate(buf: &PixelBuffer, angle_deg: f32) -> Result<PixelBuffer, PreprocessError> {
    let (w, h) = buf.dimensions();
    let (s, c) = angle_deg.to_radians().sin_cos();
    let (wf, hf) = (w as f32, h as f32);
    let new_w = ((wf * c.abs() + hf * s.abs()) - 1e-3).ceil().max(1.0) as u32;
    let new_h = ((wf * s.abs() + hf * c.abs()) - 1e-3).ceil().max(1.0) as u32;

    let mut out = allocate_canvas(new_w, new_h, BACKGROUND)?;
    let (cx_in, cy_in) = center(w, h);
    let (cx_out, cy_out) = center(new_w, new_h);

    // Inverse map: input = R(-angle) * (output - c_out) + c_in.
    for y in 0..new_h {
        let oy = y as f32 - cy_out;
        for x in 0..new_w {
            let ox = x as f32 - cx_out;
            let sx = c * ox + s * oy + cx_in;
            let sy = -s * ox + c * oy + cy_in;
            if let Some(px) = sample_bilinear(buf, sx, sy) {
                out.set_pixel(x, y, px);
            }
        }
    }
    Ok(out)
}

fn sample_bilinear(buf: &PixelBuffer, x: f32, y: f32) -> Option<[u8; 4]> {
    let (w, h) = (buf.width() as f32, buf.height() as f32);
    if x < -0.5 || y < -0.5 || x > w - 0.5 || y > h - 0.5 {
        return None;
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let p00 = buf.pixel_clamped(x0, y0);
    let p10 = buf.pixel_clamped(x0 + 1, y0);
    let p01 = buf.pixel_clamped(x0, y0 + 1);
    let p11 = buf.pixel_clamped(x0 + 1, y0 + 1);

    let mut out = [0u8; 4];
    for ch in 0..4 {
        let top = p00[ch] as f32 * (1.0 - fx) + p10[ch] as f32 * fx;
        let bottom = p01[ch] as f32 * (1.0 - fx) + p11[ch] as f32 * fx;
        out[ch] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(out)
}

/// Allocate a solid canvas, reporting failure instead of aborting.
fn allocate_canvas(w: u32, h: u32, fill: [u8; 4]) -> Result<PixelBuffer, PreprocessError> {
    let pixels = w as u64 * h as u64;
    if pixels > MAX_PIXELS {
        return Err(PreprocessError::MemoryError(format!(
            "Rotated canvas {w}x{h} exceeds the {MAX_PIXELS} pixel limit"
        )));
    }
    let len = pixels as usize * CHANNELS;
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        PreprocessError::MemoryError(format!("Cannot allocate {w}x{h} canvas: {e}"))
    })?;
    for _ in 0..pixels {
        data.extend_from_slice(&fill);
    }
    PixelBuffer::new(w, h, data)
}
