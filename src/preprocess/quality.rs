//! Quality analysis: six normalized metrics, a document-likeness verdict,
//! skew estimate, and a recommended operation list.
//!
//! All divisors below are empirical. They are kept as named constants so the
//! scores stay comparable across releases.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::contrast::CONTRAST_NORMALIZER;
use super::helpers::{edge_ratio, luminance_histogram, luminance_plane, mean_std};
use super::rotation;
use super::settings::RotationConfig;
use super::types::{Operation, PixelBuffer, ProcessingContext, QualityMetrics};

/// Laplacian variance that maps to sharpness 1.0.
pub const SHARPNESS_DIVISOR: f64 = 10_000.0;

/// Mean squared local deviation that maps to noise 1.0.
pub const NOISE_DIVISOR: f64 = 1_000.0;

/// A histogram peak must hold more than this share of all pixels.
pub const PEAK_MASS_FRACTION: f64 = 0.01;

/// Bimodality when the histogram is not clearly two-peaked.
const NEUTRAL_BIMODALITY: f32 = 0.5;

/// Half-width of the local window used for noise estimation (5x5).
const NOISE_WINDOW_RADIUS: usize = 2;

/// Noise is estimated on every Nth pixel in both directions.
const NOISE_SAMPLE_STRIDE: usize = 3;

const DOCUMENT_ASPECT_RANGE: (f32, f32) = (0.5, 2.0);
const DOCUMENT_MIN_READABILITY: f32 = 0.6;
const DOCUMENT_MIN_CONTRAST: f32 = 0.4;

/// Analyzer verdict for one buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAnalysis {
    pub quality_metrics: QualityMetrics,
    pub is_document_image: bool,
    /// Estimated skew in degrees. Zero when no dominant direction is found.
    pub detected_rotation: f32,
    pub recommended_operations: Vec<Operation>,
    pub suitability_score: f32,
}

pub fn analyze(ctx: &ProcessingContext) -> QualityAnalysis {
    let buf = ctx.buffer();
    let metrics = compute_metrics(buf);
    let is_document = is_document_like(buf.width(), buf.height(), &metrics);
    let detected_rotation = rotation::detect_angle(buf, &RotationConfig::default());
    let recommended_operations = recommend_operations(&metrics, is_document);
    let suitability_score = suitability(&metrics, is_document);

    debug!(
        overall = metrics.overall,
        is_document,
        detected_rotation,
        suitability_score,
        "Quality analysis complete"
    );

    QualityAnalysis {
        quality_metrics: metrics,
        is_document_image: is_document,
        detected_rotation,
        recommended_operations,
        suitability_score,
    }
}

/// The six metrics, each clamped to [0, 1].
pub fn compute_metrics(buf: &PixelBuffer) -> QualityMetrics {
    let (w, h) = (buf.width() as usize, buf.height() as usize);
    let plane = luminance_plane(buf);
    let (mean, std) = mean_std(&plane);

    let sharpness = sharpness(&plane, w, h);
    let contrast = unit(std / CONTRAST_NORMALIZER);
    let brightness = unit(mean / 255.0);
    let noise = noise_level(&plane, w, h);
    let text_readability = unit((0.6 * bimodality(buf) + 0.4 * edge_ratio(buf)) as f64);

    let overall = unit(
        (0.25 * sharpness
            + 0.20 * contrast
            + 0.15 * brightness
            + 0.20 * (1.0 - noise)
            + 0.20 * text_readability) as f64,
    );

    QualityMetrics {
        sharpness,
        contrast,
        brightness,
        noise,
        text_readability,
        overall,
    }
}

// ── Metrics ──────────────────────────────────────────────

/// Variance of the 4-neighbour Laplacian response over interior pixels.
fn sharpness(plane: &[f32], w: usize, h: usize) -> f32 {
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            let lap = plane[i - w] + plane[i + w] + plane[i - 1] + plane[i + 1] - 4.0 * plane[i];
            responses.push(lap);
        }
    }
    let (_, std) = mean_std(&responses);
    unit(std * std / SHARPNESS_DIVISOR)
}

/// Mean squared deviation of sampled pixels from their 5x5 neighbourhood mean.
fn noise_level(plane: &[f32], w: usize, h: usize) -> f32 {
    let r = NOISE_WINDOW_RADIUS;
    if w <= 2 * r || h <= 2 * r {
        return 0.0;
    }
    let window = ((2 * r + 1) * (2 * r + 1)) as f64;
    let mut total = 0.0f64;
    let mut samples = 0usize;
    for y in (r..h - r).step_by(NOISE_SAMPLE_STRIDE) {
        for x in (r..w - r).step_by(NOISE_SAMPLE_STRIDE) {
            let mut sum = 0.0f64;
            for yy in y - r..=y + r {
                let row = yy * w;
                for xx in x - r..=x + r {
                    sum += plane[row + xx] as f64;
                }
            }
            let deviation = plane[y * w + x] as f64 - sum / window;
            total += deviation * deviation;
            samples += 1;
        }
    }
    if samples == 0 {
        return 0.0;
    }
    unit(total / samples as f64 / NOISE_DIVISOR)
}

/// Peak separation when the luminance histogram has exactly two peaks.
pub fn bimodality(buf: &PixelBuffer) -> f32 {
    let hist = luminance_histogram(buf);
    let peaks = histogram_peaks(&hist);
    if peaks.len() == 2 {
        (peaks[1] - peaks[0]) as f32 / 255.0
    } else {
        NEUTRAL_BIMODALITY
    }
}

/// Local maxima holding more than [`PEAK_MASS_FRACTION`] of the pixels.
/// Plateaus report their first bin.
fn histogram_peaks(hist: &[u32; 256]) -> Vec<usize> {
    let total: u64 = hist.iter().map(|&c| c as u64).sum();
    let min_mass = total as f64 * PEAK_MASS_FRACTION;
    (0..256)
        .filter(|&i| {
            let left = if i > 0 { hist[i - 1] } else { 0 };
            let right = if i < 255 { hist[i + 1] } else { 0 };
            hist[i] > left && hist[i] >= right && hist[i] as f64 > min_mass
        })
        .collect()
}

// ── Verdicts ─────────────────────────────────────────────

pub fn is_document_like(width: u32, height: u32, metrics: &QualityMetrics) -> bool {
    if height == 0 {
        return false;
    }
    let aspect = width as f32 / height as f32;
    (DOCUMENT_ASPECT_RANGE.0..=DOCUMENT_ASPECT_RANGE.1).contains(&aspect)
        && metrics.text_readability > DOCUMENT_MIN_READABILITY
        && metrics.contrast > DOCUMENT_MIN_CONTRAST
}

pub fn suitability(metrics: &QualityMetrics, is_document: bool) -> f32 {
    let mut score = metrics.overall;
    if is_document {
        score += 0.1;
    }
    if metrics.overall < 0.3 {
        score *= 0.5;
    }
    if metrics.text_readability > 0.7 {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

pub fn recommend_operations(metrics: &QualityMetrics, is_document: bool) -> Vec<Operation> {
    let mut ops = vec![Operation::Grayscale];
    if metrics.contrast < 0.6 {
        ops.push(Operation::ContrastEnhancement);
    }
    if metrics.brightness < 0.3 || metrics.brightness > 0.8 {
        ops.push(Operation::BrightnessAdjustment);
    }
    if metrics.noise > 0.3 {
        ops.push(Operation::NoiseReduction);
    }
    if metrics.sharpness < 0.5 {
        ops.push(Operation::Sharpening);
    }
    if is_document {
        ops.push(Operation::RotationCorrection);
        if metrics.contrast < 0.4 {
            ops.push(Operation::HistogramEqualization);
        }
    }
    ops
}

fn unit(v: f64) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, 1.0) as f32
}
