//! Grayscale conversion.

use tracing::debug;

use super::helpers::{clamp_channel, luminance};
use super::settings::{GrayscaleConfig, GrayscaleMethod};
use super::types::{PixelBuffer, ProcessingContext};

/// Every Nth pixel is inspected by the sampling heuristics.
const SAMPLE_STRIDE: usize = 10;

/// Max per-channel delta for a pixel to count as gray.
const GRAY_TOLERANCE: i16 = 2;

/// Mean per-pixel channel variance below which `average` suffices.
const LOW_CHANNEL_VARIANCE: f64 = 100.0;

/// Mean per-pixel channel variance above which `desaturation` is preferred.
const HIGH_CHANNEL_VARIANCE: f64 = 1500.0;

/// Returns whether any pixel changed.
pub fn apply(ctx: &mut ProcessingContext, config: &GrayscaleConfig) -> bool {
    let changed = convert(ctx.buffer_mut(), config.method, config.preserve_alpha);
    debug!(
        method = ?config.method,
        preserve_alpha = config.preserve_alpha,
        changed,
        "Grayscale applied"
    );
    changed
}

/// Collapse R, G and B to one gray value per pixel. Returns whether any
/// sample changed.
pub fn convert(buf: &mut PixelBuffer, method: GrayscaleMethod, preserve_alpha: bool) -> bool {
    let mut changed = false;
    for p in buf.data_mut().chunks_exact_mut(4) {
        let gray = gray_value(p[0], p[1], p[2], method);
        let alpha = if preserve_alpha { p[3] } else { 255 };
        if p[0] != gray || p[1] != gray || p[2] != gray || p[3] != alpha {
            p[0] = gray;
            p[1] = gray;
            p[2] = gray;
            p[3] = alpha;
            changed = true;
        }
    }
    changed
}

#[inline]
pub fn gray_value(r: u8, g: u8, b: u8, method: GrayscaleMethod) -> u8 {
    match method {
        GrayscaleMethod::Luminance => clamp_channel(luminance(r, g, b)),
        GrayscaleMethod::Average => clamp_channel((r as f32 + g as f32 + b as f32) / 3.0),
        GrayscaleMethod::Desaturation => {
            let max = r.max(g).max(b) as f32;
            let min = r.min(g).min(b) as f32;
            clamp_channel((max + min) / 2.0)
        }
    }
}

/// True when sampled pixels have (near-)equal channels.
pub fn is_grayscale(buf: &PixelBuffer) -> bool {
    buf.data()
        .chunks_exact(4)
        .step_by(SAMPLE_STRIDE)
        .all(|p| {
            let (r, g, b) = (p[0] as i16, p[1] as i16, p[2] as i16);
            (r - g).abs() <= GRAY_TOLERANCE
                && (g - b).abs() <= GRAY_TOLERANCE
                && (r - b).abs() <= GRAY_TOLERANCE
        })
}

/// Suggest a conversion method from how far channels diverge per pixel.
pub fn recommend_method(buf: &PixelBuffer) -> GrayscaleMethod {
    let mut total = 0.0f64;
    let mut count = 0usize;
    for p in buf.data().chunks_exact(4).step_by(SAMPLE_STRIDE) {
        let (r, g, b) = (p[0] as f64, p[1] as f64, p[2] as f64);
        let mean = (r + g + b) / 3.0;
        total += ((r - mean).powi(2) + (g - mean).powi(2) + (b - mean).powi(2)) / 3.0;
        count += 1;
    }
    if count == 0 {
        return GrayscaleMethod::Luminance;
    }
    let variance = total / count as f64;
    if variance < LOW_CHANNEL_VARIANCE {
        GrayscaleMethod::Average
    } else if variance > HIGH_CHANNEL_VARIANCE {
        GrayscaleMethod::Desaturation
    } else {
        GrayscaleMethod::Luminance
    }
}
