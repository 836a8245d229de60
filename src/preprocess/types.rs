use std::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::quality::QualityAnalysis;
use super::raster::OutputFormat;
use super::settings::PreprocessingConfig;
use super::PreprocessError;

// ═══════════════════════════════════════════════════════════
// Pixel buffer
// ═══════════════════════════════════════════════════════════

/// Bytes per pixel: R, G, B, A.
pub const CHANNELS: usize = 4;

/// Flat row-major RGBA8 raster.
///
/// `data.len() == width * height * 4` holds for every constructed value.
/// Samples are `u8`, so channel values are clamped to [0, 255] by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGBA samples, rejecting zero dimensions or a length mismatch.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PreprocessError> {
        if width == 0 || height == 0 {
            return Err(PreprocessError::InvalidInput(format!(
                "Pixel buffer dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(CHANNELS))
            .ok_or_else(|| {
                PreprocessError::MemoryError(format!("{width}x{height} overflows addressable memory"))
            })?;
        if data.len() != expected {
            return Err(PreprocessError::InvalidInput(format!(
                "Pixel buffer length {} does not match {width}x{height}x4 = {expected}",
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Buffer of one solid color.
    ///
    /// # Panics
    ///
    /// If either dimension is zero.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        assert!(
            width > 0 && height > 0,
            "pixel buffer dimensions must be non-zero, got {width}x{height}"
        );
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * CHANNELS);
        for _ in 0..count {
            data.extend_from_slice(&rgba);
        }
        Self { width, height, data }
    }

    pub fn from_rgba_image(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }

    /// Copy into an `image` surface for encoding.
    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable samples. The length cannot change through a slice, so the
    /// dimension invariant survives any edit made here.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = self.index(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = self.index(x, y);
        self.data[i..i + CHANNELS].copy_from_slice(&rgba);
    }

    /// Pixel at clamped coordinates, for border-replicating kernels.
    #[inline]
    pub fn pixel_clamped(&self, x: i64, y: i64) -> [u8; 4] {
        let cx = x.clamp(0, self.width as i64 - 1) as u32;
        let cy = y.clamp(0, self.height as i64 - 1) as u32;
        self.pixel(cx, cy)
    }
}

// ═══════════════════════════════════════════════════════════
// Processing context
// ═══════════════════════════════════════════════════════════

/// One run's exclusively owned working state.
///
/// Filters mutate the buffer in place; rotation may swap it for a larger one.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    buffer: PixelBuffer,
    original_width: u32,
    original_height: u32,
}

impl ProcessingContext {
    pub fn new(buffer: PixelBuffer) -> Self {
        let (original_width, original_height) = buffer.dimensions();
        Self {
            buffer,
            original_width,
            original_height,
        }
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Dimensions as decoded, before any rotation rewrite.
    pub fn original_dimensions(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }

    /// Swap in a new buffer (dimensions follow the buffer).
    pub fn replace_buffer(&mut self, buffer: PixelBuffer) {
        self.buffer = buffer;
    }

    pub fn into_buffer(self) -> PixelBuffer {
        self.buffer
    }
}

// ═══════════════════════════════════════════════════════════
// Metrics and operations
// ═══════════════════════════════════════════════════════════

/// Six quality scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub sharpness: f32,
    pub contrast: f32,
    pub brightness: f32,
    pub noise: f32,
    pub text_readability: f32,
    pub overall: f32,
}

impl QualityMetrics {
    /// All-zero metrics reported by failed runs.
    pub fn zeroed() -> Self {
        Self::default()
    }
}

/// A preprocessing operation, as applied by the pipeline or recommended by
/// the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Grayscale,
    RotationCorrection,
    NoiseReduction,
    ContrastEnhancement,
    BrightnessAdjustment,
    Sharpening,
    /// Recommendation only; the pipeline expresses it as adaptive contrast.
    HistogramEqualization,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grayscale => "grayscale",
            Self::RotationCorrection => "rotation-correction",
            Self::NoiseReduction => "noise-reduction",
            Self::ContrastEnhancement => "contrast-enhancement",
            Self::BrightnessAdjustment => "brightness-adjustment",
            Self::Sharpening => "sharpening",
            Self::HistogramEqualization => "histogram-equalization",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════════════════════

/// Synchronous progress notification emitted around each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    StageStarted {
        stage: Operation,
        percent: u8,
        message: String,
    },
    StageCompleted {
        stage: Operation,
        percent: u8,
        message: String,
    },
}

impl ProgressEvent {
    pub fn stage(&self) -> Operation {
        match self {
            Self::StageStarted { stage, .. } | Self::StageCompleted { stage, .. } => *stage,
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            Self::StageStarted { percent, .. } | Self::StageCompleted { percent, .. } => *percent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::StageStarted { message, .. } | Self::StageCompleted { message, .. } => message,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Result types
// ═══════════════════════════════════════════════════════════

/// Encoded output image handed to the OCR / vision collaborators.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// `None` when echoing input whose format was not recognized.
    pub format: Option<OutputFormat>,
    /// Zero when unknown (echoed undecodable input).
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn mime_type(&self) -> &'static str {
        self.format
            .map(|f| f.mime_type())
            .unwrap_or("application/octet-stream")
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), B64.encode(&self.bytes))
    }
}

/// Outcome of one pipeline run. Immutable once returned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub processed_image: EncodedImage,
    /// Operations that actually changed the image, in application order.
    pub operations: Vec<Operation>,
    pub quality_metrics: QualityMetrics,
    /// Angle measured by the rotation stage, whether or not it was applied.
    pub detected_rotation: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_analysis: Option<QualityAnalysis>,
    pub processing_time_ms: u64,
    pub config: PreprocessingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}
