//! Raster I/O adapter: heterogeneous inputs in, one RGBA buffer out, and back.
//!
//! Decoding accepts encoded bytes, base64 data URLs, existing pixel buffers and
//! `image` surfaces. Encoding supports PNG and BMP (lossless) and JPEG (lossy).

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageOutputFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{EncodedImage, PixelBuffer, ProcessingContext};
use super::PreprocessError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Maximum encoded input size before rejecting.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024; // 50 MB

/// Largest pixel count a run will allocate a buffer for.
pub const MAX_PIXELS: u64 = 100_000_000;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Everything the pipeline accepts as an input image.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Encoded file bytes (PNG, JPEG, TIFF, BMP).
    Encoded(Vec<u8>),
    /// `data:image/<type>;base64,<payload>`, or a bare base64 payload.
    DataUrl(String),
    /// An already decoded RGBA buffer. Copied without resampling.
    Buffer(PixelBuffer),
    /// An `image` surface. Copied without resampling.
    Surface(RgbaImage),
}

/// Bounding box an encoded input is downscaled to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputFormat {
    #[default]
    Png,
    Bmp,
    Jpeg,
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Bmp => "image/bmp",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Bmp => "bmp",
            Self::Jpeg => "jpg",
        }
    }

    pub fn is_lossless(&self) -> bool {
        !matches!(self, Self::Jpeg)
    }

    /// Pick a format from a file extension (`png`, `bmp`, `jpg`/`jpeg`).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "bmp" => Some(Self::Bmp),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// Map a sniffed container format onto an output format, when one matches.
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Bmp => Some(Self::Bmp),
            ImageFormat::Jpeg => Some(Self::Jpeg),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Decode
// ═══════════════════════════════════════════════════════════

/// Decode any supported input into a fresh processing context.
///
/// `max_dimensions` only applies to encoded inputs, and only ever shrinks.
pub fn decode(
    input: &ImageInput,
    max_dimensions: Option<MaxDimensions>,
) -> Result<ProcessingContext, PreprocessError> {
    let buffer = match input {
        ImageInput::Encoded(bytes) => decode_bytes(bytes, max_dimensions)?,
        ImageInput::DataUrl(url) => {
            let bytes = decode_data_url(url)?;
            decode_bytes(&bytes, max_dimensions)?
        }
        ImageInput::Buffer(buf) => {
            check_pixel_budget(buf.width(), buf.height())?;
            buf.clone()
        }
        ImageInput::Surface(surface) => {
            let (w, h) = surface.dimensions();
            if w == 0 || h == 0 {
                return Err(PreprocessError::InvalidInput(
                    "Surface has zero dimensions".into(),
                ));
            }
            check_pixel_budget(w, h)?;
            PixelBuffer::from_rgba_image(surface.clone())
        }
    };
    Ok(ProcessingContext::new(buffer))
}

fn decode_bytes(
    bytes: &[u8],
    max_dimensions: Option<MaxDimensions>,
) -> Result<PixelBuffer, PreprocessError> {
    validate_image_bytes(bytes)?;

    let img = image::load_from_memory(bytes)
        .map_err(|e| PreprocessError::InvalidInput(format!("Failed to decode image: {e}")))?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(PreprocessError::InvalidInput(
            "Decoded image has zero dimensions".into(),
        ));
    }
    check_pixel_budget(w, h)?;

    let img = apply_orientation(img, read_exif_orientation(bytes));

    let img = match max_dimensions {
        Some(max) => {
            let (cur_w, cur_h) = img.dimensions();
            let (fit_w, fit_h) = compute_fit_dimensions(cur_w, cur_h, max);
            if (fit_w, fit_h) != (cur_w, cur_h) {
                debug!(
                    from = %format!("{cur_w}x{cur_h}"),
                    to = %format!("{fit_w}x{fit_h}"),
                    "Downscaling input to max dimensions"
                );
                img.resize_exact(fit_w, fit_h, FilterType::CatmullRom)
            } else {
                img
            }
        }
        None => img,
    };

    Ok(PixelBuffer::from_rgba_image(img.to_rgba8()))
}

/// Reject byte slices that cannot possibly be a supported image.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::InvalidInput("Image data is empty".into()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(PreprocessError::InvalidInput(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

fn check_pixel_budget(width: u32, height: u32) -> Result<(), PreprocessError> {
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(PreprocessError::MemoryError(format!(
            "{width}x{height} exceeds the {MAX_PIXELS} pixel limit"
        )));
    }
    Ok(())
}

/// Decode a `data:` URL (or bare base64 string) to raw bytes.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, PreprocessError> {
    let trimmed = url.trim();
    let payload = if trimmed.starts_with("data:") {
        let (header, payload) = trimmed
            .split_once(',')
            .ok_or_else(|| PreprocessError::InvalidInput("Data URL has no payload".into()))?;
        if !header.contains("base64") {
            return Err(PreprocessError::InvalidInput(
                "Only base64 data URLs are supported".into(),
            ));
        }
        payload
    } else {
        trimmed
    };
    B64.decode(payload)
        .map_err(|e| PreprocessError::InvalidInput(format!("Invalid base64 payload: {e}")))
}

/// Largest size fitting inside `max` with the same aspect ratio. Never upscales.
pub fn compute_fit_dimensions(width: u32, height: u32, max: MaxDimensions) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }
    let scale = (max.width as f64 / width as f64)
        .min(max.height as f64 / height as f64)
        .min(1.0);
    let new_w = ((width as f64 * scale).round() as u32).clamp(1, width);
    let new_h = ((height as f64 * scale).round() as u32).clamp(1, height);
    (new_w, new_h)
}

// ── EXIF orientation ─────────────────────────────────────

/// Read EXIF tag 0x0112 (Orientation). Returns 1 (normal) when absent.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Undo the camera orientation recorded in EXIF.
///
/// 1 = Normal, 2 = Mirrored, 3 = 180, 4 = Flipped V,
/// 5 = Mirrored + 90 CW, 6 = 90 CW, 7 = Mirrored + 270 CW, 8 = 270 CW
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ═══════════════════════════════════════════════════════════
// Encode
// ═══════════════════════════════════════════════════════════

/// Encode the context's current buffer. `quality` (0..=1) only affects JPEG.
pub fn encode(
    ctx: &ProcessingContext,
    format: OutputFormat,
    quality: f32,
) -> Result<EncodedImage, PreprocessError> {
    encode_buffer(ctx.buffer(), format, quality)
}

pub fn encode_buffer(
    buf: &PixelBuffer,
    format: OutputFormat,
    quality: f32,
) -> Result<EncodedImage, PreprocessError> {
    let surface = DynamicImage::ImageRgba8(buf.to_rgba_image());
    let mut cursor = Cursor::new(Vec::new());

    let written = match format {
        OutputFormat::Png => surface.write_to(&mut cursor, ImageOutputFormat::Png),
        OutputFormat::Bmp => surface.write_to(&mut cursor, ImageOutputFormat::Bmp),
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(surface.to_rgb8());
            rgb.write_to(&mut cursor, ImageOutputFormat::Jpeg(jpeg_quality(quality)))
        }
    };
    written.map_err(|e| {
        PreprocessError::SurfaceError(format!("{} encoding failed: {e}", format.extension()))
    })?;

    Ok(EncodedImage {
        bytes: cursor.into_inner(),
        format: Some(format),
        width: buf.width(),
        height: buf.height(),
    })
}

/// Map 0..=1 onto the encoder's 1..=100 scale.
fn jpeg_quality(quality: f32) -> u8 {
    let q = if quality.is_finite() { quality.clamp(0.0, 1.0) } else { 0.92 };
    ((q * 100.0).round() as u8).max(1)
}
