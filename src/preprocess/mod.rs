//! Image preprocessing for identity-document photographs.
//!
//! Pure in-memory transform: one raster in, one conditioned raster plus a
//! metrics report out. No network, no filesystem, no state between runs.

pub mod types;
pub mod settings;
pub mod helpers;
pub mod raster;
pub mod grayscale;
pub mod contrast;
pub mod noise;
pub mod rotation;
pub mod quality;
pub mod adjust;
pub mod pipeline;

pub use types::*;
pub use settings::*;
pub use raster::{decode, encode, ImageInput, MaxDimensions, OutputFormat};
pub use quality::{analyze, QualityAnalysis};
pub use pipeline::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Surface error: {0}")]
    SurfaceError(String),

    #[error("Memory error: {0}")]
    MemoryError(String),

    /// Reserved for caller-imposed limits. Never raised by the pipeline itself.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PreprocessError {
    /// Stable kind label, used in logs and failed results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ProcessingFailed(_) => "processing_failed",
            Self::SurfaceError(_) => "surface_error",
            Self::MemoryError(_) => "memory_error",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
        }
    }
}
