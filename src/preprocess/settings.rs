//! Preprocessing configuration: per-operation toggles, named presets, JSON loading.
//!
//! Two presets ship out of the box:
//! - `default`: general-purpose document photos
//! - `identity-document`: ID cards, tighter rotation limits, bilateral denoise

use serde::{Deserialize, Serialize};

use super::quality::QualityAnalysis;
use super::rotation::{candidate_count, MAX_ANGLE_CANDIDATES};
use super::types::Operation;
use super::PreprocessError;

pub const PRESET_DEFAULT: &str = "default";
pub const PRESET_IDENTITY_DOCUMENT: &str = "identity-document";

// ═══════════════════════════════════════════════════════════
// Method enums
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GrayscaleMethod {
    /// BT.601 weighted sum. Best for text.
    #[default]
    Luminance,
    Average,
    Desaturation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoiseMethod {
    #[default]
    Median,
    Gaussian,
    Bilateral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RotationMethod {
    Hough,
    #[default]
    Projection,
    EdgeDetection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharpenMethod {
    #[default]
    UnsharpMask,
    Laplacian,
}

// ═══════════════════════════════════════════════════════════
// Per-operation configs
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrayscaleConfig {
    pub enabled: bool,
    pub method: GrayscaleMethod,
    /// Keep the alpha channel. When false, alpha is forced opaque.
    pub preserve_alpha: bool,
}

impl Default for GrayscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: GrayscaleMethod::Luminance,
            preserve_alpha: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContrastConfig {
    pub enabled: bool,
    /// Linear stretch around mid-gray. 1.0 is identity.
    pub factor: f32,
    /// Tiled contrast-limited histogram equalization instead of linear.
    pub adaptive: bool,
    /// Histogram bin cap as a multiple of the uniform bin height.
    pub clip_limit: f32,
}

impl Default for ContrastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 1.2,
            adaptive: false,
            clip_limit: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NoiseReductionConfig {
    pub enabled: bool,
    pub method: NoiseMethod,
    /// Odd window size, at least 3.
    pub kernel_size: u32,
    /// 0..=1. Gaussian blend weight; bilateral range sigma is `strength * 50`.
    pub strength: f32,
}

impl Default for NoiseReductionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: NoiseMethod::Median,
            kernel_size: 3,
            strength: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotationConfig {
    pub enabled: bool,
    /// Search range in degrees, both directions.
    pub max_angle: f32,
    pub method: RotationMethod,
    /// Angle step in degrees; also the minimum angle worth correcting.
    pub precision: f32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_angle: 45.0,
            method: RotationMethod::Projection,
            precision: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrightnessConfig {
    pub enabled: bool,
    /// Offset as a fraction of full scale, -1..=1. Ignored when `auto_adjust`.
    pub adjustment: f32,
    /// Shift mean luminance toward mid-gray.
    pub auto_adjust: bool,
}

impl Default for BrightnessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            adjustment: 0.0,
            auto_adjust: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SharpeningConfig {
    pub enabled: bool,
    pub method: SharpenMethod,
    pub strength: f32,
    /// Box-blur radius for unsharp masking, in pixels.
    pub radius: u32,
}

impl Default for SharpeningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: SharpenMethod::UnsharpMask,
            strength: 0.5,
            radius: 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// PreprocessingConfig
// ═══════════════════════════════════════════════════════════

/// Full per-run configuration. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreprocessingConfig {
    pub name: String,
    pub grayscale: GrayscaleConfig,
    pub contrast: ContrastConfig,
    pub noise_reduction: NoiseReductionConfig,
    pub rotation_correction: RotationConfig,
    pub brightness: BrightnessConfig,
    pub sharpening: SharpeningConfig,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            name: PRESET_DEFAULT.into(),
            grayscale: GrayscaleConfig::default(),
            contrast: ContrastConfig::default(),
            noise_reduction: NoiseReductionConfig::default(),
            rotation_correction: RotationConfig::default(),
            brightness: BrightnessConfig::default(),
            sharpening: SharpeningConfig::default(),
        }
    }
}

impl PreprocessingConfig {
    /// Tuned for identity-card photographs: cards are rarely tilted past 15
    /// degrees, and bilateral filtering keeps the fine print legible.
    pub fn identity_document() -> Self {
        Self {
            name: PRESET_IDENTITY_DOCUMENT.into(),
            grayscale: GrayscaleConfig::default(),
            contrast: ContrastConfig {
                enabled: true,
                factor: 1.3,
                adaptive: true,
                clip_limit: 2.5,
            },
            noise_reduction: NoiseReductionConfig {
                enabled: true,
                method: NoiseMethod::Bilateral,
                kernel_size: 5,
                strength: 0.3,
            },
            rotation_correction: RotationConfig {
                enabled: true,
                max_angle: 15.0,
                method: RotationMethod::Projection,
                precision: 0.25,
            },
            brightness: BrightnessConfig {
                enabled: true,
                adjustment: 0.0,
                auto_adjust: true,
            },
            sharpening: SharpeningConfig {
                enabled: true,
                method: SharpenMethod::UnsharpMask,
                strength: 0.6,
                radius: 1,
            },
        }
    }

    /// Resolve a named preset.
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            PRESET_DEFAULT => Some(Self::default()),
            PRESET_IDENTITY_DOCUMENT | "identity_document" | "id-card" => {
                Some(Self::identity_document())
            }
            _ => None,
        }
    }

    pub fn preset_names() -> &'static [&'static str] {
        &[PRESET_DEFAULT, PRESET_IDENTITY_DOCUMENT]
    }

    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, PreprocessError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PreprocessError::Config(format!("Malformed configuration JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, PreprocessError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PreprocessError::Config(format!("Configuration serialization failed: {e}")))
    }

    /// Reject parameter values the filters cannot honor.
    pub fn validate(&self) -> Result<(), PreprocessError> {
        let c = &self.contrast;
        if !(c.factor.is_finite() && c.factor > 0.0) {
            return Err(config_err(format!("contrast.factor must be > 0, got {}", c.factor)));
        }
        if !(c.clip_limit.is_finite() && c.clip_limit > 0.0) {
            return Err(config_err(format!(
                "contrast.clipLimit must be > 0, got {}",
                c.clip_limit
            )));
        }

        let n = &self.noise_reduction;
        if n.kernel_size < 3 || n.kernel_size % 2 == 0 {
            return Err(config_err(format!(
                "noiseReduction.kernelSize must be odd and >= 3, got {}",
                n.kernel_size
            )));
        }
        if !(0.0..=1.0).contains(&n.strength) {
            return Err(config_err(format!(
                "noiseReduction.strength must be within [0, 1], got {}",
                n.strength
            )));
        }

        let r = &self.rotation_correction;
        if !(r.max_angle.is_finite() && r.max_angle > 0.0 && r.max_angle <= 90.0) {
            return Err(config_err(format!(
                "rotationCorrection.maxAngle must be within (0, 90], got {}",
                r.max_angle
            )));
        }
        if !(r.precision.is_finite() && r.precision > 0.0 && r.precision <= r.max_angle) {
            return Err(config_err(format!(
                "rotationCorrection.precision must be within (0, maxAngle], got {}",
                r.precision
            )));
        }
        if candidate_count(r.max_angle, r.precision) > MAX_ANGLE_CANDIDATES {
            return Err(config_err(format!(
                "rotationCorrection.precision {} is too fine for maxAngle {} (over {} candidate angles)",
                r.precision, r.max_angle, MAX_ANGLE_CANDIDATES
            )));
        }

        let b = &self.brightness;
        if !(-1.0..=1.0).contains(&b.adjustment) {
            return Err(config_err(format!(
                "brightness.adjustment must be within [-1, 1], got {}",
                b.adjustment
            )));
        }

        let s = &self.sharpening;
        if !(s.strength.is_finite() && s.strength >= 0.0) {
            return Err(config_err(format!(
                "sharpening.strength must be >= 0, got {}",
                s.strength
            )));
        }

        Ok(())
    }

    /// Operations this config enables, in pipeline order.
    pub fn enabled_operations(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        if self.grayscale.enabled {
            ops.push(Operation::Grayscale);
        }
        if self.rotation_correction.enabled {
            ops.push(Operation::RotationCorrection);
        }
        if self.noise_reduction.enabled {
            ops.push(Operation::NoiseReduction);
        }
        if self.contrast.enabled {
            ops.push(Operation::ContrastEnhancement);
        }
        if self.brightness.enabled {
            ops.push(Operation::BrightnessAdjustment);
        }
        if self.sharpening.enabled {
            ops.push(Operation::Sharpening);
        }
        ops
    }

    /// Copy of this config with toggles following an analyzer recommendation.
    ///
    /// Parameters are kept; only `enabled` flags change. A histogram-equalization
    /// recommendation switches contrast to adaptive mode.
    pub fn tuned_for(&self, analysis: &QualityAnalysis) -> Self {
        let recommends = |op: Operation| analysis.recommended_operations.contains(&op);
        let mut tuned = self.clone();
        tuned.grayscale.enabled = recommends(Operation::Grayscale);
        tuned.contrast.enabled = recommends(Operation::ContrastEnhancement)
            || recommends(Operation::HistogramEqualization);
        if recommends(Operation::HistogramEqualization) {
            tuned.contrast.adaptive = true;
        }
        tuned.noise_reduction.enabled = recommends(Operation::NoiseReduction);
        tuned.rotation_correction.enabled = recommends(Operation::RotationCorrection);
        tuned.brightness.enabled = recommends(Operation::BrightnessAdjustment);
        tuned.sharpening.enabled = recommends(Operation::Sharpening);
        tuned
    }
}

fn config_err(msg: String) -> PreprocessError {
    PreprocessError::Config(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::types::QualityMetrics;

    #[test]
    fn presets_validate() {
        for name in PreprocessingConfig::preset_names() {
            let config = PreprocessingConfig::preset(name).unwrap();
            config.validate().unwrap();
            assert_eq!(config.name, *name);
        }
    }

    #[test]
    fn unknown_preset_is_none() {
        assert!(PreprocessingConfig::preset("passport-hd").is_none());
    }

    #[test]
    fn identity_preset_is_tighter_and_bilateral() {
        let general = PreprocessingConfig::default();
        let id = PreprocessingConfig::identity_document();
        assert!(id.rotation_correction.max_angle < general.rotation_correction.max_angle);
        assert_eq!(id.noise_reduction.method, NoiseMethod::Bilateral);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            PreprocessingConfig::from_json(r#"{"noiseReduction":{"method":"gaussian"}}"#).unwrap();
        assert_eq!(config.noise_reduction.method, NoiseMethod::Gaussian);
        assert_eq!(config.noise_reduction.kernel_size, 3);
        assert!(config.grayscale.enabled);
    }

    #[test]
    fn method_names_match_wire_format() {
        let json = serde_json::to_string(&RotationMethod::EdgeDetection).unwrap();
        assert_eq!(json, "\"edgeDetection\"");
        let json = serde_json::to_string(&SharpenMethod::UnsharpMask).unwrap();
        assert_eq!(json, "\"unsharpMask\"");
    }

    #[test]
    fn json_round_trip_preserves_config() {
        let config = PreprocessingConfig::identity_document();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"maxAngle\": 15.0"));
        assert_eq!(PreprocessingConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = PreprocessingConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, PreprocessError::Config(_)));
    }

    #[test]
    fn even_kernel_rejected() {
        let mut config = PreprocessingConfig::default();
        config.noise_reduction.kernel_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_precision_rejected() {
        let mut config = PreprocessingConfig::default();
        config.rotation_correction.precision = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn too_fine_precision_rejected() {
        let mut config = PreprocessingConfig::default();
        config.rotation_correction.max_angle = 90.0;
        config.rotation_correction.precision = 1e-6;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PreprocessError::Config(_)));
        assert!(err.to_string().contains("too fine"));

        config.rotation_correction.precision = 0.05;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_angle_rejected() {
        let mut config = PreprocessingConfig::default();
        config.rotation_correction.max_angle = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_operations_follow_pipeline_order() {
        let ops = PreprocessingConfig::identity_document().enabled_operations();
        assert_eq!(
            ops,
            vec![
                Operation::Grayscale,
                Operation::RotationCorrection,
                Operation::NoiseReduction,
                Operation::ContrastEnhancement,
                Operation::BrightnessAdjustment,
                Operation::Sharpening,
            ]
        );
    }

    #[test]
    fn tuned_for_follows_recommendations() {
        let analysis = QualityAnalysis {
            quality_metrics: QualityMetrics::zeroed(),
            is_document_image: true,
            detected_rotation: 0.0,
            recommended_operations: vec![
                Operation::Grayscale,
                Operation::RotationCorrection,
                Operation::HistogramEqualization,
            ],
            suitability_score: 0.5,
        };
        let tuned = PreprocessingConfig::default().tuned_for(&analysis);
        assert!(tuned.grayscale.enabled);
        assert!(tuned.rotation_correction.enabled);
        assert!(tuned.contrast.enabled);
        assert!(tuned.contrast.adaptive);
        assert!(!tuned.noise_reduction.enabled);
        assert!(!tuned.sharpening.enabled);
    }
}
