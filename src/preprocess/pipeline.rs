//! Pipeline orchestrator: decode, run enabled stages in fixed order, measure,
//! encode. Never returns an error; failures come back as `success: false`.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::quality::{self, QualityAnalysis};
use super::raster::{self, ImageInput, MaxDimensions, OutputFormat};
use super::settings::PreprocessingConfig;
use super::types::{
    EncodedImage, Operation, PipelineResult, PixelBuffer, ProcessingContext, ProgressEvent,
    QualityMetrics,
};
use super::{adjust, contrast, grayscale, noise, rotation, PreprocessError};

/// Default JPEG quality when none is configured.
pub const DEFAULT_JPEG_QUALITY: f32 = 0.92;

/// Stateless orchestrator. Output options are fixed at construction, the
/// per-image configuration is passed to each [`run`](Self::run).
#[derive(Debug, Clone)]
pub struct PreprocessingPipeline {
    output_format: OutputFormat,
    output_quality: f32,
    max_dimensions: Option<MaxDimensions>,
    pre_scan: bool,
}

impl Default for PreprocessingPipeline {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Png,
            output_quality: DEFAULT_JPEG_QUALITY,
            max_dimensions: None,
            pre_scan: false,
        }
    }
}

/// What a successful pass produced.
struct RunOutput {
    image: EncodedImage,
    operations: Vec<Operation>,
    metrics: QualityMetrics,
    detected_rotation: Option<f32>,
    initial_analysis: Option<QualityAnalysis>,
}

impl PreprocessingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output encoding. `quality` (0..=1) only affects JPEG.
    pub fn with_output(mut self, format: OutputFormat, quality: f32) -> Self {
        self.output_format = format;
        self.output_quality = quality;
        self
    }

    /// Downscale encoded inputs to fit inside this box before processing.
    pub fn with_max_dimensions(mut self, max: MaxDimensions) -> Self {
        self.max_dimensions = Some(max);
        self
    }

    /// Analyze the decoded input before any filter runs and attach the result.
    pub fn with_pre_scan(mut self, enabled: bool) -> Self {
        self.pre_scan = enabled;
        self
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    /// Process one image.
    ///
    /// `progress_fn` is called synchronously before and after every enabled
    /// stage. Any error or panic inside decode, a filter or encode is caught
    /// here and reported through `errors`, with the original input echoed
    /// back as `processed_image`.
    pub fn run(
        &self,
        input: &ImageInput,
        config: &PreprocessingConfig,
        progress_fn: Option<&dyn Fn(ProgressEvent)>,
    ) -> PipelineResult {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(input, config, progress_fn)
        }))
        .unwrap_or_else(|payload| {
            Err(PreprocessError::ProcessingFailed(format!(
                "Filter panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        let processing_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(out) => {
                info!(
                    run_id = %run_id,
                    preset = %config.name,
                    operations = ?out.operations,
                    overall = out.metrics.overall,
                    width = out.image.width,
                    height = out.image.height,
                    processing_time_ms,
                    "Preprocessing complete"
                );
                PipelineResult {
                    run_id,
                    started_at,
                    success: true,
                    processed_image: out.image,
                    operations: out.operations,
                    quality_metrics: out.metrics,
                    detected_rotation: out.detected_rotation,
                    initial_analysis: out.initial_analysis,
                    processing_time_ms,
                    config: config.clone(),
                    errors: None,
                }
            }
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    kind = e.kind(),
                    error = %e,
                    processing_time_ms,
                    "Preprocessing failed, echoing original input"
                );
                PipelineResult {
                    run_id,
                    started_at,
                    success: false,
                    processed_image: echo_original(input),
                    operations: Vec::new(),
                    quality_metrics: QualityMetrics::zeroed(),
                    detected_rotation: None,
                    initial_analysis: None,
                    processing_time_ms,
                    config: config.clone(),
                    errors: Some(vec![e.to_string()]),
                }
            }
        }
    }

    fn execute(
        &self,
        input: &ImageInput,
        config: &PreprocessingConfig,
        progress_fn: Option<&dyn Fn(ProgressEvent)>,
    ) -> Result<RunOutput, PreprocessError> {
        config.validate()?;
        let mut ctx = raster::decode(input, self.max_dimensions)?;
        let initial_analysis = self.pre_scan.then(|| quality::analyze(&ctx));

        let stages = config.enabled_operations();
        let total = stages.len();
        let mut operations = Vec::with_capacity(total);
        let mut detected_rotation = None;

        for (i, &stage) in stages.iter().enumerate() {
            if let Some(progress) = progress_fn {
                progress(ProgressEvent::StageStarted {
                    stage,
                    percent: percent(i, total),
                    message: format!("Applying {stage}"),
                });
            }

            let changed = apply_stage(stage, &mut ctx, config, &mut detected_rotation)?;
            if changed {
                operations.push(stage);
            }

            if let Some(progress) = progress_fn {
                progress(ProgressEvent::StageCompleted {
                    stage,
                    percent: percent(i + 1, total),
                    message: if changed {
                        format!("Applied {stage}")
                    } else {
                        format!("Skipped {stage}, no change needed")
                    },
                });
            }
        }

        let metrics = quality::compute_metrics(ctx.buffer());
        let image = raster::encode(&ctx, self.output_format, self.output_quality)?;

        Ok(RunOutput {
            image,
            operations,
            metrics,
            detected_rotation,
            initial_analysis,
        })
    }
}

/// Run with PNG output and no pre-scan.
pub fn run(input: &ImageInput, config: &PreprocessingConfig) -> PipelineResult {
    PreprocessingPipeline::new().run(input, config, None)
}

/// Apply one stage. Returns whether the image was changed.
fn apply_stage(
    stage: Operation,
    ctx: &mut ProcessingContext,
    config: &PreprocessingConfig,
    detected_rotation: &mut Option<f32>,
) -> Result<bool, PreprocessError> {
    let changed = match stage {
        Operation::Grayscale => grayscale::apply(ctx, &config.grayscale),
        Operation::RotationCorrection => {
            let settings = &config.rotation_correction;
            let angle = rotation::apply(ctx, settings)?;
            *detected_rotation = Some(angle);
            rotation::exceeds_precision(angle, settings.precision)
        }
        Operation::NoiseReduction => noise::apply(ctx, &config.noise_reduction),
        // Equalization runs as adaptive contrast; it is never scheduled alone.
        Operation::ContrastEnhancement | Operation::HistogramEqualization => {
            contrast::apply(ctx, &config.contrast)
        }
        Operation::BrightnessAdjustment => adjust::apply_brightness(ctx, &config.brightness).is_some(),
        Operation::Sharpening => adjust::apply_sharpening(ctx, &config.sharpening),
    };
    Ok(changed)
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done * 100 / total) as u8
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Hand the caller back what they gave us, as close to encoded form as possible.
fn echo_original(input: &ImageInput) -> EncodedImage {
    match input {
        ImageInput::Encoded(bytes) => echo_bytes(bytes.clone()),
        ImageInput::DataUrl(url) => match raster::decode_data_url(url) {
            Ok(bytes) => echo_bytes(bytes),
            Err(_) => echo_bytes(url.as_bytes().to_vec()),
        },
        ImageInput::Buffer(buf) => {
            raster::encode_buffer(buf, OutputFormat::Png, 1.0).unwrap_or_default()
        }
        ImageInput::Surface(surface) => {
            let buf = PixelBuffer::from_rgba_image(surface.clone());
            raster::encode_buffer(&buf, OutputFormat::Png, 1.0).unwrap_or_default()
        }
    }
}

fn echo_bytes(bytes: Vec<u8>) -> EncodedImage {
    let format = image::guess_format(&bytes)
        .ok()
        .and_then(OutputFormat::from_image_format);
    EncodedImage {
        bytes,
        format,
        width: 0,
        height: 0,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::preprocess::settings::{NoiseMethod, NoiseReductionConfig, RotationConfig, RotationMethod};

    fn rotated_square(size: u32, side: f32, angle_deg: f32) -> PixelBuffer {
        let mut buf = PixelBuffer::filled(size, size, [255, 255, 255, 255]);
        let (s, c) = angle_deg.to_radians().sin_cos();
        let mid = (size as f32 - 1.0) / 2.0;
        for y in 0..size {
            for x in 0..size {
                let (dx, dy) = (x as f32 - mid, y as f32 - mid);
                if (dx * c + dy * s).abs() <= side / 2.0 && (-dx * s + dy * c).abs() <= side / 2.0 {
                    buf.set_pixel(x, y, [0, 0, 0, 255]);
                }
            }
        }
        buf
    }

    fn text_page() -> PixelBuffer {
        let mut buf = PixelBuffer::filled(120, 90, [250, 245, 240, 255]);
        for y in 0..90 {
            for x in 0..120 {
                if y % 15 < 6 && x % 12 < 8 {
                    buf.set_pixel(x, y, [30, 40, 35, 255]);
                }
            }
        }
        buf
    }

    fn all_disabled() -> PreprocessingConfig {
        let mut config = PreprocessingConfig::default();
        config.grayscale.enabled = false;
        config.contrast.enabled = false;
        config.noise_reduction.enabled = false;
        config.rotation_correction.enabled = false;
        config.brightness.enabled = false;
        config.sharpening.enabled = false;
        config
    }

    fn png_bytes(buf: &PixelBuffer) -> Vec<u8> {
        raster::encode_buffer(buf, OutputFormat::Png, 1.0).unwrap().bytes
    }

    #[test]
    fn seven_degree_square_is_corrected() {
        let mut config = all_disabled();
        config.rotation_correction = RotationConfig {
            enabled: true,
            max_angle: 45.0,
            method: RotationMethod::Projection,
            precision: 0.5,
        };
        let input = ImageInput::Buffer(rotated_square(300, 160.0, 7.0));
        let result = run(&input, &config);

        assert!(result.success, "{:?}", result.errors);
        let angle = result.detected_rotation.unwrap();
        assert!((angle - 7.0).abs() <= 1.0, "detected {angle}");
        assert_eq!(result.operations, vec![Operation::RotationCorrection]);
        assert!(result.processed_image.width > 300);
    }

    #[test]
    fn aligned_image_does_not_report_rotation() {
        let mut config = all_disabled();
        config.rotation_correction.enabled = true;
        let result = run(&ImageInput::Buffer(rotated_square(120, 60.0, 0.0)), &config);
        assert!(result.success);
        assert!(result.detected_rotation.unwrap().abs() <= 0.5);
        assert!(result.operations.is_empty());
        assert_eq!(
            (result.processed_image.width, result.processed_image.height),
            (120, 120)
        );
    }

    #[test]
    fn garbage_input_fails_without_panicking() {
        let garbage = b"definitely not an image".to_vec();
        let result = run(&ImageInput::Encoded(garbage.clone()), &PreprocessingConfig::default());
        assert!(!result.success);
        assert!(!result.errors.as_ref().unwrap().is_empty());
        assert_eq!(result.processed_image.bytes, garbage);
        assert_eq!(result.processed_image.format, None);
        assert_eq!(result.quality_metrics, QualityMetrics::zeroed());
        assert!(result.operations.is_empty());
    }

    #[test]
    fn empty_input_fails() {
        let result = run(&ImageInput::Encoded(Vec::new()), &PreprocessingConfig::default());
        assert!(!result.success);
        assert!(!result.errors.unwrap().is_empty());
    }

    #[test]
    fn invalid_config_echoes_recognized_input() {
        let bytes = png_bytes(&text_page());
        let mut config = PreprocessingConfig::default();
        config.noise_reduction.kernel_size = 2;
        let result = run(&ImageInput::Encoded(bytes.clone()), &config);
        assert!(!result.success);
        assert!(result.errors.unwrap()[0].contains("kernelSize"));
        assert_eq!(result.processed_image.format, Some(OutputFormat::Png));
        assert_eq!(result.processed_image.bytes, bytes);
    }

    #[test]
    fn operations_subset_of_enabled() {
        for name in PreprocessingConfig::preset_names() {
            let config = PreprocessingConfig::preset(name).unwrap();
            let enabled = config.enabled_operations();
            let result = run(&ImageInput::Buffer(text_page()), &config);
            assert!(result.success, "{name}: {:?}", result.errors);
            assert!(
                result.operations.iter().all(|op| enabled.contains(op)),
                "{name}: {:?} not within {enabled:?}",
                result.operations
            );
            let m = result.quality_metrics;
            for v in [m.sharpness, m.contrast, m.brightness, m.noise, m.text_readability, m.overall] {
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn progress_reports_every_stage_in_order() {
        let events = RefCell::new(Vec::new());
        let record = |e: ProgressEvent| events.borrow_mut().push(e);
        let config = PreprocessingConfig::identity_document();
        let result = PreprocessingPipeline::new().run(
            &ImageInput::Buffer(text_page()),
            &config,
            Some(&record),
        );
        assert!(result.success);

        let events = events.into_inner();
        let stages = config.enabled_operations();
        assert_eq!(events.len(), stages.len() * 2);
        assert!(matches!(events[0], ProgressEvent::StageStarted { percent: 0, .. }));
        assert_eq!(events.last().unwrap().percent(), 100);
        assert!(events.windows(2).all(|w| w[0].percent() <= w[1].percent()));
        for (pair, stage) in events.chunks(2).zip(&stages) {
            assert_eq!(pair[0].stage(), *stage);
            assert!(matches!(pair[1], ProgressEvent::StageCompleted { .. }));
        }
    }

    #[test]
    fn disabled_stages_round_trip_losslessly() {
        let original = text_page();
        let result = run(&ImageInput::Encoded(png_bytes(&original)), &all_disabled());
        assert!(result.success);
        assert!(result.operations.is_empty());
        let decoded = raster::decode(&ImageInput::Encoded(result.processed_image.bytes), None)
            .unwrap()
            .into_buffer();
        assert_eq!(decoded, original);
    }

    #[test]
    fn pre_scan_attaches_initial_analysis() {
        let input = ImageInput::Buffer(text_page());
        let config = PreprocessingConfig::default();
        let with = PreprocessingPipeline::new()
            .with_pre_scan(true)
            .run(&input, &config, None);
        let without = PreprocessingPipeline::new().run(&input, &config, None);
        assert!(with.initial_analysis.is_some());
        assert!(without.initial_analysis.is_none());
    }

    #[test]
    fn jpeg_output_and_max_dimensions() {
        let pipeline = PreprocessingPipeline::new()
            .with_output(OutputFormat::Jpeg, 0.8)
            .with_max_dimensions(MaxDimensions {
                width: 60,
                height: 60,
            });
        let input = ImageInput::Encoded(png_bytes(&text_page()));
        let result = pipeline.run(&input, &all_disabled(), None);
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.processed_image.format, Some(OutputFormat::Jpeg));
        assert_eq!(
            (result.processed_image.width, result.processed_image.height),
            (60, 45)
        );
        assert_eq!(&result.processed_image.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn failed_buffer_input_echoed_as_png() {
        let mut config = PreprocessingConfig::default();
        config.contrast.factor = -1.0;
        let result = run(&ImageInput::Buffer(text_page()), &config);
        assert!(!result.success);
        assert_eq!(result.processed_image.format, Some(OutputFormat::Png));
        assert_eq!(result.processed_image.width, 120);
    }

    #[test]
    fn result_serializes_without_image_bytes() {
        let result = run(&ImageInput::Buffer(text_page()), &PreprocessingConfig::default());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("runId").is_some());
        assert!(json["qualityMetrics"].get("textReadability").is_some());
        assert!(json["processedImage"].get("bytes").is_none());
        assert!(json.get("errors").is_none());
        assert_eq!(json["config"]["name"], "default");
    }

    #[test]
    fn percent_spreads_evenly() {
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(4, 4), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn too_fine_rotation_precision_fails_cleanly() {
        let mut config = all_disabled();
        config.rotation_correction = RotationConfig {
            enabled: true,
            max_angle: 90.0,
            method: RotationMethod::Hough,
            precision: 1e-6,
        };
        let result = run(&ImageInput::Buffer(rotated_square(300, 160.0, 7.0)), &config);
        assert!(!result.success);
        let errors = result.errors.unwrap();
        assert!(errors.iter().any(|e| e.contains("too fine")), "{errors:?}");
        assert!(result.operations.is_empty());
    }

    #[test]
    fn no_op_stages_are_not_recorded() {
        let gray = PixelBuffer::filled(20, 20, [128, 128, 128, 255]);
        let mut config = all_disabled();
        config.grayscale.enabled = true;
        config.grayscale.preserve_alpha = true;
        config.noise_reduction = NoiseReductionConfig {
            enabled: true,
            method: NoiseMethod::Gaussian,
            kernel_size: 3,
            strength: 0.0,
        };
        config.contrast.enabled = true;
        config.contrast.adaptive = true;

        let result = run(&ImageInput::Buffer(gray.clone()), &config);
        assert!(result.success, "{:?}", result.errors);
        assert!(result.operations.is_empty(), "{:?}", result.operations);

        config.contrast.adaptive = false;
        config.contrast.factor = 1.5;
        let result = run(&ImageInput::Buffer(gray), &config);
        assert!(result.success, "{:?}", result.errors);
        assert!(result.operations.is_empty(), "{:?}", result.operations);
    }

    #[test]
    fn effective_stages_are_recorded() {
        let mut config = all_disabled();
        config.grayscale.enabled = true;
        config.noise_reduction.enabled = true;
        config.contrast.enabled = true;
        let result = run(&ImageInput::Buffer(text_page()), &config);
        assert!(result.success, "{:?}", result.errors);
        assert!(result.operations.contains(&Operation::Grayscale));
        assert!(result.operations.contains(&Operation::ContrastEnhancement));
    }
}
