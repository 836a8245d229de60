//! `docprep <input> <output> [preset|config.json]`
//!
//! Reads an image, runs the preprocessing pipeline, writes the encoded result
//! and prints the run report as JSON on stdout.

use std::path::Path;
use std::process::ExitCode;

use docprep::config;
use docprep::preprocess::{
    ImageInput, OutputFormat, PreprocessingConfig, PreprocessingPipeline, ProgressEvent,
};
use tracing::{error, info};

fn main() -> ExitCode {
    docprep::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!(
            "usage: {} <input> <output> [preset|config.json]\npresets: {}",
            config::APP_NAME,
            PreprocessingConfig::preset_names().join(", ")
        );
        return ExitCode::from(2);
    }

    match run(&args[0], &args[1], args.get(2).map(String::as_str)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the pipeline succeeded.
fn run(input: &str, output: &str, selector: Option<&str>) -> Result<bool, String> {
    let preprocessing = load_config(selector)?;
    let format = Path::new(output)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(OutputFormat::from_extension)
        .unwrap_or_default();

    let bytes = std::fs::read(input).map_err(|e| format!("Cannot read {input}: {e}"))?;
    info!(
        input,
        bytes = bytes.len(),
        preset = %preprocessing.name,
        "{} v{}", config::APP_NAME, config::APP_VERSION
    );

    let report = |event: ProgressEvent| {
        info!(stage = %event.stage(), percent = event.percent(), "{}", event.message());
    };
    let pipeline = PreprocessingPipeline::new()
        .with_output(format, docprep::preprocess::DEFAULT_JPEG_QUALITY)
        .with_pre_scan(true);
    let result = pipeline.run(&ImageInput::Encoded(bytes), &preprocessing, Some(&report));

    if result.success {
        std::fs::write(output, &result.processed_image.bytes)
            .map_err(|e| format!("Cannot write {output}: {e}"))?;
    }

    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| format!("Cannot serialize result: {e}"))?;
    println!("{json}");
    Ok(result.success)
}

/// A `.json` path is loaded as a config file, anything else is a preset name.
fn load_config(selector: Option<&str>) -> Result<PreprocessingConfig, String> {
    let selector = selector
        .map(str::to_string)
        .unwrap_or_else(config::preset_from_env);
    if selector.ends_with(".json") {
        let text = std::fs::read_to_string(&selector)
            .map_err(|e| format!("Cannot read {selector}: {e}"))?;
        return PreprocessingConfig::from_json(&text).map_err(|e| e.to_string());
    }
    PreprocessingConfig::preset(&selector).ok_or_else(|| {
        format!(
            "Unknown preset '{selector}' (expected one of: {})",
            PreprocessingConfig::preset_names().join(", ")
        )
    })
}
