/// Application-level constants
pub const APP_NAME: &str = "docprep";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable naming a preset for the demo binary when none is given.
pub const PRESET_ENV_VAR: &str = "DOCPREP_PRESET";

/// Log filter used when `RUST_LOG` is unset.
/// Debug builds trace every stage; release builds log one line per run.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "docprep=debug,warn"
    } else {
        "docprep=info,warn"
    }
}

/// Preset name from [`PRESET_ENV_VAR`], falling back to `default`.
pub fn preset_from_env() -> String {
    std::env::var(PRESET_ENV_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| crate::preprocess::PRESET_DEFAULT.to_string())
}
