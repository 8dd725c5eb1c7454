use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static LOG_SELECTION: OnceLock<bool> = OnceLock::new();

const MODEL_DEVICE_PREFIX: &str = "AUTOKERN_MODEL_DEVICE_";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn log_selection_enabled() -> bool {
    *LOG_SELECTION.get_or_init(|| match env::var("AUTOKERN_LOG_SELECTION") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn model_file_variable(ordinal: usize) -> String {
    format!("{MODEL_DEVICE_PREFIX}{ordinal}")
}

/// Model description path for the device at `ordinal`. Unset and blank
/// variables both mean "keep the built-in defaults".
pub(crate) fn model_file_for_device(ordinal: usize) -> Option<PathBuf> {
    let value = env::var(model_file_variable(ordinal)).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}
