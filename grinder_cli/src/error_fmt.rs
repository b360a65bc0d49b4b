//! Human-readable error descriptions and structured JSON error formatting.

use grinder_core::error::{BuildError, GrinderError};

/// Exit code for a sensor that never came up; the unit needs a restart.
pub const EXIT_SENSOR_INIT: i32 = 3;
pub const EXIT_HARDWARE: i32 = 4;
pub const EXIT_CONFIG: i32 = 5;

fn find<E: std::error::Error + 'static>(err: &eyre::Report) -> Option<&E> {
    err.chain().find_map(|e| e.downcast_ref::<E>())
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(BuildError::InvalidSettings(msg)) = find::<BuildError>(err) {
        return format!(
            "What happened: Invalid settings ({msg}).\nLikely causes: A [dose], [buttons] or [scale] value is out of range.\nHow to fix: Edit the config file or use `grinder settings set`, then rerun."
        );
    }

    if let Some(ge) = find::<GrinderError>(err) {
        return match ge {
            GrinderError::SensorInit(msg) => format!(
                "What happened: The weight sensor did not start ({msg}).\nLikely causes: HX711 not powered, DT/SCK pins swapped, or a loose load-cell cable.\nHow to fix: Check [pins] and the wiring, then restart the controller."
            ),
            GrinderError::Timeout => "What happened: Scale read timed out.\nLikely causes: HX711 not wired correctly, no power/ground, or timeout too low.\nHow to fix: Verify DT/SCK pins and power, and consider increasing hardware.sensor_read_timeout_ms in the config.".to_string(),
            GrinderError::Hardware(msg) | GrinderError::HardwareFault(msg) => format!(
                "What happened: Hardware error ({msg}).\nLikely causes: Relay or GPIO access failed.\nHow to fix: Check [pins].relay and GPIO permissions; the grinder relay was switched off."
            ),
            GrinderError::Config(msg) => format!(
                "What happened: Invalid setting ({msg}).\nLikely causes: Unknown key or a value out of range.\nHow to fix: Run `grinder settings show` for valid keys."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = format!("{err:#}");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("must have headers") {
        return "Invalid headers in calibration CSV. Expected 'raw,grams'.".to_string();
    }

    if lower.contains("read config") {
        return format!(
            "What happened: Could not read the config file.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass --config <FILE> pointing at a readable TOML file. Original: {msg}"
        );
    }

    if lower.contains("parse config") || lower.contains(" must be ") {
        return format!(
            "What happened: Configuration is invalid.\nLikely causes: A TOML syntax error or an out-of-range value ({msg}).\nHow to fix: Edit the TOML config and try again."
        );
    }

    if lower.contains("gpio") {
        return "What happened: Failed to initialize hardware pins.\nLikely causes: Incorrect pin numbers or insufficient GPIO permissions.\nHow to fix: Fix the [pins] values in the config; ensure the process has permission to access GPIO.".to_string();
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if find::<BuildError>(err).is_some() {
        return EXIT_CONFIG;
    }
    match find::<GrinderError>(err) {
        Some(GrinderError::SensorInit(_)) => EXIT_SENSOR_INIT,
        Some(
            GrinderError::Timeout | GrinderError::Hardware(_) | GrinderError::HardwareFault(_),
        ) => EXIT_HARDWARE,
        Some(GrinderError::Config(_)) => EXIT_CONFIG,
        _ => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if find::<BuildError>(err).is_some() {
        return "InvalidSettings";
    }
    match find::<GrinderError>(err) {
        Some(GrinderError::SensorInit(_)) => "SensorInit",
        Some(GrinderError::Timeout) => "Timeout",
        Some(GrinderError::Hardware(_) | GrinderError::HardwareFault(_)) => "Hardware",
        Some(GrinderError::Config(_)) => "Config",
        _ => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    let mut obj = serde_json::json!({
        "reason": reason_name(err),
        "message": humanize(err),
    });
    if exit_code_for_error(err) == EXIT_SENSOR_INIT {
        obj["restart_required"] = serde_json::Value::Bool(true);
    }
    obj.to_string()
}
