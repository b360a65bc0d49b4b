//! `grinder settings show|set`.

use std::path::Path;

use grinder_config::Config;
use grinder_core::{BuildError, Settings, SettingsStore};

use crate::store::TomlSettingsStore;

fn policy_name(p: grinder_core::RatePolicy) -> &'static str {
    match p {
        grinder_core::RatePolicy::SessionAverage => "session_average",
        grinder_core::RatePolicy::ObservedPulse => "observed_pulse",
    }
}

/// Every runtime setting as `(key, value)`, in `SETTING_KEYS` order.
pub fn pairs(s: &Settings) -> Vec<(&'static str, String)> {
    vec![
        ("target_dose_single", s.target_dose_single.to_string()),
        ("target_dose_double", s.target_dose_double.to_string()),
        ("top_up_margin_single", s.top_up_margin_single.to_string()),
        ("top_up_margin_double", s.top_up_margin_double.to_string()),
        ("min_topup_grams", s.min_topup_grams.to_string()),
        ("topup_tolerance_g", s.topup_tolerance_g.to_string()),
        ("max_topup_pulses", s.max_topup_pulses.to_string()),
        ("rate_policy", policy_name(s.rate_policy).to_string()),
        ("fallback_rate_gps", s.fallback_rate_gps.to_string()),
        ("topup_timeout_ms", s.topup_timeout_ms.to_string()),
        ("grinding_timeout_ms", s.grinding_timeout_ms.to_string()),
        ("finalize_timeout_ms", s.finalize_timeout_ms.to_string()),
        ("confirm_timeout_ms", s.confirm_timeout_ms.to_string()),
        ("stability_min_wait_ms", s.stability_min_wait_ms.to_string()),
        ("stability_max_wait_ms", s.stability_max_wait_ms.to_string()),
        ("tare_timeout_ms", s.tare_timeout_ms.to_string()),
        ("button_debounce_ms", s.button_debounce_ms.to_string()),
        ("button_min_hold_ms", s.button_min_hold_ms.to_string()),
        ("idle_display_timeout_ms", s.idle_display_timeout_ms.to_string()),
        ("read_samples", s.sensor.read_samples.to_string()),
        ("calibration_factor", s.sensor.calibration_factor.to_string()),
        ("stable_band_g", s.sensor.stable_band_g.to_string()),
    ]
}

pub fn render(s: &Settings, json: bool) -> String {
    let pairs = pairs(s);
    if json {
        let map: serde_json::Map<String, serde_json::Value> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
            .collect();
        serde_json::Value::Object(map).to_string()
    } else {
        pairs
            .iter()
            .map(|(k, v)| format!("{k} = {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Apply one edit to the file config. Unlike edits on a running controller,
/// a failed save is an error here.
pub fn set(cfg: &Config, path: &Path, key: &str, value: &str) -> eyre::Result<Settings> {
    let mut settings = Settings::from(cfg);
    settings.apply_kv(key, value)?;
    settings
        .validate()
        .map_err(|e| eyre::Report::new(BuildError::InvalidSettings(e.to_string())))?;
    TomlSettingsStore::new(path.to_path_buf(), cfg.clone()).save(&settings)?;
    tracing::info!(key, value, path = %path.display(), "setting saved");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grinder_core::settings::SETTING_KEYS;

    #[test]
    fn pairs_cover_every_key() {
        let keys: Vec<_> = pairs(&Settings::default()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, SETTING_KEYS);
    }

    #[test]
    fn shown_values_parse_back() {
        let mut s = Settings::default();
        for (k, v) in pairs(&Settings::default()) {
            s.apply_kv(k, &v).unwrap();
        }
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn set_rejects_invalid_value_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grinder.toml");
        let err = set(&Config::default(), &path, "target_dose_single", "0").unwrap_err();
        assert!(err.downcast_ref::<BuildError>().is_some());
        assert!(!path.exists());
    }
}
