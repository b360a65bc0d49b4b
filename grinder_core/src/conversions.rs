//! `From` implementations and helpers bridging `grinder_config` types to `grinder_core` types,
//! plus the reverse mapping used when settings edits are persisted.

use grinder_config::Config;
use grinder_traits::SensorParams;

use crate::runner::LoopCfg;
use crate::scale::SamplingMode;
use crate::settings::{RatePolicy, Settings};

// ── RatePolicy ───────────────────────────────────────────────────────────────

impl From<grinder_config::RatePolicy> for RatePolicy {
    fn from(p: grinder_config::RatePolicy) -> Self {
        match p {
            grinder_config::RatePolicy::SessionAverage => Self::SessionAverage,
            grinder_config::RatePolicy::ObservedPulse => Self::ObservedPulse,
        }
    }
}

impl From<RatePolicy> for grinder_config::RatePolicy {
    fn from(p: RatePolicy) -> Self {
        match p {
            RatePolicy::SessionAverage => Self::SessionAverage,
            RatePolicy::ObservedPulse => Self::ObservedPulse,
        }
    }
}

// ── Sensor ───────────────────────────────────────────────────────────────────

/// Sensor tuning from the `[scale]` section.
pub fn sensor_params(c: &grinder_config::ScaleCfg) -> SensorParams {
    SensorParams {
        read_samples: c.read_samples,
        calibration_factor: c.calibration_factor,
        stable_band_g: c.stable_band_g,
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

impl From<&Config> for Settings {
    fn from(c: &Config) -> Self {
        let d = &c.dose;
        Self {
            target_dose_single: d.target_single_g,
            target_dose_double: d.target_double_g,
            top_up_margin_single: d.top_up_margin_single_g,
            top_up_margin_double: d.top_up_margin_double_g,
            min_topup_grams: d.min_topup_g,
            topup_tolerance_g: d.topup_tolerance_g,
            max_topup_pulses: d.max_topup_pulses,
            rate_policy: d.rate_policy.into(),
            fallback_rate_gps: d.fallback_rate_gps,
            topup_timeout_ms: d.topup_timeout_ms,
            grinding_timeout_ms: d.grinding_timeout_ms,
            finalize_timeout_ms: d.finalize_timeout_ms,
            confirm_timeout_ms: d.confirm_timeout_ms,
            stability_min_wait_ms: d.stability_min_wait_ms,
            stability_max_wait_ms: d.stability_max_wait_ms,
            tare_timeout_ms: d.tare_timeout_ms,
            button_debounce_ms: c.buttons.debounce_ms,
            button_min_hold_ms: c.buttons.min_hold_ms,
            idle_display_timeout_ms: c.display.idle_timeout_ms,
            sensor: sensor_params(&c.scale),
        }
    }
}

/// Write runtime settings back into a file config, leaving pins, logging and
/// other host-only sections untouched.
pub fn apply_to_config(s: &Settings, c: &mut Config) {
    let d = &mut c.dose;
    d.target_single_g = s.target_dose_single;
    d.target_double_g = s.target_dose_double;
    d.top_up_margin_single_g = s.top_up_margin_single;
    d.top_up_margin_double_g = s.top_up_margin_double;
    d.min_topup_g = s.min_topup_grams;
    d.topup_tolerance_g = s.topup_tolerance_g;
    d.max_topup_pulses = s.max_topup_pulses;
    d.rate_policy = s.rate_policy.into();
    d.fallback_rate_gps = s.fallback_rate_gps;
    d.topup_timeout_ms = s.topup_timeout_ms;
    d.grinding_timeout_ms = s.grinding_timeout_ms;
    d.finalize_timeout_ms = s.finalize_timeout_ms;
    d.confirm_timeout_ms = s.confirm_timeout_ms;
    d.stability_min_wait_ms = s.stability_min_wait_ms;
    d.stability_max_wait_ms = s.stability_max_wait_ms;
    d.tare_timeout_ms = s.tare_timeout_ms;
    c.buttons.debounce_ms = s.button_debounce_ms;
    c.buttons.min_hold_ms = s.button_min_hold_ms;
    c.display.idle_timeout_ms = s.idle_display_timeout_ms;
    c.scale.read_samples = s.sensor.read_samples;
    c.scale.calibration_factor = s.sensor.calibration_factor;
    c.scale.stable_band_g = s.sensor.stable_band_g;
}

// ── Runner ───────────────────────────────────────────────────────────────────

impl From<&grinder_config::RunnerCfg> for LoopCfg {
    fn from(c: &grinder_config::RunnerCfg) -> Self {
        Self {
            period_ms: c.period_ms,
            ..Self::default()
        }
    }
}

/// Sampling mode for the hardware scale: a paced background thread in
/// `sampler` mode, inline reads otherwise.
pub fn sampling_mode(c: &Config) -> SamplingMode {
    match c.runner.mode {
        grinder_config::RunMode::Sampler => SamplingMode::Paced(c.scale.sample_rate_hz),
        grinder_config::RunMode::Direct => SamplingMode::Direct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_maps_to_default_settings() {
        assert_eq!(Settings::from(&Config::default()), Settings::default());
    }

    #[test]
    fn settings_round_trip_through_config() {
        let s = Settings {
            target_dose_single: 17.2,
            rate_policy: RatePolicy::ObservedPulse,
            button_debounce_ms: 90,
            ..Settings::default()
        };
        let mut c = Config::default();
        apply_to_config(&s, &mut c);
        assert_eq!(Settings::from(&c), s);
        assert_eq!(c.pins, grinder_config::Pins::default());
    }

    #[test]
    fn scale_section_maps_to_sensor_params() {
        let mut c = Config::default();
        c.scale.read_samples = 3;
        c.scale.calibration_factor = 512.5;
        c.scale.stable_band_g = 0.2;
        let p = sensor_params(&c.scale);
        assert_eq!(p.read_samples, 3);
        assert!((p.calibration_factor - 512.5).abs() < f32::EPSILON);
        assert!((p.stable_band_g - 0.2).abs() < f32::EPSILON);
        assert_eq!(Settings::from(&c).sensor, p);
    }
}
