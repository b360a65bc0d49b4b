#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema and calibration parsing for the grinder controller.
//!
//! - `Config` and its sections are deserialized from TOML and validated.
//!   Every section has defaults, so an empty file is a valid config.
//! - `save_toml` writes the config back atomically; the controller uses it to
//!   persist settings edited at runtime.
//! - The calibration CSV loader fits counts-per-gram and the zero offset.
pub mod atomic;

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Pins {
    pub hx711_dt: u8,
    pub hx711_sck: u8,
    pub relay: u8,
    pub button_left: u8,
    pub button_right: u8,
    pub button_back: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            hx711_dt: 5,
            hx711_sck: 6,
            relay: 17,
            button_left: 22,
            button_right: 23,
            button_back: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RatePolicy {
    /// Reuse the grinding-phase average for every top-up pulse.
    #[default]
    SessionAverage,
    /// Use the rate measured across the previous pulse when available.
    ObservedPulse,
}

/// Dose targets, top-up tuning and phase timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DoseCfg {
    pub target_single_g: f32,
    pub target_double_g: f32,
    /// Grams subtracted from the single target before the first stop.
    pub top_up_margin_single_g: f32,
    pub top_up_margin_double_g: f32,
    /// Minimum increase after a pulse before a settled reading is trusted.
    pub min_topup_g: f32,
    /// Stop pulsing once within this distance of the target.
    pub topup_tolerance_g: f32,
    pub max_topup_pulses: u32,
    pub rate_policy: RatePolicy,
    /// Rate assumed when no grinding-phase sample was recorded.
    pub fallback_rate_gps: f32,
    pub topup_timeout_ms: u64,
    pub grinding_timeout_ms: u64,
    pub finalize_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub stability_min_wait_ms: u64,
    pub stability_max_wait_ms: u64,
    pub tare_timeout_ms: u64,
}

impl Default for DoseCfg {
    fn default() -> Self {
        Self {
            target_single_g: 18.0,
            target_double_g: 36.0,
            top_up_margin_single_g: 1.5,
            top_up_margin_double_g: 1.5,
            min_topup_g: 0.2,
            topup_tolerance_g: 0.08,
            max_topup_pulses: 8,
            rate_policy: RatePolicy::SessionAverage,
            fallback_rate_gps: 0.1,
            topup_timeout_ms: 1000,
            grinding_timeout_ms: 30_000,
            finalize_timeout_ms: 5000,
            confirm_timeout_ms: 2000,
            stability_min_wait_ms: 500,
            stability_max_wait_ms: 5000,
            tare_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ButtonsCfg {
    pub debounce_ms: u64,
    pub min_hold_ms: u64,
    /// Pins read low while pressed (pull-up wiring)
    pub active_low: bool,
}

impl Default for ButtonsCfg {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            min_hold_ms: 20,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScaleCfg {
    pub read_samples: usize,
    /// Raw counts per gram.
    pub calibration_factor: f32,
    /// Raw counts at zero load, used until the first tare.
    pub zero_counts: i32,
    pub stable_band_g: f32,
    /// HX711 gain/channel selection: extra clock pulses after the 24 data bits (1..=3).
    pub gain_pulses: u8,
    /// Paced sampler rate when the sensor has no data-ready line.
    pub sample_rate_hz: u32,
}

impl Default for ScaleCfg {
    fn default() -> Self {
        Self {
            read_samples: 8,
            calibration_factor: 1000.0,
            zero_counts: 0,
            stable_band_g: 0.05,
            gain_pulses: 1,
            sample_rate_hz: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayCfg {
    /// Blank the weight display after this long in Idle.
    pub idle_timeout_ms: u64,
}

impl Default for DisplayCfg {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Background thread owns the ADC
    #[default]
    Sampler,
    /// ADC read inline in the control loop
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerCfg {
    pub mode: RunMode,
    /// Control-loop period.
    pub period_ms: u64,
    /// Emit a heartbeat log line this often.
    pub heartbeat_ms: u64,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            mode: RunMode::Sampler,
            period_ms: 10,
            heartbeat_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
    /// Optional JSONL telemetry output (session and raw-sample events)
    pub telemetry_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Hardware {
    /// Max time to wait for HX711 data-ready (DT low) before failing
    pub sensor_read_timeout_ms: u64,
    /// Relay energizes on a low output
    pub relay_active_low: bool,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            sensor_read_timeout_ms: 150,
            relay_active_low: false,
        }
    }
}

/// Simulated grinder used when the `hardware` feature is off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimCfg {
    /// Grams per second delivered while the relay is on.
    pub flow_gps: f32,
    /// Dead time between relay-on and first grounds reaching the cup.
    pub spin_up_ms: u64,
    /// Time grounds keep falling after relay-off.
    pub coast_ms: u64,
    /// Peak-to-peak noise on the raw counts.
    pub noise_counts: i32,
}

impl Default for SimCfg {
    fn default() -> Self {
        Self {
            flow_gps: 2.0,
            spin_up_ms: 20,
            coast_ms: 0,
            noise_counts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub pins: Pins,
    pub dose: DoseCfg,
    pub buttons: ButtonsCfg,
    pub scale: ScaleCfg,
    pub display: DisplayCfg,
    pub runner: RunnerCfg,
    pub logging: Logging,
    pub hardware: Hardware,
    pub sim: SimCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read, parse and validate a config file.
pub fn load_path(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {}: {e}", path.display()))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {}: {e}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Serialize and atomically replace `path`.
pub fn save_toml(cfg: &Config, path: &Path) -> eyre::Result<()> {
    let text = toml::to_string_pretty(cfg).map_err(|e| eyre::eyre!("serialize config: {e}"))?;
    atomic::write_atomic(path, text.as_bytes())
        .map_err(|e| eyre::eyre!("write config {}: {e}", path.display()))
}

fn check_grams(name: &str, v: f32, max: f32) -> eyre::Result<()> {
    if !(v.is_finite() && v > 0.0 && v <= max) {
        eyre::bail!("{name} must be in (0, {max}]");
    }
    Ok(())
}

fn check_margin(name: &str, v: f32) -> eyre::Result<()> {
    if !(v.is_finite() && (0.0..=10.0).contains(&v)) {
        eyre::bail!("{name} must be in [0, 10]");
    }
    Ok(())
}

fn check_ms(name: &str, v: u64, max: u64) -> eyre::Result<()> {
    if v == 0 {
        eyre::bail!("{name} must be >= 1");
    }
    if v > max {
        eyre::bail!("{name} is unreasonably large (>{max} ms)");
    }
    Ok(())
}

const FIVE_MIN_MS: u64 = 5 * 60 * 1000;

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Dose
        let d = &self.dose;
        check_grams("dose.target_single_g", d.target_single_g, 500.0)?;
        check_grams("dose.target_double_g", d.target_double_g, 500.0)?;
        check_margin("dose.top_up_margin_single_g", d.top_up_margin_single_g)?;
        check_margin("dose.top_up_margin_double_g", d.top_up_margin_double_g)?;
        if !(d.min_topup_g.is_finite() && (0.0..=5.0).contains(&d.min_topup_g)) {
            eyre::bail!("dose.min_topup_g must be in [0, 5]");
        }
        if !(d.topup_tolerance_g.is_finite() && (0.0..=1.0).contains(&d.topup_tolerance_g)) {
            eyre::bail!("dose.topup_tolerance_g must be in [0, 1]");
        }
        if d.max_topup_pulses == 0 {
            eyre::bail!("dose.max_topup_pulses must be >= 1");
        }
        if !(d.fallback_rate_gps.is_finite() && d.fallback_rate_gps > 0.0) {
            eyre::bail!("dose.fallback_rate_gps must be > 0");
        }
        check_ms("dose.topup_timeout_ms", d.topup_timeout_ms, FIVE_MIN_MS)?;
        check_ms("dose.grinding_timeout_ms", d.grinding_timeout_ms, FIVE_MIN_MS)?;
        check_ms("dose.finalize_timeout_ms", d.finalize_timeout_ms, FIVE_MIN_MS)?;
        check_ms("dose.confirm_timeout_ms", d.confirm_timeout_ms, FIVE_MIN_MS)?;
        check_ms("dose.stability_max_wait_ms", d.stability_max_wait_ms, FIVE_MIN_MS)?;
        check_ms("dose.tare_timeout_ms", d.tare_timeout_ms, FIVE_MIN_MS)?;
        if d.stability_min_wait_ms > d.stability_max_wait_ms {
            eyre::bail!("dose.stability_min_wait_ms must be <= dose.stability_max_wait_ms");
        }

        // Buttons
        if self.buttons.debounce_ms > 5000 {
            eyre::bail!("buttons.debounce_ms is unreasonably large (>5000 ms)");
        }
        if self.buttons.min_hold_ms > 2000 {
            eyre::bail!("buttons.min_hold_ms is unreasonably large (>2000 ms)");
        }

        // Scale
        if !(1..=64).contains(&self.scale.read_samples) {
            eyre::bail!("scale.read_samples must be in [1, 64]");
        }
        if !(self.scale.calibration_factor.is_finite() && self.scale.calibration_factor != 0.0) {
            eyre::bail!("scale.calibration_factor must be finite and non-zero");
        }
        if !(self.scale.stable_band_g.is_finite() && self.scale.stable_band_g > 0.0) {
            eyre::bail!("scale.stable_band_g must be > 0");
        }
        if !(1..=3).contains(&self.scale.gain_pulses) {
            eyre::bail!("scale.gain_pulses must be in [1, 3]");
        }
        if self.scale.sample_rate_hz == 0 {
            eyre::bail!("scale.sample_rate_hz must be > 0");
        }

        // Runner
        check_ms("runner.period_ms", self.runner.period_ms, 1000)?;
        check_ms("runner.heartbeat_ms", self.runner.heartbeat_ms, FIVE_MIN_MS)?;

        // Hardware
        if self.hardware.sensor_read_timeout_ms == 0 {
            eyre::bail!("hardware.sensor_read_timeout_ms must be >= 1");
        }

        // Sim
        if !(self.sim.flow_gps.is_finite() && self.sim.flow_gps >= 0.0) {
            eyre::bail!("sim.flow_gps must be >= 0");
        }
        if self.sim.noise_counts < 0 {
            eyre::bail!("sim.noise_counts must be >= 0");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }
}

/// Calibration CSV schema.
///
/// Expected headers:
/// raw,grams
///
/// Example:
/// raw,grams
/// 8400,0.0
/// 108400,100.0
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CalibrationRow {
    pub raw: i64,
    pub grams: f32,
}

/// Linear load-cell model: `grams = (raw - zero_counts) / counts_per_gram`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFit {
    pub counts_per_gram: f32,
    pub zero_counts: i32,
    /// Largest absolute residual of the fit, in grams.
    pub max_residual_g: f32,
}

impl ScaleFit {
    /// Least-squares fit of raw counts against reference grams.
    pub fn from_rows(rows: &[CalibrationRow]) -> eyre::Result<Self> {
        if rows.len() < 2 {
            eyre::bail!("calibration requires at least two rows, got {}", rows.len());
        }
        let n = rows.len() as f64;
        let mean_g = rows.iter().map(|r| f64::from(r.grams)).sum::<f64>() / n;
        #[allow(clippy::cast_precision_loss)]
        let mean_raw = rows.iter().map(|r| r.raw as f64).sum::<f64>() / n;

        let mut sgg = 0.0f64;
        let mut sgr = 0.0f64;
        for r in rows {
            let g = f64::from(r.grams) - mean_g;
            #[allow(clippy::cast_precision_loss)]
            let x = r.raw as f64 - mean_raw;
            sgg += g * g;
            sgr += g * x;
        }
        if !sgg.is_finite() || sgg == 0.0 {
            eyre::bail!("calibration needs at least two distinct reference weights");
        }
        let slope = sgr / sgg;
        if !slope.is_finite() || slope == 0.0 {
            eyre::bail!("calibration produced zero or non-finite counts per gram");
        }
        let zero = mean_raw - slope * mean_g;
        if !zero.is_finite() || zero.abs() > f64::from(i32::MAX) {
            eyre::bail!("calibration produced invalid zero offset");
        }

        let mut max_residual = 0.0f64;
        for r in rows {
            #[allow(clippy::cast_precision_loss)]
            let predicted_g = (r.raw as f64 - zero) / slope;
            max_residual = max_residual.max((predicted_g - f64::from(r.grams)).abs());
        }

        #[allow(clippy::cast_possible_truncation)]
        let counts_per_gram = slope as f32;
        if !counts_per_gram.is_finite() || counts_per_gram == 0.0 {
            eyre::bail!("calibration slope {slope} does not fit counts per gram");
        }
        #[allow(clippy::cast_possible_truncation)]
        let fit = Self {
            counts_per_gram,
            zero_counts: zero.round() as i32,
            max_residual_g: max_residual as f32,
        };
        Ok(fit)
    }

    /// Copy the fit into a scale section.
    pub fn apply(&self, scale: &mut ScaleCfg) {
        scale.calibration_factor = self.counts_per_gram;
        scale.zero_counts = self.zero_counts;
    }
}

pub fn load_calibration_csv(path: &Path) -> eyre::Result<ScaleFit> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {}: {e}", path.display()))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {}: {e}", path.display()))?
        .clone();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != ["raw", "grams"] {
        eyre::bail!(
            "calibration CSV must have headers 'raw,grams', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => eyre::bail!("invalid CSV row {}: {e}", idx + 2),
        }
    }

    ScaleFit::from_rows(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = load_toml("").expect("parse");
        assert_eq!(cfg, Config::default());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn serialized_defaults_parse_back() {
        let text = toml::to_string_pretty(&Config::default()).expect("serialize");
        let cfg = load_toml(&text).expect("parse");
        assert_eq!(cfg.dose, DoseCfg::default());
    }
}
