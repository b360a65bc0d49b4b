//! Opens the weight sensor, relay and buttons for the current build.
//!
//! `--features hardware` on Linux talks to the HX711 and GPIO; every other
//! build drives the simulated grinder.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use grinder_config::Config;
use grinder_core::hw_error::map_hw_error;
use grinder_core::{FilteredScale, GrinderError, Telemetry, TracingTelemetry};
use grinder_hardware::{SimGrinder, SimParams, SimulatedRelay, SimulatedScale};
use grinder_core::conversions::sensor_params;
use grinder_traits::{Clock, Relay, WeightSource};

use crate::telemetry::JsonlTelemetry;

pub fn sensor_timeout(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.hardware.sensor_read_timeout_ms)
}

/// Simulator tuned to the configured calibration, so grams read back as grams.
pub fn sim_params(cfg: &Config) -> SimParams {
    SimParams {
        flow_gps: cfg.sim.flow_gps,
        spin_up_ms: cfg.sim.spin_up_ms,
        coast_ms: cfg.sim.coast_ms,
        noise_counts: cfg.sim.noise_counts,
        counts_per_gram: cfg.scale.calibration_factor,
        zero_counts: cfg.scale.zero_counts,
    }
}

pub struct SimBackend {
    pub sim: SimGrinder,
    pub weight: FilteredScale<SimulatedScale>,
    pub relay: SimulatedRelay,
}

pub fn open_sim(
    cfg: &Config,
    params: SimParams,
    clock: Arc<dyn Clock + Send + Sync>,
    mode: grinder_core::SamplingMode,
) -> SimBackend {
    let sim = SimGrinder::new(params, clock);
    let weight = FilteredScale::new(
        sim.scale(),
        mode,
        sensor_params(&cfg.scale),
        cfg.scale.zero_counts,
        sensor_timeout(cfg),
    );
    let relay = sim.relay();
    tracing::info!(flow_gps = params.flow_gps, ?mode, "simulated grinder ready");
    SimBackend { sim, weight, relay }
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod hw {
    use super::{Config, FilteredScale, WrapErr, map_hw_error, sensor_params, sensor_timeout};
    use grinder_core::SamplingMode;
    use grinder_core::conversions::sampling_mode;
    use grinder_hardware::gpio::{ButtonPins, GpioButtons, GpioRelay};
    use grinder_hardware::hx711::Hx711;

    pub fn open_weight(cfg: &Config) -> eyre::Result<FilteredScale<Hx711>> {
        let hx = Hx711::open(cfg.pins.hx711_dt, cfg.pins.hx711_sck, cfg.scale.gain_pulses)
            .map_err(|e| eyre::Report::new(map_hw_error(&e)))
            .wrap_err("open hx711")?;
        // The HX711 signals data-ready, so the sampler waits on it instead of pacing.
        let mode = match sampling_mode(cfg) {
            SamplingMode::Paced(_) => SamplingMode::Event,
            other => other,
        };
        Ok(FilteredScale::new(
            hx,
            mode,
            sensor_params(&cfg.scale),
            cfg.scale.zero_counts,
            sensor_timeout(cfg),
        ))
    }

    pub fn open_relay(cfg: &Config) -> eyre::Result<GpioRelay> {
        GpioRelay::open(cfg.pins.relay, cfg.hardware.relay_active_low)
            .map_err(|e| eyre::Report::new(map_hw_error(&e)))
            .wrap_err("open relay pin")
    }

    pub fn open_buttons(cfg: &Config) -> eyre::Result<GpioButtons> {
        GpioButtons::open(&ButtonPins {
            left: cfg.pins.button_left,
            right: cfg.pins.button_right,
            back: cfg.pins.button_back,
            active_low: cfg.buttons.active_low,
        })
        .map_err(|e| eyre::Report::new(map_hw_error(&e)))
        .wrap_err("open button pins")
    }
}

/// Tracing events always; JSON lines too when `[logging].telemetry_file` is set.
pub fn telemetry(cfg: &Config) -> eyre::Result<Box<dyn Telemetry + Send>> {
    match cfg.logging.telemetry_file.as_deref() {
        Some(path) => {
            let jsonl = JsonlTelemetry::create(Path::new(path))?;
            Ok(Box::new((TracingTelemetry, jsonl)))
        }
        None => Ok(Box::new(TracingTelemetry)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckReport {
    pub grams: f32,
    pub raw: i32,
    pub stable: bool,
}

/// Bring the sensor up, take a few readings and make sure the relay is off.
pub fn check<W: WeightSource, R: Relay>(
    weight: &mut W,
    relay: &mut R,
    samples: usize,
) -> eyre::Result<CheckReport> {
    weight
        .begin()
        .map_err(|e| eyre::Report::new(GrinderError::SensorInit(e.to_string())))?;
    for _ in 0..samples.max(1) {
        weight
            .poll()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("read weight sensor")?;
    }
    relay
        .set(false)
        .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
        .wrap_err("relay off")?;
    let raw = weight.read_raw();
    Ok(CheckReport {
        grams: weight.read(),
        raw: raw.raw,
        stable: raw.stable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use grinder_core::SamplingMode;
    use grinder_traits::ManualClock;

    #[test]
    fn sim_check_reads_zero_and_relay_off() {
        let cfg = Config::default();
        let clock = ManualClock::new();
        let mut b = open_sim(&cfg, sim_params(&cfg), Arc::new(clock), SamplingMode::Direct);
        let report = check(&mut b.weight, &mut b.relay, cfg.scale.read_samples).unwrap();
        assert!(report.grams.abs() < 1e-3);
        assert!(report.stable);
        assert!(!b.sim.relay_is_on());
    }

    #[test]
    fn sim_reads_back_configured_calibration() {
        let mut cfg = Config::default();
        cfg.scale.calibration_factor = 420.0;
        cfg.scale.zero_counts = -1200;
        let clock = ManualClock::new();
        let mut b = open_sim(&cfg, sim_params(&cfg), Arc::new(clock), SamplingMode::Direct);
        b.sim.add_mass(10.0);
        let report = check(&mut b.weight, &mut b.relay, 8).unwrap();
        assert!((report.grams - 10.0).abs() < 0.01, "{}", report.grams);
    }
}
