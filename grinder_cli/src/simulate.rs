//! `grinder simulate`: one headless dose on the simulated grinder.
//!
//! Time comes from a `ManualClock` advanced one control period per step, so a
//! thirty-second grind finishes in milliseconds.

use std::sync::Arc;

use grinder_config::Config;
use grinder_core::{
    DosingStateMachine, MachineBuilder, SamplingMode, Settings, SettingsHandle, State, StateKind,
    Telemetry,
};
use grinder_traits::{ButtonId, ButtonInput, ManualClock, Relay, WeightSource};
use serde_json::json;

use crate::backend;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimRequest {
    pub button: ButtonId,
    /// Arbitrary dose through the request slot instead of a button.
    pub grams: Option<f32>,
    pub flow_gps: Option<f32>,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimOutcome {
    pub target_g: f32,
    pub final_g: f32,
    pub elapsed_s: f32,
    pub top_up_pulses: u32,
    pub rate_gps: Option<f32>,
    pub relay_switches: u32,
}

impl SimOutcome {
    pub fn to_json(&self) -> String {
        json!({
            "target_g": self.target_g,
            "final_g": self.final_g,
            "error_g": self.final_g - self.target_g,
            "elapsed_s": self.elapsed_s,
            "top_up_pulses": self.top_up_pulses,
            "rate_gps": self.rate_gps,
            "relay_switches": self.relay_switches,
        })
        .to_string()
    }

    pub fn to_text(&self) -> String {
        format!(
            "Dose complete: {:.2} g (target {:.2} g) in {:.1} s, {} top-up pulse(s)",
            self.final_g, self.target_g, self.elapsed_s, self.top_up_pulses
        )
    }
}

struct Stepper<'a> {
    clock: &'a ManualClock,
    period: u64,
    deadline: u64,
    max_ms: u64,
}

impl Stepper<'_> {
    /// Step one control period at a time until the machine is in `kind`.
    fn until<W, R, B, T>(
        &self,
        m: &mut DosingStateMachine<W, R, B, T>,
        kind: StateKind,
    ) -> eyre::Result<()>
    where
        W: WeightSource,
        R: Relay,
        B: ButtonInput,
        T: Telemetry,
    {
        while m.state_kind() != kind {
            if m.time().now_ms() >= self.deadline {
                m.shutdown();
                eyre::bail!(
                    "simulated dose did not reach {kind} within {} ms (stuck in {})",
                    self.max_ms,
                    m.state_kind()
                );
            }
            self.clock.advance_ms(self.period);
            m.step()?;
        }
        Ok(())
    }
}

pub fn simulate(cfg: &Config, req: &SimRequest) -> eyre::Result<SimOutcome> {
    let clock = ManualClock::new();
    let mut params = backend::sim_params(cfg);
    if let Some(flow) = req.flow_gps {
        if !(flow.is_finite() && flow >= 0.0) {
            eyre::bail!("--flow must be a non-negative number, got {flow}");
        }
        params.flow_gps = flow;
    }
    let b = backend::open_sim(cfg, params, Arc::new(clock.clone()), SamplingMode::Direct);
    let sim = b.sim.clone();

    let settings = Settings::from(cfg);
    let debounce_ms = settings.button_debounce_ms;
    let mut m = MachineBuilder::new()
        .with_weight(b.weight)
        .with_relay(b.relay)
        .with_telemetry(backend::telemetry(cfg)?)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(SettingsHandle::new(settings))
        .with_heartbeat_ms(cfg.runner.heartbeat_ms)
        .build()?;
    m.begin()?;

    let period = cfg.runner.period_ms.max(1);
    let run = Stepper {
        clock: &clock,
        period,
        deadline: m.time().now_ms().saturating_add(req.max_ms),
        max_ms: req.max_ms,
    };

    match req.grams {
        Some(grams) => {
            if !m.requests().submit(grams) {
                eyre::bail!("dose request of {grams} g refused");
            }
        }
        None => m.inject_edge(req.button),
    }
    run.until(&mut m, StateKind::Confirm)?;
    let confirm = m.state().confirm_button();
    tracing::info!(button = confirm.name(), "confirming dose");
    clock.advance_ms(debounce_ms + period);
    m.inject_edge(confirm);
    run.until(&mut m, StateKind::Finalize)?;

    let State::Finalize(reading) = m.state() else {
        eyre::bail!("simulated dose ended in {}", m.state_kind());
    };
    let reading = *reading;
    let outcome = m.session().map_or(
        SimOutcome {
            target_g: 0.0,
            final_g: reading.grams,
            elapsed_s: reading.elapsed_s,
            top_up_pulses: 0,
            rate_gps: None,
            relay_switches: sim.relay_switches(),
        },
        |s| SimOutcome {
            target_g: s.target.grams,
            final_g: reading.grams,
            elapsed_s: reading.elapsed_s,
            top_up_pulses: s.top_up_pulses,
            rate_gps: s.rate.average(),
            relay_switches: sim.relay_switches(),
        },
    );
    m.shutdown();
    tracing::info!(
        target_g = outcome.target_g,
        final_g = outcome.final_g,
        elapsed_s = outcome.elapsed_s,
        "simulated dose complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(button: ButtonId) -> SimRequest {
        SimRequest {
            button,
            grams: None,
            flow_gps: None,
            max_ms: 120_000,
        }
    }

    fn quick_config() -> Config {
        let mut cfg = Config::default();
        cfg.dose.topup_timeout_ms = 500;
        cfg.dose.min_topup_g = 0.1;
        cfg.dose.stability_min_wait_ms = 100;
        cfg.dose.stability_max_wait_ms = 2000;
        cfg.scale.read_samples = 4;
        cfg.scale.zero_counts = 8400;
        cfg
    }

    #[test]
    fn single_dose_lands_near_target() {
        let out = simulate(&quick_config(), &request(ButtonId::Left)).unwrap();
        assert!((out.target_g - 18.0).abs() < f32::EPSILON);
        assert!((out.final_g - 18.0).abs() <= 0.1, "{out:?}");
        assert!(out.top_up_pulses >= 1);
        assert_eq!(out.relay_switches, 1 + out.top_up_pulses);
    }

    #[test]
    fn requested_grams_use_the_request_slot() {
        let req = SimRequest {
            grams: Some(20.0),
            ..request(ButtonId::Left)
        };
        let out = simulate(&quick_config(), &req).unwrap();
        assert!((out.target_g - 20.0).abs() < f32::EPSILON);
        let v: serde_json::Value = serde_json::from_str(&out.to_json()).unwrap();
        assert_eq!(v["top_up_pulses"], out.top_up_pulses);
    }

    #[test]
    fn dead_grinder_still_finishes() {
        let req = SimRequest {
            flow_gps: Some(0.0),
            ..request(ButtonId::Left)
        };
        let out = simulate(&quick_config(), &req).unwrap();
        assert!(out.final_g.abs() < 0.05);
    }

    #[test]
    fn deadline_is_reported() {
        let req = SimRequest {
            max_ms: 1000,
            ..request(ButtonId::Left)
        };
        let err = simulate(&quick_config(), &req).unwrap_err();
        assert!(err.to_string().contains("did not reach"), "{err}");
    }
}
