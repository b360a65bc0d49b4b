//! Write-only, best-effort event stream out of the controller.
//!
//! Display, graph and metrics sinks all receive the same events; a sink that
//! cannot deliver drops the event and never blocks the control loop.
use grinder_traits::ButtonId;

/// What the display should show.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayView {
    Weight { grams: f32 },
    Confirm { target_g: f32, button: ButtonId },
    Tare,
    Grinding { grams: f32, target_g: f32, elapsed_s: f32 },
    TopUp { grams: f32, target_g: f32 },
    Stabilizing { grams: f32 },
    Final { grams: f32, elapsed_s: f32 },
    Debug { raw: i32, grams: f32, stable: bool },
    Off,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// New dose: clear graphs and metrics.
    SessionReset { target_g: f32 },
    SessionUpdate { elapsed_s: f32, grams: f32 },
    SessionFinalize { elapsed_s: f32, grams: f32 },
    TopUp { runtime_ms: u64, delta_g: f32 },
    RawSample {
        raw: i32,
        grams: f32,
        elapsed_ms: u64,
        stable: bool,
    },
    Display(DisplayView),
    Log(String),
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionReset { .. } => "session_reset",
            Self::SessionUpdate { .. } => "session_update",
            Self::SessionFinalize { .. } => "session_finalize",
            Self::TopUp { .. } => "top_up",
            Self::RawSample { .. } => "raw_sample",
            Self::Display(_) => "display",
            Self::Log(_) => "log",
        }
    }
}

pub trait Telemetry {
    fn record(&mut self, event: &TelemetryEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn record(&mut self, _event: &TelemetryEvent) {}
}

/// Turns events into `tracing` events under the `grinder::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::SessionReset { target_g } => {
                tracing::debug!(target: "grinder::telemetry", target_g, "session reset");
            }
            TelemetryEvent::SessionUpdate { elapsed_s, grams } => {
                tracing::trace!(target: "grinder::telemetry", elapsed_s, grams, "progress");
            }
            TelemetryEvent::SessionFinalize { elapsed_s, grams } => {
                tracing::debug!(target: "grinder::telemetry", elapsed_s, grams, "finalize");
            }
            TelemetryEvent::TopUp {
                runtime_ms,
                delta_g,
            } => {
                tracing::debug!(target: "grinder::telemetry", runtime_ms, delta_g, "top-up");
            }
            TelemetryEvent::RawSample {
                raw,
                grams,
                elapsed_ms,
                stable,
            } => {
                tracing::trace!(target: "grinder::telemetry", raw, grams, elapsed_ms, stable, "raw");
            }
            TelemetryEvent::Display(view) => {
                tracing::trace!(target: "grinder::telemetry", ?view, "display");
            }
            TelemetryEvent::Log(line) => {
                tracing::debug!(target: "grinder::telemetry", "{line}");
            }
        }
    }
}

impl<A: Telemetry, B: Telemetry> Telemetry for (A, B) {
    fn record(&mut self, event: &TelemetryEvent) {
        self.0.record(event);
        self.1.record(event);
    }
}

impl Telemetry for Box<dyn Telemetry + Send> {
    fn record(&mut self, event: &TelemetryEvent) {
        (**self).record(event);
    }
}

/// Rate limiter keyed on the controller's millisecond clock.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    period_ms: u64,
    last: Option<u64>,
}

impl Throttle {
    pub const fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            last: None,
        }
    }

    /// `true` (and re-arms) once per period.
    pub fn ready(&mut self, now: u64) -> bool {
        if self
            .last
            .is_none_or(|t| now.saturating_sub(t) >= self.period_ms)
        {
            self.last = Some(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Count(usize);
    impl Telemetry for Count {
        fn record(&mut self, _event: &TelemetryEvent) {
            self.0 += 1;
        }
    }

    #[test]
    fn pair_fans_out() {
        let mut t = (Count::default(), Count::default());
        t.record(&TelemetryEvent::Log("x".into()));
        assert_eq!((t.0.0, t.1.0), (1, 1));
    }

    #[test]
    fn throttle_fires_once_per_period() {
        let mut th = Throttle::new(150);
        assert!(th.ready(0));
        assert!(!th.ready(149));
        assert!(th.ready(150));
        th.reset();
        assert!(th.ready(151));
    }
}
