//! Simulated grinder, relay and load cell.
//!
//! One `SimGrinder` holds the physics; `SimulatedRelay` switches it and
//! `SimulatedScale` reads it as raw HX711-style counts. All three share state
//! through an `Arc<Mutex<_>>` so the scale can live on a sampler thread.
//!
//! Grounds start falling `spin_up_ms` after the relay closes and keep falling
//! for `coast_ms` after it opens.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use grinder_traits::{BoxError, Clock, Relay, Scale};
use tracing::trace;

use crate::error::HwError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimParams {
    pub flow_gps: f32,
    pub spin_up_ms: u64,
    pub coast_ms: u64,
    /// Peak-to-peak noise added to raw counts.
    pub noise_counts: i32,
    pub counts_per_gram: f32,
    /// Raw counts with an empty platform.
    pub zero_counts: i32,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            flow_gps: 2.0,
            spin_up_ms: 20,
            coast_ms: 0,
            noise_counts: 0,
            counts_per_gram: 1000.0,
            zero_counts: 8400,
        }
    }
}

#[derive(Debug)]
struct Physics {
    params: SimParams,
    mass_g: f64,
    updated_at: Instant,
    relay_on: bool,
    on_at: Option<Instant>,
    off_at: Option<Instant>,
    relay_switches: u32,
    rng: u32,
}

impl Physics {
    /// Window during which grounds are falling, if any.
    fn flow_window(&self) -> Option<(Instant, Option<Instant>)> {
        let on_at = self.on_at?;
        let start = on_at + Duration::from_millis(self.params.spin_up_ms);
        if self.relay_on {
            return Some((start, None));
        }
        let off_at = self.off_at?;
        let end = off_at + Duration::from_millis(self.params.coast_ms);
        (end > start).then_some((start, Some(end)))
    }

    fn advance(&mut self, now: Instant) {
        if now <= self.updated_at {
            return;
        }
        if let Some((start, end)) = self.flow_window() {
            let from = self.updated_at.max(start);
            let to = end.map_or(now, |e| e.min(now));
            if to > from {
                let secs = to.duration_since(from).as_secs_f64();
                self.mass_g += f64::from(self.params.flow_gps) * secs;
            }
        }
        self.updated_at = now;
    }

    fn noise(&mut self) -> i32 {
        let span = self.params.noise_counts;
        if span <= 0 {
            return 0;
        }
        // xorshift32
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        let span_u = span.unsigned_abs() + 1;
        #[allow(clippy::cast_possible_wrap)]
        let v = (x % span_u) as i32;
        v - span / 2
    }
}

/// Shared simulation handle. Clones refer to the same grinder.
#[derive(Clone)]
pub struct SimGrinder {
    state: Arc<Mutex<Physics>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl std::fmt::Debug for SimGrinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimGrinder")
            .field("mass_g", &self.mass_g())
            .field("relay_on", &self.relay_is_on())
            .finish()
    }
}

impl SimGrinder {
    pub fn new(params: SimParams, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let now = clock.now();
        Self {
            state: Arc::new(Mutex::new(Physics {
                params,
                mass_g: 0.0,
                updated_at: now,
                relay_on: false,
                on_at: None,
                off_at: None,
                relay_switches: 0,
                rng: 0x9E37_79B9,
            })),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Physics>, HwError> {
        self.state.lock().map_err(|_| HwError::Poisoned)
    }

    pub fn relay(&self) -> SimulatedRelay {
        SimulatedRelay { sim: self.clone() }
    }

    pub fn scale(&self) -> SimulatedScale {
        SimulatedScale { sim: self.clone() }
    }

    /// Grams on the platform right now.
    pub fn mass_g(&self) -> f32 {
        let now = self.clock.now();
        self.lock().map_or(0.0, |mut p| {
            p.advance(now);
            #[allow(clippy::cast_possible_truncation)]
            let g = p.mass_g as f32;
            g
        })
    }

    /// Put something on (or take it off) the platform.
    pub fn add_mass(&self, grams: f32) {
        let now = self.clock.now();
        if let Ok(mut p) = self.lock() {
            p.advance(now);
            p.mass_g += f64::from(grams);
        }
    }

    pub fn set_flow(&self, flow_gps: f32) {
        let now = self.clock.now();
        if let Ok(mut p) = self.lock() {
            p.advance(now);
            p.params.flow_gps = flow_gps;
        }
    }

    pub fn relay_is_on(&self) -> bool {
        self.lock().is_ok_and(|p| p.relay_on)
    }

    /// Number of off→on transitions so far.
    pub fn relay_switches(&self) -> u32 {
        self.lock().map_or(0, |p| p.relay_switches)
    }

    fn set_relay(&self, on: bool) -> Result<(), HwError> {
        let now = self.clock.now();
        let mut p = self.lock()?;
        p.advance(now);
        if on == p.relay_on {
            return Ok(());
        }
        p.relay_on = on;
        if on {
            p.on_at = Some(now);
            p.off_at = None;
            p.relay_switches = p.relay_switches.saturating_add(1);
        } else {
            p.off_at = Some(now);
        }
        trace!(on, mass_g = p.mass_g, "sim relay");
        Ok(())
    }

    fn raw_counts(&self) -> Result<i32, HwError> {
        let now = self.clock.now();
        let mut p = self.lock()?;
        p.advance(now);
        let counts = p.mass_g * f64::from(p.params.counts_per_gram);
        #[allow(clippy::cast_possible_truncation)]
        let counts = counts.round().clamp(-8_000_000.0, 8_000_000.0) as i32;
        let noise = p.noise();
        Ok(p.params.zero_counts.saturating_add(counts).saturating_add(noise))
    }
}

/// Relay side of a `SimGrinder`.
#[derive(Debug, Clone)]
pub struct SimulatedRelay {
    sim: SimGrinder,
}

impl Relay for SimulatedRelay {
    fn set(&mut self, on: bool) -> Result<(), BoxError> {
        self.sim.set_relay(on).map_err(Into::into)
    }
}

/// Load-cell side of a `SimGrinder`; never blocks.
#[derive(Debug, Clone)]
pub struct SimulatedScale {
    sim: SimGrinder,
}

impl Scale for SimulatedScale {
    fn read(&mut self, _timeout: Duration) -> Result<i32, BoxError> {
        self.sim.raw_counts().map_err(Into::into)
    }
}
