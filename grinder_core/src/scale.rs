//! Raw ADC counts to filtered grams.
//!
//! `FilteredScale` keeps a ring of the last `read_samples` raw readings,
//! converts their mean with `grams = (mean - zero) / counts_per_gram`, and
//! calls the reading stable when the ring's spread fits inside
//! `stable_band_g`. Samples come either from an inline read (`Direct`) or a
//! background [`Sampler`].
use std::collections::VecDeque;
use std::time::Duration;

use grinder_traits::{BoxError, MonotonicClock, RawReading, Scale, SensorParams, WeightSource};

use crate::error::GrinderError;
use crate::sampler::Sampler;

/// How sampling should be orchestrated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Read inside the control loop using Scale::read(timeout)
    Direct,
    /// Event-driven: background thread blocks on sensor data-ready
    Event,
    /// Background thread paced at the given Hz
    Paced(u32),
}

/// Stall threshold for the background sampler: four sensor timeouts, but
/// never shorter than two sampling periods.
#[inline]
pub fn stall_threshold_ms(sensor_timeout_ms: u64, period_ms: u64) -> u64 {
    sensor_timeout_ms
        .saturating_mul(4)
        .max(period_ms.saturating_mul(2))
        .max(1)
}

enum Source<S> {
    Direct(S),
    Sampled { sampler: Sampler, stall_ms: u64 },
}

pub struct FilteredScale<S> {
    source: Source<S>,
    timeout: Duration,
    params: SensorParams,
    ring: VecDeque<i32>,
    zero_counts: f32,
    last_raw: i32,
    grams: f32,
    stable: bool,
}

impl<S> std::fmt::Debug for FilteredScale<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteredScale")
            .field("grams", &self.grams)
            .field("stable", &self.stable)
            .field("zero_counts", &self.zero_counts)
            .finish_non_exhaustive()
    }
}

impl<S: Scale + Send + 'static> FilteredScale<S> {
    pub fn new(
        scale: S,
        mode: SamplingMode,
        params: SensorParams,
        zero_counts: i32,
        timeout: Duration,
    ) -> Self {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let source = match mode {
            SamplingMode::Direct => Source::Direct(scale),
            SamplingMode::Event => Source::Sampled {
                sampler: Sampler::spawn_event(scale, timeout, MonotonicClock::new()),
                stall_ms: stall_threshold_ms(timeout_ms, 0),
            },
            SamplingMode::Paced(hz) => Source::Sampled {
                sampler: Sampler::spawn(scale, hz, timeout, MonotonicClock::new()),
                stall_ms: stall_threshold_ms(timeout_ms, crate::util::period_ms(hz)),
            },
        };
        #[allow(clippy::cast_precision_loss)]
        let zero_counts = zero_counts as f32;
        Self {
            source,
            timeout,
            params,
            ring: VecDeque::with_capacity(params.read_samples.max(1)),
            zero_counts,
            last_raw: 0,
            grams: 0.0,
            stable: false,
        }
    }
}

impl<S> FilteredScale<S> {
    fn window(&self) -> usize {
        self.params.read_samples.max(1)
    }

    fn mean(&self) -> Option<f32> {
        if self.ring.is_empty() {
            return None;
        }
        let sum: i64 = self.ring.iter().map(|&v| i64::from(v)).sum();
        #[allow(clippy::cast_precision_loss)]
        let mean = sum as f64 / self.ring.len() as f64;
        #[allow(clippy::cast_possible_truncation)]
        let mean = mean as f32;
        Some(mean)
    }

    fn recompute(&mut self) {
        let Some(mean) = self.mean() else {
            return;
        };
        let factor = self.params.calibration_factor;
        self.grams = (mean - self.zero_counts) / factor;
        let full = self.ring.len() >= self.window();
        let (lo, hi) = self
            .ring
            .iter()
            .fold((i32::MAX, i32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        #[allow(clippy::cast_precision_loss)]
        let spread_g = (i64::from(hi) - i64::from(lo)) as f32 / factor.abs();
        self.stable = full && spread_g <= self.params.stable_band_g;
    }

    /// Feed one raw reading.
    pub fn push(&mut self, raw: i32) {
        self.last_raw = raw;
        self.ring.push_back(raw);
        while self.ring.len() > self.window() {
            self.ring.pop_front();
        }
        self.recompute();
    }

    pub fn zero_counts(&self) -> f32 {
        self.zero_counts
    }
}

impl<S: Scale> WeightSource for FilteredScale<S> {
    fn begin(&mut self) -> Result<(), BoxError> {
        let first = match &mut self.source {
            Source::Direct(scale) => scale.read(self.timeout)?,
            Source::Sampled { sampler, stall_ms } => sampler
                .wait_first(Duration::from_millis(*stall_ms))
                .ok_or_else(|| {
                    GrinderError::SensorInit(format!("no sample within {stall_ms} ms"))
                })?,
        };
        self.push(first);
        tracing::info!(raw = first, grams = self.grams, "weight sensor ready");
        Ok(())
    }

    fn poll(&mut self) -> Result<(), BoxError> {
        match &mut self.source {
            Source::Direct(scale) => {
                let raw = scale.read(self.timeout)?;
                self.push(raw);
            }
            Source::Sampled { sampler, stall_ms } => {
                if let Some(raw) = sampler.latest() {
                    self.push(raw);
                } else if sampler.stalled_for_now() > *stall_ms {
                    return Err(Box::new(GrinderError::Timeout));
                }
            }
        }
        Ok(())
    }

    fn read(&self) -> f32 {
        self.grams
    }

    fn read_raw(&self) -> RawReading {
        RawReading {
            raw: self.last_raw,
            stable: self.stable,
        }
    }

    fn tare(&mut self) -> bool {
        if !self.stable {
            return false;
        }
        let Some(mean) = self.mean() else {
            return false;
        };
        self.zero_counts = mean;
        self.recompute();
        tracing::debug!(zero_counts = mean, "tared");
        true
    }

    fn configure(&mut self, params: &SensorParams) {
        self.params = *params;
        while self.ring.len() > self.window() {
            self.ring.pop_front();
        }
        self.recompute();
    }
}
