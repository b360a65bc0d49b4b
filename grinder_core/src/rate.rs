//! Grinding-rate estimation.

/// Rates at or below this (grams/second) are treated as sensor noise.
pub const NOISE_FLOOR_GPS: f32 = 0.1;

/// Running mean of positive grams/second samples.
///
/// Accumulates in `f64` so the mean does not depend on insertion order in any
/// way that matters at f32 precision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateEstimator {
    sum: f64,
    count: u32,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample. Returns `false` when it was discarded as noise.
    pub fn record(&mut self, rate_gps: f32) -> bool {
        if !rate_gps.is_finite() || rate_gps <= NOISE_FLOOR_GPS {
            return false;
        }
        self.sum += f64::from(rate_gps);
        self.count = self.count.saturating_add(1);
        true
    }

    /// Mean of recorded samples, `None` until the first one.
    pub fn average(&self) -> Option<f32> {
        if self.count == 0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let avg = (self.sum / f64::from(self.count)) as f32;
        Some(avg)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Grams per second between two readings `dt_ms` apart; `None` when `dt_ms` is 0.
#[inline]
#[allow(clippy::cast_precision_loss)]
pub fn instantaneous_rate(delta_g: f32, dt_ms: u64) -> Option<f32> {
    (dt_ms > 0).then(|| 1000.0 * delta_g / dt_ms as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_has_no_average() {
        let r = RateEstimator::new();
        assert_eq!(r.average(), None);
        assert_eq!(r.count(), 0);
    }

    #[test]
    fn noise_and_non_finite_samples_are_ignored() {
        let mut r = RateEstimator::new();
        assert!(!r.record(0.1));
        assert!(!r.record(-2.0));
        assert!(!r.record(f32::NAN));
        assert!(!r.record(f32::INFINITY));
        assert_eq!(r.average(), None);
        assert!(r.record(0.11));
        assert_eq!(r.count(), 1);
    }

    #[test]
    fn reset_forgets_samples() {
        let mut r = RateEstimator::new();
        r.record(2.0);
        r.reset();
        assert_eq!(r.average(), None);
    }

    #[test]
    fn instantaneous_rate_scales_to_seconds() {
        assert_eq!(instantaneous_rate(0.5, 250), Some(2.0));
        assert_eq!(instantaneous_rate(0.5, 0), None);
    }
}
