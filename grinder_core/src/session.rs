use crate::rate::RateEstimator;
use crate::util::ms_to_s;

/// Requested dose and the weight at which grinding first stops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseTarget {
    pub grams: f32,
    /// `grams` minus the top-up margin.
    pub corrected: f32,
}

/// Per-dose bookkeeping, alive from Configured until the return to Idle.
#[derive(Debug, Clone)]
pub struct Session {
    pub target: DoseTarget,
    pub started_at: u64,
    /// Last reading that produced a rate sample.
    pub last_weight: f32,
    pub last_weight_at: u64,
    pub rate: RateEstimator,
    pub top_up_pulses: u32,
    finalized: bool,
}

impl Session {
    pub fn new(target: DoseTarget, now: u64, initial_grams: f32) -> Self {
        Self {
            target,
            started_at: now,
            last_weight: initial_grams,
            last_weight_at: now,
            rate: RateEstimator::new(),
            top_up_pulses: 0,
            finalized: false,
        }
    }

    #[inline]
    pub fn elapsed_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_at)
    }

    #[inline]
    pub fn elapsed_s(&self, now: u64) -> f32 {
        ms_to_s(self.elapsed_ms(now))
    }

    /// Latch the session as finalized. Returns `true` only the first time.
    pub fn mark_finalized(&mut self) -> bool {
        !std::mem::replace(&mut self.finalized, true)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_latch_fires_once() {
        let mut s = Session::new(
            DoseTarget {
                grams: 18.0,
                corrected: 16.5,
            },
            100,
            0.0,
        );
        assert!(s.mark_finalized());
        assert!(!s.mark_finalized());
        assert!(s.is_finalized());
        assert_eq!(s.elapsed_ms(1600), 1500);
        assert!((s.elapsed_s(1600) - 1.5).abs() < 1e-6);
    }
}
