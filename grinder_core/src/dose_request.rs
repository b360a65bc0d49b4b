//! Single-slot "dose N grams" input from outside the control loop.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Latest unconsumed request wins; older ones are overwritten.
#[derive(Debug, Default)]
pub struct DoseRequest {
    pending: AtomicBool,
    grams_bits: AtomicU32,
}

impl DoseRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a request. Non-finite or non-positive weights are refused.
    pub fn submit(&self, grams: f32) -> bool {
        if !(grams.is_finite() && grams > 0.0) {
            return false;
        }
        self.grams_bits.store(grams.to_bits(), Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
        true
    }

    pub fn take(&self) -> Option<f32> {
        self.pending
            .swap(false, Ordering::AcqRel)
            .then(|| f32::from_bits(self.grams_bits.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_submit_wins_and_is_taken_once() {
        let r = DoseRequest::new();
        assert!(r.submit(12.0));
        assert!(r.submit(14.5));
        assert_eq!(r.take(), Some(14.5));
        assert_eq!(r.take(), None);
    }

    #[test]
    fn refuses_nonsense() {
        let r = DoseRequest::new();
        assert!(!r.submit(0.0));
        assert!(!r.submit(f32::NAN));
        assert_eq!(r.take(), None);
    }
}
