//! Maps `Box<dyn Error>` from trait boundaries to typed `GrinderError`.
//!
//! The traits in `grinder_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our typed enum, with an optional feature-gated
//! path for `grinder_hardware::HwError` downcasting.

use crate::error::GrinderError;

/// Map a trait-boundary error to a typed `GrinderError`.
///
/// Known error types are downcast first, then string heuristics apply.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> GrinderError {
    if let Some(g) = e.downcast_ref::<GrinderError>() {
        return g.clone();
    }

    #[cfg(feature = "hardware-errors")]
    {
        use grinder_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout | HwError::DataReadyTimeout => GrinderError::Timeout,
                HwError::Io(io) => GrinderError::Io(io.to_string()),
                other => GrinderError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        GrinderError::Timeout
    } else {
        GrinderError::Hardware(s)
    }
}
