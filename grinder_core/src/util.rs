//! Small time and weight helpers shared across grinder_core.

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Readings closer to zero than this are shown as exactly zero.
pub const ZERO_SNAP_G: f32 = 0.05;

/// Period in microseconds for a sampling rate, never below 1.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (MICROS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Period in milliseconds for a sampling rate, never below 1.
#[inline]
pub fn period_ms(hz: u32) -> u64 {
    (MILLIS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Clamp display noise around an empty platform to `0.0`.
#[inline]
pub fn snap_zero(grams: f32) -> f32 {
    if grams.abs() < ZERO_SNAP_G { 0.0 } else { grams }
}

#[inline]
#[allow(clippy::cast_precision_loss)]
pub fn ms_to_s(ms: u64) -> f32 {
    ms as f32 / 1000.0
}
