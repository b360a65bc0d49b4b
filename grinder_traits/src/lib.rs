//! Capability traits shared by the core controller and the hardware backends.
//!
//! Every fallible trait method returns `BoxError`; `grinder_core::hw_error`
//! maps those into typed errors at the boundary.
pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock, TimeBase};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Raw load-cell ADC. `read` blocks until a conversion is ready or `timeout` expires.
pub trait Scale {
    fn read(&mut self, timeout: std::time::Duration) -> Result<i32, BoxError>;
}

/// Grinder motor output. Only on/off is supported.
pub trait Relay {
    fn set(&mut self, on: bool) -> Result<(), BoxError>;
}

/// Filtering parameters pushed into a `WeightSource` when settings change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorParams {
    /// Samples averaged per reading.
    pub read_samples: usize,
    /// Raw counts per gram.
    pub calibration_factor: f32,
    /// Max spread (grams) across the averaging window to count as stable.
    pub stable_band_g: f32,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            read_samples: 8,
            calibration_factor: 1000.0,
            stable_band_g: 0.05,
        }
    }
}

/// Latest unfiltered sample plus the source's own stability verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawReading {
    pub raw: i32,
    pub stable: bool,
}

/// Filtered weight as seen by the controller.
///
/// `poll` is called once per control-loop iteration and must not block for
/// long; the accessors return whatever the last poll produced.
pub trait WeightSource {
    /// One-time sensor bring-up. Failure is fatal to the controller.
    fn begin(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
    fn poll(&mut self) -> Result<(), BoxError>;
    /// Filtered grams.
    fn read(&self) -> f32;
    fn read_raw(&self) -> RawReading;
    fn is_stable(&self) -> bool {
        self.read_raw().stable
    }
    /// Attempt to zero the scale; returns `true` once a stable zero was taken.
    fn tare(&mut self) -> bool;
    fn configure(&mut self, _params: &SensorParams) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ButtonId {
    None = 0,
    Left = 1,
    Right = 2,
    Back = 3,
}

impl ButtonId {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Left,
            2 => Self::Right,
            3 => Self::Back,
            _ => Self::None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Left => "left",
            Self::Right => "right",
            Self::Back => "back",
        }
    }
}

/// Level read of a button pin, used to confirm a press after the hold window.
pub trait ButtonInput {
    fn is_pressed(&self, button: ButtonId) -> bool;
}

/// Receiver of raw button edges. Implementations must be callable from an
/// interrupt/callback context: no blocking, no allocation.
pub trait EdgeSink: Send + Sync {
    fn on_edge(&self, button: ButtonId, now_ms: u64);
}
