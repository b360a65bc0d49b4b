//! Test and helper doubles for grinder_core.
//!
//! Every double comes with a cloneable handle so a test can keep poking at
//! the device after moving it into the state machine.
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use grinder_traits::{BoxError, ButtonId, ButtonInput, RawReading, Relay, WeightSource};

use crate::settings::{Settings, SettingsStore};
use crate::telemetry::{DisplayView, Telemetry, TelemetryEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct WeightState {
    grams: f32,
    raw: i32,
    stable: bool,
    tare_ready: bool,
    begin_error: Option<String>,
    poll_error: bool,
    tare_calls: u32,
}

/// Weight source whose readings are set by hand through a [`WeightHandle`].
#[derive(Debug)]
pub struct ScriptedWeight {
    inner: Arc<Mutex<WeightState>>,
}

#[derive(Debug, Clone)]
pub struct WeightHandle {
    inner: Arc<Mutex<WeightState>>,
}

impl ScriptedWeight {
    /// Empty platform, stable, tare succeeds immediately.
    pub fn new() -> (Self, WeightHandle) {
        let inner = Arc::new(Mutex::new(WeightState {
            grams: 0.0,
            raw: 0,
            stable: true,
            tare_ready: true,
            begin_error: None,
            poll_error: false,
            tare_calls: 0,
        }));
        (
            Self {
                inner: inner.clone(),
            },
            WeightHandle { inner },
        )
    }
}

impl WeightHandle {
    pub fn set_grams(&self, grams: f32) {
        lock(&self.inner).grams = grams;
    }

    pub fn grams(&self) -> f32 {
        lock(&self.inner).grams
    }

    pub fn set_raw(&self, raw: i32) {
        lock(&self.inner).raw = raw;
    }

    pub fn set_stable(&self, stable: bool) {
        lock(&self.inner).stable = stable;
    }

    pub fn set_tare_ready(&self, ready: bool) {
        lock(&self.inner).tare_ready = ready;
    }

    pub fn fail_begin(&self, msg: &str) {
        lock(&self.inner).begin_error = Some(msg.to_string());
    }

    pub fn fail_poll(&self, fail: bool) {
        lock(&self.inner).poll_error = fail;
    }

    pub fn tare_calls(&self) -> u32 {
        lock(&self.inner).tare_calls
    }
}

impl WeightSource for ScriptedWeight {
    fn begin(&mut self) -> Result<(), BoxError> {
        match lock(&self.inner).begin_error.clone() {
            Some(msg) => Err(msg.into()),
            None => Ok(()),
        }
    }

    fn poll(&mut self) -> Result<(), BoxError> {
        if lock(&self.inner).poll_error {
            return Err("scripted poll failure".into());
        }
        Ok(())
    }

    fn read(&self) -> f32 {
        lock(&self.inner).grams
    }

    fn read_raw(&self) -> RawReading {
        let s = lock(&self.inner);
        RawReading {
            raw: s.raw,
            stable: s.stable,
        }
    }

    fn tare(&mut self) -> bool {
        let mut s = lock(&self.inner);
        s.tare_calls += 1;
        if s.tare_ready {
            s.grams = 0.0;
        }
        s.tare_ready
    }
}

#[derive(Debug, Default)]
struct RelayState {
    history: Vec<bool>,
    fail_on: bool,
    fail_off: bool,
}

/// Relay that records every successful `set`.
#[derive(Debug)]
pub struct SpyRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Debug, Clone)]
pub struct RelayLog {
    inner: Arc<Mutex<RelayState>>,
}

impl SpyRelay {
    pub fn new() -> (Self, RelayLog) {
        let inner = Arc::new(Mutex::new(RelayState::default()));
        (
            Self {
                inner: inner.clone(),
            },
            RelayLog { inner },
        )
    }
}

impl RelayLog {
    pub fn history(&self) -> Vec<bool> {
        lock(&self.inner).history.clone()
    }

    pub fn is_on(&self) -> bool {
        lock(&self.inner).history.last().copied().unwrap_or(false)
    }

    /// Number of off->on transitions.
    pub fn starts(&self) -> usize {
        let h = lock(&self.inner);
        let mut prev = false;
        let mut n = 0;
        for &on in &h.history {
            if on && !prev {
                n += 1;
            }
            prev = on;
        }
        n
    }

    pub fn fail_on(&self, fail: bool) {
        lock(&self.inner).fail_on = fail;
    }

    pub fn fail_off(&self, fail: bool) {
        lock(&self.inner).fail_off = fail;
    }
}

impl Relay for SpyRelay {
    fn set(&mut self, on: bool) -> Result<(), BoxError> {
        let mut s = lock(&self.inner);
        if (on && s.fail_on) || (!on && s.fail_off) {
            return Err(format!("relay stuck (requested {on})").into());
        }
        s.history.push(on);
        Ok(())
    }
}

/// Pin levels for [`ButtonInput`], one bit per button.
#[derive(Debug, Clone, Default)]
pub struct PinState {
    bits: Arc<AtomicU8>,
}

impl PinState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self, button: ButtonId) {
        self.bits.fetch_or(1 << button.as_u8(), Ordering::AcqRel);
    }

    pub fn release(&self, button: ButtonId) {
        self.bits.fetch_and(!(1 << button.as_u8()), Ordering::AcqRel);
    }
}

impl ButtonInput for PinState {
    fn is_pressed(&self, button: ButtonId) -> bool {
        button != ButtonId::None && self.bits.load(Ordering::Acquire) & (1 << button.as_u8()) != 0
    }
}

/// Keeps every telemetry event for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        lock(&self.events).clone()
    }

    /// Count of events with the given [`TelemetryEvent::name`].
    pub fn count(&self, name: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn last_display(&self) -> Option<DisplayView> {
        lock(&self.events).iter().rev().find_map(|e| match e {
            TelemetryEvent::Display(v) => Some(v.clone()),
            _ => None,
        })
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl Telemetry for RecordingTelemetry {
    fn record(&mut self, event: &TelemetryEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// In-memory settings store, optionally failing every save.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Vec<Settings>>>,
    fail: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        lock(&self.saved).len()
    }

    pub fn last(&self) -> Option<Settings> {
        lock(&self.saved).last().cloned()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }
}

impl SettingsStore for MemoryStore {
    fn save(&mut self, settings: &Settings) -> eyre::Result<()> {
        if self.fail.load(Ordering::Acquire) {
            eyre::bail!("settings store unavailable");
        }
        lock(&self.saved).push(settings.clone());
        Ok(())
    }
}
