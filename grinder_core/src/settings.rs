//! Runtime settings: an immutable snapshot type and a shared handle.
//!
//! The controller reads a `Settings` snapshot; something outside the control
//! loop (CLI command, settings socket) edits through `SettingsHandle`, which
//! validates, persists best-effort and raises the `changed` flag. The
//! controller re-reads the snapshot the next time it is in Idle.
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use grinder_traits::{ButtonId, SensorParams};

use crate::error::GrinderError;
use crate::session::DoseTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePolicy {
    /// Grinding-phase average for every pulse.
    #[default]
    SessionAverage,
    /// Rate measured across the previous pulse, falling back to the average.
    ObservedPulse,
}

impl FromStr for RatePolicy {
    type Err = GrinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_average" => Ok(Self::SessionAverage),
            "observed_pulse" => Ok(Self::ObservedPulse),
            other => Err(GrinderError::Config(format!(
                "rate_policy must be session_average|observed_pulse, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub target_dose_single: f32,
    pub target_dose_double: f32,
    pub top_up_margin_single: f32,
    pub top_up_margin_double: f32,
    pub min_topup_grams: f32,
    pub topup_tolerance_g: f32,
    pub max_topup_pulses: u32,
    pub rate_policy: RatePolicy,
    pub fallback_rate_gps: f32,
    pub topup_timeout_ms: u64,
    pub grinding_timeout_ms: u64,
    pub finalize_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub stability_min_wait_ms: u64,
    pub stability_max_wait_ms: u64,
    pub tare_timeout_ms: u64,
    pub button_debounce_ms: u64,
    pub button_min_hold_ms: u64,
    pub idle_display_timeout_ms: u64,
    pub sensor: SensorParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_dose_single: 18.0,
            target_dose_double: 36.0,
            top_up_margin_single: 1.5,
            top_up_margin_double: 1.5,
            min_topup_grams: 0.2,
            topup_tolerance_g: 0.08,
            max_topup_pulses: 8,
            rate_policy: RatePolicy::SessionAverage,
            fallback_rate_gps: 0.1,
            topup_timeout_ms: 1000,
            grinding_timeout_ms: 30_000,
            finalize_timeout_ms: 5000,
            confirm_timeout_ms: 2000,
            stability_min_wait_ms: 500,
            stability_max_wait_ms: 5000,
            tare_timeout_ms: 10_000,
            button_debounce_ms: 150,
            button_min_hold_ms: 20,
            idle_display_timeout_ms: 60_000,
            sensor: SensorParams::default(),
        }
    }
}

/// Keys accepted by [`Settings::apply_kv`].
pub const SETTING_KEYS: &[&str] = &[
    "target_dose_single",
    "target_dose_double",
    "top_up_margin_single",
    "top_up_margin_double",
    "min_topup_grams",
    "topup_tolerance_g",
    "max_topup_pulses",
    "rate_policy",
    "fallback_rate_gps",
    "topup_timeout_ms",
    "grinding_timeout_ms",
    "finalize_timeout_ms",
    "confirm_timeout_ms",
    "stability_min_wait_ms",
    "stability_max_wait_ms",
    "tare_timeout_ms",
    "button_debounce_ms",
    "button_min_hold_ms",
    "idle_display_timeout_ms",
    "read_samples",
    "calibration_factor",
    "stable_band_g",
];

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, GrinderError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| GrinderError::Config(format!("{key}: cannot parse '{value}'")))
}

fn bail(msg: &str) -> Result<(), GrinderError> {
    Err(GrinderError::Config(msg.to_string()))
}

impl Settings {
    /// Target for a physical button: Left is the single dose, Right the double.
    pub fn target_for(&self, button: ButtonId) -> Option<DoseTarget> {
        let (grams, margin) = match button {
            ButtonId::Left => (self.target_dose_single, self.top_up_margin_single),
            ButtonId::Right => (self.target_dose_double, self.top_up_margin_double),
            ButtonId::Back | ButtonId::None => return None,
        };
        Some(DoseTarget {
            grams,
            corrected: (grams - margin).max(0.0),
        })
    }

    /// Target for an external "dose N grams" request.
    ///
    /// The larger of the two margins applies when the request exceeds it;
    /// smaller requests are ground without a first stop before the target.
    pub fn request_target(&self, grams: f32) -> Option<DoseTarget> {
        if !(grams.is_finite() && grams > 0.0 && grams <= 500.0) {
            return None;
        }
        let margin = self.top_up_margin_single.max(self.top_up_margin_double);
        let corrected = if grams > margin {
            grams - margin
        } else {
            grams
        };
        Some(DoseTarget { grams, corrected })
    }

    pub fn validate(&self) -> Result<(), GrinderError> {
        let grams_ok = |v: f32| v.is_finite() && v > 0.0 && v <= 500.0;
        let margin_ok = |v: f32| v.is_finite() && (0.0..=10.0).contains(&v);

        if !grams_ok(self.target_dose_single) {
            return bail("target_dose_single must be in (0, 500]");
        }
        if !grams_ok(self.target_dose_double) {
            return bail("target_dose_double must be in (0, 500]");
        }
        if !margin_ok(self.top_up_margin_single) {
            return bail("top_up_margin_single must be in [0, 10]");
        }
        if !margin_ok(self.top_up_margin_double) {
            return bail("top_up_margin_double must be in [0, 10]");
        }
        if !(self.min_topup_grams.is_finite() && (0.0..=5.0).contains(&self.min_topup_grams)) {
            return bail("min_topup_grams must be in [0, 5]");
        }
        if !(self.topup_tolerance_g.is_finite() && (0.0..=1.0).contains(&self.topup_tolerance_g))
        {
            return bail("topup_tolerance_g must be in [0, 1]");
        }
        if self.max_topup_pulses == 0 {
            return bail("max_topup_pulses must be >= 1");
        }
        if !(self.fallback_rate_gps.is_finite() && self.fallback_rate_gps > 0.0) {
            return bail("fallback_rate_gps must be > 0");
        }
        for (name, v) in [
            ("topup_timeout_ms", self.topup_timeout_ms),
            ("grinding_timeout_ms", self.grinding_timeout_ms),
            ("finalize_timeout_ms", self.finalize_timeout_ms),
            ("confirm_timeout_ms", self.confirm_timeout_ms),
            ("stability_max_wait_ms", self.stability_max_wait_ms),
            ("tare_timeout_ms", self.tare_timeout_ms),
        ] {
            if v == 0 {
                return Err(GrinderError::Config(format!("{name} must be >= 1")));
            }
        }
        if self.stability_min_wait_ms > self.stability_max_wait_ms {
            return bail("stability_min_wait_ms must be <= stability_max_wait_ms");
        }
        if !(1..=64).contains(&self.sensor.read_samples) {
            return bail("read_samples must be in [1, 64]");
        }
        if !(self.sensor.calibration_factor.is_finite() && self.sensor.calibration_factor != 0.0) {
            return bail("calibration_factor must be finite and non-zero");
        }
        if !(self.sensor.stable_band_g.is_finite() && self.sensor.stable_band_g > 0.0) {
            return bail("stable_band_g must be > 0");
        }
        Ok(())
    }

    /// Apply one `key=value` edit. The result is not validated here.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), GrinderError> {
        match key {
            "target_dose_single" => self.target_dose_single = parse(key, value)?,
            "target_dose_double" => self.target_dose_double = parse(key, value)?,
            "top_up_margin_single" => self.top_up_margin_single = parse(key, value)?,
            "top_up_margin_double" => self.top_up_margin_double = parse(key, value)?,
            "min_topup_grams" => self.min_topup_grams = parse(key, value)?,
            "topup_tolerance_g" => self.topup_tolerance_g = parse(key, value)?,
            "max_topup_pulses" => self.max_topup_pulses = parse(key, value)?,
            "rate_policy" => self.rate_policy = value.trim().parse()?,
            "fallback_rate_gps" => self.fallback_rate_gps = parse(key, value)?,
            "topup_timeout_ms" => self.topup_timeout_ms = parse(key, value)?,
            "grinding_timeout_ms" => self.grinding_timeout_ms = parse(key, value)?,
            "finalize_timeout_ms" => self.finalize_timeout_ms = parse(key, value)?,
            "confirm_timeout_ms" => self.confirm_timeout_ms = parse(key, value)?,
            "stability_min_wait_ms" => self.stability_min_wait_ms = parse(key, value)?,
            "stability_max_wait_ms" => self.stability_max_wait_ms = parse(key, value)?,
            "tare_timeout_ms" => self.tare_timeout_ms = parse(key, value)?,
            "button_debounce_ms" => self.button_debounce_ms = parse(key, value)?,
            "button_min_hold_ms" => self.button_min_hold_ms = parse(key, value)?,
            "idle_display_timeout_ms" => self.idle_display_timeout_ms = parse(key, value)?,
            "read_samples" => self.sensor.read_samples = parse(key, value)?,
            "calibration_factor" => self.sensor.calibration_factor = parse(key, value)?,
            "stable_band_g" => self.sensor.stable_band_g = parse(key, value)?,
            other => {
                return Err(GrinderError::Config(format!("unknown setting '{other}'")));
            }
        }
        Ok(())
    }
}

/// Durable storage for settings edits.
pub trait SettingsStore: Send {
    fn save(&mut self, settings: &Settings) -> eyre::Result<()>;
}

struct Shared {
    current: Mutex<Settings>,
    store: Mutex<Option<Box<dyn SettingsStore>>>,
    changed: AtomicBool,
    reboot: AtomicBool,
}

/// Cloneable handle to the live settings.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsHandle")
            .field("settings", &*self.current())
            .field("changed", &self.inner.changed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(Shared {
                current: Mutex::new(settings),
                store: Mutex::new(None),
                changed: AtomicBool::new(false),
                reboot: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_store(settings: Settings, store: Box<dyn SettingsStore>) -> Self {
        let handle = Self::new(settings);
        *handle
            .inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(store);
        handle
    }

    fn current(&self) -> MutexGuard<'_, Settings> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Settings {
        self.current().clone()
    }

    /// Edit, validate and commit. On validation failure nothing changes.
    ///
    /// A persistence failure is logged and the in-memory value stays in
    /// effect; the stored copy is stale until the next successful save.
    pub fn update<F>(&self, edit: F) -> Result<(), GrinderError>
    where
        F: FnOnce(&mut Settings) -> Result<(), GrinderError>,
    {
        let mut current = self.current();
        let mut next = current.clone();
        edit(&mut next)?;
        next.validate()?;
        *current = next.clone();

        {
            // Take the store before releasing `current` so saves land in commit order.
            let mut store = self
                .inner
                .store
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            drop(current);
            if let Some(store) = store.as_mut()
                && let Err(e) = store.save(&next)
            {
                tracing::warn!(error = %e, "settings persistence failed; keeping in-memory value");
            }
        }
        self.inner.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// `set:<key>:<value>` style edit.
    pub fn set(&self, key: &str, value: &str) -> Result<(), GrinderError> {
        self.update(|s| s.apply_kv(key, value))?;
        tracing::info!(key, value, "setting updated");
        Ok(())
    }

    /// Read and clear the changed flag.
    pub fn take_changed(&self) -> bool {
        self.inner.changed.swap(false, Ordering::AcqRel)
    }

    pub fn request_reboot(&self) {
        self.inner.reboot.store(true, Ordering::Release);
    }

    pub fn take_reboot(&self) -> bool {
        self.inner.reboot.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_targets_subtract_their_margin() {
        let s = Settings {
            top_up_margin_double: 2.0,
            ..Settings::default()
        };
        let single = s.target_for(ButtonId::Left).unwrap();
        assert!((single.corrected - 16.5).abs() < 1e-6);
        let double = s.target_for(ButtonId::Right).unwrap();
        assert!((double.corrected - 34.0).abs() < 1e-6);
        assert!(s.target_for(ButtonId::Back).is_none());
    }

    #[test]
    fn request_target_uses_larger_margin_only_when_exceeded() {
        let s = Settings {
            top_up_margin_single: 1.0,
            top_up_margin_double: 2.0,
            ..Settings::default()
        };
        let t = s.request_target(20.0).unwrap();
        assert!((t.corrected - 18.0).abs() < 1e-6);
        let small = s.request_target(1.5).unwrap();
        assert!((small.corrected - 1.5).abs() < 1e-6);
        assert!(s.request_target(f32::NAN).is_none());
        assert!(s.request_target(-3.0).is_none());
    }

    #[test]
    fn apply_kv_covers_every_listed_key() {
        for key in SETTING_KEYS {
            let mut s = Settings::default();
            let value = match *key {
                "rate_policy" => "observed_pulse",
                "read_samples" | "max_topup_pulses" => "4",
                k if k.ends_with("_ms") => "900",
                _ => "1.25",
            };
            s.apply_kv(key, value)
                .unwrap_or_else(|e| panic!("{key}: {e}"));
            assert_ne!(s, Settings::default(), "{key} had no effect");
        }
    }

    #[test]
    fn rejected_update_leaves_settings_untouched() {
        let h = SettingsHandle::default();
        let err = h.set("max_topup_pulses", "0").unwrap_err();
        assert!(err.to_string().contains("max_topup_pulses"));
        assert_eq!(h.snapshot(), Settings::default());
        assert!(!h.take_changed());
    }

    #[test]
    fn changed_flag_is_consumed_once() {
        let h = SettingsHandle::default();
        h.set("target_dose_single", "17").unwrap();
        assert!(h.take_changed());
        assert!(!h.take_changed());
        assert!((h.snapshot().target_dose_single - 17.0).abs() < f32::EPSILON);
    }

    #[test]
    fn concurrent_edits_are_all_kept() {
        let store = crate::mocks::MemoryStore::new();
        let h = SettingsHandle::with_store(Settings::default(), Box::new(store.clone()));
        let edits = [
            ("target_dose_single", "17"),
            ("target_dose_double", "35"),
            ("min_topup_grams", "0.3"),
            ("topup_timeout_ms", "900"),
            ("button_debounce_ms", "90"),
            ("max_topup_pulses", "5"),
        ];
        std::thread::scope(|scope| {
            for (key, value) in edits {
                let h = h.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        h.set(key, value).unwrap();
                    }
                });
            }
        });

        let mut expected = Settings::default();
        for (key, value) in edits {
            expected.apply_kv(key, value).unwrap();
        }
        assert_eq!(h.snapshot(), expected);
        assert_eq!(store.saves(), edits.len() * 50);
        assert_eq!(store.last(), Some(expected));
    }
}
