//! The dosing state machine.
//!
//! `step()` reads the clock once, polls the weight source, takes at most one
//! pending button edge and performs at most one transition. Nothing in here
//! blocks: every delay is "not yet elapsed, check again next step".
use std::mem::discriminant;
use std::sync::Arc;

use eyre::WrapErr;
use grinder_traits::{ButtonId, ButtonInput, Relay, TimeBase, WeightSource};

use crate::button::{ButtonEdgeQueue, EdgeAction, PendingButtonEdge};
use crate::dose_request::DoseRequest;
use crate::error::{GrinderError, Result};
use crate::hw_error::map_hw_error;
use crate::rate::instantaneous_rate;
use crate::session::{DoseTarget, Session};
use crate::settings::{Settings, SettingsHandle};
use crate::state::{FinalReading, PressOrigin, State, StateKind, StoppingWindow};
use crate::telemetry::{DisplayView, Telemetry, TelemetryEvent, Throttle};
use crate::topup::{TopUpAction, TopUpController, TopUpParams};
use crate::util::snap_zero;

/// Readings below this are ignored while grinding: nothing is coming out yet.
pub const MIN_GRINDING_GRAMS: f32 = 1.0;
/// Minimum weight gain between two rate samples.
pub const RATE_SAMPLE_MIN_DELTA_G: f32 = 0.2;
/// Change between two stability checks that still counts as settled.
pub const SETTLED_DELTA_G: f32 = 0.07;
pub const STABILITY_CHECK_MS: u64 = 100;
pub const DEBUG_PRINT_MS: u64 = 500;
pub const DEFAULT_HEARTBEAT_MS: u64 = 5000;
const DISPLAY_REFRESH_MS: u64 = 100;
const PROGRESS_MS: u64 = 150;

pub struct DosingStateMachine<W, R, B, T> {
    weight: W,
    relay: R,
    buttons: B,
    telemetry: T,
    time: TimeBase,
    edges: Arc<ButtonEdgeQueue>,
    requests: Arc<DoseRequest>,
    settings: SettingsHandle,
    cfg: Settings,
    state: State,
    session: Option<Session>,
    relay_on: bool,
    published: Option<StateKind>,
    heartbeat_ms: u64,
    last_heartbeat: u64,
    display: Throttle,
    last_view: Option<DisplayView>,
    progress: Throttle,
    restart_requested: bool,
}

impl<W, R, B, T> std::fmt::Debug for DosingStateMachine<W, R, B, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DosingStateMachine")
            .field("state", &self.state.kind())
            .field("relay_on", &self.relay_on)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Parts<W, R, B, T> {
    pub weight: W,
    pub relay: R,
    pub buttons: B,
    pub telemetry: T,
    pub time: TimeBase,
    pub edges: Arc<ButtonEdgeQueue>,
    pub requests: Arc<DoseRequest>,
    pub settings: SettingsHandle,
    pub heartbeat_ms: u64,
}

impl<W, R, B, T> DosingStateMachine<W, R, B, T>
where
    W: WeightSource,
    R: Relay,
    B: ButtonInput,
    T: Telemetry,
{
    pub(crate) fn from_parts(parts: Parts<W, R, B, T>) -> Self {
        let cfg = parts.settings.snapshot();
        let now = parts.time.now_ms();
        Self {
            weight: parts.weight,
            relay: parts.relay,
            buttons: parts.buttons,
            telemetry: parts.telemetry,
            time: parts.time,
            edges: parts.edges,
            requests: parts.requests,
            settings: parts.settings,
            cfg,
            state: State::Idle { since: now },
            session: None,
            relay_on: false,
            published: None,
            heartbeat_ms: parts.heartbeat_ms,
            last_heartbeat: now,
            display: Throttle::new(DISPLAY_REFRESH_MS),
            last_view: None,
            progress: Throttle::new(PROGRESS_MS),
            restart_requested: false,
        }
    }

    /// Bring up the weight sensor and force the relay off.
    ///
    /// A sensor failure here is fatal: the caller should stop and ask for a
    /// restart.
    pub fn begin(&mut self) -> Result<()> {
        self.weight.configure(&self.cfg.sensor);
        if let Err(e) = self.weight.begin() {
            let err = match map_hw_error(&*e) {
                GrinderError::SensorInit(msg) => GrinderError::SensorInit(msg),
                other => GrinderError::SensorInit(other.to_string()),
            };
            tracing::error!(error = %err, "weight sensor init failed");
            return Err(eyre::Report::new(err));
        }
        self.relay_off("startup");
        self.publish();
        tracing::info!(state = %self.state.kind(), "controller ready");
        Ok(())
    }

    /// One control-loop iteration. Returns the state after the step.
    pub fn step(&mut self) -> Result<StateKind> {
        let now = self.time.now_ms();
        if let Err(e) = self.weight.poll() {
            tracing::warn!(error = %map_hw_error(&*e), "weight poll failed");
        }
        self.heartbeat(now);

        let edge = self.edges.consume();
        let from = self.state.kind();
        let current = std::mem::replace(&mut self.state, State::Idle { since: now });
        match self.advance(current, now, edge) {
            Ok(next) => self.state = next,
            Err(e) => {
                self.relay_off("error recovery");
                self.session = None;
                self.state = State::Idle { since: now };
                self.publish();
                tracing::error!(error = %e, from = %from, "step failed, back to idle");
                return Err(e);
            }
        }

        let to = self.state.kind();
        if to != from {
            tracing::info!(from = %from, to = %to, "state transition");
            self.telemetry
                .record(&TelemetryEvent::Log(format!("{from} -> {to}")));
        }
        if self.relay_on && !to.may_grind() {
            self.relay_off("relay on outside grinding");
        }
        self.publish();
        Ok(to)
    }

    /// Stop the grinder (best-effort).
    pub fn shutdown(&mut self) {
        self.relay_off("shutdown");
    }

    /// Deliver a button edge stamped with the machine's own clock.
    pub fn inject_edge(&self, button: ButtonId) {
        self.edges.on_edge(button, self.time.now_ms());
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn edges(&self) -> &Arc<ButtonEdgeQueue> {
        &self.edges
    }

    pub fn requests(&self) -> &Arc<DoseRequest> {
        &self.requests
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Settings snapshot currently in effect.
    pub fn active_settings(&self) -> &Settings {
        &self.cfg
    }

    pub fn time(&self) -> &TimeBase {
        &self.time
    }

    pub fn weight(&self) -> &W {
        &self.weight
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub fn relay_is_on(&self) -> bool {
        self.relay_on
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    fn publish(&mut self) {
        let kind = self.state.kind();
        // Re-publishing Confirm would re-arm a button the edge handler already used.
        if self.published == Some(kind) {
            return;
        }
        self.edges.publish(kind, self.state.confirm_button());
        self.published = Some(kind);
    }

    fn heartbeat(&mut self, now: u64) {
        if now.saturating_sub(self.last_heartbeat) < self.heartbeat_ms {
            return;
        }
        self.last_heartbeat = now;
        tracing::info!(
            state = %self.state.kind(),
            grams = snap_zero(self.weight.read()),
            relay_on = self.relay_on,
            "heartbeat"
        );
    }

    fn relay_on(&mut self) -> Result<()> {
        self.relay
            .set(true)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("relay on")?;
        self.relay_on = true;
        Ok(())
    }

    fn relay_off(&mut self, context: &'static str) {
        match self.relay.set(false) {
            Ok(()) => self.relay_on = false,
            Err(e) => {
                tracing::warn!(error = %map_hw_error(&*e), context, "relay off failed");
            }
        }
    }

    fn show(&mut self, now: u64, view: DisplayView) {
        let new_screen = self
            .last_view
            .as_ref()
            .is_none_or(|v| discriminant(v) != discriminant(&view));
        if new_screen {
            self.display.reset();
        }
        if !self.display.ready(now) || self.last_view.as_ref() == Some(&view) {
            return;
        }
        self.telemetry
            .record(&TelemetryEvent::Display(view.clone()));
        self.last_view = Some(view);
    }

    fn advance(
        &mut self,
        state: State,
        now: u64,
        edge: Option<PendingButtonEdge>,
    ) -> Result<State> {
        match state {
            State::Idle { since } => Ok(self.idle(since, now, edge)),
            State::ButtonFilter {
                button,
                origin,
                since,
            } => Ok(self.button_filter(button, origin, since, now)),
            State::ButtonPressed { button, origin } => {
                Ok(self.button_pressed(button, origin, now))
            }
            State::Confirm {
                target,
                button,
                since,
            } => Ok(self.confirm(target, button, since, now, edge)),
            State::Tare { target, since } => Ok(self.tare(target, since, now)),
            State::Configured { target } => self.configured(target, now),
            State::Running => self.running(now),
            State::TopUp(ctl) => self.top_up(ctl, now),
            State::Stopping(window) => Ok(self.stopping(window, now)),
            State::Finalize(reading) => Ok(self.finalize(reading, now)),
            State::Debug { last_print } => Ok(self.debug(last_print, now, edge)),
        }
    }

    fn reload_settings(&mut self) {
        self.cfg = self.settings.snapshot();
        self.edges.set_debounce(self.cfg.button_debounce_ms);
        self.weight.configure(&self.cfg.sensor);
        tracing::info!("settings reloaded");
    }

    fn idle(&mut self, since: u64, now: u64, edge: Option<PendingButtonEdge>) -> State {
        if self.settings.take_changed() {
            self.reload_settings();
        }
        if self.settings.take_reboot() {
            tracing::info!("restart requested");
            self.restart_requested = true;
        }

        if let Some(e) = edge
            && matches!(e.action, EdgeAction::Press | EdgeAction::Back)
        {
            return State::ButtonFilter {
                button: e.button,
                origin: PressOrigin::Idle,
                since: e.observed_at.min(now),
            };
        }

        if let Some(grams) = self.requests.take() {
            match self.cfg.request_target(grams) {
                Some(target) => {
                    tracing::info!(grams, corrected = target.corrected, "dose requested");
                    return State::Confirm {
                        target,
                        button: ButtonId::Right,
                        since: now,
                    };
                }
                None => tracing::warn!(grams, "dose request out of range, ignored"),
            }
        }

        let view = if now.saturating_sub(since) >= self.cfg.idle_display_timeout_ms {
            DisplayView::Off
        } else {
            DisplayView::Weight {
                grams: snap_zero(self.weight.read()),
            }
        };
        self.show(now, view);
        State::Idle { since }
    }

    fn button_filter(
        &mut self,
        button: ButtonId,
        origin: PressOrigin,
        since: u64,
        now: u64,
    ) -> State {
        // Any later edge (bounce, release) restarts the hold window.
        let hold_from = since.max(self.edges.last_edge_at());
        if now.saturating_sub(hold_from) < self.cfg.button_min_hold_ms {
            return State::ButtonFilter {
                button,
                origin,
                since,
            };
        }
        if self.buttons.is_pressed(button) {
            State::ButtonPressed { button, origin }
        } else {
            tracing::debug!(button = button.name(), "button glitch");
            self.back_to_idle(origin, now)
        }
    }

    fn back_to_idle(&self, origin: PressOrigin, now: u64) -> State {
        match origin {
            PressOrigin::Idle => State::Idle { since: now },
            PressOrigin::Debug => State::Debug { last_print: None },
        }
    }

    fn button_pressed(&self, button: ButtonId, origin: PressOrigin, now: u64) -> State {
        if origin == PressOrigin::Debug {
            return State::Idle { since: now };
        }
        if button == ButtonId::Back {
            return State::Debug { last_print: None };
        }
        match self.cfg.target_for(button) {
            Some(target) => {
                tracing::info!(
                    button = button.name(),
                    grams = target.grams,
                    corrected = target.corrected,
                    "dose selected"
                );
                State::Confirm {
                    target,
                    button,
                    since: now,
                }
            }
            None => State::Idle { since: now },
        }
    }

    fn confirm(
        &mut self,
        target: DoseTarget,
        button: ButtonId,
        since: u64,
        now: u64,
        edge: Option<PendingButtonEdge>,
    ) -> State {
        match edge.map(|e| e.action) {
            Some(EdgeAction::ConfirmAccept) => return State::Tare { target, since: now },
            Some(EdgeAction::ConfirmCancel) => {
                tracing::info!("dose cancelled");
                return State::Idle { since: now };
            }
            _ => {}
        }
        if now.saturating_sub(since) >= self.cfg.confirm_timeout_ms {
            tracing::info!("confirmation timed out");
            return State::Idle { since: now };
        }
        self.show(
            now,
            DisplayView::Confirm {
                target_g: target.grams,
                button,
            },
        );
        State::Confirm {
            target,
            button,
            since,
        }
    }

    fn tare(&mut self, target: DoseTarget, since: u64, now: u64) -> State {
        self.show(now, DisplayView::Tare);
        if self.weight.tare() {
            return State::Configured { target };
        }
        if now.saturating_sub(since) >= self.cfg.tare_timeout_ms {
            tracing::warn!(
                timeout_ms = self.cfg.tare_timeout_ms,
                "scale never settled for tare"
            );
            return State::Idle { since: now };
        }
        State::Tare { target, since }
    }

    fn configured(&mut self, target: DoseTarget, now: u64) -> Result<State> {
        self.telemetry.record(&TelemetryEvent::SessionReset {
            target_g: target.grams,
        });
        self.relay_on()?;
        self.session = Some(Session::new(target, now, self.weight.read()));
        self.progress.reset();
        tracing::info!(
            target_g = target.grams,
            corrected = target.corrected,
            "grinding"
        );
        Ok(State::Running)
    }

    fn running(&mut self, now: u64) -> Result<State> {
        let Some(session) = self.session.as_ref() else {
            return Err(eyre::Report::new(GrinderError::State(
                "running without a session".into(),
            )));
        };
        let target = session.target;
        let elapsed_ms = session.elapsed_ms(now);
        let elapsed_s = session.elapsed_s(now);
        let (last_weight, last_weight_at) = (session.last_weight, session.last_weight_at);

        let grams = self.weight.read();
        let raw = self.weight.read_raw();
        self.telemetry.record(&TelemetryEvent::RawSample {
            raw: raw.raw,
            grams,
            elapsed_ms,
            stable: raw.stable,
        });

        if elapsed_ms > self.cfg.grinding_timeout_ms {
            tracing::warn!(elapsed_ms, grams, "grinding timed out");
            self.relay_off("grinding timeout");
            return Ok(State::Stopping(StoppingWindow::new(now, grams)));
        }

        if self.progress.ready(now) {
            self.telemetry
                .record(&TelemetryEvent::SessionUpdate { elapsed_s, grams });
        }
        self.show(
            now,
            DisplayView::Grinding {
                grams: snap_zero(grams),
                target_g: target.grams,
                elapsed_s,
            },
        );

        if grams < MIN_GRINDING_GRAMS {
            return Ok(State::Running);
        }

        if grams > last_weight && grams > target.corrected {
            self.relay_off("first stop");
            let params = TopUpParams::from_settings(&self.cfg, target.grams);
            tracing::debug!(
                grams,
                avg_rate = ?self.session.as_ref().and_then(|s| s.rate.average()),
                "first stop, topping up"
            );
            return Ok(State::TopUp(TopUpController::new(params, now, grams)));
        }

        let delta = grams - last_weight;
        if delta >= RATE_SAMPLE_MIN_DELTA_G
            && let Some(rate) = instantaneous_rate(delta, now.saturating_sub(last_weight_at))
            && let Some(session) = self.session.as_mut()
        {
            session.rate.record(rate);
            session.last_weight = grams;
            session.last_weight_at = now;
        }
        Ok(State::Running)
    }

    fn top_up(&mut self, mut ctl: TopUpController, now: u64) -> Result<State> {
        let grams = self.weight.read();
        let stable = self.weight.is_stable();
        let avg = self.session.as_ref().and_then(|s| s.rate.average());
        let action = if self.relay_on && !ctl.is_pulsing() {
            // Settle only counts once the grinder is really off.
            self.relay_off("top-up settle");
            if !self.relay_on {
                ctl.restart_settle(now);
            }
            TopUpAction::Wait
        } else {
            ctl.poll(now, grams, stable, avg)
        };

        if let Some(report) = ctl.take_report() {
            tracing::debug!(
                runtime_ms = report.runtime_ms,
                delta_g = report.delta_g,
                "top-up pulse settled"
            );
            self.telemetry.record(&TelemetryEvent::TopUp {
                runtime_ms: report.runtime_ms,
                delta_g: report.delta_g,
            });
        }

        match action {
            TopUpAction::Wait => {}
            TopUpAction::StartPulse {
                duration_ms,
                pulse_s,
                rate_gps,
            } => {
                self.relay_on()?;
                if let Some(s) = self.session.as_mut() {
                    s.top_up_pulses += 1;
                }
                tracing::debug!(duration_ms, pulse_s, rate_gps, grams, "top-up pulse");
            }
            TopUpAction::EndPulse => self.relay_off("top-up pulse end"),
            TopUpAction::Finish(reason) => {
                self.relay_off("top-up finished");
                tracing::info!(?reason, grams, pulses = ctl.pulses(), "top-up done");
                return Ok(State::Stopping(StoppingWindow::new(now, grams)));
            }
        }

        self.show(
            now,
            DisplayView::TopUp {
                grams: snap_zero(grams),
                target_g: ctl.target_g(),
            },
        );
        Ok(State::TopUp(ctl))
    }

    fn stopping(&mut self, mut window: StoppingWindow, now: u64) -> State {
        let grams = self.weight.read();
        let stable = self.weight.is_stable();
        self.show(
            now,
            DisplayView::Stabilizing {
                grams: snap_zero(grams),
            },
        );

        let waited = now.saturating_sub(window.since);
        if waited >= self.cfg.stability_max_wait_ms {
            tracing::debug!(grams, "stability wait expired");
            return self.final_reading(grams, now);
        }
        if waited < self.cfg.stability_min_wait_ms
            || now.saturating_sub(window.last_check_at) < STABILITY_CHECK_MS
        {
            return State::Stopping(window);
        }
        let settled = stable || (grams - window.last_grams).abs() <= SETTLED_DELTA_G;
        window.last_check_at = now;
        window.last_grams = grams;
        if settled {
            return self.final_reading(grams, now);
        }
        State::Stopping(window)
    }

    fn final_reading(&self, grams: f32, now: u64) -> State {
        let elapsed_s = self.session.as_ref().map_or(0.0, |s| s.elapsed_s(now));
        State::Finalize(FinalReading {
            grams,
            elapsed_s,
            since: now,
        })
    }

    fn finalize(&mut self, reading: FinalReading, now: u64) -> State {
        if let Some(session) = self.session.as_mut()
            && session.mark_finalized()
        {
            let target_g = session.target.grams;
            let pulses = session.top_up_pulses;
            self.telemetry.record(&TelemetryEvent::SessionFinalize {
                elapsed_s: reading.elapsed_s,
                grams: reading.grams,
            });
            self.telemetry.record(&TelemetryEvent::Log(format!(
                "dose {:.2} g of {target_g:.1} g in {:.1} s",
                reading.grams, reading.elapsed_s
            )));
            tracing::info!(
                grams = reading.grams,
                target_g,
                elapsed_s = reading.elapsed_s,
                pulses,
                "dose complete"
            );
        }
        self.show(
            now,
            DisplayView::Final {
                grams: snap_zero(reading.grams),
                elapsed_s: reading.elapsed_s,
            },
        );
        if now.saturating_sub(reading.since) >= self.cfg.finalize_timeout_ms {
            self.session = None;
            return State::Idle { since: now };
        }
        State::Finalize(reading)
    }

    fn debug(
        &mut self,
        last_print: Option<u64>,
        now: u64,
        edge: Option<PendingButtonEdge>,
    ) -> State {
        if let Some(e) = edge
            && e.action == EdgeAction::Back
        {
            return State::ButtonFilter {
                button: ButtonId::Back,
                origin: PressOrigin::Debug,
                since: e.observed_at.min(now),
            };
        }
        if last_print.is_some_and(|t| now.saturating_sub(t) < DEBUG_PRINT_MS) {
            return State::Debug { last_print };
        }
        let raw = self.weight.read_raw();
        let grams = self.weight.read();
        tracing::debug!(raw = raw.raw, grams, stable = raw.stable, "debug reading");
        self.show(
            now,
            DisplayView::Debug {
                raw: raw.raw,
                grams,
                stable: raw.stable,
            },
        );
        State::Debug {
            last_print: Some(now),
        }
    }
}
