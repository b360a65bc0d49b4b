use std::sync::Arc;

use grinder_core::mocks::{PinState, RelayLog, ScriptedWeight, SpyRelay, WeightHandle};
use grinder_core::{
    DosingStateMachine, MachineBuilder, NullTelemetry, Settings, SettingsHandle, State, StateKind,
};
use grinder_traits::{ButtonId, ManualClock};
use rstest::rstest;

type Machine = DosingStateMachine<ScriptedWeight, SpyRelay, PinState, NullTelemetry>;

struct Rig {
    m: Machine,
    clock: ManualClock,
    pins: PinState,
    weight: WeightHandle,
    relay: RelayLog,
}

fn rig() -> Rig {
    let clock = ManualClock::new();
    let (w, weight) = ScriptedWeight::new();
    let (r, relay) = SpyRelay::new();
    let pins = PinState::new();
    let mut m = MachineBuilder::new()
        .with_weight(w)
        .with_relay(r)
        .with_buttons(pins.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_settings(SettingsHandle::new(Settings::default()))
        .build()
        .unwrap();
    m.begin().unwrap();
    Rig {
        m,
        clock,
        pins,
        weight,
        relay,
    }
}

impl Rig {
    fn tick(&mut self) -> StateKind {
        self.clock.advance_ms(10);
        self.m.step().unwrap()
    }

    fn ticks(&mut self, n: usize) -> StateKind {
        for _ in 0..n {
            self.tick();
        }
        self.m.state_kind()
    }

    fn press(&self, button: ButtonId) {
        self.pins.press(button);
        self.m.inject_edge(button);
    }

    fn release(&self, button: ButtonId) {
        self.pins.release(button);
        self.m.inject_edge(button);
    }

    /// Hold `button` through the filter into Confirm.
    fn select(&mut self, button: ButtonId) {
        self.press(button);
        assert_eq!(self.ticks(3), StateKind::Confirm);
        self.pins.release(button);
    }
}

#[test]
fn short_glitch_returns_to_idle() {
    let mut r = rig();
    r.press(ButtonId::Left);
    assert_eq!(r.tick(), StateKind::ButtonFilter);
    r.pins.release(ButtonId::Left);
    assert_eq!(r.ticks(2), StateKind::Idle);
    assert!(r.relay.history().iter().all(|on| !on));
}

#[test]
fn bouncing_contact_restarts_hold_window() {
    let mut r = rig();
    r.press(ButtonId::Left);
    assert_eq!(r.tick(), StateKind::ButtonFilter);
    // bounce 15 ms into the hold: debounced, but it still moves the window
    r.clock.advance_ms(5);
    r.m.inject_edge(ButtonId::Left);
    // without the bounce the hold would have elapsed at 20 ms
    assert_eq!(r.tick(), StateKind::ButtonFilter);
    assert_eq!(r.tick(), StateKind::ButtonPressed);
}

#[rstest]
#[case::left(ButtonId::Left, 18.0, 16.5)]
#[case::right(ButtonId::Right, 36.0, 34.5)]
fn press_selects_target(#[case] button: ButtonId, #[case] grams: f32, #[case] corrected: f32) {
    let mut r = rig();
    r.select(button);
    match r.m.state() {
        State::Confirm {
            target,
            button: b,
            ..
        } => {
            assert_eq!(*b, button);
            assert!((target.grams - grams).abs() < 1e-6);
            assert!((target.corrected - corrected).abs() < 1e-6);
        }
        other => panic!("expected Confirm, got {other:?}"),
    }
}

#[test]
fn same_button_confirms_and_starts_grinding() {
    let mut r = rig();
    r.select(ButtonId::Left);
    r.clock.advance_ms(300);
    r.press(ButtonId::Left);
    assert_eq!(r.tick(), StateKind::Tare);
    assert_eq!(r.tick(), StateKind::Configured);
    assert_eq!(r.tick(), StateKind::Running);
    assert!(r.relay.is_on());
    assert_eq!(r.weight.tare_calls(), 1);
}

#[rstest]
#[case::other_dose_button(ButtonId::Right)]
#[case::back(ButtonId::Back)]
fn different_button_cancels(#[case] other: ButtonId) {
    let mut r = rig();
    r.select(ButtonId::Left);
    r.clock.advance_ms(300);
    r.press(other);
    assert_eq!(r.tick(), StateKind::Idle);
    assert_eq!(r.ticks(10), StateKind::Idle);
    assert!(!r.relay.is_on());
}

#[test]
fn confirmation_times_out() {
    let mut r = rig();
    r.select(ButtonId::Left);
    r.clock.advance_ms(1990);
    assert_eq!(r.tick(), StateKind::Idle);
}

#[test]
fn second_edge_after_resolution_cannot_confirm() {
    let mut r = rig();
    r.select(ButtonId::Left);
    r.clock.advance_ms(300);
    // cancel, then the original button before the loop has run
    r.press(ButtonId::Right);
    r.clock.advance_ms(200);
    r.press(ButtonId::Left);
    assert_eq!(r.tick(), StateKind::Idle);
    assert_eq!(r.tick(), StateKind::Idle);
}

#[test]
fn presses_inside_debounce_are_dropped() {
    let mut r = rig();
    r.select(ButtonId::Left);
    // 30 ms after the first press, well inside 150 ms
    r.press(ButtonId::Left);
    assert_eq!(r.ticks(5), StateKind::Confirm);
}

#[test]
fn buttons_are_ignored_while_grinding() {
    let mut r = rig();
    r.select(ButtonId::Left);
    r.clock.advance_ms(300);
    r.press(ButtonId::Left);
    assert_eq!(r.ticks(3), StateKind::Running);
    for b in [ButtonId::Left, ButtonId::Right, ButtonId::Back] {
        r.clock.advance_ms(200);
        r.press(b);
        assert_eq!(r.tick(), StateKind::Running);
    }
    assert!(r.m.edges().consume().is_none());
}

#[test]
fn back_toggles_debug() {
    let mut r = rig();
    r.press(ButtonId::Back);
    assert_eq!(r.ticks(3), StateKind::Debug);
    r.release(ButtonId::Back);
    r.weight.set_raw(123_456);
    r.clock.advance_ms(300);
    r.press(ButtonId::Back);
    assert_eq!(r.ticks(3), StateKind::Idle);
}

#[test]
fn dose_buttons_do_nothing_in_debug() {
    let mut r = rig();
    r.press(ButtonId::Back);
    assert_eq!(r.ticks(3), StateKind::Debug);
    r.clock.advance_ms(300);
    r.press(ButtonId::Left);
    assert_eq!(r.ticks(5), StateKind::Debug);
}
