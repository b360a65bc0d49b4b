use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use grinder_core::mocks::{MemoryStore, RecordingTelemetry, ScriptedWeight, SpyRelay};
use grinder_core::{
    DisplayView, GrinderError, LoopCfg, LoopExit, MachineBuilder, Settings, SettingsHandle,
    StateKind, run_loop,
};
use grinder_traits::{ButtonId, ManualClock};
use rstest::rstest;

struct Parts {
    clock: ManualClock,
    weight: grinder_core::mocks::WeightHandle,
    relay: grinder_core::mocks::RelayLog,
    tel: RecordingTelemetry,
}

fn machine(
    settings: SettingsHandle,
) -> (
    grinder_core::DosingStateMachine<
        ScriptedWeight,
        SpyRelay,
        grinder_core::TrustEdges,
        RecordingTelemetry,
    >,
    Parts,
) {
    let clock = ManualClock::new();
    let (w, weight) = ScriptedWeight::new();
    let (r, relay) = SpyRelay::new();
    let tel = RecordingTelemetry::new();
    let m = MachineBuilder::new()
        .with_weight(w)
        .with_relay(r)
        .with_telemetry(tel.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings)
        .build()
        .unwrap();
    (
        m,
        Parts {
            clock,
            weight,
            relay,
            tel,
        },
    )
}

#[test]
fn sensor_init_failure_is_fatal_and_typed() {
    let (mut m, p) = machine(SettingsHandle::default());
    p.weight.fail_begin("no data-ready within 150 ms");
    let err = m.begin().unwrap_err();
    match err.downcast_ref::<GrinderError>() {
        Some(GrinderError::SensorInit(msg)) => assert!(msg.contains("data-ready")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn settings_edits_apply_only_in_idle() {
    let handle = SettingsHandle::default();
    let (mut m, p) = machine(handle.clone());
    m.begin().unwrap();

    m.inject_edge(ButtonId::Left);
    for _ in 0..3 {
        p.clock.advance_ms(10);
        m.step().unwrap();
    }
    assert_eq!(m.state_kind(), StateKind::Confirm);
    handle.set("target_dose_single", "20").unwrap();
    p.clock.advance_ms(10);
    m.step().unwrap();
    assert!((m.active_settings().target_dose_single - 18.0).abs() < f32::EPSILON);

    // timeout back to Idle, where the edit lands
    p.clock.advance_ms(2000);
    assert_eq!(m.step().unwrap(), StateKind::Idle);
    p.clock.advance_ms(10);
    m.step().unwrap();
    assert!((m.active_settings().target_dose_single - 20.0).abs() < f32::EPSILON);
}

#[test]
fn debounce_edit_reaches_edge_queue() {
    let handle = SettingsHandle::default();
    let (mut m, p) = machine(handle.clone());
    m.begin().unwrap();
    handle.set("button_debounce_ms", "40").unwrap();
    p.clock.advance_ms(10);
    m.step().unwrap();
    assert_eq!(m.edges().debounce_ms(), 40);
}

#[rstest]
#[case::store_ok(false, 1)]
#[case::store_failing(true, 0)]
fn settings_persist_best_effort(#[case] failing: bool, #[case] saves: usize) {
    let store = MemoryStore::new();
    store.set_failing(failing);
    let handle = SettingsHandle::with_store(Settings::default(), Box::new(store.clone()));
    handle.set("top_up_margin_single", "2.5").unwrap();
    assert_eq!(store.saves(), saves);
    // in-memory value wins either way
    assert!((handle.snapshot().top_up_margin_single - 2.5).abs() < f32::EPSILON);
    assert!(handle.take_changed());
}

#[test]
fn tare_that_never_settles_gives_up() {
    let (mut m, p) = machine(SettingsHandle::default());
    m.begin().unwrap();
    p.weight.set_tare_ready(false);
    m.inject_edge(ButtonId::Left);
    for _ in 0..3 {
        p.clock.advance_ms(10);
        m.step().unwrap();
    }
    p.clock.advance_ms(200);
    m.inject_edge(ButtonId::Left);
    p.clock.advance_ms(10);
    assert_eq!(m.step().unwrap(), StateKind::Tare);
    p.clock.advance_ms(9_990);
    assert_eq!(m.step().unwrap(), StateKind::Tare);
    p.clock.advance_ms(10);
    assert_eq!(m.step().unwrap(), StateKind::Idle);
    assert!(!p.relay.is_on());
    assert_eq!(p.tel.last_display(), Some(DisplayView::Tare));
}

#[test]
fn relay_failure_aborts_dose_back_to_idle() {
    let (mut m, p) = machine(SettingsHandle::default());
    m.begin().unwrap();
    p.relay.fail_on(true);
    m.inject_edge(ButtonId::Left);
    for _ in 0..3 {
        p.clock.advance_ms(10);
        m.step().unwrap();
    }
    p.clock.advance_ms(200);
    m.inject_edge(ButtonId::Left);
    p.clock.advance_ms(10);
    m.step().unwrap();
    p.clock.advance_ms(10);
    assert_eq!(m.step().unwrap(), StateKind::Configured);
    p.clock.advance_ms(10);
    let err = m.step().unwrap_err();
    assert!(format!("{err:#}").contains("relay on"));
    assert_eq!(m.state_kind(), StateKind::Idle);
    assert!(m.session().is_none());
}

#[test]
fn poll_errors_do_not_stop_the_machine() {
    let (mut m, p) = machine(SettingsHandle::default());
    m.begin().unwrap();
    p.weight.fail_poll(true);
    p.clock.advance_ms(10);
    assert_eq!(m.step().unwrap(), StateKind::Idle);
}

#[test]
fn runner_stops_on_restart_request() {
    let handle = SettingsHandle::default();
    let (mut m, _p) = machine(handle.clone());
    m.begin().unwrap();
    handle.request_reboot();
    let exit = run_loop(&mut m, &AtomicBool::new(false), &LoopCfg::default()).unwrap();
    assert_eq!(exit, LoopExit::RestartRequested);
}

#[test]
fn runner_honours_shutdown_and_turns_relay_off() {
    let (mut m, p) = machine(SettingsHandle::default());
    m.begin().unwrap();
    m.inject_edge(ButtonId::Left);
    let cfg = LoopCfg {
        max_iterations: Some(4),
        ..LoopCfg::default()
    };
    run_loop(&mut m, &AtomicBool::new(false), &cfg).unwrap();
    assert_eq!(m.state_kind(), StateKind::Confirm);
    p.clock.advance_ms(200);
    m.inject_edge(ButtonId::Left);
    let cfg = LoopCfg {
        max_iterations: Some(3),
        ..LoopCfg::default()
    };
    let exit = run_loop(&mut m, &AtomicBool::new(false), &cfg).unwrap();
    assert_eq!(exit, LoopExit::IterationLimit);
    assert_eq!(m.state_kind(), StateKind::Running);
    // grinding started, and leaving the loop stopped it
    assert_eq!(p.relay.starts(), 1);
    assert!(!p.relay.is_on());

    let exit = run_loop(&mut m, &AtomicBool::new(true), &cfg).unwrap();
    assert_eq!(exit, LoopExit::Shutdown);
    assert!(!m.relay_is_on());
}
