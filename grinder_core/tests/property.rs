use std::sync::Arc;

use grinder_core::mocks::{ScriptedWeight, SpyRelay};
use grinder_core::rate::RateEstimator;
use grinder_core::topup::{MAX_PULSE_S, MIN_PULSE_S, pulse_seconds};
use grinder_core::{ButtonEdgeQueue, MachineBuilder, StateKind};
use grinder_traits::{ButtonId, ManualClock};
use proptest::prelude::*;

fn button() -> impl Strategy<Value = ButtonId> {
    prop_oneof![
        Just(ButtonId::Left),
        Just(ButtonId::Right),
        Just(ButtonId::Back),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Wait(u64),
    Press(ButtonId),
    Grams(f32),
    Stable(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..400).prop_map(Op::Wait),
        2 => button().prop_map(Op::Press),
        3 => (-1.0f32..40.0).prop_map(Op::Grams),
        1 => any::<bool>().prop_map(Op::Stable),
    ]
}

proptest! {
    #[test]
    fn average_is_mean_of_accepted_samples(samples in prop::collection::vec(-5.0f32..10.0, 0..64)) {
        let mut est = RateEstimator::new();
        let mut kept = Vec::new();
        for s in &samples {
            if est.record(*s) {
                kept.push(f64::from(*s));
            }
        }
        prop_assert!(kept.iter().all(|&v| v > 0.1));
        match est.average() {
            None => prop_assert!(kept.is_empty()),
            Some(avg) => {
                let mean = kept.iter().sum::<f64>() / kept.len() as f64;
                prop_assert!((f64::from(avg) - mean).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn pulse_length_is_always_clamped(
        target in prop_oneof![Just(f32::NAN), -100.0f32..100.0],
        current in -100.0f32..100.0,
        rate in prop_oneof![Just(0.0f32), Just(f32::INFINITY), Just(f32::NAN), -5.0f32..5.0],
    ) {
        let s = pulse_seconds(target, current, rate);
        prop_assert!((MIN_PULSE_S..=MAX_PULSE_S).contains(&s), "{s}");
    }

    #[test]
    fn accepted_edges_respect_debounce(
        gaps in prop::collection::vec(0u64..400, 1..64),
        debounce in 1u64..300,
    ) {
        let q = ButtonEdgeQueue::new(debounce);
        let mut now = 0;
        let mut accepted = Vec::new();
        for gap in gaps {
            now += gap;
            q.on_edge(ButtonId::Left, now);
            if let Some(e) = q.consume() {
                accepted.push(e.observed_at);
            }
        }
        prop_assert!(!accepted.is_empty());
        for pair in accepted.windows(2) {
            prop_assert!(pair[1] - pair[0] >= debounce);
        }
    }

    #[test]
    fn relay_only_runs_in_grinding_states(ops in prop::collection::vec(op(), 1..200)) {
        let clock = ManualClock::new();
        let (w, weight) = ScriptedWeight::new();
        let (r, relay) = SpyRelay::new();
        let mut m = MachineBuilder::new()
            .with_weight(w)
            .with_relay(r)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        m.begin().unwrap();

        for op in ops {
            match op {
                Op::Wait(ms) => clock.advance_ms(ms),
                Op::Press(b) => m.inject_edge(b),
                Op::Grams(g) => weight.set_grams(g),
                Op::Stable(s) => weight.set_stable(s),
            }
            let kind = m.step().unwrap();
            prop_assert_eq!(relay.is_on(), m.relay_is_on());
            if relay.is_on() {
                prop_assert!(kind.may_grind(), "relay on in {}", kind);
            }
            if kind == StateKind::Running {
                prop_assert!(relay.is_on());
            }
        }
    }

    #[test]
    fn first_stop_happens_above_corrected_target(
        steps in prop::collection::vec(0.0f32..0.6, 20..400),
    ) {
        let clock = ManualClock::new();
        let (w, weight) = ScriptedWeight::new();
        let (r, relay) = SpyRelay::new();
        let mut m = MachineBuilder::new()
            .with_weight(w)
            .with_relay(r)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        m.begin().unwrap();
        m.inject_edge(ButtonId::Left);
        for _ in 0..3 {
            clock.advance_ms(10);
            m.step().unwrap();
        }
        clock.advance_ms(200);
        m.inject_edge(ButtonId::Left);
        while m.state_kind() != StateKind::Running {
            clock.advance_ms(10);
            m.step().unwrap();
        }
        let corrected = m.session().unwrap().target.corrected;

        let mut grams = 0.0f32;
        for step in steps {
            grams += step;
            weight.set_grams(grams);
            clock.advance_ms(10);
            let kind = m.step().unwrap();
            if kind == StateKind::TopUp {
                prop_assert!(grams > corrected);
                prop_assert!(!relay.is_on());
                break;
            }
            prop_assert_eq!(kind, StateKind::Running);
            prop_assert!(grams <= corrected, "passed {} g without stopping", corrected);
        }
    }
}
