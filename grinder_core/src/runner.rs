//! Fixed-period control loop around `DosingStateMachine::step`.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use grinder_traits::{ButtonInput, Relay, WeightSource};

use crate::error::Result;
use crate::machine::DosingStateMachine;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCfg {
    pub period_ms: u64,
    /// Stop after this many steps (simulation, tests).
    pub max_iterations: Option<u64>,
    /// Give up after this many failed steps in a row.
    pub max_consecutive_errors: u32,
}

impl Default for LoopCfg {
    fn default() -> Self {
        Self {
            period_ms: 10,
            max_iterations: None,
            max_consecutive_errors: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    RestartRequested,
    IterationLimit,
}

/// Step `machine` every `period_ms` until `shutdown` is raised, a restart is
/// requested, or the iteration limit is hit. The relay is off on every exit.
///
/// A failed step has already put the machine back in Idle; it is logged and
/// the loop keeps going unless failures pile up.
pub fn run_loop<W, R, B, T>(
    machine: &mut DosingStateMachine<W, R, B, T>,
    shutdown: &AtomicBool,
    cfg: &LoopCfg,
) -> Result<LoopExit>
where
    W: WeightSource,
    R: Relay,
    B: ButtonInput,
    T: Telemetry,
{
    let period = Duration::from_millis(cfg.period_ms.max(1));
    let mut iterations: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    let exit = loop {
        if shutdown.load(Ordering::Acquire) {
            break LoopExit::Shutdown;
        }
        if machine.restart_requested() {
            break LoopExit::RestartRequested;
        }
        if cfg.max_iterations.is_some_and(|max| iterations >= max) {
            break LoopExit::IterationLimit;
        }

        let started = machine.time().clock().now();
        match machine.step() {
            Ok(_) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(error = %e, consecutive_errors, "control step failed");
                if consecutive_errors >= cfg.max_consecutive_errors {
                    machine.shutdown();
                    return Err(e.wrap_err(format!(
                        "{consecutive_errors} consecutive control step failures"
                    )));
                }
            }
        }
        iterations += 1;

        let spent = machine
            .time()
            .clock()
            .now()
            .saturating_duration_since(started);
        machine.time().sleep(period.saturating_sub(spent));
    };

    machine.shutdown();
    tracing::info!(?exit, iterations, "control loop stopped");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MachineBuilder;
    use crate::mocks::{ScriptedWeight, SpyRelay};
    use grinder_traits::ManualClock;
    use std::sync::Arc;

    #[test]
    fn iteration_limit_advances_manual_clock() {
        let clock = ManualClock::new();
        let (w, _) = ScriptedWeight::new();
        let (r, log) = SpyRelay::new();
        let mut m = MachineBuilder::new()
            .with_weight(w)
            .with_relay(r)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let cfg = LoopCfg {
            max_iterations: Some(25),
            ..LoopCfg::default()
        };
        let exit = run_loop(&mut m, &AtomicBool::new(false), &cfg).unwrap();
        assert_eq!(exit, LoopExit::IterationLimit);
        assert_eq!(m.time().now_ms(), 250);
        assert!(!log.is_on());
    }
}
