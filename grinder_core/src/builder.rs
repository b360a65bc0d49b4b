//! Type-state builder for `DosingStateMachine`.
//!
//! A weight source and a relay must be supplied before `build()` exists.
//! Buttons default to [`TrustEdges`] and telemetry to [`NullTelemetry`].

use std::sync::Arc;

use grinder_traits::clock::{Clock, MonotonicClock};
use grinder_traits::{ButtonInput, Relay, TimeBase, WeightSource};

use crate::button::{ButtonEdgeQueue, TrustEdges};
use crate::dose_request::DoseRequest;
use crate::error::{BuildError, Result};
use crate::machine::{DEFAULT_HEARTBEAT_MS, DosingStateMachine, Parts};
use crate::settings::SettingsHandle;
use crate::telemetry::{NullTelemetry, Telemetry};

/// Placeholder for a component that has not been supplied yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct Missing;

#[derive(Default)]
struct Shared {
    time: Option<TimeBase>,
    settings: Option<SettingsHandle>,
    edges: Option<Arc<ButtonEdgeQueue>>,
    requests: Option<Arc<DoseRequest>>,
    heartbeat_ms: Option<u64>,
}

pub struct MachineBuilder<W = Missing, R = Missing, B = TrustEdges, T = NullTelemetry> {
    weight: W,
    relay: R,
    buttons: B,
    telemetry: T,
    shared: Shared,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self {
            weight: Missing,
            relay: Missing,
            buttons: TrustEdges,
            telemetry: NullTelemetry,
            shared: Shared::default(),
        }
    }
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W, R, B, T> MachineBuilder<W, R, B, T> {
    pub fn with_weight<W2: WeightSource>(self, weight: W2) -> MachineBuilder<W2, R, B, T> {
        MachineBuilder {
            weight,
            relay: self.relay,
            buttons: self.buttons,
            telemetry: self.telemetry,
            shared: self.shared,
        }
    }

    pub fn with_relay<R2: Relay>(self, relay: R2) -> MachineBuilder<W, R2, B, T> {
        MachineBuilder {
            weight: self.weight,
            relay,
            buttons: self.buttons,
            telemetry: self.telemetry,
            shared: self.shared,
        }
    }

    pub fn with_buttons<B2: ButtonInput>(self, buttons: B2) -> MachineBuilder<W, R, B2, T> {
        MachineBuilder {
            weight: self.weight,
            relay: self.relay,
            buttons,
            telemetry: self.telemetry,
            shared: self.shared,
        }
    }

    pub fn with_telemetry<T2: Telemetry>(self, telemetry: T2) -> MachineBuilder<W, R, B, T2> {
        MachineBuilder {
            weight: self.weight,
            relay: self.relay,
            buttons: self.buttons,
            telemetry,
            shared: self.shared,
        }
    }

    /// Clock for all timestamps. Defaults to the monotonic system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.shared.time = Some(TimeBase::new(clock));
        self
    }

    /// Share an existing time base, e.g. with a GPIO edge listener.
    pub fn with_time(mut self, time: TimeBase) -> Self {
        self.shared.time = Some(time);
        self
    }

    pub fn with_settings(mut self, settings: SettingsHandle) -> Self {
        self.shared.settings = Some(settings);
        self
    }

    pub fn with_edges(mut self, edges: Arc<ButtonEdgeQueue>) -> Self {
        self.shared.edges = Some(edges);
        self
    }

    pub fn with_requests(mut self, requests: Arc<DoseRequest>) -> Self {
        self.shared.requests = Some(requests);
        self
    }

    pub fn with_heartbeat_ms(mut self, ms: u64) -> Self {
        self.shared.heartbeat_ms = Some(ms.max(1));
        self
    }
}

impl<W, R, B, T> MachineBuilder<W, R, B, T>
where
    W: WeightSource,
    R: Relay,
    B: ButtonInput,
    T: Telemetry,
{
    /// Validate settings and assemble the machine in `Idle`.
    pub fn build(self) -> Result<DosingStateMachine<W, R, B, T>> {
        let shared = self.shared;
        let settings = shared.settings.unwrap_or_default();
        let snapshot = settings.snapshot();
        snapshot
            .validate()
            .map_err(|e| eyre::Report::new(BuildError::InvalidSettings(e.to_string())))?;

        let edges = shared
            .edges
            .unwrap_or_else(|| Arc::new(ButtonEdgeQueue::new(snapshot.button_debounce_ms)));
        edges.set_debounce(snapshot.button_debounce_ms);

        let time = shared
            .time
            .unwrap_or_else(|| TimeBase::new(Arc::new(MonotonicClock::new())));

        Ok(DosingStateMachine::from_parts(Parts {
            weight: self.weight,
            relay: self.relay,
            buttons: self.buttons,
            telemetry: self.telemetry,
            time,
            edges,
            requests: shared.requests.unwrap_or_default(),
            settings,
            heartbeat_ms: shared.heartbeat_ms.unwrap_or(DEFAULT_HEARTBEAT_MS),
        }))
    }
}
