#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Grind-by-weight dosing controller (hardware-agnostic).
//!
//! All hardware goes through `grinder_traits`: a `WeightSource` for filtered
//! grams, a `Relay` for the grinder motor and `ButtonInput` for pin levels.
//! Button interrupts talk to the controller only through the lock-free
//! [`ButtonEdgeQueue`]; the HTTP-style "dose N grams" input goes through
//! [`DoseRequest`].
//!
//! ## Architecture
//!
//! - **State machine**: [`DosingStateMachine`] advances at most one transition
//!   per [`DosingStateMachine::step`] (`machine` module)
//! - **Rate estimation**: grams/second average over the grinding phase (`rate`)
//! - **Top-up**: pulse length and pulse/settle cycle after the first stop (`topup`)
//! - **Settings**: validated snapshot plus a shared, persisted handle (`settings`)
//! - **Sampling**: [`FilteredScale`] turns raw ADC counts into grams, optionally
//!   fed by a background [`sampler::Sampler`]
//! - **Runner**: fixed-period loop with shutdown handling (`runner`)

pub mod builder;
pub mod button;
pub mod conversions;
pub mod dose_request;
pub mod error;
pub mod hw_error;
pub mod machine;
pub mod mocks;
pub mod rate;
pub mod runner;
pub mod sampler;
pub mod scale;
pub mod session;
pub mod settings;
pub mod state;
pub mod telemetry;
pub mod topup;
pub mod util;

pub use builder::{MachineBuilder, Missing};
pub use button::{ButtonEdgeQueue, EdgeAction, PendingButtonEdge, TrustEdges};
pub use dose_request::DoseRequest;
pub use error::{BuildError, GrinderError, Result};
pub use machine::DosingStateMachine;
pub use rate::RateEstimator;
pub use runner::{LoopCfg, LoopExit, run_loop};
pub use scale::{FilteredScale, SamplingMode};
pub use session::{DoseTarget, Session};
pub use settings::{RatePolicy, Settings, SettingsHandle, SettingsStore};
pub use state::{State, StateKind};
pub use telemetry::{DisplayView, NullTelemetry, Telemetry, TelemetryEvent, TracingTelemetry};
pub use topup::{FinishReason, PulseReport, TopUpAction, TopUpController, TopUpParams};
