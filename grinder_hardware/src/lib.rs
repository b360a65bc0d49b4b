//! Hardware backends for the grinder controller.
//!
//! Without the `hardware` feature only the simulator is built. With it, the
//! HX711 load-cell reader, the relay output and the button inputs are
//! available through `rppal` GPIO on Linux.
pub mod error;
pub mod sim;
pub mod util;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod gpio;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod hx711;

pub use sim::{SimGrinder, SimParams, SimulatedRelay, SimulatedScale};
