//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use grinder_traits::ButtonId;
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "grinder", version, about = "Grind-by-weight dosing controller")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/grinder.toml")]
    pub config: PathBuf,

    /// Log and print results as JSON lines instead of pretty text
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Dose button selectable from the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum DoseButton {
    /// Single dose
    Left,
    /// Double dose
    Right,
}

impl From<DoseButton> for ButtonId {
    fn from(b: DoseButton) -> Self {
        match b {
            DoseButton::Left => Self::Left,
            DoseButton::Right => Self::Right,
        }
    }
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Current
        } else {
            Self::None
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller until Ctrl-C or `quit`
    ///
    /// Lines on stdin act as button presses and API calls:
    /// left | right | back | dose <grams> | set <key> <value> | show | reboot | quit
    Run {
        /// Enable real-time mode (SCHED_FIFO, mlockall); needs the `rt` feature
        #[arg(long, action = ArgAction::SetTrue)]
        rt: bool,
        /// SCHED_FIFO priority when --rt is enabled (Linux only)
        #[arg(long, value_name = "PRIO")]
        rt_prio: Option<i32>,
        /// Memory locking mode for --rt: none, current, or all
        #[arg(long, value_enum, value_name = "MODE")]
        rt_lock: Option<RtLock>,
    },
    /// Grind one dose on the simulated grinder and print the result
    Simulate {
        /// Dose button to press (ignored when --grams is given)
        #[arg(long, value_enum, default_value = "left")]
        button: DoseButton,
        /// Request an arbitrary dose instead of pressing a button
        #[arg(long, value_name = "GRAMS")]
        grams: Option<f32>,
        /// Override sim.flow_gps
        #[arg(long, value_name = "GPS")]
        flow: Option<f32>,
        /// Give up after this much simulated time
        #[arg(long, value_name = "MS", default_value_t = 120_000)]
        max_ms: u64,
    },
    /// Bring up the weight sensor and relay once and report a reading
    SelfCheck,
    /// Inspect or edit runtime settings stored in the config file
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Fit calibration_factor and zero_counts from a `raw,grams` CSV
    Calibrate {
        /// Calibration CSV with header `raw,grams`
        #[arg(long, value_name = "FILE")]
        csv: PathBuf,
        /// Write the fit back into the config file
        #[arg(long, action = ArgAction::SetTrue)]
        write: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCmd {
    /// Print every runtime setting
    Show,
    /// Validate and persist one setting
    Set { key: String, value: String },
}
