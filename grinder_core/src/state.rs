//! Controller states. Each variant carries only the data valid in it.
use grinder_traits::ButtonId;

use crate::session::DoseTarget;
use crate::topup::TopUpController;

/// Where a press started; decides what a confirmed Back press means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOrigin {
    Idle,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoppingWindow {
    pub since: u64,
    pub last_check_at: u64,
    pub last_grams: f32,
}

impl StoppingWindow {
    pub fn new(now: u64, grams: f32) -> Self {
        Self {
            since: now,
            last_check_at: now,
            last_grams: grams,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalReading {
    pub grams: f32,
    pub elapsed_s: f32,
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Idle {
        since: u64,
    },
    ButtonFilter {
        button: ButtonId,
        origin: PressOrigin,
        since: u64,
    },
    ButtonPressed {
        button: ButtonId,
        origin: PressOrigin,
    },
    Confirm {
        target: DoseTarget,
        button: ButtonId,
        since: u64,
    },
    Tare {
        target: DoseTarget,
        since: u64,
    },
    Configured {
        target: DoseTarget,
    },
    Running,
    TopUp(TopUpController),
    Stopping(StoppingWindow),
    Finalize(FinalReading),
    Debug {
        last_print: Option<u64>,
    },
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Idle { .. } => StateKind::Idle,
            Self::ButtonFilter { .. } => StateKind::ButtonFilter,
            Self::ButtonPressed { .. } => StateKind::ButtonPressed,
            Self::Confirm { .. } => StateKind::Confirm,
            Self::Tare { .. } => StateKind::Tare,
            Self::Configured { .. } => StateKind::Configured,
            Self::Running => StateKind::Running,
            Self::TopUp(_) => StateKind::TopUp,
            Self::Stopping(_) => StateKind::Stopping,
            Self::Finalize(_) => StateKind::Finalize,
            Self::Debug { .. } => StateKind::Debug,
        }
    }

    /// Button that accepts a pending confirmation.
    pub fn confirm_button(&self) -> ButtonId {
        match self {
            Self::Confirm { button, .. } => *button,
            _ => ButtonId::None,
        }
    }
}

/// Discriminant of [`State`], small enough to publish through an atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StateKind {
    Idle = 0,
    ButtonFilter = 1,
    ButtonPressed = 2,
    Confirm = 3,
    Tare = 4,
    Configured = 5,
    Running = 6,
    TopUp = 7,
    Stopping = 8,
    Finalize = 9,
    Debug = 10,
}

impl StateKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Idle,
            1 => Self::ButtonFilter,
            2 => Self::ButtonPressed,
            3 => Self::Confirm,
            4 => Self::Tare,
            5 => Self::Configured,
            6 => Self::Running,
            7 => Self::TopUp,
            8 => Self::Stopping,
            9 => Self::Finalize,
            10 => Self::Debug,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ButtonFilter => "button_filter",
            Self::ButtonPressed => "button_pressed",
            Self::Confirm => "confirm",
            Self::Tare => "tare",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::TopUp => "top_up",
            Self::Stopping => "stopping",
            Self::Finalize => "finalize",
            Self::Debug => "debug",
        }
    }

    /// States in which the relay may legitimately be on.
    pub fn may_grind(self) -> bool {
        matches!(self, Self::Configured | Self::Running | Self::TopUp)
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_u8() {
        for v in 0..=10u8 {
            let k = StateKind::from_u8(v).unwrap();
            assert_eq!(k as u8, v);
        }
        assert_eq!(StateKind::from_u8(11), None);
    }
}
