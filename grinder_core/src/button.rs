//! Interrupt-to-loop hand-off of button edges.
//!
//! `on_edge` runs in interrupt/callback context: it only touches atomics and
//! never blocks or allocates. It debounces, looks at the state the control
//! loop last published, resolves what the edge means, and leaves at most one
//! pending edge for `consume`. The loop is the single reader.
//!
//! Slot layout (`u64`): bits 0..8 action (0 = empty), 8..16 button,
//! 16..64 timestamp in ms.
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use grinder_traits::{ButtonId, ButtonInput, EdgeSink};

use crate::state::StateKind;

const TS_MASK: u64 = (1 << 48) - 1;
const NEVER: u64 = u64::MAX;

/// What the edge handler decided an edge means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EdgeAction {
    /// Dose button in Idle: start the hold filter.
    Press = 1,
    /// Same button again while confirming.
    ConfirmAccept = 2,
    /// Any other button while confirming.
    ConfirmCancel = 3,
    /// Back button in Idle or Debug.
    Back = 4,
}

impl EdgeAction {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Press),
            2 => Some(Self::ConfirmAccept),
            3 => Some(Self::ConfirmCancel),
            4 => Some(Self::Back),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingButtonEdge {
    pub button: ButtonId,
    pub observed_at: u64,
    pub action: EdgeAction,
}

impl PendingButtonEdge {
    fn pack(self) -> u64 {
        ((self.observed_at & TS_MASK) << 16)
            | (u64::from(self.button.as_u8()) << 8)
            | u64::from(self.action as u8)
    }

    fn unpack(v: u64) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let action = EdgeAction::from_u8((v & 0xFF) as u8)?;
        #[allow(clippy::cast_possible_truncation)]
        let button = ButtonId::from_u8(((v >> 8) & 0xFF) as u8);
        Some(Self {
            button,
            observed_at: v >> 16,
            action,
        })
    }
}

#[derive(Debug)]
pub struct ButtonEdgeQueue {
    slot: AtomicU64,
    phase: AtomicU8,
    confirm_button: AtomicU8,
    last_accepted_at: AtomicU64,
    last_edge_at: AtomicU64,
    debounce_ms: AtomicU64,
}

impl Default for ButtonEdgeQueue {
    fn default() -> Self {
        Self::new(150)
    }
}

impl ButtonEdgeQueue {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            slot: AtomicU64::new(0),
            phase: AtomicU8::new(StateKind::Idle as u8),
            confirm_button: AtomicU8::new(ButtonId::None.as_u8()),
            last_accepted_at: AtomicU64::new(NEVER),
            last_edge_at: AtomicU64::new(0),
            debounce_ms: AtomicU64::new(debounce_ms),
        }
    }

    pub fn set_debounce(&self, ms: u64) {
        self.debounce_ms.store(ms, Ordering::Relaxed);
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent edge of any button, accepted or not.
    pub fn last_edge_at(&self) -> u64 {
        self.last_edge_at.load(Ordering::Acquire)
    }

    /// State the control loop last published.
    pub fn phase(&self) -> StateKind {
        StateKind::from_u8(self.phase.load(Ordering::Acquire)).unwrap_or(StateKind::Idle)
    }

    /// Called by the control loop after every step.
    pub fn publish(&self, kind: StateKind, confirm_button: ButtonId) {
        // Confirm button first so a Confirm phase is never seen without it.
        self.confirm_button
            .store(confirm_button.as_u8(), Ordering::Release);
        self.phase.store(kind as u8, Ordering::Release);
    }

    /// Take the pending edge, if any.
    pub fn consume(&self) -> Option<PendingButtonEdge> {
        PendingButtonEdge::unpack(self.slot.swap(0, Ordering::AcqRel))
    }

    fn debounced(&self, now: u64) -> bool {
        let last = self.last_accepted_at.load(Ordering::Acquire);
        last != NEVER && now.saturating_sub(last) < self.debounce_ms()
    }

    /// Record an edge observed at `now` (ms on the controller's time base).
    pub fn on_edge(&self, button: ButtonId, now: u64) {
        self.last_edge_at.fetch_max(now, Ordering::AcqRel);
        if button == ButtonId::None || self.debounced(now) {
            return;
        }

        let phase = self.phase();
        let action = match phase {
            StateKind::Idle if button == ButtonId::Back => EdgeAction::Back,
            StateKind::Idle => EdgeAction::Press,
            StateKind::Confirm => {
                let expected = ButtonId::from_u8(
                    self.confirm_button
                        .swap(ButtonId::None.as_u8(), Ordering::AcqRel),
                );
                if expected == ButtonId::None {
                    // Already resolved by an earlier edge.
                    return;
                }
                if expected == button {
                    EdgeAction::ConfirmAccept
                } else {
                    EdgeAction::ConfirmCancel
                }
            }
            StateKind::Debug if button == ButtonId::Back => EdgeAction::Back,
            _ => return,
        };

        let packed = PendingButtonEdge {
            button,
            observed_at: now,
            action,
        }
        .pack();
        let stored = if matches!(phase, StateKind::Idle | StateKind::Confirm) {
            self.slot.store(packed, Ordering::Release);
            true
        } else {
            self.slot
                .compare_exchange(0, packed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };
        if stored {
            self.last_accepted_at.store(now, Ordering::Release);
        }
    }
}

impl EdgeSink for ButtonEdgeQueue {
    fn on_edge(&self, button: ButtonId, now_ms: u64) {
        Self::on_edge(self, button, now_ms);
    }
}

/// Button input that treats every delivered edge as a held press.
///
/// For edge sources without a readable level: stdin commands, virtual
/// buttons from a remote API.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustEdges;

impl ButtonInput for TrustEdges {
    fn is_pressed(&self, button: ButtonId) -> bool {
        button != ButtonId::None
    }
}
