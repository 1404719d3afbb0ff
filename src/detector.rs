//! Transition detection over a stream of possibly-redundant snapshots.
//!
//! DESIGN
//! ======
//! Snapshots arrive from either channel, sometimes twice for the same server
//! state. Detection compares each snapshot against the *latest observation*
//! (not the latest change), so duplicates are silent and every genuine change
//! yields exactly one event of each kind.
//!
//! The first snapshot of a session only establishes the baseline; it never
//! produces events, even when the session is already running.

use crate::snapshot::{Phase, Snapshot, TimerStatus};

/// What the detector remembers about the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub phase: Phase,
    pub phase_index: u32,
    pub status: TimerStatus,
}

impl From<&Snapshot> for Observed {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            phase: snapshot.current_phase,
            phase_index: snapshot.current_phase_index,
            status: snapshot.status,
        }
    }
}

/// Detector memory. Empty at session start and after teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionState {
    previous: Option<Observed>,
}

impl TransitionState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.previous.is_none()
    }

    #[must_use]
    pub fn previous(&self) -> Option<Observed> {
        self.previous
    }
}

/// A meaningful change between two consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    PhaseChanged {
        from: Phase,
        to: Phase,
        /// Zero-based index of the new phase.
        index: u32,
        total: u32,
    },
    StatusChanged {
        from: TimerStatus,
        to: TimerStatus,
    },
    Completed,
}

/// Compare `snapshot` against `state`, returning the updated state and the
/// events the change produced (in `PhaseChanged`, `StatusChanged`,
/// `Completed` order).
#[must_use]
pub fn detect(state: &TransitionState, snapshot: &Snapshot) -> (TransitionState, Vec<TransitionEvent>) {
    let current = Observed::from(snapshot);
    let next = TransitionState { previous: Some(current) };

    let Some(previous) = state.previous else {
        return (next, Vec::new());
    };

    let mut events = Vec::new();
    if current.phase != previous.phase || current.phase_index != previous.phase_index {
        events.push(TransitionEvent::PhaseChanged {
            from: previous.phase,
            to: current.phase,
            index: current.phase_index,
            total: snapshot.total_phases,
        });
    }
    if current.status != previous.status {
        events.push(TransitionEvent::StatusChanged { from: previous.status, to: current.status });
        if current.status == TimerStatus::Completed {
            events.push(TransitionEvent::Completed);
        }
    }

    (next, events)
}

/// Owns a [`TransitionState`] and applies [`detect`] to it in place.
#[derive(Debug, Default)]
pub struct TransitionDetector {
    state: TransitionState,
}

impl TransitionDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one snapshot; the stored state is replaced unconditionally.
    pub fn observe(&mut self, snapshot: &Snapshot) -> Vec<TransitionEvent> {
        let (next, events) = detect(&self.state, snapshot);
        self.state = next;
        events
    }

    /// Forget the baseline; the next snapshot is treated as the first.
    pub fn reset(&mut self) {
        self.state = TransitionState::default();
    }

    #[must_use]
    pub fn state(&self) -> &TransitionState {
        &self.state
    }
}

#[cfg(test)]
#[path = "detector_test.rs"]
mod tests;
