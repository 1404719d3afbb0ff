//! Snapshot model: one server-reported observation of a timer session.
//!
//! DESIGN
//! ======
//! A `Snapshot` is immutable once received. Only the phase, phase index and
//! status take part in transition detection; the formatted durations are
//! forwarded to the display untouched and never parsed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Title shown when no session is being displayed.
pub const IDLE_TITLE: &str = "PhaseLock Timer";

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Server-assigned identifier of one run of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned identifier of a configured block of phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub i64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// PHASE / STATUS
// =============================================================================

/// One segment kind of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pomodoro,
    ShortBreak,
    LongBreak,
}

impl Phase {
    /// Full display name, used for the phase label and notifications.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Pomodoro => "Pomodoro",
            Self::ShortBreak => "Short Break",
            Self::LongBreak => "Long Break",
        }
    }

    /// Compact name used in the window title.
    #[must_use]
    pub fn title_name(self) -> &'static str {
        match self {
            Self::Pomodoro => "Pomodoro",
            Self::ShortBreak => "Break",
            Self::LongBreak => "Long Break",
        }
    }
}

/// Lifecycle status of a session as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerStatus {
    Running,
    Paused,
    Stopped,
    Completed,
}

impl TimerStatus {
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Completed => "Completed",
        }
    }

    /// `COMPLETED` and `STOPPED` end a session's live updates.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Server-reported state of one timer session at one instant.
///
/// Field names follow the server's camelCase JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub session_id: SessionId,
    pub block_id: BlockId,
    pub current_phase: Phase,
    /// Zero-based position within the block's phase sequence.
    pub current_phase_index: u32,
    /// Phase count of the block; stable for the whole session.
    pub total_phases: u32,
    pub status: TimerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_elapsed_seconds: Option<i64>,
    /// `MM:SS`, forwarded as-is.
    #[serde(default, rename = "formattedRemainingTime")]
    pub remaining_time: String,
    /// `HH:MM:SS`, forwarded as-is.
    #[serde(default, rename = "formattedElapsedTime")]
    pub elapsed_time: String,
}

impl Snapshot {
    /// Parse a snapshot from a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed or incomplete bodies.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Window/terminal title for this observation.
    #[must_use]
    pub fn title(&self) -> String {
        format!(
            "{} - {} | {IDLE_TITLE}",
            self.remaining_time,
            self.current_phase.title_name()
        )
    }

    /// `"n / total"` with a one-based phase number.
    #[must_use]
    pub fn progress_label(&self) -> String {
        format!("{} / {}", self.current_phase_index.saturating_add(1), self.total_phases)
    }

    /// Share of the block's phases reached, in percent.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.total_phases == 0 {
            return 0.0;
        }
        f64::from(self.current_phase_index.saturating_add(1)) / f64::from(self.total_phases) * 100.0
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
