//! Effect dispatch for detected transitions.
//!
//! DESIGN
//! ======
//! The dispatcher holds no state of its own: idempotency comes from the
//! detector, which emits at most one event per genuine change. Side effects
//! go through the narrow [`EffectSink`] trait so the sync engine runs
//! (and is tested) without any audio, notification or display backend.
//!
//! Events that end a session's live updates return a [`Directive`] asking
//! the supervisor to tear the active channel down.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::detector::TransitionEvent;
use crate::snapshot::{IDLE_TITLE, Phase, Snapshot, TimerStatus};

pub const PHASE_CHANGE_CUE: Duration = Duration::from_secs(2);
pub const COMPLETION_CUE: Duration = Duration::from_secs(3);

const PHASE_NOTIFICATION_TAG: &str = "phaselock-timer";
const COMPLETION_NOTIFICATION_TAG: &str = "phaselock-complete";

// =============================================================================
// EFFECT VOCABULARY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Start-of-phase tone, keyed by the new phase.
    Phase(Phase),
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualCue {
    PhaseChange,
    Completion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Replaces an earlier notification carrying the same tag.
    pub tag: &'static str,
}

impl Notification {
    #[must_use]
    pub fn phase_started(phase: Phase, index: u32, total: u32) -> Self {
        Self {
            title: format!("{} Started", phase.display_name()),
            body: format!("Phase {} of {total}", index.saturating_add(1)),
            tag: PHASE_NOTIFICATION_TAG,
        }
    }

    #[must_use]
    pub fn block_completed() -> Self {
        Self {
            title: "Block Completed!".to_owned(),
            body: "Great job! Your time block is complete.".to_owned(),
            tag: COMPLETION_NOTIFICATION_TAG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Success,
    Info,
    Error,
}

/// Exit point of the sync engine into audio, notification and display.
pub trait EffectSink: Send + Sync {
    fn play_tone(&self, tone: Tone);
    fn notify(&self, notification: Notification);
    /// Show `cue`; the sink reverts it after `duration`.
    fn visual_cue(&self, cue: VisualCue, duration: Duration);
    fn set_title(&self, title: &str);
    fn render(&self, snapshot: &Snapshot);
    /// Return the display to its empty/idle representation.
    fn reset_display(&self);
    fn message(&self, kind: MessageKind, text: &str);
    /// Whether the user is currently looking at the display.
    fn is_visible(&self) -> bool;
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Request returned to the supervisor after an event is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Tear the channel down; optionally reset the display to idle.
    Teardown { reset_display: bool },
}

impl Directive {
    /// Combine two directives, keeping the strongest request.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Continue, d) | (d, Self::Continue) => d,
            (Self::Teardown { reset_display: a }, Self::Teardown { reset_display: b }) => {
                Self::Teardown { reset_display: a || b }
            }
        }
    }
}

#[derive(Clone)]
pub struct EffectDispatcher {
    sink: Arc<dyn EffectSink>,
}

impl EffectDispatcher {
    #[must_use]
    pub fn new(sink: Arc<dyn EffectSink>) -> Self {
        Self { sink }
    }

    /// Display update applied to every routed snapshot, baseline included.
    pub fn render(&self, snapshot: &Snapshot) {
        self.sink.render(snapshot);
        self.sink.set_title(&snapshot.title());
    }

    /// Fire the effects for one event.
    pub fn dispatch(&self, event: &TransitionEvent) -> Directive {
        match *event {
            TransitionEvent::PhaseChanged { to, index, total, .. } => {
                self.sink.play_tone(Tone::Phase(to));
                if !self.sink.is_visible() {
                    self.sink.notify(Notification::phase_started(to, index, total));
                }
                self.sink.visual_cue(VisualCue::PhaseChange, PHASE_CHANGE_CUE);
                Directive::Continue
            }
            TransitionEvent::Completed => {
                self.sink.play_tone(Tone::Completed);
                self.sink.notify(Notification::block_completed());
                self.sink.visual_cue(VisualCue::Completion, COMPLETION_CUE);
                self.sink.message(MessageKind::Success, "Block completed!");
                Directive::Teardown { reset_display: false }
            }
            TransitionEvent::StatusChanged { to: TimerStatus::Stopped, .. } => {
                Directive::Teardown { reset_display: true }
            }
            TransitionEvent::StatusChanged { .. } => Directive::Continue,
        }
    }

    pub fn reset_display(&self) {
        self.sink.reset_display();
        self.sink.set_title(IDLE_TITLE);
    }

    /// Live updates ended on a poll failure; the display is now stale.
    pub fn live_updates_lost(&self) {
        self.sink.message(MessageKind::Error, "Live updates stopped; timer display may be stale");
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EffectSink> {
        &self.sink
    }
}

// =============================================================================
// TERMINAL SINK
// =============================================================================

/// Line-oriented sink for the `phaselock` CLI.
///
/// Tones ring the terminal bell; visual cues are printed once since a
/// scrolling terminal has nothing to revert.
pub struct TerminalEffects {
    visible: bool,
}

impl TerminalEffects {
    #[must_use]
    pub fn new(visible: bool) -> Self {
        Self { visible }
    }

    fn line(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{text}");
    }
}

impl EffectSink for TerminalEffects {
    fn play_tone(&self, tone: Tone) {
        let label = match tone {
            Tone::Phase(phase) => phase.display_name(),
            Tone::Completed => "Completed",
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "\x07[tone] {label}");
    }

    fn notify(&self, notification: Notification) {
        self.line(&format!("[notify] {}: {}", notification.title, notification.body));
    }

    fn visual_cue(&self, cue: VisualCue, duration: Duration) {
        let label = match cue {
            VisualCue::PhaseChange => ">>> phase change <<<",
            VisualCue::Completion => "*** block complete ***",
        };
        self.line(&format!("{label} ({}s)", duration.as_secs()));
    }

    fn set_title(&self, title: &str) {
        // OSC 0 sets the terminal window title.
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\x1b]0;{title}\x07");
        let _ = out.flush();
    }

    fn render(&self, snapshot: &Snapshot) {
        self.line(&format!(
            "[{}] {} {} ({}) remaining {} elapsed {}",
            snapshot.session_id,
            snapshot.status.display_name(),
            snapshot.current_phase.display_name(),
            snapshot.progress_label(),
            snapshot.remaining_time,
            snapshot.elapsed_time,
        ));
    }

    fn reset_display(&self) {
        self.line("[idle] 00:00 - / - Stopped");
    }

    fn message(&self, kind: MessageKind, text: &str) {
        match kind {
            MessageKind::Error => eprintln!("error: {text}"),
            MessageKind::Success | MessageKind::Info => self.line(text),
        }
    }

    fn is_visible(&self) -> bool {
        self.visible
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "effects_test.rs"]
mod tests;
