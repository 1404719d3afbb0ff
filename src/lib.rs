//! Client-side sync engine for server-authoritative countdown timer sessions.
//!
//! A session's state lives on the timer server. This crate keeps a local
//! display in step with it over a STOMP push subscription, falling back to
//! timed polling when push cannot be established, and turns server-side
//! phase/status changes into user-facing effects exactly once.

pub mod api;
pub mod config;
pub mod controller;
pub mod detector;
pub mod effects;
pub mod error;
pub mod poll;
pub mod push;
pub mod snapshot;
pub mod stomp;
pub mod supervisor;

pub use api::{ApiError, SessionCommand, StatusSource, TimerApi};
pub use config::SyncConfig;
pub use controller::SessionController;
pub use detector::{TransitionDetector, TransitionEvent, TransitionState};
pub use effects::{Directive, EffectDispatcher, EffectSink, TerminalEffects};
pub use error::SyncError;
pub use poll::PollChannel;
pub use push::{ChannelError, PushConnector, PushStream, StompConnector};
pub use snapshot::{BlockId, Phase, SessionId, Snapshot, TimerStatus};
pub use supervisor::{Channel, ConnectionState, ConnectionSupervisor, Lifecycle, SupervisorSettings};
