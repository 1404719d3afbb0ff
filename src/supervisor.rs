//! Connection supervisor: keeps one session's display in sync.
//!
//! ARCHITECTURE
//! ============
//! [`ConnectionSupervisor`] owns a single background task per session. The
//! task drives both delivery paths from one `select!` loop:
//!
//! - the push channel: connect + subscribe, linear backoff on failure
//!   (`base_delay * attempt`), permanent fallback to polling once the
//!   attempts are used up. A subscription that ends after connecting counts
//!   as a failure and re-enters backoff;
//! - the [`PollChannel`]: a fixed-cadence timer that starts with the session
//!   and runs in the background, its ticks skipped (and any in-flight result
//!   discarded) while push is connected.
//!
//! Every snapshot, whichever path it came from, is rendered and then run
//! through the session's [`TransitionDetector`] and the [`EffectDispatcher`].
//! Because the detector and all timers live inside the task, awaiting the
//! task in [`ConnectionSupervisor::stop`] is the single cancellation point:
//! once it returns nothing touches the transition state again.
//!
//! ERROR HANDLING
//! ==============
//! - push connect/subscribe failures and ended subscriptions: retried with
//!   backoff, then fallback
//! - non-success poll response: live updates end, the session is torn down
//! - other poll errors: logged, the next tick retries
//! - unparseable push message: logged and discarded

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, StatusSource};
use crate::detector::TransitionDetector;
use crate::effects::{Directive, EffectDispatcher};
use crate::poll::PollChannel;
use crate::push::{ChannelError, PushConnector, PushStream};
use crate::snapshot::{SessionId, Snapshot, TimerStatus};

// =============================================================================
// SETTINGS & STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Push retries after the first failed attempt before falling back.
    pub push_max_attempts: u32,
    pub push_base_delay: Duration,
    pub poll_interval: Duration,
    /// Upper bound on closing the push connection during teardown.
    pub close_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            push_max_attempts: 5,
            push_base_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Delivery path currently responsible for effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    None,
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Connecting,
    Backoff,
    Connected,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub session_id: Option<SessionId>,
    pub channel: Channel,
    pub lifecycle: Lifecycle,
    /// Failed push attempts since the last successful subscribe.
    pub attempt: u32,
    /// When the pending push retry fires, while in backoff.
    pub backoff_deadline: Option<Instant>,
}

impl ConnectionState {
    fn stopped() -> Self {
        Self { lifecycle: Lifecycle::Stopped, ..Self::default() }
    }
}

// =============================================================================
// SUPERVISOR HANDLE
// =============================================================================

struct Running {
    session_id: SessionId,
    inbox: mpsc::UnboundedSender<Snapshot>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn PushConnector>,
    source: Arc<dyn StatusSource>,
    dispatcher: EffectDispatcher,
    settings: SupervisorSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Option<Running>,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(
        connector: Arc<dyn PushConnector>,
        source: Arc<dyn StatusSource>,
        dispatcher: EffectDispatcher,
        settings: SupervisorSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self { connector, source, dispatcher, settings, state: Arc::new(state), running: None }
    }

    /// Begin synchronizing `session_id`, tearing down any session already managed.
    pub async fn start(&mut self, session_id: SessionId) {
        self.stop().await;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Worker::new(
            session_id,
            Arc::clone(&self.connector),
            Arc::clone(&self.source),
            self.dispatcher.clone(),
            self.settings,
            Arc::clone(&self.state),
        );
        self.state.send_replace(ConnectionState {
            session_id: Some(session_id),
            channel: Channel::Push,
            lifecycle: Lifecycle::Connecting,
            attempt: 0,
            backoff_deadline: None,
        });
        info!(%session_id, "sync started");
        let task = tokio::spawn(worker.run(shutdown_rx, inbox_rx));
        self.running = Some(Running { session_id, inbox: inbox_tx, shutdown: shutdown_tx, task });
    }

    /// Stop synchronizing. Safe to call in any state; once it returns no
    /// timer, retry or message handler of the old session runs again.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if let Err(error) = running.task.await {
            warn!(session_id = %running.session_id, %error, "sync task ended abnormally");
        }
        self.state.send_replace(ConnectionState::stopped());
    }

    /// Route a snapshot obtained outside the channels (e.g. a command
    /// response) through the running session.
    pub fn on_snapshot(&self, snapshot: Snapshot) {
        match &self.running {
            Some(running) if !running.task.is_finished() => {
                if running.inbox.send(snapshot).is_err() {
                    debug!(session_id = %running.session_id, "sync task gone; snapshot dropped");
                }
            }
            _ => debug!(session_id = %snapshot.session_id, "no running sync; snapshot dropped"),
        }
    }

    /// Whether a session is being synchronized right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Session being synchronized, if any.
    #[must_use]
    pub fn active_session(&self) -> Option<SessionId> {
        self.state.borrow().session_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EffectDispatcher {
        &self.dispatcher
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

type ConnectFuture = BoxFuture<'static, Result<Box<dyn PushStream>, ChannelError>>;

enum PushSlot {
    Connecting(ConnectFuture),
    Backoff(Pin<Box<Sleep>>),
    Connected(Box<dyn PushStream>),
    /// Attempts used up; polling owns the session.
    Exhausted,
}

impl PushSlot {
    fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

enum PushEvent {
    Subscribed(Box<dyn PushStream>),
    Failed(ChannelError),
    RetryDue,
    Message(String),
}

struct Worker {
    session_id: SessionId,
    connector: Arc<dyn PushConnector>,
    dispatcher: EffectDispatcher,
    settings: SupervisorSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    detector: TransitionDetector,
    attempt: u32,
    backoff_deadline: Option<Instant>,
    push: PushSlot,
    poll: PollChannel,
}

impl Worker {
    fn new(
        session_id: SessionId,
        connector: Arc<dyn PushConnector>,
        source: Arc<dyn StatusSource>,
        dispatcher: EffectDispatcher,
        settings: SupervisorSettings,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        let push = PushSlot::Connecting(connect(&connector, session_id));
        Self {
            session_id,
            connector,
            dispatcher,
            settings,
            state,
            detector: TransitionDetector::new(),
            attempt: 0,
            backoff_deadline: None,
            push,
            poll: PollChannel::new(session_id, source, settings.poll_interval),
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>, mut inbox: mpsc::UnboundedReceiver<Snapshot>) {
        loop {
            let poll_dormant = self.push.is_connected();
            let directive = tokio::select! {
                biased;
                _ = &mut shutdown => Directive::Teardown { reset_display: false },
                event = next_push_event(&mut self.push) => self.on_push_event(event),
                result = self.poll.next_result(poll_dormant) => self.on_poll_result(result),
                Some(snapshot) = inbox.recv() => self.route(&snapshot),
            };
            if let Directive::Teardown { reset_display } = directive {
                self.teardown(reset_display).await;
                return;
            }
        }
    }

    fn on_push_event(&mut self, event: PushEvent) -> Directive {
        let session_id = self.session_id;
        match event {
            PushEvent::Subscribed(stream) => {
                info!(%session_id, channel = "push", "push channel connected");
                self.attempt = 0;
                self.backoff_deadline = None;
                self.push = PushSlot::Connected(stream);
                self.publish(Channel::Push, Lifecycle::Connected);
            }
            PushEvent::Failed(error) if self.attempt < self.settings.push_max_attempts => {
                self.attempt += 1;
                let delay = self.settings.push_base_delay * self.attempt;
                let deadline = Instant::now() + delay;
                warn!(
                    %session_id,
                    attempt = self.attempt,
                    max_attempts = self.settings.push_max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "push channel failed; retrying"
                );
                self.backoff_deadline = Some(deadline);
                self.push = PushSlot::Backoff(Box::pin(tokio::time::sleep_until(deadline)));
                self.publish(Channel::Push, Lifecycle::Backoff);
            }
            PushEvent::Failed(error) => {
                warn!(%session_id, attempt = self.attempt, %error, channel = "poll", "push unavailable; falling back to polling");
                self.backoff_deadline = None;
                self.push = PushSlot::Exhausted;
                self.publish(Channel::Poll, Lifecycle::Connected);
            }
            PushEvent::RetryDue => {
                debug!(%session_id, attempt = self.attempt, "retrying push connect");
                self.backoff_deadline = None;
                self.push = PushSlot::Connecting(connect(&self.connector, session_id));
                self.publish(Channel::Push, Lifecycle::Connecting);
            }
            PushEvent::Message(body) => match Snapshot::from_json(&body) {
                Ok(snapshot) => return self.route(&snapshot),
                Err(error) => warn!(%session_id, %error, "discarding unparseable push message"),
            },
        }
        Directive::Continue
    }

    fn on_poll_result(&mut self, result: Result<Snapshot, ApiError>) -> Directive {
        let session_id = self.session_id;
        if self.push.is_connected() {
            debug!(%session_id, "push connected; discarding poll result");
            return Directive::Continue;
        }
        match result {
            Ok(snapshot) => self.route(&snapshot),
            Err(error @ ApiError::Status { .. }) => {
                error!(%session_id, %error, channel = "poll", "poll failed; live updates stopped");
                self.dispatcher.live_updates_lost();
                Directive::Teardown { reset_display: false }
            }
            Err(error) => {
                warn!(%session_id, %error, channel = "poll", "poll request failed");
                Directive::Continue
            }
        }
    }

    /// Render, detect, dispatch. Terminal statuses end the session even when
    /// they arrive as the baseline.
    fn route(&mut self, snapshot: &Snapshot) -> Directive {
        if snapshot.session_id != self.session_id {
            debug!(
                session_id = %self.session_id,
                other_session_id = %snapshot.session_id,
                "ignoring snapshot for another session"
            );
            return Directive::Continue;
        }

        self.dispatcher.render(snapshot);
        let mut directive = Directive::Continue;
        for event in self.detector.observe(snapshot) {
            debug!(session_id = %self.session_id, ?event, "transition");
            directive = directive.merge(self.dispatcher.dispatch(&event));
        }
        if snapshot.status.is_terminal() {
            directive = directive.merge(Directive::Teardown { reset_display: snapshot.status == TimerStatus::Stopped });
        }
        directive
    }

    async fn teardown(&mut self, reset_display: bool) {
        if let PushSlot::Connected(stream) = &mut self.push {
            if tokio::time::timeout(self.settings.close_timeout, stream.close()).await.is_err() {
                warn!(session_id = %self.session_id, "push close timed out");
            }
        }
        self.push = PushSlot::Exhausted;
        self.backoff_deadline = None;
        self.poll.cancel();
        self.detector.reset();
        if reset_display {
            self.dispatcher.reset_display();
        }
        self.state.send_replace(ConnectionState::stopped());
        info!(session_id = %self.session_id, "sync stopped");
    }

    fn publish(&self, channel: Channel, lifecycle: Lifecycle) {
        self.state.send_replace(ConnectionState {
            session_id: Some(self.session_id),
            channel,
            lifecycle,
            attempt: self.attempt,
            backoff_deadline: self.backoff_deadline,
        });
    }
}

fn connect(connector: &Arc<dyn PushConnector>, session_id: SessionId) -> ConnectFuture {
    let connector = Arc::clone(connector);
    Box::pin(async move { connector.subscribe(session_id).await })
}

/// Next event of the push slot. An established subscription that ends
/// (close, socket error, broker `ERROR`) counts as a failed attempt.
async fn next_push_event(slot: &mut PushSlot) -> PushEvent {
    match slot {
        PushSlot::Connecting(connecting) => match connecting.await {
            Ok(stream) => PushEvent::Subscribed(stream),
            Err(error) => PushEvent::Failed(error),
        },
        PushSlot::Backoff(sleep) => {
            sleep.as_mut().await;
            PushEvent::RetryDue
        }
        PushSlot::Connected(stream) => match stream.next_message().await {
            Some(body) => PushEvent::Message(body),
            None => PushEvent::Failed(ChannelError::Ended),
        },
        PushSlot::Exhausted => pending().await,
    }
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod tests;
