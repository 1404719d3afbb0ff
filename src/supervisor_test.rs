use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::*;
use crate::effects::test_helpers::{Effect, RecordingSink};
use crate::effects::{COMPLETION_CUE, MessageKind, Notification, PHASE_CHANGE_CUE, Tone, VisualCue};
use crate::snapshot::test_helpers::snapshot as snap;
use crate::snapshot::{IDLE_TITLE, Phase};

const SESSION: SessionId = SessionId(1);

// =============================================================================
// MOCKS
// =============================================================================

#[derive(Default)]
struct FailingConnector {
    calls: Mutex<Vec<(SessionId, Instant)>>,
}

impl FailingConnector {
    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn offsets_secs(&self, t0: Instant) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(t0).as_secs())
            .collect()
    }

    fn sessions(&self) -> Vec<SessionId> {
        self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait::async_trait]
impl PushConnector for FailingConnector {
    async fn subscribe(&self, session_id: SessionId) -> Result<Box<dyn PushStream>, ChannelError> {
        self.calls.lock().unwrap().push((session_id, Instant::now()));
        Err(ChannelError::Closed)
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl PushStream for MockStream {
    async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that hands out one scripted stream after `delay`.
struct StreamConnector {
    delay: Duration,
    stream: Mutex<Option<MockStream>>,
}

#[async_trait::async_trait]
impl PushConnector for StreamConnector {
    async fn subscribe(&self, _session_id: SessionId) -> Result<Box<dyn PushStream>, ChannelError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.stream.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(ChannelError::Closed),
        }
    }
}

struct PushHandle {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl PushHandle {
    fn send(&self, snapshot: &Snapshot) {
        self.tx.send(serde_json::to_string(snapshot).unwrap()).unwrap();
    }

    fn send_raw(&self, body: &str) {
        self.tx.send(body.to_owned()).unwrap();
    }
}

fn stream_connector(delay: Duration) -> (Arc<StreamConnector>, PushHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let stream = MockStream { rx, closed: Arc::clone(&closed) };
    let connector = Arc::new(StreamConnector { delay, stream: Mutex::new(Some(stream)) });
    (connector, PushHandle { tx, closed })
}

type Respond = Box<dyn Fn(usize) -> Result<Snapshot, ApiError> + Send + Sync>;

/// Poll source answering call `n` (1-based) with `respond(n)`.
struct ScriptedSource {
    calls: AtomicUsize,
    delay: Duration,
    respond: Respond,
}

impl ScriptedSource {
    fn new(respond: impl Fn(usize) -> Result<Snapshot, ApiError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, respond: Box::new(respond) })
    }

    fn slow(delay: Duration, respond: impl Fn(usize) -> Result<Snapshot, ApiError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), delay, respond: Box::new(respond) })
    }

    fn running() -> Arc<Self> {
        Self::new(|_| Ok(snap(Phase::Pomodoro, 0, TimerStatus::Running)))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StatusSource for ScriptedSource {
    async fn fetch_status(&self, _session_id: SessionId) -> Result<Snapshot, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(n)
    }
}

fn supervisor(
    connector: Arc<dyn PushConnector>,
    source: Arc<dyn StatusSource>,
    sink: &Arc<RecordingSink>,
    settings: SupervisorSettings,
) -> ConnectionSupervisor {
    let dispatcher = EffectDispatcher::new(Arc::clone(sink) as Arc<dyn crate::effects::EffectSink>);
    ConnectionSupervisor::new(connector, source, dispatcher, settings)
}

fn poll_only() -> SupervisorSettings {
    SupervisorSettings { push_max_attempts: 0, ..SupervisorSettings::default() }
}

async fn wait_stopped(sup: &ConnectionSupervisor) {
    let mut rx = sup.subscribe_state();
    tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| s.lifecycle == Lifecycle::Stopped))
        .await
        .unwrap()
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// =============================================================================
// PUSH BACKOFF & FALLBACK
// =============================================================================

#[tokio::test(start_paused = true)]
async fn push_failures_back_off_linearly_then_fall_back_to_polling() {
    let t0 = Instant::now();
    let connector = Arc::new(FailingConnector::default());
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector.clone(), ScriptedSource::running(), &sink, SupervisorSettings::default());

    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(30_500)).await;

    assert_eq!(connector.offsets_secs(t0), vec![0, 2, 6, 12, 20, 30]);
    let state = sup.state();
    assert_eq!(state.channel, Channel::Poll);
    assert_eq!(state.lifecycle, Lifecycle::Connected);
    assert_eq!(state.attempt, 5);
    assert_eq!(state.backoff_deadline, None);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.count(), 6);
    assert_eq!(sup.state().channel, Channel::Poll);
    assert!(sink.transitions().is_empty());

    sup.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_state_is_observable() {
    let t0 = Instant::now();
    let connector = Arc::new(FailingConnector::default());
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, ScriptedSource::running(), &sink, SupervisorSettings::default());

    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let state = sup.state();
    assert_eq!(state.session_id, Some(SESSION));
    assert_eq!(state.channel, Channel::Push);
    assert_eq!(state.lifecycle, Lifecycle::Backoff);
    assert_eq!(state.attempt, 2);
    // Second failure at t=2 waits 2 * base_delay.
    assert_eq!(state.backoff_deadline, Some(t0 + Duration::from_secs(6)));

    sup.stop().await;
    assert_eq!(sup.state().backoff_deadline, None);
}

#[tokio::test(start_paused = true)]
async fn stopped_poll_snapshot_after_fallback_tears_down_and_resets_display() {
    let t0 = Instant::now();
    let connector = Arc::new(FailingConnector::default());
    let source = ScriptedSource::new(|n| {
        let status = if n >= 31 { TimerStatus::Stopped } else { TimerStatus::Running };
        Ok(snap(Phase::Pomodoro, 0, status))
    });
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector.clone(), source.clone(), &sink, SupervisorSettings::default());

    sup.start(SESSION).await;
    wait_stopped(&sup).await;

    assert_eq!(t0.elapsed().as_secs(), 31);
    assert_eq!(connector.count(), 6);
    assert_eq!(sink.transitions(), vec![Effect::Reset]);
    assert_eq!(sink.effects().last(), Some(&Effect::Title(IDLE_TITLE.to_owned())));
    assert!(!sup.is_running());
    assert_eq!(sup.active_session(), None);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls(), 31);
}

// =============================================================================
// CHANNEL ARBITRATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn poll_results_are_discarded_while_push_is_connected() {
    let (connector, push) = stream_connector(Duration::from_millis(1500));
    let source = ScriptedSource::slow(Duration::from_secs(3), |_| {
        Ok(snap(Phase::ShortBreak, 1, TimerStatus::Paused))
    });
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, source.clone(), &sink, SupervisorSettings::default());

    push.send(&snap(Phase::Pomodoro, 0, TimerStatus::Running));
    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Fetch issued at t=1 while push was still connecting; it resolved at t=4.
    assert_eq!(source.calls(), 1);
    assert_eq!(sink.renders(), 1);
    assert!(sink.transitions().is_empty());
    assert_eq!(sup.state().channel, Channel::Push);
    assert_eq!(sup.state().lifecycle, Lifecycle::Connected);

    push.send(&snap(Phase::ShortBreak, 1, TimerStatus::Running));
    settle().await;
    assert_eq!(
        sink.transitions(),
        vec![Effect::Tone(Tone::Phase(Phase::ShortBreak)), Effect::Cue(VisualCue::PhaseChange, PHASE_CHANGE_CUE)]
    );
    sup.stop().await;
    assert!(push.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn first_snapshot_is_baseline_and_duplicates_across_paths_are_silent() {
    let connector = Arc::new(FailingConnector::default());
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, ScriptedSource::running(), &sink, poll_only());

    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    sup.on_snapshot(snap(Phase::Pomodoro, 0, TimerStatus::Running));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(sink.renders(), 4);
    assert!(sink.transitions().is_empty());
    sup.stop().await;
}

#[tokio::test(start_paused = true)]
async fn command_response_routed_through_inbox_fires_transition() {
    let connector = Arc::new(FailingConnector::default());
    let source = ScriptedSource::new(|n| {
        if n >= 2 {
            Ok(snap(Phase::ShortBreak, 1, TimerStatus::Running))
        } else {
            Ok(snap(Phase::Pomodoro, 0, TimerStatus::Running))
        }
    });
    let sink = RecordingSink::new(false);
    let mut sup = supervisor(connector, source, &sink, poll_only());

    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    sup.on_snapshot(snap(Phase::ShortBreak, 1, TimerStatus::Running));
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Later polls of the skipped-to phase are duplicates.
    assert_eq!(
        sink.transitions(),
        vec![
            Effect::Tone(Tone::Phase(Phase::ShortBreak)),
            Effect::Notify(Notification::phase_started(Phase::ShortBreak, 1, 8)),
            Effect::Cue(VisualCue::PhaseChange, PHASE_CHANGE_CUE),
        ]
    );
    assert_eq!(sup.state().lifecycle, Lifecycle::Connected);
    sup.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ended_push_subscription_backs_off_and_resumes_polling() {
    let t0 = Instant::now();
    let (connector, push) = stream_connector(Duration::ZERO);
    let source = ScriptedSource::new(|_| Ok(snap(Phase::ShortBreak, 1, TimerStatus::Running)));
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, source.clone(), &sink, SupervisorSettings::default());

    push.send(&snap(Phase::Pomodoro, 0, TimerStatus::Running));
    let PushHandle { tx, closed } = push;
    drop(tx);
    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let state = sup.state();
    assert_eq!(state.channel, Channel::Push);
    assert_eq!(state.lifecycle, Lifecycle::Backoff);
    assert_eq!(state.attempt, 1);
    assert_eq!(state.backoff_deadline, Some(t0 + Duration::from_secs(2)));

    // The poll at t=1 picks up the phase change push never delivered.
    assert_eq!(source.calls(), 1);
    assert_eq!(
        sink.transitions(),
        vec![Effect::Tone(Tone::Phase(Phase::ShortBreak)), Effect::Cue(VisualCue::PhaseChange, PHASE_CHANGE_CUE)]
    );

    // Reconnects keep failing until polling takes over for good.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(sup.state().channel, Channel::Poll);
    assert_eq!(sup.state().lifecycle, Lifecycle::Connected);
    assert!(sup.is_running());
    sup.stop().await;
    assert!(!closed.load(Ordering::SeqCst));
}

// =============================================================================
// TERMINAL STATUSES & FAILURES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn completion_fires_once_and_closes_push() {
    let (connector, push) = stream_connector(Duration::ZERO);
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, ScriptedSource::running(), &sink, SupervisorSettings::default());

    push.send(&snap(Phase::LongBreak, 7, TimerStatus::Running));
    push.send(&snap(Phase::LongBreak, 7, TimerStatus::Completed));
    push.send(&snap(Phase::LongBreak, 7, TimerStatus::Completed));
    sup.start(SESSION).await;
    wait_stopped(&sup).await;

    assert_eq!(
        sink.transitions(),
        vec![
            Effect::Tone(Tone::Completed),
            Effect::Notify(Notification::block_completed()),
            Effect::Cue(VisualCue::Completion, COMPLETION_CUE),
            Effect::Message(MessageKind::Success, "Block completed!".to_owned()),
        ]
    );
    assert_eq!(sink.renders(), 2);
    assert!(push.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn terminal_baseline_tears_down_without_effects() {
    let connector = Arc::new(FailingConnector::default());
    let source = ScriptedSource::new(|_| Ok(snap(Phase::Pomodoro, 7, TimerStatus::Completed)));
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, source.clone(), &sink, poll_only());

    sup.start(SESSION).await;
    wait_stopped(&sup).await;

    assert!(sink.transitions().is_empty());
    assert_eq!(sink.renders(), 1);
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unparseable_push_message_is_discarded() {
    let (connector, push) = stream_connector(Duration::ZERO);
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, ScriptedSource::running(), &sink, SupervisorSettings::default());

    push.send_raw("not json");
    push.send(&snap(Phase::Pomodoro, 0, TimerStatus::Running));
    push.send_raw(r#"{"sessionId":1}"#);
    push.send(&snap(Phase::ShortBreak, 1, TimerStatus::Running));
    sup.start(SESSION).await;
    settle().await;

    assert_eq!(sink.renders(), 2);
    assert_eq!(
        sink.transitions(),
        vec![Effect::Tone(Tone::Phase(Phase::ShortBreak)), Effect::Cue(VisualCue::PhaseChange, PHASE_CHANGE_CUE)]
    );
    assert_eq!(sup.state().lifecycle, Lifecycle::Connected);
    assert!(!push.closed.load(Ordering::SeqCst));
    sup.stop().await;
}

#[tokio::test(start_paused = true)]
async fn poll_status_failure_ends_live_updates() {
    let t0 = Instant::now();
    let connector = Arc::new(FailingConnector::default());
    let source = ScriptedSource::new(|n| {
        if n == 1 {
            Ok(snap(Phase::Pomodoro, 0, TimerStatus::Running))
        } else {
            Err(ApiError::Status { status: 500, message: "boom".into() })
        }
    });
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, source.clone(), &sink, poll_only());

    sup.start(SESSION).await;
    wait_stopped(&sup).await;
    assert_eq!(t0.elapsed().as_secs(), 2);

    let transitions = sink.transitions();
    assert_eq!(transitions.len(), 1);
    assert!(matches!(transitions[0], Effect::Message(MessageKind::Error, _)));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn other_poll_errors_keep_polling() {
    let connector = Arc::new(FailingConnector::default());
    let source = ScriptedSource::new(|n| {
        if n <= 2 {
            Err(ApiError::MissingBody)
        } else {
            Ok(snap(Phase::Pomodoro, 0, TimerStatus::Running))
        }
    });
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, source.clone(), &sink, poll_only());

    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(source.calls(), 3);
    assert_eq!(sink.renders(), 1);
    assert!(sink.transitions().is_empty());
    assert!(sup.is_running());
    sup.stop().await;
}

#[tokio::test(start_paused = true)]
async fn snapshots_for_other_sessions_are_ignored() {
    let connector = Arc::new(FailingConnector::default());
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector, ScriptedSource::running(), &sink, poll_only());

    sup.start(SessionId(2)).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(sink.renders(), 0);
    assert!(sup.is_running());
    sup.stop().await;
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stop_silences_all_scheduled_work() {
    let connector = Arc::new(FailingConnector::default());
    let source = ScriptedSource::new(|n| {
        let phase = if n % 2 == 0 { Phase::ShortBreak } else { Phase::Pomodoro };
        Ok(snap(phase, u32::try_from(n % 2).unwrap(), TimerStatus::Running))
    });
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector.clone(), source.clone(), &sink, SupervisorSettings::default());

    sup.start(SESSION).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;
    sup.stop().await;

    let effects = sink.effects().len();
    let connects = connector.count();
    let polls = source.calls();
    assert_eq!(sup.state().lifecycle, Lifecycle::Stopped);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(sink.effects().len(), effects);
    assert_eq!(connector.count(), connects);
    assert_eq!(source.calls(), polls);

    sup.stop().await;
    assert_eq!(sup.state().lifecycle, Lifecycle::Stopped);
    assert!(!sup.is_running());
    assert_eq!(sup.active_session(), None);
}

#[tokio::test(start_paused = true)]
async fn start_replaces_the_running_session() {
    let connector = Arc::new(FailingConnector::default());
    let sink = RecordingSink::new(true);
    let mut sup = supervisor(connector.clone(), ScriptedSource::running(), &sink, SupervisorSettings::default());

    sup.start(SessionId(1)).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    sup.start(SessionId(2)).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let sessions = connector.sessions();
    assert_eq!(sessions.first(), Some(&SessionId(1)));
    assert_eq!(sessions.iter().filter(|id| **id == SessionId(1)).count(), 1);
    assert!(sessions.len() > 2);
    assert_eq!(sup.active_session(), Some(SessionId(2)));
    sup.stop().await;
}

struct StuckStream;

#[async_trait::async_trait]
impl PushStream for StuckStream {
    async fn next_message(&mut self) -> Option<String> {
        std::future::pending().await
    }

    async fn close(&mut self) {
        std::future::pending::<()>().await;
    }
}

struct StuckConnector;

#[async_trait::async_trait]
impl PushConnector for StuckConnector {
    async fn subscribe(&self, _session_id: SessionId) -> Result<Box<dyn PushStream>, ChannelError> {
        Ok(Box::new(StuckStream))
    }
}

#[tokio::test(start_paused = true)]
async fn stop_is_bounded_when_push_close_stalls() {
    let sink = RecordingSink::new(true);
    let settings = SupervisorSettings { close_timeout: Duration::from_secs(3), ..SupervisorSettings::default() };
    let mut sup = supervisor(Arc::new(StuckConnector), ScriptedSource::running(), &sink, settings);

    sup.start(SESSION).await;
    settle().await;
    assert_eq!(sup.state().lifecycle, Lifecycle::Connected);

    let t0 = Instant::now();
    sup.stop().await;
    assert_eq!(t0.elapsed().as_secs(), 3);
    assert_eq!(sup.state().lifecycle, Lifecycle::Stopped);
    assert!(!sup.is_running());
}

#[test]
fn snapshot_without_running_session_is_dropped() {
    let sink = RecordingSink::new(true);
    let sup = supervisor(
        Arc::new(FailingConnector::default()),
        ScriptedSource::running(),
        &sink,
        SupervisorSettings::default(),
    );
    sup.on_snapshot(snap(Phase::Pomodoro, 0, TimerStatus::Running));
    assert!(sink.effects().is_empty());
    assert_eq!(sup.state(), ConnectionState::default());
    assert!(!sup.is_running());
}
