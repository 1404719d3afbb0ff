//! Session commands wired to the connection supervisor.
//!
//! Each command calls the REST API and forwards the snapshot it answers
//! with into the running supervisor, so the display and transition effects
//! follow a command immediately instead of waiting for the next push or
//! poll delivery. Failed commands are reported through the effect sink and
//! leave the supervisor untouched.

use std::sync::Arc;

use tracing::info;

use crate::api::{SessionCommand, TimerApi};
use crate::effects::{EffectDispatcher, MessageKind};
use crate::error::SyncError;
use crate::push::PushConnector;
use crate::snapshot::{BlockId, SessionId, Snapshot};
use crate::supervisor::{ConnectionSupervisor, SupervisorSettings};

pub struct SessionController {
    api: Arc<TimerApi>,
    supervisor: ConnectionSupervisor,
}

impl SessionController {
    #[must_use]
    pub fn new(
        api: Arc<TimerApi>,
        connector: Arc<dyn PushConnector>,
        dispatcher: EffectDispatcher,
        settings: SupervisorSettings,
    ) -> Self {
        let supervisor = ConnectionSupervisor::new(connector, api.clone(), dispatcher, settings);
        Self { api, supervisor }
    }

    #[must_use]
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ConnectionSupervisor {
        &mut self.supervisor
    }

    /// Look up the server's running session and, if there is one, start
    /// synchronizing it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Api`] when the lookup fails.
    pub async fn attach_active(&mut self) -> Result<Option<Snapshot>, SyncError> {
        let Some(snapshot) = self.api.active_session().await? else {
            return Ok(None);
        };
        info!(session_id = %snapshot.session_id, "attaching to active session");
        self.supervisor.start(snapshot.session_id).await;
        self.supervisor.on_snapshot(snapshot.clone());
        Ok(Some(snapshot))
    }

    /// Attach to `session_id` without issuing a command.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Api`] when the session cannot be fetched.
    pub async fn attach(&mut self, session_id: SessionId) -> Result<Snapshot, SyncError> {
        let snapshot = self.api.status(session_id).await?;
        self.supervisor.start(session_id).await;
        self.supervisor.on_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Api`] when the server refuses to start the block.
    pub async fn start_block(&mut self, block_id: BlockId) -> Result<Snapshot, SyncError> {
        let snapshot = match self.api.start(block_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => return Err(self.command_failed(error.into())),
        };
        info!(%block_id, session_id = %snapshot.session_id, "session started");
        self.supervisor.start(snapshot.session_id).await;
        self.supervisor.on_snapshot(snapshot.clone());
        self.announce(MessageKind::Success, "Timer started");
        Ok(snapshot)
    }

    /// Pause, resume, restart or skip `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Api`] when the server rejects the command.
    pub async fn command(&mut self, session_id: SessionId, command: SessionCommand) -> Result<Snapshot, SyncError> {
        let snapshot = match self.api.command(session_id, command).await {
            Ok(snapshot) => snapshot,
            Err(error) => return Err(self.command_failed(error.into())),
        };

        let restarts_sync = matches!(command, SessionCommand::Resume | SessionCommand::Restart);
        let syncing = self.supervisor.is_running() && self.supervisor.active_session() == Some(session_id);
        if restarts_sync && !syncing {
            self.supervisor.start(session_id).await;
        }
        let (kind, text) = confirmation(command);
        self.announce(kind, text);
        self.supervisor.on_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    /// Cancel `session_id` on the server, then stop syncing and reset the display.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Api`] when the server rejects the cancel.
    pub async fn cancel(&mut self, session_id: SessionId) -> Result<(), SyncError> {
        if let Err(error) = self.api.cancel(session_id).await {
            return Err(self.command_failed(error.into()));
        }
        self.supervisor.stop().await;
        self.supervisor.dispatcher().reset_display();
        self.announce(MessageKind::Info, "Timer canceled");
        Ok(())
    }

    /// Stop synchronizing without touching the server.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }

    fn announce(&self, kind: MessageKind, text: &str) {
        self.supervisor.dispatcher().sink().message(kind, text);
    }

    fn command_failed(&self, error: SyncError) -> SyncError {
        self.announce(MessageKind::Error, &format!("Error: {}", error.user_message()));
        error
    }
}

fn confirmation(command: SessionCommand) -> (MessageKind, &'static str) {
    match command {
        SessionCommand::Pause => (MessageKind::Info, "Timer paused"),
        SessionCommand::Resume => (MessageKind::Success, "Timer resumed"),
        SessionCommand::Restart => (MessageKind::Info, "Timer restarted"),
        SessionCommand::Skip => (MessageKind::Info, "Phase skipped"),
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
