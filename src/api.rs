//! REST client for the timer endpoints.
//!
//! DESIGN
//! ======
//! Every operation returns a [`Snapshot`] on success. Non-success responses
//! carry a JSON body whose `message` field is surfaced verbatim; when the
//! body has none, a per-operation fallback text is used instead.
//!
//! The poll channel only needs "fetch status by id", exposed through the
//! [`StatusSource`] trait so the supervisor can be driven by a mock.
//!
//! ERROR HANDLING
//! ==============
//! `ApiError::Status` is the only variant that ends a poll loop; transport
//! errors on a poll tick are logged and retried on the next tick.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::snapshot::{BlockId, SessionId, Snapshot};

const TIMER_PATH: &str = "/api/timer";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server returned no snapshot")]
    MissingBody,
}

impl ApiError {
    /// Human-readable message suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Session control operations that answer with the updated snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Restart,
    Skip,
}

impl SessionCommand {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Restart => "restart",
            Self::Skip => "skip",
        }
    }

    fn failure_message(self) -> &'static str {
        match self {
            Self::Pause => "Error pausing timer",
            Self::Resume => "Error resuming timer",
            Self::Restart => "Error restarting timer",
            Self::Skip => "Error skipping phase",
        }
    }
}

/// Pull seam used by the poll channel.
#[async_trait::async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch the current snapshot of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Status`] for non-success responses and
    /// [`ApiError::Transport`] when the request never completed.
    async fn fetch_status(&self, session_id: SessionId) -> Result<Snapshot, ApiError>;
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Debug, Clone)]
pub struct TimerApi {
    client: reqwest::Client,
    base_url: String,
}

impl TimerApi {
    /// Build a client rooted at `base_url` (e.g. `http://127.0.0.1:8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration, connect_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_owned() })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The running session, if any (`204` means none).
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn active_session(&self) -> Result<Option<Snapshot>, ApiError> {
        self.request(Method::GET, "/active", "Error checking active session")
            .await
    }

    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn status(&self, session_id: SessionId) -> Result<Snapshot, ApiError> {
        self.request(Method::GET, &format!("/{session_id}"), "Error fetching timer status")
            .await?
            .ok_or(ApiError::MissingBody)
    }

    /// Start a new session for `block_id`.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn start(&self, block_id: BlockId) -> Result<Snapshot, ApiError> {
        self.request(Method::POST, &format!("/start/{block_id}"), "Error starting timer")
            .await?
            .ok_or(ApiError::MissingBody)
    }

    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn command(&self, session_id: SessionId, command: SessionCommand) -> Result<Snapshot, ApiError> {
        let path = format!("/{session_id}/{}", command.path_segment());
        self.request(Method::POST, &path, command.failure_message())
            .await?
            .ok_or(ApiError::MissingBody)
    }

    /// Cancel (delete) a session. The server answers `204`.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn cancel(&self, session_id: SessionId) -> Result<(), ApiError> {
        self.request(Method::DELETE, &format!("/{session_id}"), "Error canceling timer")
            .await?;
        Ok(())
    }

    async fn request(&self, method: Method, path: &str, fallback: &str) -> Result<Option<Snapshot>, ApiError> {
        let url = format!("{}{TIMER_PATH}{path}", self.base_url);
        let response = self.client.request(method, &url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), message: error_message(&body, fallback) });
        }
        if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Snapshot::from_json(&body)?))
    }
}

#[async_trait::async_trait]
impl StatusSource for TimerApi {
    async fn fetch_status(&self, session_id: SessionId) -> Result<Snapshot, ApiError> {
        self.status(session_id).await
    }
}

fn error_message(body: &str, fallback: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| fallback.to_owned())
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
