//! Runtime configuration read from `PHASELOCK_*` environment variables.

use std::time::Duration;

use crate::error::SyncError;
use crate::supervisor::SupervisorSettings;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_PUSH_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_PUSH_BASE_DELAY_MS: u64 = 2000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

const WS_ENDPOINT: &str = "/ws/websocket";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_url: String,
    pub ws_url: String,
    pub supervisor: SupervisorSettings,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Whether the terminal sink reports itself as visible (suppresses phase notifications).
    pub assume_visible: bool,
}

impl SyncConfig {
    /// Build config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidBaseUrl`] if no websocket URL is given and
    /// the base URL is neither `http://` nor `https://`.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`SyncConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let base_url = lookup("PHASELOCK_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let base_url = base_url.trim().trim_end_matches('/').to_owned();
        let ws_url = match lookup("PHASELOCK_WS_URL").filter(|v| !v.trim().is_empty()) {
            Some(url) => url.trim().to_owned(),
            None => ws_url_from_base(&base_url)?,
        };

        let connect_timeout = Duration::from_secs(env_parse(
            &lookup,
            "PHASELOCK_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ));
        let supervisor = SupervisorSettings {
            push_max_attempts: env_parse(&lookup, "PHASELOCK_PUSH_MAX_ATTEMPTS", DEFAULT_PUSH_MAX_ATTEMPTS),
            push_base_delay: Duration::from_millis(env_parse(
                &lookup,
                "PHASELOCK_PUSH_BASE_DELAY_MS",
                DEFAULT_PUSH_BASE_DELAY_MS,
            )),
            poll_interval: Duration::from_millis(
                env_parse(&lookup, "PHASELOCK_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(1),
            ),
            close_timeout: connect_timeout,
        };

        Ok(Self {
            base_url,
            ws_url,
            supervisor,
            connect_timeout,
            request_timeout: Duration::from_secs(env_parse(
                &lookup,
                "PHASELOCK_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            assume_visible: env_parse(&lookup, "PHASELOCK_ASSUME_VISIBLE", true),
        })
    }

    /// Apply command-line overrides. A new base URL re-derives the websocket
    /// URL unless one is given explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidBaseUrl`] when the websocket URL has to be
    /// derived from an unsupported base URL.
    pub fn with_overrides(mut self, base_url: Option<String>, ws_url: Option<String>) -> Result<Self, SyncError> {
        let base_url = base_url.filter(|v| !v.trim().is_empty());
        let ws_url = ws_url.filter(|v| !v.trim().is_empty());
        if let Some(base) = base_url {
            self.base_url = base.trim().trim_end_matches('/').to_owned();
            if ws_url.is_none() {
                self.ws_url = ws_url_from_base(&self.base_url)?;
            }
        }
        if let Some(ws) = ws_url {
            self.ws_url = ws;
        }
        Ok(self)
    }
}

/// Websocket endpoint served next to the REST API at `base_url`.
///
/// # Errors
///
/// Returns [`SyncError::InvalidBaseUrl`] for schemes other than `http`/`https`.
pub fn ws_url_from_base(base_url: &str) -> Result<String, SyncError> {
    let base_url = base_url.trim_end_matches('/');
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}{WS_ENDPOINT}"));
    }
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}{WS_ENDPOINT}"));
    }
    Err(SyncError::InvalidBaseUrl(base_url.to_owned()))
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
