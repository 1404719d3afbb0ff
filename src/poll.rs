//! Poll channel: fixed-cadence status fetches for one session.
//!
//! The timer starts with the session. Ticks that land while the channel is
//! dormant (push connected) or while a fetch is still in flight are skipped,
//! so at most one request is outstanding.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::api::{ApiError, StatusSource};
use crate::snapshot::{SessionId, Snapshot};

type FetchFuture = BoxFuture<'static, Result<Snapshot, ApiError>>;

pub struct PollChannel {
    session_id: SessionId,
    source: Arc<dyn StatusSource>,
    timer: Interval,
    fetch: Option<FetchFuture>,
}

impl PollChannel {
    /// First tick fires one `interval` from now.
    #[must_use]
    pub fn new(session_id: SessionId, source: Arc<dyn StatusSource>, interval: Duration) -> Self {
        let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { session_id, source, timer, fetch: None }
    }

    /// Next fetch result. While `dormant`, ticks pass without a request; a
    /// request already in flight still completes.
    ///
    /// Cancel safe: an in-flight request survives the returned future being
    /// dropped and is resumed by the next call.
    pub async fn next_result(&mut self, dormant: bool) -> Result<Snapshot, ApiError> {
        loop {
            if let Some(request) = self.fetch.as_mut() {
                let result = request.await;
                self.fetch = None;
                return result;
            }
            self.timer.tick().await;
            if !dormant {
                let source = Arc::clone(&self.source);
                let session_id = self.session_id;
                self.fetch = Some(Box::pin(async move { source.fetch_status(session_id).await }));
            }
        }
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.fetch.is_some()
    }

    /// Drop any in-flight request.
    pub fn cancel(&mut self) {
        self.fetch = None;
    }
}

#[cfg(test)]
#[path = "poll_test.rs"]
mod tests;
