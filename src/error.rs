use crate::api::ApiError;
use crate::push::ChannelError;

/// Errors surfaced to the CLI and the session controller.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no active timer session")]
    NoActiveSession,
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

impl SyncError {
    /// Text shown to the user for a failed command.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Api(error) => error.user_message(),
            other => other.to_string(),
        }
    }
}
