use shared::error::ApiError;
use thiserror::Error;

/// Why an optimistic send did not stick. The provisional entry has already
/// been rolled back by the time a caller sees this.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("message content is empty")]
    EmptyContent,
    #[error("server rejected message: {0}")]
    Rejected(ApiError),
    #[error("send request failed: {0:#}")]
    Network(anyhow::Error),
}

impl SendError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Rejected(err) => Some(err),
            _ => None,
        }
    }
}
