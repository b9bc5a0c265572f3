//! Feed API Errors

use super::ports::SocketError;

/// Errors returned by the public feed API.
///
/// Transport failures never appear here; they become state transitions.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Send attempted while the feed is not open.
    #[error("feed is not connected")]
    NotConnected,

    /// The manager has been shut down.
    #[error("feed connection has been shut down")]
    Disposed,

    /// Topic names must be non-empty.
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Outbound payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<SocketError> for FeedError {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::NotConnected => Self::NotConnected,
        }
    }
}
