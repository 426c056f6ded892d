//! Error types shared by the cast session and stream-token components.

use thiserror::Error;

/// Failures surfaced by the cast session manager and its collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CastError {
    #[error("no cast receiver is connected")]
    NotConnected,
    #[error("cast session manager has been released")]
    Released,
    #[error("cast device '{0}' was not found")]
    DeviceNotFound(String),
    #[error("failed to connect to cast device: {0}")]
    Connection(String),
    #[error("cast connection attempt was cancelled")]
    Cancelled,
    #[error("playlist is empty")]
    EmptyPlaylist,
    #[error("no queue has been mirrored to the receiver")]
    NothingMirrored,
    #[error("item '{0}' is not part of the playlist")]
    ItemNotInPlaylist(String),
    #[error("invalid volume value {0}")]
    InvalidVolume(f32),
    #[error("cast channel error: {0}")]
    Channel(String),
    #[error("stream token error: {0}")]
    Token(#[from] TokenError),
}

/// Failures of the stream-token generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The host can never produce tokens (missing or broken execution environment).
    #[error("token host is unavailable: {0}")]
    HostUnavailable(String),
    #[error("failed to create token resource: {0}")]
    Creation(String),
    #[error("failed to generate token: {0}")]
    Generation(String),
    #[error("token generator has been released")]
    Released,
}

impl CastError {
    pub fn channel(err: impl Into<String>) -> Self {
        CastError::Channel(err.into())
    }

    /// Whether the caller should fall back to local-only playback.
    pub fn is_fallback_to_local(&self) -> bool {
        matches!(
            self,
            CastError::NotConnected
                | CastError::Released
                | CastError::Connection(_)
                | CastError::Cancelled
                | CastError::DeviceNotFound(_)
        )
    }
}
