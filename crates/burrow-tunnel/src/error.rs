//! Error types for the tunnel side.

use burrow_error::CommonError;
use thiserror::Error;

/// Errors from the relay channel client.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is gone. Pending connect waiters fail with this; later
    /// fire-and-forget sends return it quietly.
    #[error("relay channel closed")]
    Closed,

    /// The relay host reported that the real connection could not be
    /// opened, or the reply did not arrive in time.
    #[error("relay connect failed: {0}")]
    ConnectFailed(String),

    /// Websocket-level failure while establishing or using the channel.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Common errors shared across burrow crates.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}

/// Errors from the tunnel endpoint lifecycle.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Relay channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Common errors shared across burrow crates.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
