//! Error types for the relay host.

use burrow_error::CommonError;
use thiserror::Error;

/// Errors from the relay server lifecycle.
///
/// Per-connection failures never surface here; they stay local to their
/// flow as `Error`/`Disconnected` frames on the channel.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Common errors shared across burrow crates.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
