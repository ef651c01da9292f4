//! Common error types shared across burrow crates.

use thiserror::Error;

/// Common errors that occur across multiple burrow crates.
///
/// Crate-specific error enums wrap this type through `#[from]` so that I/O
/// and configuration failures carry the same shape on both sides of the
/// relay channel.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid or missing configuration values, e.g. a relay URL with an
    /// unsupported scheme or an unparsable listen port.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state transition.
    ///
    /// An operation was attempted on a component that is not in a valid
    /// state for it (e.g. starting an endpoint that is already running).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation timeout.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl CommonError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Returns true if this is an I/O error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let common_err: CommonError = io_err.into();
        assert!(common_err.is_io());
        assert!(common_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_config_error() {
        let err = CommonError::config("unsupported relay URL scheme");
        assert_eq!(
            err.to_string(),
            "configuration error: unsupported relay URL scheme"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = CommonError::timeout("connect reply after 10s");
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timeout: connect reply after 10s");
    }
}
