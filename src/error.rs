//! Error types for mbap-transport.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum MbapError {
    /// Invalid argument passed to a constructor or setter.
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    /// Operation attempted on a closed or closing resource.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The caller's cancellation input fired while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// Protocol-level failure (framing, timeout, response validation).
    #[error("Communication error: {0}")]
    Communication(String),

    /// Malformed transport configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An unreachable code path was reached.
    #[error("Internal invariant violated: {0}")]
    Bug(String),
}

/// Coarse classification of [`MbapError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parameter,
    InvalidOperation,
    Cancelled,
    Communication,
    Configuration,
    Bug,
}

impl MbapError {
    /// Get the error kind.
    ///
    /// I/O errors are reported as [`ErrorKind::Communication`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            MbapError::Parameter(_) => ErrorKind::Parameter,
            MbapError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            MbapError::Cancelled => ErrorKind::Cancelled,
            MbapError::Communication(_) | MbapError::Io(_) => ErrorKind::Communication,
            MbapError::Configuration(_) => ErrorKind::Configuration,
            MbapError::Bug(_) => ErrorKind::Bug,
        }
    }

    pub(crate) fn closed(what: &str) -> Self {
        MbapError::InvalidOperation(format!("{} is closed", what))
    }
}

impl From<serde_json::Error> for MbapError {
    fn from(err: serde_json::Error) -> Self {
        MbapError::Configuration(err.to_string())
    }
}

/// Result type alias using MbapError.
pub type Result<T> = std::result::Result<T, MbapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_is_communication() {
        let err = MbapError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(err.kind(), ErrorKind::Communication);
    }

    #[test]
    fn test_json_is_configuration() {
        let err: MbapError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_display() {
        let err = MbapError::Communication("no response".to_string());
        assert_eq!(err.to_string(), "Communication error: no response");
        assert!(MbapError::closed("transport")
            .to_string()
            .contains("transport is closed"));
    }
}
