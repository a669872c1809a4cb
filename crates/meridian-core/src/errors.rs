//! Unified error system for Meridian
//!
//! Every crate keeps its own precise error enum and converts into
//! [`MeridianError`] at API boundaries where callers only need the category.

use serde::{Deserialize, Serialize};

/// Unified error type for all Meridian operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum MeridianError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// A quorum or peer could not be reached; the operation may be retried
    #[error("Unavailable: {message}")]
    Unavailable {
        /// Error message describing what was unreachable
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Intent compilation failed
    #[error("Compilation error: {message}")]
    Compilation {
        /// Error message naming the offending element
        message: String,
    },

    /// Southbound installation failed
    #[error("Install error: {message}")]
    Install {
        /// Error message describing the failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl MeridianError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a compilation error
    pub fn compilation(message: impl Into<String>) -> Self {
        Self::Compilation {
            message: message.into(),
        }
    }

    /// Create an install error
    pub fn install(message: impl Into<String>) -> Self {
        Self::Install {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Standard Result type for Meridian operations
pub type Result<T> = std::result::Result<T, MeridianError>;

impl From<std::io::Error> for MeridianError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::unavailable(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MeridianError::invalid("test message");
        assert!(matches!(err, MeridianError::Invalid { .. }));
        assert_eq!(err.to_string(), "Invalid: test message");
    }

    #[test]
    fn test_retryable_only_for_unavailable() {
        assert!(MeridianError::unavailable("quorum lost").is_retryable());
        assert!(!MeridianError::compilation("missing link").is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow peer");
        assert!(MeridianError::from(io_err).is_retryable());
    }
}
