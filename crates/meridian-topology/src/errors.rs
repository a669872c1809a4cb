//! Topology store errors

use meridian_core::{DeviceId, MeridianError};

/// Errors surfaced at the store boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A provider submitted a malformed description; nothing was stored
    #[error("Invalid description of {element}: {reason}")]
    InvalidDescription {
        /// Element the description was for
        element: String,
        /// What is wrong with it
        reason: String,
    },
    /// A port or availability update named a device the store does not hold
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
    /// Snapshot export failed
    #[error("Snapshot export failed: {0}")]
    Export(String),
    /// Replication with a peer failed
    #[error("Replication failed: {0}")]
    Replication(String),
}

impl TopologyError {
    /// Create an invalid description error
    pub fn invalid(element: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidDescription {
            element: element.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<TopologyError> for MeridianError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::InvalidDescription { .. } => MeridianError::invalid(err.to_string()),
            TopologyError::UnknownDevice(_) => MeridianError::not_found(err.to_string()),
            TopologyError::Export(_) => MeridianError::serialization(err.to_string()),
            TopologyError::Replication(_) => MeridianError::unavailable(err.to_string()),
        }
    }
}

/// Standard Result type for topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;
