//! Intent validation and compilation errors

use crate::intent::IntentKey;
use meridian_core::{ConnectPoint, DeviceId, LinkKey, MeridianError};

/// Why an intent could not be built or compiled.
///
/// Compilation is all-or-nothing: any of these means no installables were
/// produced for the intent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompilationError {
    /// No ingress or no egress points were declared
    #[error("Intent {key} is empty: {reason}")]
    EmptyIntent {
        /// Offending intent
        key: IntentKey,
        /// Which part is missing
        reason: String,
    },
    /// A named device cannot be reached from an ingress or cannot reach an egress
    #[error("Intent {key} names unreachable device {device}")]
    Unreachable {
        /// Offending intent
        key: IntentKey,
        /// Device outside every ingress-to-egress walk
        device: DeviceId,
    },
    /// The topology does not know a device the intent uses
    #[error("Intent {key} references missing device {device}")]
    MissingDevice {
        /// Offending intent
        key: IntentKey,
        /// Missing device
        device: DeviceId,
    },
    /// The device reports ports and this is not one of them
    #[error("Intent {key} references missing port {point}")]
    MissingPort {
        /// Offending intent
        key: IntentKey,
        /// Missing connect point
        point: ConnectPoint,
    },
    /// The topology does not know a link the intent traverses
    #[error("Intent {key} references missing link {link}")]
    MissingLink {
        /// Offending intent
        key: IntentKey,
        /// Missing link
        link: LinkKey,
    },
}

impl CompilationError {
    /// Intent the error is about
    pub fn key(&self) -> &IntentKey {
        match self {
            Self::EmptyIntent { key, .. }
            | Self::Unreachable { key, .. }
            | Self::MissingDevice { key, .. }
            | Self::MissingPort { key, .. }
            | Self::MissingLink { key, .. } => key,
        }
    }
}

impl From<CompilationError> for MeridianError {
    fn from(err: CompilationError) -> Self {
        MeridianError::compilation(err.to_string())
    }
}

/// Standard Result type for intent operations
pub type Result<T> = std::result::Result<T, CompilationError>;
