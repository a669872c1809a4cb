//! Installation and intent lifecycle errors

use meridian_core::MeridianError;
use meridian_intent::{CompilationError, IntentKey};
use meridian_maps::MapError;

/// Failures surfaced by [`crate::IntentManager`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    /// The intent registry could not commit or read
    #[error("Intent registry: {0}")]
    Registry(#[from] MapError),
    /// The intent does not compile against the current topology
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    /// No intent is registered under the key
    #[error("Intent {0} not found")]
    NotFound(IntentKey),
}

impl InstallError {
    /// True when retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registry(err) => err.is_retryable(),
            Self::Compilation(_) | Self::NotFound(_) => false,
        }
    }
}

impl From<InstallError> for MeridianError {
    fn from(err: InstallError) -> Self {
        match err {
            InstallError::Registry(err) => err.into(),
            InstallError::Compilation(err) => err.into(),
            InstallError::NotFound(key) => MeridianError::not_found(format!("intent {key}")),
        }
    }
}

/// Standard Result type for install operations
pub type Result<T> = std::result::Result<T, InstallError>;
