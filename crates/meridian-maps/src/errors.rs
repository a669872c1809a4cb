//! Map and transport errors

use meridian_core::{MeridianError, NodeId, SerializationError};
use serde::{Deserialize, Serialize};

/// Errors surfaced by the cluster transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    /// The peer is not reachable from this node
    #[error("Peer {0} unreachable")]
    Unreachable(NodeId),
    /// The peer has no handler for the subject
    #[error("Peer {peer} has no handler for '{subject}'")]
    NoHandler {
        /// Target peer
        peer: NodeId,
        /// Message subject
        subject: String,
    },
    /// The peer's handler failed
    #[error("Handler on {peer} failed: {reason}")]
    HandlerFailed {
        /// Target peer
        peer: NodeId,
        /// Failure reason
        reason: String,
    },
}

/// Errors surfaced by distributed maps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum MapError {
    /// A majority did not acknowledge before the consensus deadline
    #[error("Consensus timeout after {timeout_ms}ms on map '{map}'")]
    ConsensusTimeout {
        /// Map name
        map: String,
        /// Deadline that elapsed
        timeout_ms: u64,
    },
    /// Too few replicas are reachable to form a majority
    #[error("Map '{map}' unavailable: {acked} of {required} required acknowledgements")]
    Unavailable {
        /// Map name
        map: String,
        /// Acknowledgements received
        acked: usize,
        /// Majority size
        required: usize,
    },
    /// The leader for the map could not be reached
    #[error("Leader of map '{map}' unreachable: {source}")]
    LeaderUnreachable {
        /// Map name
        map: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },
    /// Encoding or decoding a replicated entry failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),
    /// A peer replied with something this node cannot interpret
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl MapError {
    /// True when retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConsensusTimeout { .. } | Self::Unavailable { .. } | Self::LeaderUnreachable { .. }
        )
    }
}

impl From<MapError> for MeridianError {
    fn from(err: MapError) -> Self {
        if err.is_retryable() {
            MeridianError::unavailable(err.to_string())
        } else {
            match err {
                MapError::Serialization(e) => e.into(),
                other => MeridianError::internal(other.to_string()),
            }
        }
    }
}

/// Standard Result type for map operations
pub type Result<T> = std::result::Result<T, MapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_failures_are_retryable() {
        let timeout = MapError::ConsensusTimeout {
            map: "intents".into(),
            timeout_ms: 5,
        };
        let unavailable = MapError::Unavailable {
            map: "intents".into(),
            acked: 1,
            required: 2,
        };
        assert!(timeout.is_retryable());
        assert!(unavailable.is_retryable());
        assert!(MeridianError::from(unavailable).is_retryable());
        assert!(!MapError::Protocol("bad reply".into()).is_retryable());
    }
}
