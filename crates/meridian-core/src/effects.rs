//! Capability traits for external collaborators
//!
//! Mastership and southbound programming are provided by the surrounding
//! platform. Components receive them as `Arc<dyn ...>` capability objects so
//! tests can inject deterministic fakes.
//!
//! # Effect Classification
//!
//! - **Mastership**: synchronous query, answered from locally cached role state
//! - **Objective installation**: asynchronous, completes when the device acks

use crate::flow::ForwardingObjective;
use crate::identifiers::{DeviceId, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role of the local node for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MastershipRole {
    /// Exclusive writer for the device
    Master,
    /// Replica that may take over
    Standby,
    /// No relationship with the device
    None,
}

/// Notification that the master of a device changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MastershipEvent {
    /// Affected device
    pub device_id: DeviceId,
    /// New master, or `None` while the device has no master
    pub master: Option<NodeId>,
}

impl MastershipEvent {
    /// True when `node` is the new master
    pub fn is_master(&self, node: &NodeId) -> bool {
        self.master.as_ref() == Some(node)
    }
}

/// Per-device write authority of the local node.
pub trait MastershipOracle: Send + Sync {
    /// Identity of the local node
    fn local_node(&self) -> NodeId;

    /// True when the local node may originate southbound writes for `device`
    fn is_local_master(&self, device: &DeviceId) -> bool;

    /// Role of the local node for `device`
    fn role(&self, device: &DeviceId) -> MastershipRole {
        if self.is_local_master(device) {
            MastershipRole::Master
        } else {
            MastershipRole::Standby
        }
    }
}

impl<T: MastershipOracle + ?Sized> MastershipOracle for Arc<T> {
    fn local_node(&self) -> NodeId {
        (**self).local_node()
    }

    fn is_local_master(&self, device: &DeviceId) -> bool {
        (**self).is_local_master(device)
    }

    fn role(&self, device: &DeviceId) -> MastershipRole {
        (**self).role(device)
    }
}

/// Southbound programming failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ObjectiveError {
    /// The device did not acknowledge in time
    #[error("Device {device} did not acknowledge within {timeout_ms}ms")]
    Timeout {
        /// Target device
        device: DeviceId,
        /// Deadline that elapsed
        timeout_ms: u64,
    },
    /// The device or its driver is temporarily unreachable
    #[error("Device {device} unreachable: {reason}")]
    Unreachable {
        /// Target device
        device: DeviceId,
        /// Driver-supplied reason
        reason: String,
    },
    /// The device rejected the objective; resubmitting will not help
    #[error("Device {device} rejected objective: {reason}")]
    Rejected {
        /// Target device
        device: DeviceId,
        /// Driver-supplied reason
        reason: String,
    },
}

impl ObjectiveError {
    /// True when resubmitting the same objective may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Device the failure concerns
    pub fn device(&self) -> &DeviceId {
        match self {
            Self::Timeout { device, .. }
            | Self::Unreachable { device, .. }
            | Self::Rejected { device, .. } => device,
        }
    }
}

impl From<ObjectiveError> for crate::MeridianError {
    fn from(err: ObjectiveError) -> Self {
        crate::MeridianError::install(err.to_string())
    }
}

/// Device driver capability accepting forwarding objectives.
#[async_trait]
pub trait ObjectiveInstaller: Send + Sync {
    /// Apply `objective` to `device`; resolves once the device acknowledges
    async fn forward(
        &self,
        device: &DeviceId,
        objective: &ForwardingObjective,
    ) -> Result<(), ObjectiveError>;
}

#[async_trait]
impl<T: ObjectiveInstaller + ?Sized> ObjectiveInstaller for Arc<T> {
    async fn forward(
        &self,
        device: &DeviceId,
        objective: &ForwardingObjective,
    ) -> Result<(), ObjectiveError> {
        (**self).forward(device, objective).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(NodeId);

    impl MastershipOracle for Fixed {
        fn local_node(&self) -> NodeId {
            self.0.clone()
        }

        fn is_local_master(&self, device: &DeviceId) -> bool {
            device.as_str().ends_with('1')
        }
    }

    #[test]
    fn test_default_role_follows_mastership() {
        let oracle: Arc<dyn MastershipOracle> = Arc::new(Fixed(NodeId::new("n1")));
        assert_eq!(oracle.role(&DeviceId::new("of:1")), MastershipRole::Master);
        assert_eq!(oracle.role(&DeviceId::new("of:2")), MastershipRole::Standby);
    }

    #[test]
    fn test_rejection_not_retryable() {
        let device = DeviceId::new("of:1");
        let rejected = ObjectiveError::Rejected {
            device: device.clone(),
            reason: "table full".into(),
        };
        let timeout = ObjectiveError::Timeout {
            device: device.clone(),
            timeout_ms: 10,
        };
        assert!(!rejected.is_retryable());
        assert!(timeout.is_retryable());
        assert_eq!(timeout.device(), &device);
    }

    #[test]
    fn test_event_names_master() {
        let event = MastershipEvent {
            device_id: DeviceId::new("of:1"),
            master: Some(NodeId::new("n2")),
        };
        assert!(event.is_master(&NodeId::new("n2")));
        assert!(!event.is_master(&NodeId::new("n1")));
    }
}
