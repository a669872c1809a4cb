//! Settable mastership for tests

use meridian_core::{DeviceId, MastershipEvent, MastershipOracle, NodeId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Mastership table shared by every node of an in-process cluster.
///
/// Each node gets its own view through [`FakeMastership::view`]; all views
/// observe the same table, so moving a device's master is seen cluster-wide.
#[derive(Debug)]
pub struct FakeMastership {
    local: NodeId,
    masters: Arc<RwLock<BTreeMap<DeviceId, NodeId>>>,
    events: broadcast::Sender<MastershipEvent>,
}

impl FakeMastership {
    /// Oracle for `local` with no masters assigned
    pub fn new(local: NodeId) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local,
            masters: Arc::new(RwLock::new(BTreeMap::new())),
            events,
        }
    }

    /// Oracle where `local` masters every listed device
    pub fn master_of(local: NodeId, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        let oracle = Self::new(local.clone());
        oracle
            .masters
            .write()
            .extend(devices.into_iter().map(|d| (d, local.clone())));
        oracle
    }

    /// Another node's view over the same table and event bus
    pub fn view(&self, local: NodeId) -> Self {
        Self {
            local,
            masters: Arc::clone(&self.masters),
            events: self.events.clone(),
        }
    }

    /// Move `device` to `master` and publish the change
    pub fn set_master(&self, device: DeviceId, master: Option<NodeId>) {
        {
            let mut masters = self.masters.write();
            match &master {
                Some(node) => masters.insert(device.clone(), node.clone()),
                None => masters.remove(&device),
            };
        }
        let _ = self.events.send(MastershipEvent {
            device_id: device,
            master,
        });
    }

    /// Current master of `device`
    pub fn master(&self, device: &DeviceId) -> Option<NodeId> {
        self.masters.read().get(device).cloned()
    }

    /// Mastership change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<MastershipEvent> {
        self.events.subscribe()
    }
}

impl MastershipOracle for FakeMastership {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn is_local_master(&self, device: &DeviceId) -> bool {
        self.masters.read().get(device) == Some(&self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::MastershipRole;

    #[test]
    fn test_views_share_the_table() {
        let n1 = FakeMastership::new(NodeId::new("n1"));
        let n2 = n1.view(NodeId::new("n2"));
        let device = DeviceId::new("of:1");
        let mut events = n2.subscribe();

        n1.set_master(device.clone(), Some(NodeId::new("n2")));
        assert!(n2.is_local_master(&device));
        assert_eq!(n1.role(&device), MastershipRole::Standby);
        assert!(events.try_recv().unwrap().is_master(&NodeId::new("n2")));
    }
}
