//! Per-device install progress
//!
//! Each master records how far it got on its own devices. Records live in an
//! eventually consistent map keyed by `(intent, device)`, so any node can
//! derive the overall state of an intent whose devices are spread over the
//! cluster.

use meridian_core::{ClockTimestampProvider, DeviceId, LogicalClock, MapConfig, NodeId};
use meridian_intent::IntentKey;
use meridian_maps::{ClusterTransport, EventuallyConsistentMap, MapError, MapEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Name of the replicated progress map
pub const PROGRESS_MAP: &str = "intent-install-progress";

/// Progress key
pub type ProgressKey = (IntentKey, DeviceId);

/// Where one device stands for one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceInstallState {
    /// The master is programming the device
    Installing,
    /// Every objective was acknowledged
    Installed,
    /// The retry budget ran out or the device rejected an objective
    Failed {
        /// Last driver error
        reason: String,
    },
    /// The intent's objectives were removed from the device
    Withdrawn,
}

/// Progress record written by a device's master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInstallRecord {
    /// State of the device
    pub state: DeviceInstallState,
    /// Node that wrote the record
    pub node: NodeId,
    /// Objectives the device should hold for the intent
    pub objectives: usize,
}

/// Overall state of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentInstallState {
    /// Compiled; no device has finished yet
    Installing,
    /// Some devices are done, others are still pending
    PartiallyInstalled,
    /// Every device holds its objectives
    Installed,
    /// Compilation failed or a device exhausted its retry budget
    Failed,
    /// The intent was withdrawn
    Withdrawn,
}

impl IntentInstallState {
    /// Combine the device states of an intent that spans `expected` devices
    pub fn derive<'a>(
        expected: &BTreeSet<DeviceId>,
        records: impl IntoIterator<Item = (&'a DeviceId, &'a DeviceInstallState)>,
    ) -> Self {
        let states: BTreeMap<&DeviceId, &DeviceInstallState> = records
            .into_iter()
            .filter(|(device, _)| expected.contains(*device))
            .collect();
        if states
            .values()
            .any(|state| matches!(state, DeviceInstallState::Failed { .. }))
        {
            return Self::Failed;
        }
        if !states.is_empty()
            && states
                .values()
                .all(|state| **state == DeviceInstallState::Withdrawn)
        {
            return Self::Withdrawn;
        }
        let installed = states
            .values()
            .filter(|state| ***state == DeviceInstallState::Installed)
            .count();
        match installed {
            0 => Self::Installing,
            n if n == expected.len() => Self::Installed,
            _ => Self::PartiallyInstalled,
        }
    }
}

impl fmt::Display for IntentInstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installing => "INSTALLING",
            Self::PartiallyInstalled => "PARTIALLY_INSTALLED",
            Self::Installed => "INSTALLED",
            Self::Failed => "FAILED",
            Self::Withdrawn => "WITHDRAWN",
        };
        f.write_str(name)
    }
}

/// Replicated install progress for every intent
#[derive(Clone)]
pub struct InstallProgress {
    map: EventuallyConsistentMap<ProgressKey, DeviceInstallRecord>,
}

impl InstallProgress {
    /// Wrap an existing map
    pub fn new(map: EventuallyConsistentMap<ProgressKey, DeviceInstallRecord>) -> Self {
        Self { map }
    }

    /// Progress replicated over `transport`, stamped by `clock`
    pub fn replicated(
        clock: Arc<LogicalClock>,
        transport: Arc<dyn ClusterTransport>,
        config: &MapConfig,
    ) -> Self {
        let map = EventuallyConsistentMap::builder(
            PROGRESS_MAP,
            ClockTimestampProvider::new(Arc::clone(&clock)),
        )
        .with_clock(clock)
        .with_transport(transport)
        .with_config(config)
        .build();
        Self::new(map)
    }

    /// Progress visible to this node only
    pub fn local(node: NodeId) -> Self {
        let clock = Arc::new(LogicalClock::new(node));
        let map = EventuallyConsistentMap::builder(
            PROGRESS_MAP,
            ClockTimestampProvider::new(Arc::clone(&clock)),
        )
        .with_clock(clock)
        .build();
        Self::new(map)
    }

    /// Underlying map, for replication tasks
    pub fn map(&self) -> &EventuallyConsistentMap<ProgressKey, DeviceInstallRecord> {
        &self.map
    }

    /// Store the record of `device` for `key`
    pub fn record(
        &self,
        key: &IntentKey,
        device: &DeviceId,
        record: DeviceInstallRecord,
    ) -> Result<(), MapError> {
        tracing::debug!(
            intent = %key,
            device = %device,
            state = ?record.state,
            "install progress"
        );
        self.map.put((key.clone(), device.clone()), record)?;
        Ok(())
    }

    /// Record of one device
    pub fn get(&self, key: &IntentKey, device: &DeviceId) -> Option<DeviceInstallRecord> {
        self.map.get(&(key.clone(), device.clone()))
    }

    /// Records of every device of `key`
    pub fn records(&self, key: &IntentKey) -> BTreeMap<DeviceId, DeviceInstallRecord> {
        self.map
            .entry_set()
            .into_iter()
            .filter(|((intent, _), _)| intent == key)
            .map(|((_, device), record)| (device, record))
            .collect()
    }

    /// Drop the record of `device` for `key`
    pub fn clear(&self, key: &IntentKey, device: &DeviceId) -> Result<(), MapError> {
        self.map.remove(&(key.clone(), device.clone()))?;
        Ok(())
    }

    /// Overall state of `key` across `devices`
    pub fn state(&self, key: &IntentKey, devices: &BTreeSet<DeviceId>) -> IntentInstallState {
        let records = self.records(key);
        IntentInstallState::derive(
            devices,
            records.iter().map(|(device, record)| (device, &record.state)),
        )
    }

    /// Record changes, local and replicated
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent<ProgressKey, DeviceInstallRecord>> {
        self.map.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::AppId;
    use proptest::prelude::*;

    fn d(n: u32) -> DeviceId {
        DeviceId::new(format!("of:{n}"))
    }

    fn record(state: DeviceInstallState) -> DeviceInstallRecord {
        DeviceInstallRecord {
            state,
            node: NodeId::new("n1"),
            objectives: 1,
        }
    }

    #[test]
    fn test_state_follows_device_records() {
        let progress = InstallProgress::local(NodeId::new("n1"));
        let key = IntentKey::new(AppId::new(1, "app"), 1);
        let devices = BTreeSet::from([d(1), d(2)]);
        assert_eq!(progress.state(&key, &devices), IntentInstallState::Installing);

        progress
            .record(&key, &d(1), record(DeviceInstallState::Installed))
            .unwrap();
        assert_eq!(
            progress.state(&key, &devices),
            IntentInstallState::PartiallyInstalled
        );

        progress
            .record(&key, &d(2), record(DeviceInstallState::Installed))
            .unwrap();
        assert_eq!(progress.state(&key, &devices), IntentInstallState::Installed);

        progress
            .record(
                &key,
                &d(2),
                record(DeviceInstallState::Failed {
                    reason: "rejected".into(),
                }),
            )
            .unwrap();
        assert_eq!(progress.state(&key, &devices), IntentInstallState::Failed);

        progress.clear(&key, &d(2)).unwrap();
        assert!(progress.get(&key, &d(2)).is_none());
        assert_eq!(progress.records(&key).len(), 1);
    }

    #[test]
    fn test_records_of_other_devices_ignored() {
        let key = IntentKey::new(AppId::new(1, "app"), 1);
        let stale = DeviceInstallState::Failed {
            reason: "old path".into(),
        };
        let installed = DeviceInstallState::Installed;
        let state = IntentInstallState::derive(
            &BTreeSet::from([d(1)]),
            [(&d(1), &installed), (&d(9), &stale)],
        );
        assert_eq!(state, IntentInstallState::Installed);
        assert_eq!(key.to_string(), "app/0x1");
    }

    #[test]
    fn test_all_withdrawn() {
        let withdrawn = DeviceInstallState::Withdrawn;
        let state = IntentInstallState::derive(
            &BTreeSet::from([d(1), d(2)]),
            [(&d(1), &withdrawn), (&d(2), &withdrawn)],
        );
        assert_eq!(state, IntentInstallState::Withdrawn);
        assert_eq!(state.to_string(), "WITHDRAWN");
    }

    fn state_of(code: u8) -> DeviceInstallState {
        match code {
            0 => DeviceInstallState::Installing,
            1 => DeviceInstallState::Installed,
            2 => DeviceInstallState::Withdrawn,
            _ => DeviceInstallState::Failed {
                reason: "timeout".into(),
            },
        }
    }

    proptest! {
        #[test]
        fn installed_only_when_every_device_is(codes in prop::collection::vec(0u8..4, 1..6)) {
            let devices: Vec<DeviceId> = (0..codes.len()).map(|i| d(i as u32)).collect();
            let states: Vec<DeviceInstallState> = codes.iter().map(|c| state_of(*c)).collect();
            let expected: BTreeSet<DeviceId> = devices.iter().cloned().collect();

            let derived = IntentInstallState::derive(&expected, devices.iter().zip(states.iter()));
            let all_installed = states.iter().all(|s| *s == DeviceInstallState::Installed);
            let any_failed = states
                .iter()
                .any(|s| matches!(s, DeviceInstallState::Failed { .. }));
            prop_assert_eq!(derived == IntentInstallState::Installed, all_installed);
            prop_assert_eq!(derived == IntentInstallState::Failed, any_failed);
        }
    }
}
