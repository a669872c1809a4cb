//! Gossip replication of the topology store between cluster nodes
//!
//! Two paths keep replicas aligned:
//!
//! - **Push**: after a local change the owner pushes the device's full
//!   [`DeviceDescriptions`] to every peer, or a removal notice.
//! - **Anti-entropy**: each round a node advertises a [`DeviceDigest`] per
//!   device to a few peers, hashing the device and every port separately. The
//!   peer answers with full descriptions for devices where it holds a
//!   fragment the advertiser lacks or holds differently, and names the
//!   devices where the advertiser has such a fragment. Receivers join every
//!   re-push fragment by fragment, so disjoint port updates on two replicas
//!   end up on both.
//!
//! Removals are not remembered. A peer that still holds a removed device
//! re-pushes it on the next round and the device reappears.

use crate::device_descriptions::{DeviceDescriptions, DeviceDigest};
use crate::errors::{Result, TopologyError};
use crate::store::TopologyStore;
use async_trait::async_trait;
use meridian_core::serialization::{Schema, SchemaRegistry};
use meridian_core::{DeviceId, MapConfig, NodeId};
use meridian_maps::{ClusterTransport, MessageHandler, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// First schema id of the topology message block
pub const TOPOLOGY_SCHEMA_BASE: u32 = 200;

const ADVERTISE_SUBJECT: &str = "topology/advertise";
const RESYNC_SUBJECT: &str = "topology/resync";
const REMOVE_SUBJECT: &str = "topology/remove";

/// Digest of every device the sender holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyAdvertisement {
    /// Device digests of the sender
    pub devices: BTreeMap<DeviceId, DeviceDigest>,
}

impl Schema for TopologyAdvertisement {
    const NAME: &'static str = "meridian.topology.Advertisement";
}

/// Answer to an advertisement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementReply {
    /// Devices the answering node has fragments to offer for
    pub resync: Vec<DeviceDescriptions>,
    /// Devices the advertiser has fragments to offer for
    pub wanted: Vec<DeviceId>,
}

impl Schema for AdvertisementReply {
    const NAME: &'static str = "meridian.topology.AdvertisementReply";
}

/// Full re-push of one or more devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResync {
    /// Device replicas
    pub descriptions: Vec<DeviceDescriptions>,
}

impl Schema for DeviceResync {
    const NAME: &'static str = "meridian.topology.DeviceResync";
}

/// Administrative removal of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRemoval {
    /// Removed device
    pub device_id: DeviceId,
}

impl Schema for DeviceRemoval {
    const NAME: &'static str = "meridian.topology.DeviceRemoval";
}

/// Schema block for topology replication messages
pub fn topology_schemas() -> SchemaRegistry {
    SchemaRegistry::builder()
        .next_id(TOPOLOGY_SCHEMA_BASE)
        .register::<TopologyAdvertisement>()
        .register::<AdvertisementReply>()
        .register::<DeviceResync>()
        .register::<DeviceRemoval>()
        .build()
}

fn replication_error(err: impl ToString) -> TopologyError {
    TopologyError::Replication(err.to_string())
}

struct ReplicatorInner {
    store: Arc<TopologyStore>,
    transport: Arc<dyn ClusterTransport>,
    registry: SchemaRegistry,
    fanout: usize,
    interval: Duration,
    round: AtomicUsize,
}

impl ReplicatorInner {
    fn answer(&self, remote: TopologyAdvertisement) -> Result<AdvertisementReply> {
        let local = self.store.advertisement()?;
        let resync = local
            .iter()
            .filter(|(id, ours)| remote.devices.get(*id).map_or(true, |theirs| ours.offers_to(theirs)))
            .filter_map(|(id, _)| self.store.device_descriptions(id))
            .collect();
        let wanted = remote
            .devices
            .into_iter()
            .filter(|(id, theirs)| local.get(id).map_or(true, |ours| theirs.offers_to(ours)))
            .map(|(id, _)| id)
            .collect();
        Ok(AdvertisementReply { resync, wanted })
    }

    fn apply(&self, descriptions: Vec<DeviceDescriptions>) -> usize {
        descriptions
            .into_iter()
            .map(|descs| self.store.apply_resync(descs).len())
            .sum()
    }

    async fn broadcast(&self, subject: &str, frame: Vec<u8>) -> usize {
        let sends = self.transport.peers().into_iter().map(|peer| {
            let frame = frame.clone();
            async move {
                let result = self.transport.request(&peer, subject, frame).await;
                (peer, result)
            }
        });
        let mut delivered = 0;
        for (peer, result) in futures::future::join_all(sends).await {
            match result {
                Ok(_) => delivered += 1,
                Err(error) => {
                    tracing::debug!(peer = %peer, subject, error = %error, "topology push failed");
                }
            }
        }
        delivered
    }
}

/// Replicates a [`TopologyStore`] over a [`ClusterTransport`]
#[derive(Clone)]
pub struct TopologyReplicator {
    inner: Arc<ReplicatorInner>,
}

impl TopologyReplicator {
    /// Attach `store` to the cluster and start answering peers
    pub fn new(
        store: Arc<TopologyStore>,
        transport: Arc<dyn ClusterTransport>,
        config: &MapConfig,
    ) -> Self {
        let inner = Arc::new(ReplicatorInner {
            store,
            transport,
            registry: topology_schemas(),
            fanout: config.anti_entropy_fanout.max(1),
            interval: Duration::from_millis(config.anti_entropy_interval_ms.max(1)),
            round: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&inner);
        inner.transport.register_handler(
            ADVERTISE_SUBJECT,
            Arc::new(AdvertiseHandler { inner: weak.clone() }),
        );
        inner
            .transport
            .register_handler(RESYNC_SUBJECT, Arc::new(ResyncHandler { inner: weak.clone() }));
        inner
            .transport
            .register_handler(REMOVE_SUBJECT, Arc::new(RemoveHandler { inner: weak }));
        Self { inner }
    }

    /// Local node
    pub fn local_node(&self) -> NodeId {
        self.inner.transport.local_node()
    }

    /// Push the full local replica of a device to every peer; returns the
    /// number of peers reached
    pub async fn push_device(&self, device_id: &DeviceId) -> Result<usize> {
        let Some(descs) = self.inner.store.device_descriptions(device_id) else {
            return Err(TopologyError::UnknownDevice(device_id.clone()));
        };
        let frame = self
            .inner
            .registry
            .encode(&DeviceResync {
                descriptions: vec![descs],
            })
            .map_err(replication_error)?;
        Ok(self.inner.broadcast(RESYNC_SUBJECT, frame).await)
    }

    /// Tell every peer a device was removed; returns the number reached
    pub async fn push_removal(&self, device_id: &DeviceId) -> Result<usize> {
        let frame = self
            .inner
            .registry
            .encode(&DeviceRemoval {
                device_id: device_id.clone(),
            })
            .map_err(replication_error)?;
        Ok(self.inner.broadcast(REMOVE_SUBJECT, frame).await)
    }

    /// Reconcile with up to `anti_entropy_fanout` peers; returns the number
    /// of events the round produced locally
    pub async fn anti_entropy_round(&self) -> Result<usize> {
        let peers = self.inner.transport.peers();
        if peers.is_empty() {
            return Ok(0);
        }
        let round = self.inner.round.fetch_add(1, Ordering::Relaxed);
        let count = self.inner.fanout.min(peers.len());
        let mut applied = 0;
        for i in 0..count {
            let peer = &peers[(round * count + i) % peers.len()];
            match self.reconcile_with(peer).await {
                Ok(n) => applied += n,
                Err(error) => {
                    tracing::debug!(peer = %peer, error = %error, "topology anti-entropy failed");
                }
            }
        }
        Ok(applied)
    }

    async fn reconcile_with(&self, peer: &NodeId) -> Result<usize> {
        let inner = &self.inner;
        let advertisement = TopologyAdvertisement {
            devices: inner.store.advertisement()?,
        };
        let frame = inner.registry.encode(&advertisement).map_err(replication_error)?;
        let reply = inner
            .transport
            .request(peer, ADVERTISE_SUBJECT, frame)
            .await
            .map_err(replication_error)?;
        let reply: AdvertisementReply = inner.registry.decode(&reply).map_err(replication_error)?;

        let applied = inner.apply(reply.resync);
        let descriptions: Vec<_> = reply
            .wanted
            .iter()
            .filter_map(|id| inner.store.device_descriptions(id))
            .collect();
        if !descriptions.is_empty() {
            let frame = inner
                .registry
                .encode(&DeviceResync { descriptions })
                .map_err(replication_error)?;
            inner
                .transport
                .request(peer, RESYNC_SUBJECT, frame)
                .await
                .map_err(replication_error)?;
        }
        tracing::debug!(peer = %peer, applied, "topology reconciled");
        Ok(applied)
    }

    /// Run anti-entropy every `anti_entropy_interval_ms` until aborted
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let replicator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(replicator.inner.interval);
            loop {
                ticker.tick().await;
                if let Err(error) = replicator.anti_entropy_round().await {
                    tracing::warn!(error = %error, "topology anti-entropy round failed");
                }
            }
        })
    }
}

fn handler_failure(peer: &NodeId, reason: impl ToString) -> TransportError {
    TransportError::HandlerFailed {
        peer: peer.clone(),
        reason: reason.to_string(),
    }
}

fn upgrade(inner: &Weak<ReplicatorInner>, from: &NodeId) -> std::result::Result<Arc<ReplicatorInner>, TransportError> {
    inner
        .upgrade()
        .ok_or_else(|| handler_failure(from, "topology replicator dropped"))
}

struct AdvertiseHandler {
    inner: Weak<ReplicatorInner>,
}

#[async_trait]
impl MessageHandler for AdvertiseHandler {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = upgrade(&self.inner, from)?;
        let local = inner.transport.local_node();
        let advertisement: TopologyAdvertisement = inner
            .registry
            .decode(&payload)
            .map_err(|e| handler_failure(&local, e))?;
        let reply = inner.answer(advertisement).map_err(|e| handler_failure(&local, e))?;
        inner
            .registry
            .encode(&reply)
            .map_err(|e| handler_failure(&local, e))
    }
}

struct ResyncHandler {
    inner: Weak<ReplicatorInner>,
}

#[async_trait]
impl MessageHandler for ResyncHandler {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = upgrade(&self.inner, from)?;
        let resync: DeviceResync = inner
            .registry
            .decode(&payload)
            .map_err(|e| handler_failure(&inner.transport.local_node(), e))?;
        let applied = inner.apply(resync.descriptions);
        tracing::debug!(from = %from, applied, "applied topology re-push");
        Ok(Vec::new())
    }
}

struct RemoveHandler {
    inner: Weak<ReplicatorInner>,
}

#[async_trait]
impl MessageHandler for RemoveHandler {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = upgrade(&self.inner, from)?;
        let removal: DeviceRemoval = inner
            .registry
            .decode(&payload)
            .map_err(|e| handler_failure(&inner.transport.local_node(), e))?;
        if inner.store.remove_device(&removal.device_id).is_some() {
            tracing::info!(device = %removal.device_id, from = %from, "device removed by peer");
        }
        Ok(Vec::new())
    }
}
