//! Eventually consistent map
//!
//! Every node holds a full replica. Writes are stamped by the map's
//! [`TimestampProvider`], applied locally at once, queued for push to peers,
//! and repaired by periodic anti-entropy. Reads never touch the network.
//!
//! Per key, an incoming entry replaces the stored one when it is strictly
//! newer. At equal timestamps a tombstone beats a value, and between two values
//! the one with the larger payload fingerprint wins. The order is total, so
//! replicas that have seen the same set of entries hold the same state
//! regardless of delivery order.
//!
//! Removals leave tombstones so a late, older write cannot resurrect a key.
//! A tombstone is purged once every peer is known to hold it or to lack the
//! key; peers learn this from digest exchanges and acknowledged pushes.

use crate::errors::{MapError, Result, TransportError};
use crate::messages::{
    map_schemas, AntiEntropyDigest, AntiEntropyReply, Fingerprint, MapEntry, MapKey, MapValue,
    UpdateBatch, TOMBSTONE_FINGERPRINT,
};
use crate::transport::{ClusterTransport, MessageHandler};
use async_trait::async_trait;
use meridian_core::serialization::SchemaRegistry;
use meridian_core::{
    LogicalClock, LogicalTimestamp, MapConfig, NodeId, SerializationError, TimestampProvider,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Change to the visible contents of a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent<K, V> {
    /// `key` now maps to `value`
    Put {
        /// Key
        key: K,
        /// New value
        value: V,
    },
    /// `key` was removed
    Remove {
        /// Key
        key: K,
        /// Value before removal
        previous: V,
    },
}

impl<K, V> MapEvent<K, V> {
    /// Key the event concerns
    pub fn key(&self) -> &K {
        match self {
            Self::Put { key, .. } | Self::Remove { key, .. } => key,
        }
    }
}

/// BLAKE3 hash of the bincode encoding of `value`
pub fn fingerprint<V: Serialize>(value: Option<&V>) -> Result<Fingerprint> {
    let Some(value) = value else {
        return Ok(TOMBSTONE_FINGERPRINT);
    };
    let bytes = bincode::serialize(value)
        .map_err(|e| SerializationError::InvalidFormat(e.to_string()))?;
    Ok(blake3::hash(&bytes).into())
}

/// Entry as held by a replica
struct Stored<V> {
    entry: MapEntry<V>,
    fingerprint: Fingerprint,
    /// Peers known to hold this tombstone or to lack the key
    seen_by: BTreeSet<NodeId>,
}

impl<V> Stored<V> {
    fn new(entry: MapEntry<V>, fingerprint: Fingerprint) -> Self {
        Self {
            entry,
            fingerprint,
            seen_by: BTreeSet::new(),
        }
    }

    /// True when `entry` (with `fingerprint`) replaces this one
    fn superseded_by(&self, entry: &MapEntry<V>, fingerprint: &Fingerprint) -> bool {
        match entry.timestamp.cmp(&self.entry.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (&entry.value, &self.entry.value) {
                (None, existing) => existing.is_some(),
                (Some(_), None) => false,
                (Some(_), Some(_)) => *fingerprint > self.fingerprint,
            },
        }
    }

    /// True when a peer advertising (`timestamp`, `fingerprint`) should get
    /// this entry
    fn ahead_of(&self, timestamp: &LogicalTimestamp, fingerprint: &Fingerprint) -> bool {
        match self.entry.timestamp.cmp(timestamp) {
            Ordering::Greater => true,
            Ordering::Equal => *fingerprint != self.fingerprint,
            Ordering::Less => false,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.entry.is_tombstone()
    }
}

struct Inner<K, V> {
    name: String,
    local: NodeId,
    items: RwLock<BTreeMap<K, Stored<V>>>,
    pending: Mutex<BTreeMap<K, MapEntry<V>>>,
    provider: Arc<dyn TimestampProvider<K, V>>,
    clock: Option<Arc<LogicalClock>>,
    events: broadcast::Sender<MapEvent<K, V>>,
    transport: Option<Arc<dyn ClusterTransport>>,
    registry: SchemaRegistry,
    fanout: usize,
    interval: Duration,
    round: AtomicUsize,
}

/// Builder for [`EventuallyConsistentMap`]
pub struct EventuallyConsistentMapBuilder<K, V> {
    name: String,
    provider: Arc<dyn TimestampProvider<K, V>>,
    clock: Option<Arc<LogicalClock>>,
    transport: Option<Arc<dyn ClusterTransport>>,
    registry: Option<SchemaRegistry>,
    config: MapConfig,
}

impl<K: MapKey, V: MapValue> EventuallyConsistentMapBuilder<K, V> {
    /// Replicate through `transport`; without one the map is node-local
    pub fn with_transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Advance `clock` past every timestamp received from peers
    pub fn with_clock(mut self, clock: Arc<LogicalClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Encode messages with `registry` instead of the map defaults
    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Anti-entropy and channel settings
    pub fn with_config(mut self, config: &MapConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Build the map and register its handlers with the transport
    pub fn build(self) -> EventuallyConsistentMap<K, V> {
        let (events, _) = broadcast::channel(self.config.event_channel_capacity.max(1));
        let local = self
            .transport
            .as_ref()
            .map(|t| t.local_node())
            .unwrap_or_else(|| NodeId::new("local"));
        let inner = Arc::new(Inner {
            name: self.name,
            local,
            items: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            provider: self.provider,
            clock: self.clock,
            events,
            transport: self.transport,
            registry: self.registry.unwrap_or_else(map_schemas),
            fanout: self.config.anti_entropy_fanout.max(1),
            interval: Duration::from_millis(self.config.anti_entropy_interval_ms),
            round: AtomicUsize::new(0),
        });

        if let Some(transport) = &inner.transport {
            let weak = Arc::downgrade(&inner);
            transport.register_handler(
                &inner.update_subject(),
                Arc::new(UpdateHandler { inner: weak.clone() }),
            );
            transport.register_handler(&inner.digest_subject(), Arc::new(DigestHandler { inner: weak }));
        }

        EventuallyConsistentMap { inner }
    }
}

/// Last-writer-wins replicated map with anti-entropy
pub struct EventuallyConsistentMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for EventuallyConsistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: MapKey, V: MapValue> EventuallyConsistentMap<K, V> {
    /// Start building map `name` stamped by `provider`
    pub fn builder(
        name: impl Into<String>,
        provider: impl TimestampProvider<K, V> + 'static,
    ) -> EventuallyConsistentMapBuilder<K, V> {
        EventuallyConsistentMapBuilder {
            name: name.into(),
            provider: Arc::new(provider),
            clock: None,
            transport: None,
            registry: None,
            config: MapConfig::default(),
        }
    }

    /// Map name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Node holding this replica
    pub fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    /// Current value for `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .items
            .read()
            .get(key)
            .and_then(|s| s.entry.value.clone())
    }

    /// True when `key` maps to a live value
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Timestamp of the entry (or tombstone) stored for `key`
    pub fn timestamp_of(&self, key: &K) -> Option<LogicalTimestamp> {
        self.inner
            .items
            .read()
            .get(key)
            .map(|s| s.entry.timestamp.clone())
    }

    /// Write `value` locally and queue it for peers; returns the previous value
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let timestamp = self.inner.provider.timestamp(&key, Some(&value));
        self.inner.apply_local(key, MapEntry::value(value, timestamp))
    }

    /// Remove `key` locally and queue the tombstone; returns the removed value
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let timestamp = self.inner.provider.timestamp(key, None);
        self.inner.apply_local(key.clone(), MapEntry::tombstone(timestamp))
    }

    /// Live entries in key order
    pub fn entry_set(&self) -> Vec<(K, V)> {
        self.inner
            .items
            .read()
            .iter()
            .filter_map(|(k, s)| s.entry.value.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Live keys in order
    pub fn keys(&self) -> Vec<K> {
        self.entry_set().into_iter().map(|(k, _)| k).collect()
    }

    /// Live values in key order
    pub fn values(&self) -> Vec<V> {
        self.entry_set().into_iter().map(|(_, v)| v).collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner
            .items
            .read()
            .values()
            .filter(|s| !s.is_tombstone())
            .count()
    }

    /// True when no live entries exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones still held
    pub fn tombstones(&self) -> usize {
        self.inner
            .items
            .read()
            .values()
            .filter(|s| s.is_tombstone())
            .count()
    }

    /// Receive an event for every visible change
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent<K, V>> {
        self.inner.events.subscribe()
    }

    /// Merge entries received from elsewhere; returns how many were applied
    pub fn merge(&self, entries: Vec<(K, MapEntry<V>)>) -> Result<usize> {
        self.inner.merge_remote(entries)
    }

    /// Summary of every stored entry for anti-entropy
    pub fn digest(&self) -> AntiEntropyDigest<K> {
        self.inner.digest()
    }

    /// Push queued local writes to every peer.
    ///
    /// Unreachable peers are skipped; anti-entropy repairs them later.
    pub async fn flush(&self) -> Result<()> {
        let Some(transport) = &self.inner.transport else {
            self.inner.pending.lock().clear();
            return Ok(());
        };
        let entries: Vec<_> = std::mem::take(&mut *self.inner.pending.lock())
            .into_iter()
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        let removals: Vec<(K, LogicalTimestamp)> = entries
            .iter()
            .filter(|(_, entry)| entry.is_tombstone())
            .map(|(key, entry)| (key.clone(), entry.timestamp.clone()))
            .collect();
        let frame = self.inner.registry.encode(&UpdateBatch { entries })?;
        let subject = self.inner.update_subject();
        let sends = transport
            .peers()
            .into_iter()
            .map(|peer| {
                let frame = frame.clone();
                let subject = subject.clone();
                async move {
                    let result = transport.request(&peer, &subject, frame).await;
                    (peer, result)
                }
            })
            .collect::<Vec<_>>();
        for (peer, result) in futures::future::join_all(sends).await {
            match result {
                Ok(_) => self.inner.mark_seen(&peer, &removals),
                Err(error) => {
                    tracing::debug!(map = %self.inner.name, peer = %peer, error = %error, "update push failed");
                }
            }
        }
        Ok(())
    }

    /// Reconcile with up to `anti_entropy_fanout` peers, then purge the
    /// tombstones every peer has seen; returns entries applied
    pub async fn anti_entropy_round(&self) -> Result<usize> {
        let Some(transport) = &self.inner.transport else {
            return Ok(0);
        };
        let peers = transport.peers();
        if peers.is_empty() {
            return Ok(0);
        }

        let round = self.inner.round.fetch_add(1, AtomicOrdering::Relaxed);
        let count = self.inner.fanout.min(peers.len());
        let mut applied = 0;
        for i in 0..count {
            let peer = &peers[(round * count + i) % peers.len()];
            match self.reconcile_with(transport.as_ref(), peer).await {
                Ok(n) => applied += n,
                Err(error) => {
                    tracing::debug!(map = %self.inner.name, peer = %peer, error = %error, "anti-entropy round failed");
                }
            }
        }
        self.purge_tombstones();
        Ok(applied)
    }

    /// Drop tombstones that every current peer holds or has no entry for;
    /// returns how many were dropped
    pub fn purge_tombstones(&self) -> usize {
        let peers: Vec<NodeId> = self
            .inner
            .transport
            .as_ref()
            .map(|t| t.peers())
            .unwrap_or_default();
        let mut items = self.inner.items.write();
        let before = items.len();
        items.retain(|_, stored| {
            !(stored.is_tombstone() && peers.iter().all(|peer| stored.seen_by.contains(peer)))
        });
        let purged = before - items.len();
        if purged > 0 {
            tracing::debug!(map = %self.inner.name, purged, "purged tombstones");
        }
        purged
    }

    async fn reconcile_with(&self, transport: &dyn ClusterTransport, peer: &NodeId) -> Result<usize> {
        let digest = self.inner.digest();
        let frame = self.inner.registry.encode(&digest)?;
        let reply = transport
            .request(peer, &self.inner.digest_subject(), frame)
            .await
            .map_err(|source| MapError::Protocol(source.to_string()))?;
        let reply: AntiEntropyReply<K, V> = self.inner.registry.decode(&reply)?;

        // Tombstones the peer neither corrected nor asked for are in sync there
        let divergent: BTreeSet<&K> = reply
            .updates
            .iter()
            .map(|(key, _)| key)
            .chain(&reply.wanted)
            .collect();
        let in_sync: Vec<(K, LogicalTimestamp)> = digest
            .entries
            .iter()
            .filter(|(key, _, fp)| *fp == TOMBSTONE_FINGERPRINT && !divergent.contains(key))
            .map(|(key, ts, _)| (key.clone(), ts.clone()))
            .collect();
        self.inner.mark_seen(peer, &in_sync);

        let applied = self.inner.merge_remote(reply.updates)?;
        if !reply.wanted.is_empty() {
            let entries: Vec<_> = {
                let items = self.inner.items.read();
                reply
                    .wanted
                    .into_iter()
                    .filter_map(|k| items.get(&k).map(|s| (k, s.entry.clone())))
                    .collect()
            };
            let removals: Vec<(K, LogicalTimestamp)> = entries
                .iter()
                .filter(|(_, entry)| entry.is_tombstone())
                .map(|(key, entry)| (key.clone(), entry.timestamp.clone()))
                .collect();
            let frame = self.inner.registry.encode(&UpdateBatch { entries })?;
            transport
                .request(peer, &self.inner.update_subject(), frame)
                .await
                .map_err(|source| MapError::Protocol(source.to_string()))?;
            self.inner.mark_seen(peer, &removals);
        }
        tracing::debug!(map = %self.inner.name, peer = %peer, applied, "anti-entropy reconciled");
        Ok(applied)
    }

    /// Run push and anti-entropy every `anti_entropy_interval_ms` until aborted
    pub fn spawn_background(&self) -> tokio::task::JoinHandle<()> {
        let map = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(map.inner.interval);
            loop {
                ticker.tick().await;
                if let Err(error) = map.flush().await {
                    tracing::warn!(map = %map.inner.name, error = %error, "flush failed");
                }
                if let Err(error) = map.anti_entropy_round().await {
                    tracing::warn!(map = %map.inner.name, error = %error, "anti-entropy failed");
                }
            }
        })
    }
}

impl<K: MapKey, V: MapValue> Inner<K, V> {
    fn update_subject(&self) -> String {
        format!("ecmap/{}/update", self.name)
    }

    fn digest_subject(&self) -> String {
        format!("ecmap/{}/digest", self.name)
    }

    fn apply_local(&self, key: K, entry: MapEntry<V>) -> Result<Option<V>> {
        let (applied, previous) = self.apply(key.clone(), entry.clone())?;
        if applied {
            self.pending.lock().insert(key, entry);
        } else {
            tracing::debug!(map = %self.name, key = ?key, "local write older than stored entry");
        }
        Ok(previous)
    }

    /// Apply one entry; returns whether it was stored and the previously
    /// visible value
    fn apply(&self, key: K, entry: MapEntry<V>) -> Result<(bool, Option<V>)> {
        let fingerprint = fingerprint(entry.value.as_ref())?;
        let mut items = self.items.write();
        let previous = items.get(&key).and_then(|s| s.entry.value.clone());
        if let Some(existing) = items.get(&key) {
            if !existing.superseded_by(&entry, &fingerprint) {
                return Ok((false, previous));
            }
        }

        let event = match (&previous, &entry.value) {
            (old, Some(new)) if old.as_ref() != Some(new) => Some(MapEvent::Put {
                key: key.clone(),
                value: new.clone(),
            }),
            (Some(old), None) => Some(MapEvent::Remove {
                key: key.clone(),
                previous: old.clone(),
            }),
            _ => None,
        };
        items.insert(key, Stored::new(entry, fingerprint));
        drop(items);

        if let Some(event) = event {
            // No subscribers is not an error
            let _ = self.events.send(event);
        }
        Ok((true, previous))
    }

    fn merge_remote(&self, entries: Vec<(K, MapEntry<V>)>) -> Result<usize> {
        let mut applied = 0;
        for (key, entry) in entries {
            if let Some(clock) = &self.clock {
                clock.observe(&entry.timestamp);
            }
            if self.apply(key, entry)?.0 {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Note that `peer` holds the tombstones written at the given stamps
    fn mark_seen(&self, peer: &NodeId, removals: &[(K, LogicalTimestamp)]) {
        if removals.is_empty() {
            return;
        }
        let mut items = self.items.write();
        for (key, timestamp) in removals {
            if let Some(stored) = items.get_mut(key) {
                if stored.is_tombstone() && stored.entry.timestamp == *timestamp {
                    stored.seen_by.insert(peer.clone());
                }
            }
        }
    }

    fn digest(&self) -> AntiEntropyDigest<K> {
        AntiEntropyDigest {
            entries: self
                .items
                .read()
                .iter()
                .map(|(k, s)| (k.clone(), s.entry.timestamp.clone(), s.fingerprint))
                .collect(),
        }
    }

    /// Compare a digest sent by `from` with the local replica.
    ///
    /// Tombstones are neither sent to nor requested from a side that has no
    /// entry for the key: absent and removed look the same to readers.
    fn answer_digest(&self, from: &NodeId, remote: AntiEntropyDigest<K>) -> AntiEntropyReply<K, V> {
        let mut items = self.items.write();
        let remote: BTreeMap<K, (LogicalTimestamp, Fingerprint)> = remote
            .entries
            .into_iter()
            .map(|(k, ts, fp)| (k, (ts, fp)))
            .collect();

        let mut updates = Vec::new();
        for (key, stored) in items.iter_mut() {
            let (send, in_sync) = match remote.get(key) {
                None => (!stored.is_tombstone(), true),
                Some((ts, fp)) => {
                    let ahead = stored.ahead_of(ts, fp);
                    (ahead, !ahead && *ts == stored.entry.timestamp)
                }
            };
            if send {
                updates.push((key.clone(), stored.entry.clone()));
            } else if in_sync && stored.is_tombstone() {
                stored.seen_by.insert(from.clone());
            }
        }

        let wanted = remote
            .iter()
            .filter(|(key, (ts, fp))| match items.get(*key) {
                None => *fp != TOMBSTONE_FINGERPRINT,
                Some(stored) => match ts.cmp(&stored.entry.timestamp) {
                    Ordering::Greater => true,
                    Ordering::Equal => *fp != stored.fingerprint,
                    Ordering::Less => false,
                },
            })
            .map(|(key, _)| key.clone())
            .collect();

        AntiEntropyReply { updates, wanted }
    }
}

fn handler_failure(peer: NodeId, reason: impl ToString) -> TransportError {
    TransportError::HandlerFailed {
        peer,
        reason: reason.to_string(),
    }
}

struct UpdateHandler<K, V> {
    inner: Weak<Inner<K, V>>,
}

#[async_trait]
impl<K: MapKey, V: MapValue> MessageHandler for UpdateHandler<K, V> {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| handler_failure(from.clone(), "map dropped"))?;
        let batch: UpdateBatch<K, V> = inner
            .registry
            .decode(&payload)
            .map_err(|e| handler_failure(inner.local.clone(), e))?;
        let applied = inner
            .merge_remote(batch.entries)
            .map_err(|e| handler_failure(inner.local.clone(), e))?;
        tracing::debug!(map = %inner.name, from = %from, applied, "merged pushed updates");
        Ok(Vec::new())
    }
}

struct DigestHandler<K, V> {
    inner: Weak<Inner<K, V>>,
}

#[async_trait]
impl<K: MapKey, V: MapValue> MessageHandler for DigestHandler<K, V> {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| handler_failure(from.clone(), "map dropped"))?;
        let digest: AntiEntropyDigest<K> = inner
            .registry
            .decode(&payload)
            .map_err(|e| handler_failure(inner.local.clone(), e))?;
        let reply = inner.answer_digest(from, digest);
        inner
            .registry
            .encode(&reply)
            .map_err(|e| handler_failure(inner.local.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;

    fn ts(logical: u64, node: &str) -> LogicalTimestamp {
        LogicalTimestamp::new(logical, NodeId::new(node))
    }

    fn local_map() -> EventuallyConsistentMap<String, String> {
        let clock = Arc::new(LogicalClock::new(NodeId::new("n1")));
        EventuallyConsistentMap::builder(
            "hosts",
            meridian_core::ClockTimestampProvider::new(Arc::clone(&clock)),
        )
        .with_clock(clock)
        .build()
    }

    fn networked(network: &InMemoryNetwork, name: &str) -> EventuallyConsistentMap<String, u32> {
        let node = NodeId::new(name);
        EventuallyConsistentMap::builder("cache", LogicalClock::new(node.clone()))
            .with_transport(network.join(node))
            .build()
    }

    #[test]
    fn test_put_get_remove() {
        let map = local_map();
        assert_eq!(map.put("a".into(), "1".into()).unwrap(), None);
        assert_eq!(map.put("a".into(), "2".into()).unwrap(), Some("1".into()));
        assert_eq!(map.get(&"a".to_string()), Some("2".into()));
        assert_eq!(map.remove(&"a".to_string()).unwrap(), Some("2".into()));
        assert!(map.is_empty());
        assert!(map.timestamp_of(&"a".to_string()).is_some());
        assert_eq!(map.tombstones(), 1);
    }

    #[test]
    fn test_older_entry_ignored() {
        let map = local_map();
        map.merge(vec![("a".into(), MapEntry::value("new".into(), ts(5, "n2")))])
            .unwrap();
        let applied = map
            .merge(vec![("a".into(), MapEntry::value("old".into(), ts(3, "n3")))])
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(map.get(&"a".to_string()), Some("new".into()));
    }

    #[test]
    fn test_tombstone_blocks_older_write() {
        let map = local_map();
        map.merge(vec![("a".into(), MapEntry::tombstone(ts(5, "n2")))])
            .unwrap();
        map.merge(vec![("a".into(), MapEntry::value("late".into(), ts(4, "n3")))])
            .unwrap();
        assert_eq!(map.get(&"a".to_string()), None);
    }

    #[test]
    fn test_equal_timestamp_tiebreak() {
        let x = ("a".to_string(), MapEntry::value("x".to_string(), ts(5, "n2")));
        let y = ("a".to_string(), MapEntry::value("y".to_string(), ts(5, "n2")));

        let forward = local_map();
        forward.merge(vec![x.clone(), y.clone()]).unwrap();
        let backward = local_map();
        backward.merge(vec![y, x]).unwrap();
        assert_eq!(forward.entry_set(), backward.entry_set());
        assert_eq!(forward.digest(), backward.digest());

        forward
            .merge(vec![("a".into(), MapEntry::tombstone(ts(5, "n2")))])
            .unwrap();
        assert_eq!(forward.get(&"a".to_string()), None);
    }

    #[test]
    fn test_fingerprint_is_blake3_of_encoding() {
        let value = 7u32;
        let expected: Fingerprint = blake3::hash(&bincode::serialize(&value).unwrap()).into();
        assert_eq!(fingerprint(Some(&value)).unwrap(), expected);
        assert_eq!(fingerprint::<u32>(None).unwrap(), TOMBSTONE_FINGERPRINT);
        assert_ne!(fingerprint(Some(&8u32)).unwrap(), expected);
    }

    #[test]
    fn test_events_only_on_visible_change() {
        let map = local_map();
        let mut events = map.subscribe();
        let entry = MapEntry::value("v".to_string(), ts(1, "n2"));
        map.merge(vec![("a".into(), entry.clone())]).unwrap();
        map.merge(vec![("a".into(), entry)]).unwrap();
        map.remove(&"a".to_string()).unwrap();
        map.remove(&"missing".to_string()).unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            MapEvent::Put {
                key: "a".into(),
                value: "v".into()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            MapEvent::Remove {
                key: "a".into(),
                previous: "v".into()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_clock_observes_remote_timestamps() {
        let clock = Arc::new(LogicalClock::new(NodeId::new("n1")));
        let map: EventuallyConsistentMap<String, u32> = EventuallyConsistentMap::builder(
            "ports",
            meridian_core::ClockTimestampProvider::new(Arc::clone(&clock)),
        )
        .with_clock(Arc::clone(&clock))
        .build();

        map.merge(vec![("a".into(), MapEntry::value(1, ts(40, "n2")))])
            .unwrap();
        map.put("a".into(), 2).unwrap();
        assert_eq!(map.get(&"a".to_string()), Some(2));
        assert!(clock.current() > 40);
    }

    #[tokio::test]
    async fn test_flush_pushes_to_peers() {
        let network = InMemoryNetwork::new();
        let maps: Vec<_> = ["n1", "n2", "n3"]
            .iter()
            .map(|n| networked(&network, n))
            .collect();

        maps[0].put("a".into(), 1).unwrap();
        maps[0].flush().await.unwrap();
        assert_eq!(maps[1].get(&"a".to_string()), Some(1));
        assert_eq!(maps[2].get(&"a".to_string()), Some(1));
    }

    #[tokio::test]
    async fn test_anti_entropy_repairs_partition() {
        let network = InMemoryNetwork::new();
        let a = networked(&network, "a");
        let b = networked(&network, "b");

        network.isolate(&NodeId::new("b"));
        a.put("only-a".into(), 1).unwrap();
        b.put("only-b".into(), 2).unwrap();
        a.flush().await.unwrap();
        b.flush().await.unwrap();
        assert!(b.get(&"only-a".to_string()).is_none());

        network.heal(&NodeId::new("b"));
        a.anti_entropy_round().await.unwrap();
        assert_eq!(a.entry_set(), b.entry_set());
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn test_tombstones_purged_once_every_peer_has_them() {
        let network = InMemoryNetwork::new();
        let a = networked(&network, "a");
        let b = networked(&network, "b");
        let key = "gone".to_string();

        a.put(key.clone(), 1).unwrap();
        a.flush().await.unwrap();
        a.remove(&key).unwrap();
        a.flush().await.unwrap();
        assert_eq!(b.get(&key), None);
        assert_eq!(b.tombstones(), 1);

        // a knows b acknowledged the push
        a.anti_entropy_round().await.unwrap();
        assert_eq!(a.tombstones(), 0);
        assert!(a.timestamp_of(&key).is_none());

        // b learns a no longer holds the key and does not hand it back
        b.anti_entropy_round().await.unwrap();
        assert_eq!(b.tombstones(), 0);
        a.anti_entropy_round().await.unwrap();
        assert!(a.digest().entries.is_empty());
        assert!(b.digest().entries.is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_kept_while_a_peer_is_unreachable() {
        let network = InMemoryNetwork::new();
        let a = networked(&network, "a");
        let b = networked(&network, "b");
        let c = networked(&network, "c");
        let key = "k".to_string();

        a.put(key.clone(), 1).unwrap();
        a.flush().await.unwrap();
        network.isolate(&NodeId::new("c"));
        a.remove(&key).unwrap();
        a.flush().await.unwrap();
        a.anti_entropy_round().await.unwrap();
        assert_eq!(a.tombstones(), 1);
        assert_eq!(c.get(&key), Some(1));

        network.heal(&NodeId::new("c"));
        for _ in 0..2 {
            a.anti_entropy_round().await.unwrap();
        }
        assert_eq!(c.get(&key), None);
        assert_eq!(b.get(&key), None);
        assert_eq!(a.tombstones(), 0);
    }
}
