//! Strongly consistent map
//!
//! Every operation is executed by the map's leader node. Mutations are
//! assigned a log index, pushed to the other members, and applied only once a
//! majority (the leader included) has accepted the entry. A mutation that
//! cannot reach a majority before the consensus deadline fails with a
//! retryable error and leaves the map unchanged, so callers never observe a
//! value that was not committed.
//!
//! Reads are also served by the leader, which makes them linearizable with
//! respect to committed writes.

use crate::errors::{MapError, Result, TransportError};
use crate::messages::{
    map_schemas, AppendEntry, MapKey, MapOperation, MapValue, OperationReply, OperationResult,
};
use crate::transport::{ClusterTransport, MessageHandler};
use async_lock::Mutex;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use meridian_core::serialization::SchemaRegistry;
use meridian_core::{MapConfig, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A value with the commit version that wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<V> {
    value: V,
    version: u64,
}

impl<V> Versioned<V> {
    /// Wrap a value
    pub fn new(value: V, version: u64) -> Self {
        Self { value, version }
    }

    /// The value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Commit version; strictly increasing across writes to the map
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Take the value
    pub fn into_value(self) -> V {
        self.value
    }
}

/// Closure producing a value for an absent key
pub type ComputeFn<K, V> = Box<dyn FnOnce(&K) -> V + Send>;

/// Linearizable key/value map
#[async_trait]
pub trait ConsistentMap<K, V>: Send + Sync
where
    K: MapKey,
    V: MapValue,
{
    /// Map name, unique within the cluster
    fn name(&self) -> &str;

    /// Current value for `key`
    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>>;

    /// Write `value`, returning the previous value
    async fn put(&self, key: K, value: V) -> Result<Option<Versioned<V>>>;

    /// Write `value` only if `key` is absent, returning the existing value if
    /// there was one
    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<Versioned<V>>>;

    /// Remove `key`, returning the removed value
    async fn remove(&self, key: &K) -> Result<Option<Versioned<V>>>;

    /// Return the value for `key`, committing `compute(key)` first if absent.
    ///
    /// `compute` runs on the calling node and only when the key is absent at
    /// the time of the read; a racing writer that commits first wins and its
    /// value is returned.
    async fn compute_if_absent(&self, key: K, compute: ComputeFn<K, V>) -> Result<Versioned<V>>;

    /// All committed entries in key order
    async fn entry_set(&self) -> Result<Vec<(K, Versioned<V>)>>;
}

struct LeaderState<K, V> {
    entries: BTreeMap<K, Versioned<V>>,
    index: u64,
}

struct Inner<K, V> {
    name: String,
    leader: NodeId,
    transport: Arc<dyn ClusterTransport>,
    registry: SchemaRegistry,
    timeout: Duration,
    state: Mutex<LeaderState<K, V>>,
    accepted: parking_lot::Mutex<BTreeMap<u64, Vec<u8>>>,
}

/// [`ConsistentMap`] committed by majority acknowledgement
pub struct QuorumConsistentMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for QuorumConsistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: MapKey, V: MapValue> QuorumConsistentMap<K, V> {
    /// Create this node's replica of map `name`, led by `leader`
    pub fn new(
        name: impl Into<String>,
        leader: NodeId,
        transport: Arc<dyn ClusterTransport>,
        config: &MapConfig,
    ) -> Self {
        Self::with_registry(name, leader, transport, config, map_schemas())
    }

    /// Same as [`QuorumConsistentMap::new`] with an explicit registry
    pub fn with_registry(
        name: impl Into<String>,
        leader: NodeId,
        transport: Arc<dyn ClusterTransport>,
        config: &MapConfig,
        registry: SchemaRegistry,
    ) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            leader,
            transport,
            registry,
            timeout: Duration::from_millis(config.consensus_timeout_ms),
            state: Mutex::new(LeaderState {
                entries: BTreeMap::new(),
                index: 0,
            }),
            accepted: parking_lot::Mutex::new(BTreeMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.register_handler(
            &inner.operation_subject(),
            Arc::new(OperationHandler { inner: weak.clone() }),
        );
        inner
            .transport
            .register_handler(&inner.append_subject(), Arc::new(AppendHandler { inner: weak }));

        Self { inner }
    }

    /// Highest log index this replica has accepted
    pub fn accepted_index(&self) -> u64 {
        self.inner
            .accepted
            .lock()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Leader of the map
    pub fn leader(&self) -> &NodeId {
        &self.inner.leader
    }

    async fn submit(&self, operation: MapOperation<K, V>) -> Result<OperationResult<K, V>> {
        if self.inner.transport.local_node() == self.inner.leader {
            return self.inner.execute(operation).await;
        }

        let frame = self.inner.registry.encode(&operation)?;
        let subject = self.inner.operation_subject();
        let request = self
            .inner
            .transport
            .request(&self.inner.leader, &subject, frame);
        let reply = match tokio::time::timeout(self.inner.timeout, request).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(source)) => {
                return Err(MapError::LeaderUnreachable {
                    map: self.inner.name.clone(),
                    source,
                })
            }
            Err(_) => return Err(self.inner.timeout_error()),
        };
        let OperationReply(result) = self.inner.registry.decode::<OperationReply<K, V>>(&reply)?;
        result
    }

    async fn submit_for_value(&self, operation: MapOperation<K, V>) -> Result<Option<Versioned<V>>> {
        match self.submit(operation).await? {
            OperationResult::Value(value) => Ok(value),
            OperationResult::Entries(_) => Err(MapError::Protocol(
                "expected a single value, got an entry list".into(),
            )),
        }
    }
}

impl<K: MapKey, V: MapValue> Inner<K, V> {
    fn operation_subject(&self) -> String {
        format!("cmap/{}/operation", self.name)
    }

    fn append_subject(&self) -> String {
        format!("cmap/{}/append", self.name)
    }

    fn timeout_error(&self) -> MapError {
        MapError::ConsensusTimeout {
            map: self.name.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    async fn execute(&self, operation: MapOperation<K, V>) -> Result<OperationResult<K, V>> {
        let mut state = self.state.lock().await;
        match &operation {
            MapOperation::Get(key) => {
                return Ok(OperationResult::Value(state.entries.get(key).cloned()));
            }
            MapOperation::Entries => {
                return Ok(OperationResult::Entries(
                    state
                        .entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ));
            }
            MapOperation::PutIfAbsent(key, _) => {
                if let Some(existing) = state.entries.get(key) {
                    return Ok(OperationResult::Value(Some(existing.clone())));
                }
            }
            MapOperation::Remove(key) => {
                if !state.entries.contains_key(key) {
                    return Ok(OperationResult::Value(None));
                }
            }
            MapOperation::Put(..) => {}
        }

        let index = state.index + 1;
        let frame = self.registry.encode(&operation)?;
        self.replicate(index, frame).await?;
        state.index = index;

        let previous = match operation {
            MapOperation::Put(key, value) | MapOperation::PutIfAbsent(key, value) => {
                state.entries.insert(key, Versioned::new(value, index))
            }
            MapOperation::Remove(key) => state.entries.remove(&key),
            MapOperation::Get(_) | MapOperation::Entries => None,
        };
        tracing::debug!(map = %self.name, index, "committed map operation");
        Ok(OperationResult::Value(previous))
    }

    async fn replicate(&self, index: u64, operation: Vec<u8>) -> Result<()> {
        let members = self.transport.members();
        let required = members.len() / 2 + 1;
        self.accepted.lock().insert(index, operation.clone());

        let frame = self.registry.encode(&AppendEntry { index, operation })?;
        let subject = self.append_subject();
        let peers = self.transport.peers();
        let mut pending: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| self.transport.request(peer, &subject, frame.clone()))
            .collect();

        let collect = async {
            let mut acked = 1;
            while acked < required {
                match pending.next().await {
                    Some(Ok(_)) => acked += 1,
                    Some(Err(error)) => {
                        tracing::debug!(map = %self.name, index, error = %error, "append rejected");
                    }
                    None => break,
                }
            }
            acked
        };

        match tokio::time::timeout(self.timeout, collect).await {
            Ok(acked) if acked >= required => Ok(()),
            Ok(acked) => {
                self.accepted.lock().remove(&index);
                tracing::warn!(map = %self.name, index, acked, required, "majority unreachable");
                Err(MapError::Unavailable {
                    map: self.name.clone(),
                    acked,
                    required,
                })
            }
            Err(_) => {
                self.accepted.lock().remove(&index);
                tracing::warn!(map = %self.name, index, "consensus timeout");
                Err(self.timeout_error())
            }
        }
    }
}

struct OperationHandler<K, V> {
    inner: Weak<Inner<K, V>>,
}

#[async_trait]
impl<K: MapKey, V: MapValue> MessageHandler for OperationHandler<K, V> {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = self.inner.upgrade().ok_or_else(|| TransportError::HandlerFailed {
            peer: from.clone(),
            reason: "map dropped".into(),
        })?;
        let result = match inner.registry.decode::<MapOperation<K, V>>(&payload) {
            Ok(operation) => inner.execute(operation).await,
            Err(e) => Err(e.into()),
        };
        inner
            .registry
            .encode(&OperationReply(result))
            .map_err(|e| TransportError::HandlerFailed {
                peer: inner.transport.local_node(),
                reason: e.to_string(),
            })
    }
}

struct AppendHandler<K, V> {
    inner: Weak<Inner<K, V>>,
}

#[async_trait]
impl<K: MapKey, V: MapValue> MessageHandler for AppendHandler<K, V> {
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        let inner = self.inner.upgrade().ok_or_else(|| TransportError::HandlerFailed {
            peer: from.clone(),
            reason: "map dropped".into(),
        })?;
        if *from != inner.leader {
            return Err(TransportError::HandlerFailed {
                peer: inner.transport.local_node(),
                reason: format!("{from} is not the leader of '{}'", inner.name),
            });
        }
        let entry: AppendEntry =
            inner
                .registry
                .decode(&payload)
                .map_err(|e| TransportError::HandlerFailed {
                    peer: inner.transport.local_node(),
                    reason: e.to_string(),
                })?;
        inner.accepted.lock().insert(entry.index, entry.operation);
        Ok(Vec::new())
    }
}

#[async_trait]
impl<K: MapKey, V: MapValue> ConsistentMap<K, V> for QuorumConsistentMap<K, V> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>> {
        self.submit_for_value(MapOperation::Get(key.clone())).await
    }

    async fn put(&self, key: K, value: V) -> Result<Option<Versioned<V>>> {
        self.submit_for_value(MapOperation::Put(key, value)).await
    }

    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<Versioned<V>>> {
        self.submit_for_value(MapOperation::PutIfAbsent(key, value)).await
    }

    async fn remove(&self, key: &K) -> Result<Option<Versioned<V>>> {
        self.submit_for_value(MapOperation::Remove(key.clone())).await
    }

    async fn compute_if_absent(&self, key: K, compute: ComputeFn<K, V>) -> Result<Versioned<V>> {
        if let Some(existing) = self.get(&key).await? {
            return Ok(existing);
        }
        let value = compute(&key);
        match self.put_if_absent(key.clone(), value).await? {
            Some(existing) => Ok(existing),
            None => self.get(&key).await?.ok_or_else(|| {
                MapError::Protocol(format!("committed value for {key:?} vanished"))
            }),
        }
    }

    async fn entry_set(&self) -> Result<Vec<(K, Versioned<V>)>> {
        match self.submit(MapOperation::Entries).await? {
            OperationResult::Entries(entries) => Ok(entries),
            OperationResult::Value(_) => Err(MapError::Protocol(
                "expected an entry list, got a single value".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;

    fn config(timeout_ms: u64) -> MapConfig {
        MapConfig {
            consensus_timeout_ms: timeout_ms,
            ..MapConfig::default()
        }
    }

    fn cluster(
        size: usize,
        timeout_ms: u64,
    ) -> (InMemoryNetwork, Vec<QuorumConsistentMap<String, u32>>) {
        let network = InMemoryNetwork::new();
        let transports: Vec<_> = (1..=size)
            .map(|i| network.join(NodeId::new(format!("n{i}"))))
            .collect();
        let maps = transports
            .into_iter()
            .map(|t| QuorumConsistentMap::new("settings", NodeId::new("n1"), t, &config(timeout_ms)))
            .collect();
        (network, maps)
    }

    #[tokio::test]
    async fn test_put_get_versions_increase() {
        let (_network, maps) = cluster(3, 1_000);
        assert_eq!(maps[0].put("a".into(), 1).await.unwrap(), None);
        let previous = maps[1].put("a".into(), 2).await.unwrap().unwrap();
        assert_eq!(*previous.value(), 1);

        let current = maps[2].get(&"a".to_string()).await.unwrap().unwrap();
        assert_eq!(*current.value(), 2);
        assert!(current.version() > previous.version());
    }

    #[tokio::test]
    async fn test_followers_accept_committed_entries() {
        let (_network, maps) = cluster(3, 1_000);
        maps[0].put("a".into(), 1).await.unwrap();
        maps[0].put("b".into(), 2).await.unwrap();
        let replicated = maps[1..].iter().filter(|m| m.accepted_index() == 2).count();
        assert!(replicated >= 1);
        assert_eq!(maps[0].accepted_index(), 2);
    }

    #[tokio::test]
    async fn test_compute_if_absent_keeps_existing() {
        let (_network, maps) = cluster(3, 1_000);
        let first = maps[1]
            .compute_if_absent("k".into(), Box::new(|_| 7))
            .await
            .unwrap();
        assert_eq!(*first.value(), 7);

        let second = maps[2]
            .compute_if_absent("k".into(), Box::new(|_| 99))
            .await
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_remove_returns_committed_value() {
        let (_network, maps) = cluster(3, 1_000);
        maps[0].put("a".into(), 5).await.unwrap();
        let removed = maps[2].remove(&"a".to_string()).await.unwrap().unwrap();
        assert_eq!(*removed.value(), 5);
        assert!(maps[1].entry_set().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_minority_partition_is_unavailable() {
        let (network, maps) = cluster(3, 1_000);
        network.isolate(&NodeId::new("n2"));
        network.isolate(&NodeId::new("n3"));

        let err = maps[0].put("a".into(), 1).await.unwrap_err();
        assert!(matches!(err, MapError::Unavailable { acked: 1, required: 2, .. }));
        assert!(err.is_retryable());
        assert_eq!(maps[0].get(&"a".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stalled_majority_times_out() {
        let (network, maps) = cluster(3, 50);
        network.stall(&NodeId::new("n2"));
        network.stall(&NodeId::new("n3"));

        let err = maps[0].put("a".into(), 1).await.unwrap_err();
        assert!(matches!(err, MapError::ConsensusTimeout { .. }));
        assert!(maps[0].entry_set().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_stalled_follower_still_commits() {
        let (network, maps) = cluster(3, 200);
        network.stall(&NodeId::new("n3"));
        maps[0].put("a".into(), 1).await.unwrap();
        assert_eq!(*maps[1].get(&"a".to_string()).await.unwrap().unwrap().value(), 1);
    }

    #[tokio::test]
    async fn test_leader_unreachable_from_follower() {
        let (network, maps) = cluster(3, 1_000);
        network.isolate(&NodeId::new("n2"));
        let err = maps[1].get(&"a".to_string()).await.unwrap_err();
        assert!(matches!(err, MapError::LeaderUnreachable { .. }));
        assert!(err.is_retryable());
    }
}
