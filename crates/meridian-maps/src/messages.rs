//! Wire messages exchanged between map replicas

use crate::errors::MapError;
use crate::Versioned;
use meridian_core::serialization::{Schema, SchemaRegistry};
use meridian_core::LogicalTimestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// First schema id of the map message block
pub const MAP_SCHEMA_BASE: u32 = 100;

/// Bounds for map keys
pub trait MapKey: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapKey for T where T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Bounds for map values
pub trait MapValue:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> MapValue for T where
    T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Operation forwarded to the leader of a consistent map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum MapOperation<K, V> {
    Get(K),
    Put(K, V),
    PutIfAbsent(K, V),
    Remove(K),
    Entries,
}

impl<K, V> Schema for MapOperation<K, V> {
    const NAME: &'static str = "meridian.maps.MapOperation";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum OperationResult<K, V> {
    Value(Option<Versioned<V>>),
    Entries(Vec<(K, Versioned<V>)>),
}

/// Leader reply to a forwarded [`MapOperation`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OperationReply<K, V>(pub Result<OperationResult<K, V>, MapError>);

impl<K, V> Schema for OperationReply<K, V> {
    const NAME: &'static str = "meridian.maps.OperationReply";
}

/// Committed operation pushed from the leader to followers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AppendEntry {
    pub index: u64,
    pub operation: Vec<u8>,
}

impl Schema for AppendEntry {
    const NAME: &'static str = "meridian.maps.AppendEntry";
}

/// A value or tombstone with the timestamp that wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry<V> {
    /// `None` for a tombstone
    pub value: Option<V>,
    /// Last-writer-wins discriminator
    pub timestamp: LogicalTimestamp,
}

impl<V> MapEntry<V> {
    /// Live value
    pub fn value(value: V, timestamp: LogicalTimestamp) -> Self {
        Self {
            value: Some(value),
            timestamp,
        }
    }

    /// Tombstone
    pub fn tombstone(timestamp: LogicalTimestamp) -> Self {
        Self {
            value: None,
            timestamp,
        }
    }

    /// True for a tombstone
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Pushed batch of updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UpdateBatch<K, V> {
    pub entries: Vec<(K, MapEntry<V>)>,
}

impl<K, V> Schema for UpdateBatch<K, V> {
    const NAME: &'static str = "meridian.maps.UpdateBatch";
}

/// BLAKE3 hash of an entry's encoded payload
pub type Fingerprint = [u8; 32];

/// Fingerprint advertised for tombstones
pub const TOMBSTONE_FINGERPRINT: Fingerprint = [0; 32];

/// Summary of a replica used to find divergent keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyDigest<K> {
    /// Key, timestamp and payload fingerprint for every entry including tombstones
    pub entries: Vec<(K, LogicalTimestamp, Fingerprint)>,
}

impl<K> Schema for AntiEntropyDigest<K> {
    const NAME: &'static str = "meridian.maps.AntiEntropyDigest";
}

/// Answer to a digest: what the sender is missing and what it should send back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyReply<K, V> {
    /// Entries that supersede the sender's
    pub updates: Vec<(K, MapEntry<V>)>,
    /// Keys whose entries the sender holds newer versions of
    pub wanted: Vec<K>,
}

impl<K, V> Schema for AntiEntropyReply<K, V> {
    const NAME: &'static str = "meridian.maps.AntiEntropyReply";
}

/// Registry holding every map message schema
pub fn map_schemas() -> SchemaRegistry {
    SchemaRegistry::builder()
        .next_id(MAP_SCHEMA_BASE)
        .register::<MapOperation<(), ()>>()
        .register::<OperationReply<(), ()>>()
        .register::<AppendEntry>()
        .register::<UpdateBatch<(), ()>>()
        .register::<AntiEntropyDigest<()>>()
        .register::<AntiEntropyReply<(), ()>>()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::NodeId;

    #[test]
    fn test_map_schemas_occupy_own_block() {
        let registry = map_schemas();
        assert_eq!(
            registry.id_of("meridian.maps.MapOperation"),
            Some(MAP_SCHEMA_BASE)
        );
        assert_eq!(
            registry.id_of("meridian.maps.AntiEntropyReply"),
            Some(MAP_SCHEMA_BASE + 5)
        );
    }

    #[test]
    fn test_update_batch_frames() {
        let registry = map_schemas();
        let batch = UpdateBatch {
            entries: vec![(
                "k".to_string(),
                MapEntry::value(3u32, LogicalTimestamp::new(1, NodeId::new("n1"))),
            )],
        };
        let bytes = registry.encode(&batch).unwrap();
        let decoded: UpdateBatch<String, u32> = registry.decode(&bytes).unwrap();
        assert_eq!(decoded.entries, batch.entries);
    }
}
