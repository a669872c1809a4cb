//! Meridian Maps - distributed map abstractions
//!
//! Two flavours back the upper layers:
//!
//! - [`ConsistentMap`]: linearizable, every mutation committed by a majority
//!   before it returns. Used for small authoritative state such as the intent
//!   registry. Quorum loss surfaces as a retryable [`MapError`].
//! - [`EventuallyConsistentMap`]: local-first replica with last-writer-wins
//!   merge, push replication and anti-entropy. Used for high-churn state such
//!   as per-device install progress.
//!
//! Both speak to peers through a [`ClusterTransport`]; [`InMemoryNetwork`]
//! wires several in-process nodes together.

#![forbid(unsafe_code)]

/// Strongly consistent map
pub mod consistent;

/// Map and transport errors
pub mod errors;

/// Eventually consistent map
pub mod eventual;

/// Wire messages and schema registrations
pub mod messages;

/// Cluster transport abstraction
pub mod transport;

pub use consistent::{ComputeFn, ConsistentMap, QuorumConsistentMap, Versioned};
pub use errors::{MapError, Result, TransportError};
pub use eventual::{fingerprint, EventuallyConsistentMap, EventuallyConsistentMapBuilder, MapEvent};
pub use messages::{
    map_schemas, AntiEntropyDigest, AntiEntropyReply, Fingerprint, MapEntry, MapKey, MapValue,
    TOMBSTONE_FINGERPRINT,
};
pub use transport::{ClusterTransport, InMemoryNetwork, InMemoryTransport, MessageHandler};
