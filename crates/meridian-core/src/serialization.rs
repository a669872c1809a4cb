//! Schema registry and pooled codec for replicated values
//!
//! Every value that crosses the cluster is framed with a numeric schema id and
//! a schema version in front of a bincode payload:
//!
//! ```text
//! [schema id: u32 LE][schema version: u16 LE][bincode payload]
//! ```
//!
//! Schema ids are assigned in registration blocks. A block either starts at an
//! explicit id or floats directly after everything registered so far. Keeping
//! the id table explicit (instead of deriving it from type identity) is what
//! keeps frames readable across builds.
//!
//! Encoding borrows a scratch buffer from a pool so hot replication paths do
//! not allocate a fresh growable buffer per message.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Initial capacity of pooled encode buffers
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest frame the codec will produce or accept
pub const MAX_BUFFER_SIZE: usize = 100 * 1000 * 1000;

/// Smallest id available to user registrations; ids below are reserved
pub const INITIAL_ID: u32 = 11;

/// Id written for unregistered types when registration is not required
pub const UNREGISTERED_ID: u32 = 0;

const HEADER_LEN: usize = 6;

/// A type with a stable wire name and version.
pub trait Schema {
    /// Stable, globally unique name
    const NAME: &'static str;
    /// Version of the encoded layout
    const VERSION: u16 = 1;
}

/// Errors produced by the registry and codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SerializationError {
    /// The type was never registered and the registry requires registration
    #[error("Type '{0}' is not registered")]
    Unregistered(String),
    /// The frame's schema id is not in the table
    #[error("Unknown schema id {0}")]
    UnknownSchemaId(u32),
    /// The frame holds a different type than requested
    #[error("Schema mismatch: frame holds '{found}', expected '{expected}'")]
    SchemaMismatch {
        /// Requested type
        expected: String,
        /// Type named by the frame
        found: String,
    },
    /// The frame was written with an incompatible schema version
    #[error("Version mismatch for '{name}': frame v{found}, registered v{expected}")]
    VersionMismatch {
        /// Schema name
        name: String,
        /// Registered version
        expected: u16,
        /// Version in the frame
        found: u16,
    },
    /// The encoded value would exceed the maximum frame size
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Configured limit
        limit: usize,
    },
    /// Invalid frame or payload
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

impl From<SerializationError> for crate::MeridianError {
    fn from(err: SerializationError) -> Self {
        crate::MeridianError::serialization(err.to_string())
    }
}

/// Standard Result type for serialization operations
pub type Result<T> = std::result::Result<T, SerializationError>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SchemaEntry {
    name: String,
    version: u16,
}

/// A run of consecutive schema ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationBlock {
    begin: Option<u32>,
    entries: Vec<SchemaEntry>,
}

impl RegistrationBlock {
    /// First id of the block, or `None` if the block floats
    pub fn begin(&self) -> Option<u32> {
        self.begin
    }

    /// Number of schemas in the block
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the block is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`SchemaRegistry`]
#[derive(Debug)]
pub struct SchemaRegistryBuilder {
    block_head: Option<u32>,
    pending: Vec<SchemaEntry>,
    blocks: Vec<RegistrationBlock>,
    registration_required: bool,
    buffer_size: usize,
    max_buffer_size: usize,
    pool_size: usize,
}

impl Default for SchemaRegistryBuilder {
    fn default() -> Self {
        Self {
            block_head: Some(INITIAL_ID),
            pending: Vec::new(),
            blocks: Vec::new(),
            registration_required: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
            pool_size: 1,
        }
    }
}

impl SchemaRegistryBuilder {
    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.blocks.push(RegistrationBlock {
                begin: self.block_head,
                entries: std::mem::take(&mut self.pending),
            });
        }
    }

    /// Start a new block at an explicit id
    pub fn next_id(mut self, id: u32) -> Self {
        if let Some(head) = self.block_head {
            if !self.pending.is_empty() && id < head + self.pending.len() as u32 {
                tracing::warn!(
                    requested = id,
                    block_head = head,
                    pending = self.pending.len(),
                    "requested next id could overlap existing registrations"
                );
            }
        }
        self.flush();
        self.block_head = Some(id);
        self
    }

    /// Start a new block placed after everything registered before it
    pub fn floating(mut self) -> Self {
        self.flush();
        self.block_head = None;
        self
    }

    /// Register a type in the current block
    pub fn register<T: Schema>(mut self) -> Self {
        self.pending.push(SchemaEntry {
            name: T::NAME.to_string(),
            version: T::VERSION,
        });
        self
    }

    /// Register every block of another registry, preserving explicit ids
    pub fn register_registry(mut self, other: &SchemaRegistry) -> Self {
        for block in &other.blocks {
            self.flush();
            self.blocks.push(block.clone());
            self.block_head = block.begin.map(|b| b + block.entries.len() as u32);
        }
        self
    }

    /// Require every encoded type to be registered (default `true`)
    pub fn registration_required(mut self, required: bool) -> Self {
        self.registration_required = required;
        self
    }

    /// Initial capacity of pooled buffers
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Largest frame accepted
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size.min(MAX_BUFFER_SIZE);
        self
    }

    /// Buffers created up front
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Resolve ids and build the registry
    pub fn build(mut self) -> SchemaRegistry {
        self.flush();

        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        let mut next_free = INITIAL_ID;
        for block in &self.blocks {
            let mut id = block.begin.unwrap_or(next_free);
            for entry in &block.entries {
                if let Some(previous) = by_id.insert(id, entry.clone()) {
                    tracing::warn!(
                        id,
                        previous = %previous.name,
                        replacement = %entry.name,
                        "schema id registered twice; later registration wins"
                    );
                    by_name.remove(&previous.name);
                }
                by_name.insert(entry.name.clone(), (id, entry.version));
                id += 1;
            }
            next_free = next_free.max(id);
        }

        let pool = CodecPool::new(self.buffer_size);
        pool.populate(self.pool_size);

        SchemaRegistry {
            blocks: self.blocks,
            by_name,
            by_id,
            registration_required: self.registration_required,
            max_buffer_size: self.max_buffer_size,
            pool: Arc::new(pool),
        }
    }
}

/// Id table plus pooled codec.
#[derive(Clone)]
pub struct SchemaRegistry {
    blocks: Vec<RegistrationBlock>,
    by_name: HashMap<String, (u32, u16)>,
    by_id: HashMap<u32, SchemaEntry>,
    registration_required: bool,
    max_buffer_size: usize,
    pool: Arc<CodecPool>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("blocks", &self.blocks)
            .field("registration_required", &self.registration_required)
            .finish()
    }
}

impl SchemaRegistry {
    /// New builder
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Builder pre-sized from configuration
    pub fn builder_from_config(config: &crate::config::SerializationConfig) -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
            .buffer_size(config.default_buffer_size)
            .max_buffer_size(config.max_buffer_size)
            .pool_size(config.pool_size)
    }

    /// Registered id for a schema name
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|(id, _)| *id)
    }

    /// Schema name for an id
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|e| e.name.as_str())
    }

    /// Registration blocks in declaration order
    pub fn blocks(&self) -> &[RegistrationBlock] {
        &self.blocks
    }

    /// Buffers currently idle in the pool
    pub fn idle_buffers(&self) -> usize {
        self.pool.idle()
    }

    /// Encode `value` into a framed byte vector
    pub fn encode<T: Schema + Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let (id, version) = match self.by_name.get(T::NAME) {
            Some(found) => *found,
            None if self.registration_required => {
                return Err(SerializationError::Unregistered(T::NAME.to_string()))
            }
            None => (UNREGISTERED_ID, T::VERSION),
        };

        let mut buffer = self.pool.borrow();
        let out = buffer.as_mut();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&version.to_le_bytes());
        if id == UNREGISTERED_ID {
            bincode::serialize_into(&mut *out, T::NAME)
                .map_err(|e| SerializationError::InvalidFormat(e.to_string()))?;
        }
        bincode::serialize_into(&mut *out, value)
            .map_err(|e| SerializationError::InvalidFormat(e.to_string()))?;

        if out.len() > self.max_buffer_size {
            return Err(SerializationError::TooLarge {
                size: out.len(),
                limit: self.max_buffer_size,
            });
        }
        Ok(out.to_vec())
    }

    /// Read the schema name of a frame without decoding its payload
    pub fn peek_name(&self, bytes: &[u8]) -> Result<String> {
        let (id, _version, rest) = split_header(bytes)?;
        if id == UNREGISTERED_ID {
            return bincode::deserialize::<String>(rest)
                .map_err(|e| SerializationError::InvalidFormat(e.to_string()));
        }
        self.name_of(id)
            .map(str::to_string)
            .ok_or(SerializationError::UnknownSchemaId(id))
    }

    /// Decode a frame produced by [`SchemaRegistry::encode`]
    pub fn decode<T: Schema + DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() > self.max_buffer_size {
            return Err(SerializationError::TooLarge {
                size: bytes.len(),
                limit: self.max_buffer_size,
            });
        }
        let (id, version, mut payload) = split_header(bytes)?;

        if id == UNREGISTERED_ID {
            if self.registration_required {
                return Err(SerializationError::Unregistered(T::NAME.to_string()));
            }
            let mut cursor = std::io::Cursor::new(payload);
            let name: String = bincode::deserialize_from(&mut cursor)
                .map_err(|e| SerializationError::InvalidFormat(e.to_string()))?;
            if name != T::NAME {
                return Err(SerializationError::SchemaMismatch {
                    expected: T::NAME.to_string(),
                    found: name,
                });
            }
            let consumed = cursor.position() as usize;
            payload = &payload[consumed..];
        } else {
            let entry = self
                .by_id
                .get(&id)
                .ok_or(SerializationError::UnknownSchemaId(id))?;
            if entry.name != T::NAME {
                return Err(SerializationError::SchemaMismatch {
                    expected: T::NAME.to_string(),
                    found: entry.name.clone(),
                });
            }
            if entry.version != version {
                return Err(SerializationError::VersionMismatch {
                    name: entry.name.clone(),
                    expected: entry.version,
                    found: version,
                });
            }
        }

        bincode::deserialize(payload).map_err(|e| SerializationError::InvalidFormat(e.to_string()))
    }
}

fn split_header(bytes: &[u8]) -> Result<(u32, u16, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(SerializationError::InvalidFormat(format!(
            "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    let id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    Ok((id, version, &bytes[HEADER_LEN..]))
}

/// Pool of reusable encode buffers.
#[derive(Debug)]
pub struct CodecPool {
    idle: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl CodecPool {
    /// Empty pool producing buffers of `buffer_size` initial capacity
    pub fn new(buffer_size: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    /// Create `count` buffers up front
    pub fn populate(&self, count: usize) {
        let mut idle = self.idle.lock();
        for _ in 0..count {
            idle.push(Vec::with_capacity(self.buffer_size));
        }
    }

    /// Borrow a cleared buffer; it returns to the pool on drop
    pub fn borrow(&self) -> PooledBuffer<'_> {
        let buffer = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        PooledBuffer {
            pool: self,
            buffer: Some(buffer),
        }
    }

    /// Buffers currently idle
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        // Oversized buffers are dropped rather than pinned in the pool
        if buffer.capacity() <= self.buffer_size.saturating_mul(16) {
            self.idle.lock().push(buffer);
        }
    }
}

/// Buffer on loan from a [`CodecPool`]
pub struct PooledBuffer<'a> {
    pool: &'a CodecPool,
    buffer: Option<Vec<u8>>,
}

impl AsMut<Vec<u8>> for PooledBuffer<'_> {
    fn as_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.get_or_insert_with(Vec::new)
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    impl Schema for Sample {
        const NAME: &'static str = "test.Sample";
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Other(u32);

    impl Schema for Other {
        const NAME: &'static str = "test.Other";
        const VERSION: u16 = 2;
    }

    #[test]
    fn test_ids_start_at_initial_id() {
        let registry = SchemaRegistry::builder()
            .register::<Sample>()
            .register::<Other>()
            .build();
        assert_eq!(registry.id_of("test.Sample"), Some(INITIAL_ID));
        assert_eq!(registry.id_of("test.Other"), Some(INITIAL_ID + 1));
    }

    #[test]
    fn test_explicit_and_floating_blocks() {
        let registry = SchemaRegistry::builder()
            .next_id(100)
            .register::<Sample>()
            .floating()
            .register::<Other>()
            .build();
        assert_eq!(registry.id_of("test.Sample"), Some(100));
        assert_eq!(registry.id_of("test.Other"), Some(101));
        assert_eq!(registry.blocks().len(), 2);
        assert_eq!(registry.blocks()[1].begin(), None);
    }

    #[test]
    fn test_composed_registry_keeps_ids() {
        let base = SchemaRegistry::builder().next_id(40).register::<Sample>().build();
        let composed = SchemaRegistry::builder()
            .register_registry(&base)
            .register::<Other>()
            .build();
        assert_eq!(composed.id_of("test.Sample"), Some(40));
        assert_eq!(composed.id_of("test.Other"), Some(41));
    }

    #[test]
    fn test_frame_round_trip_and_peek() {
        let registry = SchemaRegistry::builder().register::<Sample>().build();
        let sample = Sample {
            id: 7,
            name: "seven".to_string(),
        };
        let bytes = registry.encode(&sample).unwrap();
        assert_eq!(registry.peek_name(&bytes).unwrap(), "test.Sample");
        assert_eq!(registry.decode::<Sample>(&bytes).unwrap(), sample);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let registry = SchemaRegistry::builder()
            .register::<Sample>()
            .register::<Other>()
            .build();
        let bytes = registry.encode(&Other(3)).unwrap();
        assert!(matches!(
            registry.decode::<Sample>(&bytes),
            Err(SerializationError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_unregistered_type_rejected_when_required() {
        let registry = SchemaRegistry::builder().register::<Sample>().build();
        assert_eq!(
            registry.encode(&Other(1)),
            Err(SerializationError::Unregistered("test.Other".to_string()))
        );
    }

    #[test]
    fn test_unregistered_type_named_inline_when_optional() {
        let registry = SchemaRegistry::builder()
            .registration_required(false)
            .build();
        let bytes = registry.encode(&Other(5)).unwrap();
        assert_eq!(registry.peek_name(&bytes).unwrap(), "test.Other");
        assert_eq!(registry.decode::<Other>(&bytes).unwrap(), Other(5));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let registry = SchemaRegistry::builder()
            .register::<Sample>()
            .max_buffer_size(16)
            .build();
        let sample = Sample {
            id: 1,
            name: "x".repeat(64),
        };
        assert!(matches!(
            registry.encode(&sample),
            Err(SerializationError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let registry = SchemaRegistry::builder()
            .register::<Sample>()
            .pool_size(2)
            .build();
        assert_eq!(registry.idle_buffers(), 2);
        let sample = Sample {
            id: 1,
            name: "a".to_string(),
        };
        registry.encode(&sample).unwrap();
        assert_eq!(registry.idle_buffers(), 2);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let registry = SchemaRegistry::builder().register::<Sample>().build();
        assert!(matches!(
            registry.decode::<Sample>(&[1, 2]),
            Err(SerializationError::InvalidFormat(_))
        ));
    }
}
