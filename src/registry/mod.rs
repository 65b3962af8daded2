//! Process-wide table of live shuffles.
//!
//! The registry is the only shared mutable state in the server: a map from
//! 16-byte identifier to live shuffle, behind a read-writer lock (many
//! concurrent lookups, exclusive insert/remove). It is owned by the
//! [`crate::server::Server`] value and handed to connection tasks; there
//! are no process globals.

use crate::codec::{RowCodec, ShuffleSchema};
use crate::core::error::{ShuffleError, ShuffleResult};
use crate::store::Store;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Opaque 16-byte shuffle identifier, minted from a cryptographically
/// secure source at START.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShuffleId([u8; 16]);

impl ShuffleId {
    /// Mint a fresh random identifier.
    pub fn mint() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex rendering used in logs and scratch directory names.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShuffleId({self})")
    }
}

/// One live shuffle: its schema, codec, and backing store.
pub struct Shuffle {
    id: ShuffleId,
    schema: ShuffleSchema,
    codec: RowCodec,
    store: Store,
    created_at: SystemTime,
}

impl Shuffle {
    pub fn new(id: ShuffleId, schema: ShuffleSchema, codec: RowCodec, store: Store) -> Self {
        Self {
            id,
            schema,
            codec,
            store,
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> ShuffleId {
        self.id
    }

    pub fn schema(&self) -> &ShuffleSchema {
        &self.schema
    }

    pub fn codec(&self) -> &RowCodec {
        &self.codec
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// identifier → live shuffle table.
#[derive(Default)]
pub struct ShuffleRegistry {
    shuffles: RwLock<HashMap<ShuffleId, Arc<Shuffle>>>,
}

impl ShuffleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new shuffle under its identifier.
    pub fn insert(&self, shuffle: Arc<Shuffle>) {
        self.shuffles.write().insert(shuffle.id(), shuffle);
    }

    /// Look up a live shuffle.
    pub fn get(&self, id: &ShuffleId) -> Option<Arc<Shuffle>> {
        self.shuffles.read().get(id).cloned()
    }

    /// Look up a live shuffle, mapping absence to `UnknownShuffle`.
    pub fn resolve(&self, id: &ShuffleId) -> ShuffleResult<Arc<Shuffle>> {
        self.get(id).ok_or_else(|| ShuffleError::UnknownShuffle {
            id_hex: id.to_hex(),
        })
    }

    /// Remove a shuffle and close its store.
    ///
    /// Returns whether an entry existed. Close failures are logged, not
    /// surfaced: the shuffle is already unreachable.
    pub fn remove(&self, id: &ShuffleId) -> bool {
        let removed = self.shuffles.write().remove(id);
        match removed {
            Some(shuffle) => {
                if let Err(error) = shuffle.store().close() {
                    tracing::warn!(shuffle = %id, %error, "failed to close store on remove");
                }
                true
            }
            None => false,
        }
    }

    /// Number of live shuffles.
    pub fn len(&self) -> usize {
        self.shuffles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shuffles.read().is_empty()
    }

    /// Close every live shuffle (server shutdown).
    pub fn drain(&self) {
        let drained: Vec<Arc<Shuffle>> = self.shuffles.write().drain().map(|(_, s)| s).collect();
        for shuffle in drained {
            if let Err(error) = shuffle.store().close() {
                tracing::warn!(shuffle = %shuffle.id(), %error, "failed to close store on drain");
            }
        }
    }
}
