//! In-memory sorted buffer of recent puts.
//!
//! Entries are keyed by (encoded key, insert sequence) so that duplicate
//! keys keep their insertion order through flushes and merges.

use crate::store::KeyInterval;
use bytes::Bytes;
use std::collections::BTreeMap;

/// The in-memory sorted table, flushed to a run file when it grows past
/// the configured threshold.
#[derive(Debug, Default)]
pub struct Memtable {
    entries: BTreeMap<(Bytes, u64), Bytes>,
    bytes: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under its global sequence number.
    pub fn insert(&mut self, key: Bytes, seq: u64, row: Bytes) {
        self.bytes += key.len() + row.len();
        self.entries.insert((key, seq), row);
    }

    /// Approximate payload bytes buffered.
    pub fn approximate_bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate all entries in (key, seq) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, u64, &Bytes)> {
        self.entries.iter().map(|((key, seq), row)| (key, *seq, row))
    }

    /// Clone the entries falling inside the interval, in order.
    ///
    /// The clones are cheap (`Bytes` is reference-counted); the snapshot
    /// lets a scan proceed without holding the store lock.
    pub fn snapshot_range(&self, interval: &KeyInterval) -> Vec<(Bytes, u64, Bytes)> {
        self.entries
            .iter()
            .filter(|((key, _), _)| interval.contains(key))
            .map(|((key, seq), row)| (key.clone(), *seq, row.clone()))
            .collect()
    }

    /// Take the whole table for a flush, leaving it empty.
    pub fn take(&mut self) -> BTreeMap<(Bytes, u64), Bytes> {
        self.bytes = 0;
        std::mem::take(&mut self.entries)
    }
}
