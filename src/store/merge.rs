//! K-way merge over the memtable snapshot and run files.
//!
//! Yields entries in ascending (key, seq) order. Sequence numbers are
//! globally unique within a store, so the merge is a strict total order
//! and duplicate keys come out in insertion order.

use crate::store::run::{RunEntry, RunReader};
use bytes::Bytes;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io;

/// One input to the merge.
pub enum MergeSource {
    /// Snapshot of memtable entries, already sorted.
    Memtable(std::vec::IntoIter<(Bytes, u64, Bytes)>),
    /// Sequential reader over a sorted run file.
    Run(RunReader),
}

impl MergeSource {
    fn next(&mut self) -> io::Result<Option<RunEntry>> {
        match self {
            MergeSource::Memtable(iter) => Ok(iter.next().map(|(key, seq, row)| RunEntry {
                key,
                seq,
                row,
            })),
            MergeSource::Run(reader) => reader.next_entry(),
        }
    }
}

struct HeapItem {
    key: Bytes,
    seq: u64,
    row: Bytes,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Streaming k-way merge.
pub struct MergeStream {
    sources: Vec<MergeSource>,
    heap: BinaryHeap<Reverse<HeapItem>>,
}

impl MergeStream {
    /// Build a merge over the given sources, priming one entry from each.
    pub fn new(sources: Vec<MergeSource>) -> io::Result<Self> {
        let mut merge = Self {
            sources,
            heap: BinaryHeap::new(),
        };
        for idx in 0..merge.sources.len() {
            merge.refill(idx)?;
        }
        Ok(merge)
    }

    fn refill(&mut self, source: usize) -> io::Result<()> {
        if let Some(entry) = self.sources[source].next()? {
            self.heap.push(Reverse(HeapItem {
                key: entry.key,
                seq: entry.seq,
                row: entry.row,
                source,
            }));
        }
        Ok(())
    }

    /// Pop the next entry in (key, seq) order.
    pub fn next(&mut self) -> io::Result<Option<RunEntry>> {
        let Some(Reverse(item)) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(item.source)?;
        Ok(Some(RunEntry {
            key: item.key,
            seq: item.seq,
            row: item.row,
        }))
    }
}
