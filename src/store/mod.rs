//! Per-shuffle persistent sorted multimap.
//!
//! A log-structured merge tree: puts land in an in-memory sorted table
//! ([`memtable`]) that is flushed to a sorted [`run`] file when it exceeds
//! the configured threshold; a compaction pass collapses runs when their
//! count exceeds the fan-in limit, bounding read amplification. Range
//! scans k-way [`merge`] a memtable snapshot with one reader per run.
//! Partition bounds come from a reservoir [`sampler`] fed at insert time.
//!
//! The store compares raw encoded-key bytes only; the codec guarantees
//! that byte order equals the logical sort order. Duplicate keys keep
//! insertion order via a global sequence number carried through flushes.
//!
//! Batches arrive with a [`BatchToken`]; a batch is applied atomically
//! under the store lock and its token is recorded, so a client that
//! resends a batch whose acknowledgement was lost in transit inserts
//! nothing the second time.
//!
//! Any I/O failure poisons the store: the failing operation surfaces the
//! error and every subsequent operation fails with `ShufflePoisoned` until
//! the shuffle is stopped.

pub mod memtable;
pub mod merge;
pub mod run;
pub mod sampler;

use crate::core::error::{ShuffleError, ShuffleResult};
use bytes::Bytes;
use memtable::Memtable;
use merge::{MergeSource, MergeStream};
use parking_lot::Mutex;
use run::{run_path, RunMeta, RunReader, RunWriter};
use sampler::ReservoirSampler;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Client-minted identifier of one PUT batch, stable across retries of
/// the same batch.
pub type BatchToken = [u8; 16];

/// Half-open-capable key interval over encoded keys.
///
/// An empty `start` means unbounded below; an empty `end` means unbounded
/// above (encoded keys are never empty).
#[derive(Debug, Clone)]
pub struct KeyInterval {
    pub start: Bytes,
    pub start_inclusive: bool,
    pub end: Bytes,
    pub end_inclusive: bool,
}

impl KeyInterval {
    pub fn new(start: Bytes, start_inclusive: bool, end: Bytes, end_inclusive: bool) -> Self {
        Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        }
    }

    /// The interval covering every key.
    pub fn all() -> Self {
        Self::new(Bytes::new(), true, Bytes::new(), true)
    }

    /// Whether a key falls inside the interval.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.above_start(key) && !self.beyond_end(key)
    }

    fn above_start(&self, key: &[u8]) -> bool {
        if self.start.is_empty() {
            return true;
        }
        match key.cmp(&self.start[..]) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.start_inclusive,
            std::cmp::Ordering::Less => false,
        }
    }

    /// Whether a key is past the upper bound; scans stop here because the
    /// merge yields keys in ascending order.
    pub fn beyond_end(&self, key: &[u8]) -> bool {
        if self.end.is_empty() {
            return false;
        }
        match key.cmp(&self.end[..]) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => !self.end_inclusive,
            std::cmp::Ordering::Greater => true,
        }
    }
}

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Memtable payload size that triggers a flush.
    pub memtable_flush_bytes: usize,
    /// Run count that triggers a compaction into a single run.
    pub max_runs: usize,
    /// Reservoir capacity for partition-bound sampling.
    pub sample_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memtable_flush_bytes: 8 * 1024 * 1024,
            max_runs: 8,
            sample_capacity: 4096,
        }
    }
}

struct StoreInner {
    memtable: Memtable,
    runs: Vec<RunMeta>,
    next_seq: u64,
    next_run_id: u64,
    sampler: ReservoirSampler,
    min_key: Option<Bytes>,
    max_key: Option<Bytes>,
    entry_count: u64,
    applied_batches: HashSet<BatchToken>,
    closed: bool,
}

/// One shuffle's sorted multimap.
pub struct Store {
    dir: PathBuf,
    config: StoreConfig,
    poisoned: Arc<AtomicBool>,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish()
    }
}

impl Store {
    /// Create a store backed by the given directory (created if absent).
    pub fn create(dir: PathBuf, config: StoreConfig) -> ShuffleResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|source| ShuffleError::StoreIo {
            operation: "create",
            source,
        })?;
        let sample_capacity = config.sample_capacity;
        Ok(Self {
            dir,
            config,
            poisoned: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(StoreInner {
                memtable: Memtable::new(),
                runs: Vec::new(),
                next_seq: 0,
                next_run_id: 0,
                sampler: ReservoirSampler::new(sample_capacity),
                min_key: None,
                max_key: None,
                entry_count: 0,
                applied_batches: HashSet::new(),
                closed: false,
            }),
        })
    }

    /// Insert one entry. Duplicate keys are kept; iteration order is key
    /// order with insertion-order tiebreak.
    pub fn put(&self, key: Bytes, row: Bytes) -> ShuffleResult<()> {
        self.check_usable()?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(self.poisoned_error());
        }
        self.insert_locked(&mut inner, key, row)
    }

    /// Apply a batch of entries exactly once.
    ///
    /// The batch token is recorded on first application; a batch resent
    /// under the same token (the client never saw the acknowledgement)
    /// inserts nothing and returns `false`. The whole batch lands under
    /// one hold of the store lock, so a scan sees either none or all of
    /// it.
    pub fn apply_batch(
        &self,
        token: BatchToken,
        entries: Vec<(Bytes, Bytes)>,
    ) -> ShuffleResult<bool> {
        self.check_usable()?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(self.poisoned_error());
        }
        if inner.applied_batches.contains(&token) {
            return Ok(false);
        }
        for (key, row) in entries {
            self.insert_locked(&mut inner, key, row)?;
        }
        inner.applied_batches.insert(token);
        Ok(true)
    }

    /// Insert one entry and run the flush/compaction policy. Caller holds
    /// the lock.
    fn insert_locked(&self, inner: &mut StoreInner, key: Bytes, row: Bytes) -> ShuffleResult<()> {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sampler.observe(&key);
        if inner.min_key.as_ref().map_or(true, |min| key < *min) {
            inner.min_key = Some(key.clone());
        }
        if inner.max_key.as_ref().map_or(true, |max| key > *max) {
            inner.max_key = Some(key.clone());
        }
        inner.entry_count += 1;
        inner.memtable.insert(key, seq, row);

        if inner.memtable.approximate_bytes() >= self.config.memtable_flush_bytes {
            self.flush_locked(inner)?;
            if inner.runs.len() > self.config.max_runs {
                self.compact_locked(inner)?;
            }
        }
        Ok(())
    }

    /// Open a streaming scan over the interval.
    ///
    /// The scan observes exactly the puts that completed before this call:
    /// the memtable portion is snapshotted under the lock and run files
    /// are immutable once written.
    pub fn range(&self, interval: KeyInterval) -> ShuffleResult<RangeScan> {
        self.check_usable()?;
        // Run readers must be opened under the lock: a concurrent
        // compaction may delete run files, but an already-open reader
        // keeps its data reachable.
        let sources = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(self.poisoned_error());
            }
            let mut sources = Vec::with_capacity(inner.runs.len() + 1);
            for run in &inner.runs {
                let reader = self.guard_io("scan", RunReader::open(&run.path))?;
                sources.push(MergeSource::Run(reader));
            }
            sources.push(MergeSource::Memtable(
                inner.memtable.snapshot_range(&interval).into_iter(),
            ));
            sources
        };
        let stream = self.guard_io("scan", MergeStream::new(sources))?;

        Ok(RangeScan {
            stream,
            interval,
            poisoned: Arc::clone(&self.poisoned),
            done: false,
        })
    }

    /// Boundary keys approximately equi-partitioning the current key
    /// distribution into `n` buckets.
    ///
    /// Returns `n + 1` monotone non-decreasing keys whose first is the
    /// minimum stored key and last the maximum; empty iff `n` is zero or
    /// the store holds no entries.
    pub fn partition_keys(&self, n: u32) -> ShuffleResult<Vec<Bytes>> {
        self.check_usable()?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let (mut samples, min_key, max_key) = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(self.poisoned_error());
            }
            if inner.entry_count == 0 {
                return Ok(Vec::new());
            }
            let samples = if inner.sampler.len() < (n as usize + 1) {
                // Reservoir smaller than the boundary count: fall back to
                // every key in the store.
                self.collect_all_keys(&inner)?
            } else {
                inner.sampler.samples()
            };
            (samples, inner.min_key.clone(), inner.max_key.clone())
        };

        samples.sort();
        let last = samples.len() - 1;
        let mut bounds = Vec::with_capacity(n as usize + 1);
        for i in 0..=n as usize {
            let idx = i * last / n as usize;
            bounds.push(samples[idx].clone());
        }
        if let Some(min) = min_key {
            bounds[0] = min;
        }
        if let Some(max) = max_key {
            bounds[n as usize] = max;
        }
        Ok(bounds)
    }

    /// Total entries inserted (including flushed ones).
    pub fn entry_count(&self) -> u64 {
        self.inner.lock().entry_count
    }

    /// Release all resources and delete the backing directory.
    pub fn close(&self) -> ShuffleResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.memtable.take();
        inner.runs.clear();
        inner.applied_batches.clear();
        std::fs::remove_dir_all(&self.dir).map_err(|source| ShuffleError::StoreIo {
            operation: "close",
            source,
        })?;
        Ok(())
    }

    /// Whether a prior I/O failure poisoned this store.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn poison_for_tests(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn check_usable(&self) -> ShuffleResult<()> {
        if self.is_poisoned() {
            Err(self.poisoned_error())
        } else {
            Ok(())
        }
    }

    fn poisoned_error(&self) -> ShuffleError {
        ShuffleError::ShufflePoisoned {
            id_hex: self
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Surface an I/O result, poisoning the store on failure.
    fn guard_io<T>(&self, operation: &'static str, result: std::io::Result<T>) -> ShuffleResult<T> {
        result.map_err(|source| {
            self.poisoned.store(true, Ordering::Release);
            tracing::error!(dir = %self.dir.display(), operation, error = %source, "store poisoned");
            ShuffleError::StoreIo { operation, source }
        })
    }

    /// Write the memtable out as a new run. Caller holds the lock.
    fn flush_locked(&self, inner: &mut StoreInner) -> ShuffleResult<()> {
        if inner.memtable.is_empty() {
            return Ok(());
        }
        let id = inner.next_run_id;
        inner.next_run_id += 1;
        let path = run_path(&self.dir, id);

        let entries = inner.memtable.take();
        let meta = self.guard_io("flush", (|| {
            let mut writer = RunWriter::create(path)?;
            for ((key, seq), row) in &entries {
                writer.append(key, *seq, row)?;
            }
            writer.finish(id)
        })())?;
        tracing::debug!(
            dir = %self.dir.display(),
            run = meta.id,
            entries = meta.entries,
            "flushed memtable"
        );
        inner.runs.push(meta);
        Ok(())
    }

    /// Collapse all runs into a single new run. Caller holds the lock.
    fn compact_locked(&self, inner: &mut StoreInner) -> ShuffleResult<()> {
        let id = inner.next_run_id;
        inner.next_run_id += 1;
        let path = run_path(&self.dir, id);
        let old_runs = std::mem::take(&mut inner.runs);

        let meta = self.guard_io("merge", (|| {
            let mut sources = Vec::with_capacity(old_runs.len());
            for run in &old_runs {
                sources.push(MergeSource::Run(RunReader::open(&run.path)?));
            }
            let mut stream = MergeStream::new(sources)?;
            let mut writer = RunWriter::create(path)?;
            while let Some(entry) = stream.next()? {
                writer.append(&entry.key, entry.seq, &entry.row)?;
            }
            let meta = writer.finish(id)?;
            for run in &old_runs {
                std::fs::remove_file(&run.path)?;
            }
            Ok(meta)
        })())?;
        tracing::debug!(
            dir = %self.dir.display(),
            run = meta.id,
            entries = meta.entries,
            merged = old_runs.len(),
            "compacted runs"
        );
        inner.runs.push(meta);
        Ok(())
    }

    /// Every key in the store, in order. Caller holds the lock.
    fn collect_all_keys(&self, inner: &StoreInner) -> ShuffleResult<Vec<Bytes>> {
        let mut sources = Vec::with_capacity(inner.runs.len() + 1);
        for run in &inner.runs {
            let reader = self.guard_io("scan", RunReader::open(&run.path))?;
            sources.push(MergeSource::Run(reader));
        }
        sources.push(MergeSource::Memtable(
            inner.memtable.snapshot_range(&KeyInterval::all()).into_iter(),
        ));
        let mut stream = self.guard_io("scan", MergeStream::new(sources))?;
        let mut keys = Vec::new();
        while let Some(entry) = self.guard_io("scan", stream.next())? {
            keys.push(entry.key);
        }
        Ok(keys)
    }
}

/// Streaming result of [`Store::range`].
pub struct RangeScan {
    stream: MergeStream,
    interval: KeyInterval,
    poisoned: Arc<AtomicBool>,
    done: bool,
}

impl Iterator for RangeScan {
    type Item = ShuffleResult<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.stream.next() {
                Ok(Some(entry)) => {
                    if self.interval.beyond_end(&entry.key) {
                        self.done = true;
                        return None;
                    }
                    if !self.interval.contains(&entry.key) {
                        continue;
                    }
                    return Some(Ok((entry.key, entry.row)));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(source) => {
                    self.done = true;
                    self.poisoned.store(true, Ordering::Release);
                    return Some(Err(ShuffleError::StoreIo {
                        operation: "scan",
                        source,
                    }));
                }
            }
        }
    }
}
