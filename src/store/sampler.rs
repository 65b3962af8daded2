//! Reservoir sampling of inserted keys for partition bounds.
//!
//! Algorithm R: every inserted key has an equal chance of occupying one of
//! the reservoir slots, so the sorted reservoir approximates the key
//! distribution regardless of insert order.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fixed-capacity uniform sample of the keys seen so far.
pub struct ReservoirSampler {
    capacity: usize,
    seen: u64,
    samples: Vec<Bytes>,
    rng: StdRng,
}

impl std::fmt::Debug for ReservoirSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservoirSampler")
            .field("capacity", &self.capacity)
            .field("seen", &self.seen)
            .field("samples", &self.samples.len())
            .finish()
    }
}

impl ReservoirSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: 0,
            samples: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Observe one inserted key.
    pub fn observe(&mut self, key: &Bytes) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(key.clone());
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.samples[slot as usize] = key.clone();
        }
    }

    /// Number of keys observed so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Clone the current sample set.
    pub fn samples(&self) -> Vec<Bytes> {
        self.samples.clone()
    }
}
