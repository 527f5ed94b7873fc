//! Approximate prefix-reuse signal.
//!
//! Counts how often the head of a prompt has been seen and maps the count to a
//! cache-hit probability. Stands in for real prefix-cache statistics from the
//! engine; any replacement must keep the contract of prompt in, probability out,
//! non-decreasing across repeat sightings until eviction.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

pub const PREFIX_CHARS: usize = 512;
pub const DEFAULT_CAPACITY: usize = 4096;

pub type Fingerprint = [u8; 16];

pub struct PrefixHeuristic {
    seen: Mutex<LruCache<Fingerprint, u32>>,
}

impl Default for PrefixHeuristic {
    fn default() -> Self { Self::new() }
}

impl PrefixHeuristic {
    pub fn new() -> Self { Self::with_capacity(DEFAULT_CAPACITY) }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { seen: Mutex::new(LruCache::new(capacity)) }
    }

    /// 16-byte digest of the first [`PREFIX_CHARS`] characters.
    pub fn fingerprint(prompt: &str) -> Fingerprint {
        let end = prompt.char_indices().nth(PREFIX_CHARS).map(|(i, _)| i).unwrap_or(prompt.len());
        let digest = blake3::hash(&prompt.as_bytes()[..end]);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        out
    }

    /// Records a sighting and returns the estimated hit probability.
    pub fn observe(&self, prompt: &str) -> f64 {
        let key = Self::fingerprint(prompt);
        let mut seen = self.seen.lock();
        let count = match seen.get_mut(&key) {
            Some(c) => {
                *c = c.saturating_add(1);
                *c
            }
            None => {
                seen.push(key, 1);
                1
            }
        };
        hit_probability(count)
    }

    /// Peeks without touching recency.
    pub fn contains(&self, prompt: &str) -> bool {
        self.seen.lock().contains(&Self::fingerprint(prompt))
    }

    pub fn len(&self) -> usize { self.seen.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

fn hit_probability(count: u32) -> f64 {
    match count {
        0 => 0.0,
        1 => 0.1,
        2 => 0.3,
        3 => 0.5,
        4 => 0.7,
        _ => 0.9,
    }
}
