use super::position::REGION_AREA;
use std::sync::{Mutex, MutexGuard, PoisonError};

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = REGION_AREA / WORD_BITS;

/// Occupancy of one 32x32 region: bit `i` is set once chunk `i` has been generated.
///
/// Stored as a flat 128-byte array indexed by [`region_index`](super::position::region_index).
/// Every access goes through a short per-region critical section, so unrelated
/// regions never contend with each other. Bits are never cleared.
pub struct RegionBits {
    words: Mutex<[u64; WORDS]>,
}

impl RegionBits {
    pub fn new() -> Self {
        Self {
            words: Mutex::new([0; WORDS]),
        }
    }

    #[inline]
    const fn locate(index: usize) -> (usize, u64) {
        debug_assert!(index < REGION_AREA);
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    // Poison is ignored: every critical section is a single load or `|=`.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, [u64; WORDS]> {
        self.words.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark bit `index`. Returns `true` if it was previously unset.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        let mut words = self.lock();
        let was_set = words[word] & mask != 0;
        words[word] |= mask;
        !was_set
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.lock()[word] & mask != 0
    }

    /// Number of generated chunks in this region.
    pub fn count(&self) -> u32 {
        self.lock().iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.lock().iter().all(|w| *w == u64::MAX)
    }
}

impl Default for RegionBits {
    fn default() -> Self {
        Self::new()
    }
}
