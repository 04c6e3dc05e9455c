pub mod bits;
pub mod position;

use std::sync::Arc;
use std::time::Instant;

use bits::RegionBits;
use dashmap::DashMap;
use position::{ChunkCoord, RegionCoord, RegionKey};
use rayon::prelude::*;

use crate::metrics::{MetricsSnapshot, RegionCacheMetrics};

/// Which chunks of one world have been generated. Thread-safe, lock-sharded by region.
///
/// Regions are allocated on first write. Reads never allocate: a missing
/// region simply means none of its chunks are generated yet.
pub struct WorldState {
    regions: DashMap<RegionKey, Arc<RegionBits>>,
    metrics: RegionCacheMetrics,
}

impl WorldState {
    pub fn new(metrics_enabled: bool) -> Self {
        Self {
            regions: DashMap::new(),
            metrics: RegionCacheMetrics::with_enabled(metrics_enabled),
        }
    }

    /// The bit set for `chunk`'s region, creating it if needed.
    ///
    /// The `Arc` is cloned out so the map shard lock is released before the
    /// region's own lock is taken.
    fn region_or_insert(&self, chunk: ChunkCoord) -> Arc<RegionBits> {
        let key = chunk.region().key();
        if let Some(region) = self.regions.get(&key) {
            return Arc::clone(&region);
        }
        Arc::clone(&self.regions.entry(key).or_default())
    }

    fn region(&self, chunk: ChunkCoord) -> Option<Arc<RegionBits>> {
        self.regions
            .get(&chunk.region().key())
            .map(|region| Arc::clone(&region))
    }

    /// Mark a chunk as generated. Idempotent; re-marking still counts as a write.
    pub fn set_generated(&self, chunk: ChunkCoord) {
        let region = self.region_or_insert(chunk);
        let index = chunk.region_index();
        if self.metrics.is_enabled() {
            let start = Instant::now();
            region.set(index);
            self.metrics.record_write(start.elapsed());
        } else {
            region.set(index);
        }
    }

    pub fn is_generated(&self, chunk: ChunkCoord) -> bool {
        let Some(region) = self.region(chunk) else {
            return false;
        };
        let index = chunk.region_index();
        if self.metrics.is_enabled() {
            let start = Instant::now();
            let generated = region.get(index);
            self.metrics.record_read(start.elapsed());
            generated
        } else {
            region.get(index)
        }
    }

    /// Mark many chunks at once, spread over the rayon pool.
    pub fn set_generated_all(&self, chunks: &[ChunkCoord]) {
        chunks.par_iter().for_each(|&chunk| self.set_generated(chunk));
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total number of generated chunks across all regions.
    pub fn generated_count(&self) -> u64 {
        self.regions
            .iter()
            .map(|region| u64::from(region.value().count()))
            .sum()
    }

    /// Regions whose every chunk is generated.
    pub fn full_regions(&self) -> Vec<RegionCoord> {
        self.regions
            .iter()
            .filter(|region| region.value().is_full())
            .map(|region| region.key().unpack())
            .collect()
    }

    pub fn metrics(&self) -> &RegionCacheMetrics {
        &self.metrics
    }
}

/// `world name -> WorldState`. Worlds are independent and created lazily.
pub struct RegionCache {
    worlds: DashMap<String, Arc<WorldState>>,
    metrics_enabled: bool,
}

impl RegionCache {
    /// A cache following the process-wide metrics switch.
    pub fn new() -> Self {
        Self::with_metrics(crate::metrics::enabled())
    }

    /// A cache with metrics explicitly on or off, independent of the environment.
    pub fn with_metrics(metrics_enabled: bool) -> Self {
        Self {
            worlds: DashMap::new(),
            metrics_enabled,
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    /// Shared handle to a world's state, creating it if absent.
    ///
    /// A handle taken before [`clear`](Self::clear) keeps working on the
    /// evicted state; later lookups see a fresh one.
    pub fn world(&self, world: &str) -> Arc<WorldState> {
        if let Some(state) = self.worlds.get(world) {
            return Arc::clone(&state);
        }
        let state = self
            .worlds
            .entry(world.to_string())
            .or_insert_with(|| Arc::new(WorldState::new(self.metrics_enabled)));
        Arc::clone(&state)
    }

    fn existing(&self, world: &str) -> Option<Arc<WorldState>> {
        self.worlds.get(world).map(|state| Arc::clone(&state))
    }

    pub fn set_generated(&self, world: &str, x: i32, z: i32) {
        self.world(world).set_generated(ChunkCoord::new(x, z));
    }

    /// `false` for an unknown world, an unallocated region or an unset bit.
    /// Never creates entries.
    pub fn is_generated(&self, world: &str, x: i32, z: i32) -> bool {
        self.existing(world)
            .is_some_and(|state| state.is_generated(ChunkCoord::new(x, z)))
    }

    /// Drop everything known about `world`.
    pub fn clear(&self, world: &str) {
        if self.worlds.remove(world).is_some() {
            tracing::debug!("Cleared region cache for world '{}'", world);
        }
    }

    pub fn metrics(&self, world: &str) -> MetricsSnapshot {
        self.world(world).metrics().snapshot()
    }

    pub fn reset_metrics(&self, world: &str) {
        if let Some(state) = self.existing(world) {
            state.metrics().reset();
        }
    }

    pub fn region_count(&self, world: &str) -> usize {
        self.existing(world).map_or(0, |state| state.region_count())
    }

    pub fn full_region_count(&self, world: &str) -> usize {
        self.existing(world).map_or(0, |state| state.full_regions().len())
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }
}

impl Default for RegionCache {
    fn default() -> Self {
        Self::new()
    }
}
