//! Pre-generation driver.
//!
//! A [`GenerationTask`] walks a square area of chunks ring by ring outwards
//! from its centre. Chunks the [`RegionCache`] already knows about are
//! skipped; every other chunk is handed to the [`ChunkGenerator`] and, on
//! success, recorded in the cache. Progress is posted to the [`EventBus`].
//!
//! # Plugging in a generator
//!
//! Implement [`ChunkGenerator`] and pass it to [`Pregenerator::new`]. The
//! driver handles ordering, skipping, cancellation and event posting.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chunky_engine::event_bus::EventBus;
use chunky_engine::region::RegionCache;
use chunky_engine::region::position::ChunkCoord;
use chunky_engine::scheduler::{SchedulerError, TaskHandle, TaskScheduler};

use crate::events::{GenerationCompleteEvent, GenerationProgressEvent};

/// Produces the terrain for one chunk. Called from scheduler worker threads.
pub trait ChunkGenerator: Send + Sync + 'static {
    /// Human-readable name (used for logging).
    fn name(&self) -> &'static str;

    /// Generate `chunk` in `world`. Returning an error leaves the chunk
    /// unmarked so a later run retries it.
    fn generate(&self, world: &str, chunk: ChunkCoord) -> anyhow::Result<()>;
}

/// Stand-in generator that only spends `cost` per chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedGenerator {
    pub cost: Duration,
}

impl ChunkGenerator for SimulatedGenerator {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn generate(&self, _world: &str, _chunk: ChunkCoord) -> anyhow::Result<()> {
        if !self.cost.is_zero() {
            thread::sleep(self.cost);
        }
        Ok(())
    }
}

/// Square of `(2 * radius + 1)^2` chunks around `center`. A negative radius
/// counts as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub center: ChunkCoord,
    pub radius: i32,
}

impl Area {
    pub const fn new(center: ChunkCoord, radius: i32) -> Self {
        Self { center, radius }
    }

    pub fn chunk_count(&self) -> u64 {
        let side = 2 * u64::from(self.radius.max(0).unsigned_abs()) + 1;
        side * side
    }

    /// Every chunk of the area, centre first, then each surrounding ring.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkCoord> {
        let center = self.center;
        (0..=self.radius.max(0)).flat_map(move |r| ring(center, r))
    }
}

/// Chunks at Chebyshev distance exactly `r` from `center`.
fn ring(center: ChunkCoord, r: i32) -> Vec<ChunkCoord> {
    if r == 0 {
        return vec![center];
    }
    let (cx, cz) = (center.x, center.z);
    let mut out = Vec::with_capacity(8 * r as usize);
    for x in cx - r..=cx + r {
        out.push(ChunkCoord::new(x, cz - r));
        out.push(ChunkCoord::new(x, cz + r));
    }
    for z in cz - r + 1..cz + r {
        out.push(ChunkCoord::new(cx - r, z));
        out.push(ChunkCoord::new(cx + r, z));
    }
    out
}

/// One world to pre-generate.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub world: String,
    pub area: Area,
    /// Post a progress event every this many chunks.
    pub update_every: u64,
}

impl GenerationTask {
    pub fn new(world: impl Into<String>, area: Area) -> Self {
        Self {
            world: world.into(),
            area,
            update_every: 1024,
        }
    }
}

/// Shared context for running generation tasks.
pub struct Pregenerator {
    cache: Arc<RegionCache>,
    bus: Arc<EventBus>,
    generator: Arc<dyn ChunkGenerator>,
}

impl Pregenerator {
    pub fn new(
        cache: Arc<RegionCache>,
        bus: Arc<EventBus>,
        generator: Arc<dyn ChunkGenerator>,
    ) -> Self {
        Self {
            cache,
            bus,
            generator,
        }
    }

    /// Record every chunk of `area` as already generated without calling the
    /// generator, e.g. for terrain that existed before the first run.
    /// Returns the number of chunks in the area.
    pub fn assume_generated(&self, world: &str, area: Area) -> u64 {
        let chunks: Vec<ChunkCoord> = area.chunks().collect();
        self.cache.world(world).set_generated_all(&chunks);
        tracing::debug!("Marked {} existing chunks in '{}'", chunks.len(), world);
        chunks.len() as u64
    }

    /// Run `task` on the current thread, checking `cancelled` before each chunk.
    pub fn run<C>(&self, task: &GenerationTask, cancelled: C) -> GenerationCompleteEvent
    where
        C: Fn() -> bool,
    {
        let state = self.cache.world(&task.world);
        let total = task.area.chunk_count();
        let update_every = task.update_every.max(1);
        let started = Instant::now();

        let mut visited = 0u64;
        let mut generated = 0u64;
        let mut skipped = 0u64;
        let mut failed = 0u64;
        let mut was_cancelled = false;

        for chunk in task.area.chunks() {
            if cancelled() {
                was_cancelled = true;
                break;
            }

            if state.is_generated(chunk) {
                skipped += 1;
            } else {
                match self.generator.generate(&task.world, chunk) {
                    Ok(()) => {
                        state.set_generated(chunk);
                        generated += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "{}: failed to generate chunk ({}, {}) in '{}': {:#}",
                            self.generator.name(),
                            chunk.x,
                            chunk.z,
                            task.world,
                            e
                        );
                        failed += 1;
                    }
                }
            }
            visited += 1;

            if visited % update_every == 0 || visited == total {
                let secs = started.elapsed().as_secs_f64();
                self.bus.call(&GenerationProgressEvent {
                    world: task.world.clone(),
                    chunks: visited,
                    total,
                    percent: 100.0 * visited as f64 / total as f64,
                    rate: if secs > 0.0 { visited as f64 / secs } else { 0.0 },
                    x: chunk.x,
                    z: chunk.z,
                });
            }
        }

        let complete = GenerationCompleteEvent {
            world: task.world.clone(),
            generated,
            skipped,
            failed,
            cancelled: was_cancelled,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        self.bus.call(&complete);
        complete
    }

    /// Submit `task` to the scheduler. The job stops early when the
    /// scheduler cancels it.
    pub fn start(
        self: &Arc<Self>,
        scheduler: &TaskScheduler,
        task: GenerationTask,
    ) -> Result<TaskHandle, SchedulerError> {
        let pregen = Arc::clone(self);
        let world = task.world.clone();
        let handle = scheduler.run_task(move |token| {
            pregen.run(&task, || token.is_cancelled());
        })?;
        tracing::info!(
            "Started generation task for '{}' ({} generator)",
            world,
            self.generator.name()
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use chunky_engine::config::SchedulerConfig;
    use chunky_engine::scheduler::TaskOutcome;

    fn setup() -> (Arc<RegionCache>, Arc<EventBus>) {
        (
            Arc::new(RegionCache::with_metrics(false)),
            Arc::new(EventBus::new()),
        )
    }

    /// Fails every chunk whose x coordinate is odd.
    struct OddFails;

    impl ChunkGenerator for OddFails {
        fn name(&self) -> &'static str {
            "odd-fails"
        }

        fn generate(&self, _world: &str, chunk: ChunkCoord) -> anyhow::Result<()> {
            anyhow::ensure!(chunk.x % 2 == 0, "odd column");
            Ok(())
        }
    }

    #[test]
    fn area_walks_rings_outwards_without_repeats() {
        let area = Area::new(ChunkCoord::new(10, -5), 3);
        let chunks: Vec<_> = area.chunks().collect();
        assert_eq!(chunks.len() as u64, area.chunk_count());
        assert_eq!(chunks[0], area.center);

        let unique: HashSet<_> = chunks.iter().copied().collect();
        assert_eq!(unique.len(), chunks.len());
        for c in &chunks {
            assert!((c.x - 10).abs() <= 3 && (c.z + 5).abs() <= 3);
        }

        let distance = |c: &ChunkCoord| (c.x - 10).abs().max((c.z + 5).abs());
        assert!(chunks.windows(2).all(|w| distance(&w[0]) <= distance(&w[1])));
    }

    #[test]
    fn zero_radius_is_one_chunk() {
        let area = Area::new(ChunkCoord::new(0, 0), 0);
        assert_eq!(area.chunks().count(), 1);
        assert_eq!(area.chunk_count(), 1);
    }

    #[test]
    fn negative_radius_matches_zero() {
        let area = Area::new(ChunkCoord::new(3, 3), -5);
        assert_eq!(area.chunk_count(), 1);
        assert_eq!(area.chunks().count() as u64, area.chunk_count());

        let (cache, bus) = setup();
        let progress = Arc::new(AtomicU64::new(0));
        let p = Arc::clone(&progress);
        bus.subscribe_fn(move |e: &GenerationProgressEvent| {
            assert_eq!(e.percent, 100.0);
            p.fetch_add(1, Ordering::SeqCst);
        });
        let pregen = Pregenerator::new(cache, bus, Arc::new(SimulatedGenerator::default()));
        let complete = pregen.run(&GenerationTask::new("w", area), || false);
        assert_eq!(complete.generated, 1);
        assert_eq!(progress.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_marks_area_and_reports() {
        let (cache, bus) = setup();
        let progress = Arc::new(AtomicU64::new(0));
        let last = Arc::new(Mutex::new(None));

        let p = Arc::clone(&progress);
        bus.subscribe_fn(move |_: &GenerationProgressEvent| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let l = Arc::clone(&last);
        bus.subscribe_fn(move |e: &GenerationCompleteEvent| {
            *l.lock().unwrap() = Some(e.clone());
        });

        let pregen = Pregenerator::new(
            Arc::clone(&cache),
            Arc::clone(&bus),
            Arc::new(SimulatedGenerator::default()),
        );
        let mut task = GenerationTask::new("overworld", Area::new(ChunkCoord::new(0, 0), 10));
        task.update_every = 100;

        let complete = pregen.run(&task, || false);
        assert_eq!(complete.generated, 441);
        assert_eq!(complete.skipped, 0);
        assert!(!complete.cancelled);
        // 441 chunks: four interval updates plus the final one.
        assert_eq!(progress.load(Ordering::SeqCst), 5);
        assert_eq!(last.lock().unwrap().as_ref().map(|e| e.generated), Some(441));

        for c in task.area.chunks() {
            assert!(cache.is_generated("overworld", c.x, c.z));
        }
        assert!(!cache.is_generated("overworld", 11, 0));

        let again = pregen.run(&task, || false);
        assert_eq!(again.generated, 0);
        assert_eq!(again.skipped, 441);
    }

    #[test]
    fn assumed_chunks_are_skipped() {
        let (cache, bus) = setup();
        let pregen = Pregenerator::new(
            Arc::clone(&cache),
            bus,
            Arc::new(OddFails),
        );
        // Chunks 1..=31 on both axes: region (0, 0) minus its x = 0 and z = 0 edges.
        let inner = Area::new(ChunkCoord::new(16, 16), 15);
        assert_eq!(pregen.assume_generated("w", inner), 31 * 31);
        assert_eq!(cache.full_region_count("w"), 0);

        let complete = pregen.run(&GenerationTask::new("w", inner), || false);
        assert_eq!(complete.skipped, 31 * 31);
        assert_eq!(complete.failed, 0);
    }

    #[test]
    fn cancellation_stops_between_chunks() {
        let (cache, bus) = setup();
        let pregen = Pregenerator::new(
            Arc::clone(&cache),
            bus,
            Arc::new(SimulatedGenerator::default()),
        );
        let task = GenerationTask::new("w", Area::new(ChunkCoord::new(0, 0), 5));

        let checks = AtomicU64::new(0);
        let complete = pregen.run(&task, || checks.fetch_add(1, Ordering::SeqCst) >= 10);
        assert!(complete.cancelled);
        assert_eq!(complete.generated, 10);
        assert_eq!(cache.world("w").generated_count(), 10);
    }

    #[test]
    fn failed_chunks_stay_unmarked() {
        let (cache, bus) = setup();
        let pregen = Pregenerator::new(Arc::clone(&cache), bus, Arc::new(OddFails));
        let task = GenerationTask::new("w", Area::new(ChunkCoord::new(0, 0), 2));

        let complete = pregen.run(&task, || false);
        // Columns x = -1 and x = 1 fail, five chunks each.
        assert_eq!(complete.failed, 10);
        assert_eq!(complete.generated, 15);
        assert!(!cache.is_generated("w", 1, 0));
        assert!(cache.is_generated("w", 2, 0));
    }

    #[test]
    fn start_runs_on_scheduler() {
        let (cache, bus) = setup();
        let scheduler = TaskScheduler::new(SchedulerConfig::new(1, 2, 8)).unwrap();
        let pregen = Arc::new(Pregenerator::new(
            Arc::clone(&cache),
            bus,
            Arc::new(SimulatedGenerator::default()),
        ));

        let handles: Vec<_> = ["overworld", "the_nether"]
            .into_iter()
            .map(|world| {
                pregen
                    .start(&scheduler, GenerationTask::new(world, Area::new(ChunkCoord::new(0, 0), 4)))
                    .unwrap()
            })
            .collect();
        for handle in &handles {
            assert_eq!(handle.wait_timeout(Duration::from_secs(10)), Some(TaskOutcome::Completed));
        }
        assert_eq!(cache.world("overworld").generated_count(), 81);
        assert_eq!(cache.world("the_nether").generated_count(), 81);
    }
}
