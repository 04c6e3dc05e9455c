//! Logs generation progress, and lock-contention metrics with every update.

use std::sync::Arc;

use chunky_engine::event_bus::{EventBus, Subscriber};
use chunky_engine::region::RegionCache;

use crate::events::{GenerationCompleteEvent, GenerationProgressEvent};

/// `3725` seconds -> `"1:02:05"`.
pub fn format_eta(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Seconds left at the current rate, if a rate is known.
pub fn eta_secs(e: &GenerationProgressEvent) -> Option<u64> {
    (e.rate > 0.0).then(|| (e.total.saturating_sub(e.chunks) as f64 / e.rate).ceil() as u64)
}

pub fn progress_line(e: &GenerationProgressEvent) -> String {
    let eta = eta_secs(e).map_or_else(|| "?".to_string(), format_eta);
    format!(
        "[Chunky] Task running for {}. Processed: {} chunks ({:.2}%), ETA: {}, Rate: {:.1} cps, Current: {}, {}",
        e.world, e.chunks, e.percent, eta, e.rate, e.x, e.z
    )
}

pub fn complete_line(e: &GenerationCompleteEvent) -> String {
    let verb = if e.cancelled { "cancelled" } else { "finished" };
    format!(
        "[Chunky] Task {} for {}. Generated: {}, already present: {}, failed: {}, in {:.1}s",
        verb, e.world, e.generated, e.skipped, e.failed, e.elapsed_secs
    )
}

/// Subscriptions held on the bus; pass back to [`ProgressReporter::detach`].
pub struct ProgressReporter {
    progress: Subscriber<GenerationProgressEvent>,
    complete: Subscriber<GenerationCompleteEvent>,
}

impl ProgressReporter {
    pub fn attach(bus: &EventBus, cache: Arc<RegionCache>) -> Self {
        let metrics_cache = Arc::clone(&cache);
        let progress = bus.subscribe_fn(move |e: &GenerationProgressEvent| {
            tracing::info!("{}", progress_line(e));
            if metrics_cache.metrics_enabled() {
                tracing::info!("\n{}", metrics_cache.metrics(&e.world));
            }
        });
        let complete = bus.subscribe_fn(move |e: &GenerationCompleteEvent| {
            tracing::info!("{}", complete_line(e));
            tracing::debug!(
                "'{}' now tracks {} regions",
                e.world,
                cache.region_count(&e.world)
            );
        });
        Self { progress, complete }
    }

    pub fn detach(&self, bus: &EventBus) {
        bus.unsubscribe(&self.progress);
        bus.unsubscribe(&self.complete);
    }
}
