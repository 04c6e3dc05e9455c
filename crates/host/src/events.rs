//! Events posted on the [`EventBus`](chunky_engine::event_bus::EventBus) while
//! a world is being pre-generated.
//!
//! Each generation task posts [`GenerationProgressEvent`]s at a fixed chunk
//! interval and exactly one [`GenerationCompleteEvent`] when it stops, whether
//! it ran to the end or was cancelled.

use serde::Serialize;

/// Periodic progress of one world's generation task.
#[derive(Clone, Debug, Serialize)]
pub struct GenerationProgressEvent {
    pub world: String,
    /// Chunks visited so far, including ones skipped as already generated.
    pub chunks: u64,
    pub total: u64,
    pub percent: f64,
    /// Chunks per second since the task started.
    pub rate: f64,
    /// Last chunk visited.
    pub x: i32,
    pub z: i32,
}

/// Final tally of one world's generation task.
#[derive(Clone, Debug, Serialize)]
pub struct GenerationCompleteEvent {
    pub world: String,
    pub generated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub elapsed_secs: f64,
}
