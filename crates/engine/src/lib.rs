//! Concurrent core of the Chunky pre-generator.
//!
//! - [`region`]: which chunks of which world have already been generated.
//! - [`metrics`]: lock-wait telemetry for the region cache.
//! - [`scheduler`]: bounded worker pool running generation tasks.
//! - [`event_bus`]: typed, synchronous fan-out of progress events.
//! - [`config`]: start-up tunables resolved from the environment.

pub mod config;
pub mod event_bus;
pub mod metrics;
pub mod region;
pub mod scheduler;

mod util;
