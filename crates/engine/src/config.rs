//! Start-up tunables.
//!
//! Values are looked up by dotted key (`chunky.schedulerQueueSize`). The
//! process environment is searched for the literal key first and then for the
//! conventional variable name (`CHUNKY_SCHEDULER_QUEUE_SIZE`). A malformed
//! value never aborts start-up: it is reported and the default is used.

use std::env;
use std::thread;
use std::time::Duration;

use thiserror::Error;

pub const METRICS_DISABLED_KEY: &str = "chunky.metrics.disabled";
pub const CORE_THREADS_KEY: &str = "chunky.schedulerCoreThreads";
pub const MAX_THREADS_KEY: &str = "chunky.schedulerMaxThreads";
pub const QUEUE_SIZE_KEY: &str = "chunky.schedulerQueueSize";

pub const DEFAULT_QUEUE_SIZE: usize = 200;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Largest accepted queue capacity. The FIFO allocates every slot up front.
pub const MAX_QUEUE_SIZE: usize = 1 << 16;
/// Largest accepted worker count, for both core and max.
pub const MAX_WORKER_THREADS: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: expected an integer, got {value:?}")]
    NotAnInteger { key: String, value: String },
    #[error("{key}: must not be negative, got {value}")]
    Negative { key: String, value: i64 },
    #[error("{key}: must be at most {max}, got {value}")]
    TooLarge { key: String, value: String, max: usize },
}

/// `chunky.schedulerCoreThreads` -> `CHUNKY_SCHEDULER_CORE_THREADS`.
pub fn env_var_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 8);
    let mut prev_lower = false;
    for ch in key.chars() {
        if ch == '.' || ch == '-' {
            out.push('_');
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch);
            prev_lower = false;
        } else {
            out.push(ch.to_ascii_uppercase());
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Property lookup against the process environment.
pub fn env_property(key: &str) -> Option<String> {
    env::var(key).ok().or_else(|| env::var(env_var_name(key)).ok())
}

/// `true`, `1`, `yes` and `on` (any case) are truthy; everything else is not.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Parse a non-negative count no greater than `max`.
pub fn parse_count(key: &str, raw: &str, max: usize) -> Result<usize, ConfigError> {
    let trimmed = raw.trim();
    let too_large = || ConfigError::TooLarge {
        key: key.to_string(),
        value: trimmed.to_string(),
        max,
    };
    let value: i128 = trimmed.parse().map_err(|_| {
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            too_large()
        } else {
            ConfigError::NotAnInteger {
                key: key.to_string(),
                value: raw.to_string(),
            }
        }
    })?;
    if value < 0 {
        return Err(ConfigError::Negative {
            key: key.to_string(),
            value: i64::try_from(value).unwrap_or(i64::MIN),
        });
    }
    usize::try_from(value)
        .ok()
        .filter(|&n| n <= max)
        .ok_or_else(too_large)
}

fn count_or_default<F>(lookup: &F, key: &str, default: usize, max: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => parse_count(key, &raw, max).unwrap_or_else(|e| {
            tracing::warn!("Invalid configuration ({e}); using default {default}");
            default
        }),
    }
}

/// Metrics are on unless `chunky.metrics.disabled` is truthy.
pub fn metrics_enabled_from<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    !lookup(METRICS_DISABLED_KEY).is_some_and(|v| parse_flag(&v))
}

pub fn metrics_enabled_from_env() -> bool {
    metrics_enabled_from(env_property)
}

/// Sizing of the task scheduler's worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Workers started up front.
    pub core_threads: usize,
    /// Hard cap on live workers.
    pub max_threads: usize,
    /// Capacity of the FIFO in front of the workers.
    pub queue_size: usize,
    /// Idle time after which any worker, core ones included, exits.
    pub keep_alive: Duration,
}

impl SchedulerConfig {
    /// Counts above [`MAX_WORKER_THREADS`] and [`MAX_QUEUE_SIZE`] are capped.
    pub fn new(core_threads: usize, max_threads: usize, queue_size: usize) -> Self {
        let core_threads = core_threads.min(MAX_WORKER_THREADS);
        Self {
            core_threads,
            max_threads: max_threads.clamp(core_threads.max(1), MAX_WORKER_THREADS),
            queue_size: queue_size.min(MAX_QUEUE_SIZE),
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn from_properties<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let core = count_or_default(
            &lookup,
            CORE_THREADS_KEY,
            defaults.core_threads,
            MAX_WORKER_THREADS,
        );
        let max = count_or_default(
            &lookup,
            MAX_THREADS_KEY,
            defaults.max_threads,
            MAX_WORKER_THREADS,
        );
        let queue = count_or_default(&lookup, QUEUE_SIZE_KEY, defaults.queue_size, MAX_QUEUE_SIZE);
        if max < core {
            tracing::warn!(
                "{MAX_THREADS_KEY} ({max}) is below {CORE_THREADS_KEY} ({core}); raising it to {core}"
            );
        }
        Self::new(core, max, queue)
    }

    pub fn from_env() -> Self {
        Self::from_properties(env_property)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self::new((cpus / 2).max(3), (cpus * 2).max(10), DEFAULT_QUEUE_SIZE)
    }
}

/// Every tunable read at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkyConfig {
    pub metrics_enabled: bool,
    pub scheduler: SchedulerConfig,
}

impl ChunkyConfig {
    pub fn from_properties<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            metrics_enabled: metrics_enabled_from(&lookup),
            scheduler: SchedulerConfig::from_properties(&lookup),
        }
    }

    /// Resolve from the environment. The metrics switch goes through
    /// [`crate::metrics::enabled`] so the start-up banner is logged once.
    pub fn from_env() -> Self {
        Self {
            metrics_enabled: crate::metrics::enabled(),
            scheduler: SchedulerConfig::from_env(),
        }
    }
}
