//! Lock-wait telemetry for the region cache.
//!
//! Worker threads bump these counters on every cache access, so the hot path
//! must never serialise on them: each counter is striped over cache-padded
//! cells and a thread always adds to "its" cell. Snapshots sum the stripes.
//!
//! Collection is on by default and can be switched off for the whole process
//! with `chunky.metrics.disabled`; a disabled collector performs no atomic
//! writes at all.

use std::array;
use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::utils::CachePadded;
use serde::Serialize;

use crate::config;

/// Cells per striped counter. More than the worker pool will usually run.
const STRIPES: usize = 16;

/// Lines announcing the metrics switch at start-up.
pub fn startup_lines(enabled: bool) -> &'static [&'static str] {
    if enabled {
        &[
            "[Chunky] Performance profiling is ENABLED",
            "[Chunky] Lock contention metrics will be logged with each progress update",
        ]
    } else {
        &["[Chunky] Performance profiling is DISABLED"]
    }
}

static ENABLED: LazyLock<bool> = LazyLock::new(|| {
    let enabled = config::metrics_enabled_from_env();
    for line in startup_lines(enabled) {
        tracing::info!("{line}");
    }
    enabled
});

/// Process-wide metrics switch, resolved (and announced) on first use.
pub fn enabled() -> bool {
    *ENABLED
}

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Relaxed) % STRIPES;
}

/// Adder-style counter: concurrent increments land on different cache lines.
struct StripedCounter {
    cells: Box<[CachePadded<AtomicU64>; STRIPES]>,
}

impl StripedCounter {
    fn new() -> Self {
        Self {
            cells: Box::new(array::from_fn(|_| CachePadded::new(AtomicU64::new(0)))),
        }
    }

    #[inline]
    fn add(&self, n: u64) {
        let stripe = STRIPE.with(|s| *s);
        self.cells[stripe].fetch_add(n, Relaxed);
    }

    fn sum(&self) -> u64 {
        self.cells
            .iter()
            .fold(0u64, |acc, c| acc.wrapping_add(c.load(Relaxed)))
    }

    fn reset(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Relaxed);
        }
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Read/write counts and cumulative lock wait for one world's region cache.
pub struct RegionCacheMetrics {
    enabled: bool,
    read_ops: StripedCounter,
    read_wait_nanos: StripedCounter,
    write_ops: StripedCounter,
    write_wait_nanos: StripedCounter,
    last_reset_ms: AtomicU64,
}

impl RegionCacheMetrics {
    /// Collector following the process-wide switch.
    pub fn new() -> Self {
        Self::with_enabled(enabled())
    }

    pub fn with_enabled(enabled: bool) -> Self {
        Self {
            enabled,
            read_ops: StripedCounter::new(),
            read_wait_nanos: StripedCounter::new(),
            write_ops: StripedCounter::new(),
            write_wait_nanos: StripedCounter::new(),
            last_reset_ms: AtomicU64::new(now_epoch_ms()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn record_read(&self, lock_wait: Duration) {
        if !self.enabled {
            return;
        }
        self.read_ops.add(1);
        self.read_wait_nanos.add(lock_wait.as_nanos() as u64);
    }

    #[inline]
    pub fn record_write(&self, lock_wait: Duration) {
        if !self.enabled {
            return;
        }
        self.write_ops.add(1);
        self.write_wait_nanos.add(lock_wait.as_nanos() as u64);
    }

    /// Sum all stripes. Called from progress reporting, never the hot path.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_reset_ms = self.last_reset_ms.load(Relaxed);
        MetricsSnapshot {
            read_ops: self.read_ops.sum(),
            write_ops: self.write_ops.sum(),
            read_wait_nanos: self.read_wait_nanos.sum(),
            write_wait_nanos: self.write_wait_nanos.sum(),
            last_reset_epoch_ms: last_reset_ms,
            elapsed_ms: now_epoch_ms().saturating_sub(last_reset_ms),
        }
    }

    /// Zero every counter and restart the elapsed-time window.
    pub fn reset(&self) {
        self.read_ops.reset();
        self.write_ops.reset();
        self.read_wait_nanos.reset();
        self.write_wait_nanos.reset();
        self.last_reset_ms.store(now_epoch_ms(), Relaxed);
    }
}

impl Default for RegionCacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// How much time workers spend waiting on region locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Contention {
    High,
    Moderate,
    Low,
    Minimal,
}

impl Contention {
    pub fn from_percentage(pct: f64) -> Self {
        if pct > 15.0 {
            Contention::High
        } else if pct > 10.0 {
            Contention::Moderate
        } else if pct > 5.0 {
            Contention::Low
        } else {
            Contention::Minimal
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            Contention::High => {
                "HIGH contention - read-optimised region lock strongly recommended"
            }
            Contention::Moderate => "MODERATE contention - read-optimised region lock recommended",
            Contention::Low => "LOW contention - read-optimised region lock may provide minor benefit",
            Contention::Minimal => {
                "MINIMAL contention - read-optimised region lock not needed, current locking sufficient"
            }
        }
    }
}

/// Counter values at a point in time, plus the rates derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_wait_nanos: u64,
    pub write_wait_nanos: u64,
    pub last_reset_epoch_ms: u64,
    pub elapsed_ms: u64,
}

impl MetricsSnapshot {
    pub fn read_ops_per_sec(&self) -> f64 {
        per_second(self.read_ops, self.elapsed_ms)
    }

    pub fn write_ops_per_sec(&self) -> f64 {
        per_second(self.write_ops, self.elapsed_ms)
    }

    pub fn avg_read_wait_micros(&self) -> f64 {
        average_micros(self.read_wait_nanos, self.read_ops)
    }

    pub fn avg_write_wait_micros(&self) -> f64 {
        average_micros(self.write_wait_nanos, self.write_ops)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_ms as f64 / 1000.0
    }

    pub fn total_wait_secs(&self) -> f64 {
        (self.read_wait_nanos as f64 + self.write_wait_nanos as f64) / 1_000_000_000.0
    }

    /// Share of wall-clock time spent waiting on region locks, in percent.
    /// Can exceed 100 when many workers wait at once.
    pub fn contention_pct(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        let wait = self.read_wait_nanos as f64 + self.write_wait_nanos as f64;
        100.0 * wait / (self.elapsed_ms as f64 * 1_000_000.0)
    }

    pub fn contention(&self) -> Contention {
        Contention::from_percentage(self.contention_pct())
    }

    pub fn recommendation(&self) -> &'static str {
        self.contention().recommendation()
    }
}

fn per_second(ops: u64, elapsed_ms: u64) -> f64 {
    if elapsed_ms == 0 {
        0.0
    } else {
        ops as f64 * 1000.0 / elapsed_ms as f64
    }
}

fn average_micros(wait_nanos: u64, ops: u64) -> f64 {
    if ops == 0 {
        0.0
    } else {
        wait_nanos as f64 / 1000.0 / ops as f64
    }
}

/// `1234567` -> `"1,234,567"`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "=== CHUNKY PERFORMANCE METRICS ({:.1}s elapsed) ===",
            self.elapsed_secs()
        )?;
        writeln!(
            f,
            "  Reads:  {} ops ({:.1}/s, avg wait: {:.2}µs)",
            group_thousands(self.read_ops),
            self.read_ops_per_sec(),
            self.avg_read_wait_micros()
        )?;
        writeln!(
            f,
            "  Writes: {} ops ({:.1}/s, avg wait: {:.2}µs)",
            group_thousands(self.write_ops),
            self.write_ops_per_sec(),
            self.avg_write_wait_micros()
        )?;
        writeln!(f, "  Total lock wait time: {:.3}s", self.total_wait_secs())?;
        writeln!(f, "  LOCK CONTENTION: {:.1}%", self.contention_pct())?;
        writeln!(f, "  Recommendation: {}", self.recommendation())?;
        write!(f, "==========================================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_banner() {
        assert_eq!(
            startup_lines(true),
            [
                "[Chunky] Performance profiling is ENABLED",
                "[Chunky] Lock contention metrics will be logged with each progress update",
            ]
        );
        assert_eq!(
            startup_lines(false),
            ["[Chunky] Performance profiling is DISABLED"]
        );
    }

    fn snapshot(reads: u64, writes: u64, rw: u64, ww: u64, elapsed_ms: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            read_ops: reads,
            write_ops: writes,
            read_wait_nanos: rw,
            write_wait_nanos: ww,
            last_reset_epoch_ms: 0,
            elapsed_ms,
        }
    }

    #[test]
    fn disabled_collector_counts_nothing() {
        let m = RegionCacheMetrics::with_enabled(false);
        for _ in 0..1000 {
            m.record_read(Duration::from_nanos(50));
            m.record_write(Duration::from_nanos(50));
        }
        let s = m.snapshot();
        assert_eq!(s.read_ops, 0);
        assert_eq!(s.write_ops, 0);
        assert_eq!(s.read_wait_nanos + s.write_wait_nanos, 0);
    }

    #[test]
    fn counters_sum_across_threads() {
        let m = RegionCacheMetrics::with_enabled(true);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        m.record_read(Duration::from_nanos(2));
                        m.record_write(Duration::from_nanos(3));
                    }
                });
            }
        });
        let s = m.snapshot();
        assert_eq!(s.read_ops, 8000);
        assert_eq!(s.write_ops, 8000);
        assert_eq!(s.read_wait_nanos, 16_000);
        assert_eq!(s.write_wait_nanos, 24_000);
    }

    #[test]
    fn reset_zeroes_counters() {
        let m = RegionCacheMetrics::with_enabled(true);
        m.record_read(Duration::from_micros(1));
        m.record_write(Duration::from_micros(1));
        m.reset();
        let s = m.snapshot();
        assert_eq!((s.read_ops, s.write_ops), (0, 0));
        assert_eq!((s.read_wait_nanos, s.write_wait_nanos), (0, 0));
    }

    #[test]
    fn rates_are_zero_without_elapsed_time() {
        let s = snapshot(100, 100, 1_000, 1_000, 0);
        assert_eq!(s.read_ops_per_sec(), 0.0);
        assert_eq!(s.write_ops_per_sec(), 0.0);
        assert_eq!(s.contention_pct(), 0.0);
        assert_eq!(s.contention(), Contention::Minimal);
    }

    #[test]
    fn derived_values() {
        // 2 s window, 40 ms reads + 60 ms writes waiting = 5 %.
        let s = snapshot(4_000, 1_000, 40_000_000, 60_000_000, 2_000);
        assert_eq!(s.read_ops_per_sec(), 2_000.0);
        assert_eq!(s.write_ops_per_sec(), 500.0);
        assert_eq!(s.avg_read_wait_micros(), 10.0);
        assert_eq!(s.avg_write_wait_micros(), 60.0);
        assert!((s.total_wait_secs() - 0.1).abs() < 1e-12);
        assert!((s.contention_pct() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn recommendation_bands() {
        assert_eq!(Contention::from_percentage(15.1), Contention::High);
        assert_eq!(Contention::from_percentage(15.0), Contention::Moderate);
        assert_eq!(Contention::from_percentage(10.5), Contention::Moderate);
        assert_eq!(Contention::from_percentage(10.0), Contention::Low);
        assert_eq!(Contention::from_percentage(5.01), Contention::Low);
        assert_eq!(Contention::from_percentage(5.0), Contention::Minimal);
        assert_eq!(Contention::from_percentage(0.0), Contention::Minimal);
        assert!(Contention::High.recommendation().starts_with("HIGH"));
        assert!(Contention::Minimal.recommendation().starts_with("MINIMAL"));
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
        assert_eq!(group_thousands(100_000), "100,000");
    }

    #[test]
    fn telemetry_text_layout() {
        let s = snapshot(12_345, 678, 24_690_000, 1_356_000, 2_500);
        let text = s.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "=== CHUNKY PERFORMANCE METRICS (2.5s elapsed) ===");
        assert_eq!(lines[1], "  Reads:  12,345 ops (4938.0/s, avg wait: 2.00µs)");
        assert_eq!(lines[2], "  Writes: 678 ops (271.2/s, avg wait: 2.00µs)");
        assert_eq!(lines[3], "  Total lock wait time: 0.026s");
        assert_eq!(lines[4], "  LOCK CONTENTION: 1.0%");
        assert!(lines[5].starts_with("  Recommendation: MINIMAL"));
        assert_eq!(lines[6], "==========================================");
    }
}
