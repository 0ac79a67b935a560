//! Throughput statistics
//!
//! Per-request accounting is a plain value type ([`Stats`]) that engines
//! build, add, and subtract; the run totals live in relaxed atomic counters
//! ([`StatsAccumulator`]) so the program thread can sample them at any time
//! without taking a lock, no matter which engine is driving IO.
//!
//! The periodic report ([`StatsReporter`]) subtracts the previous sample
//! from the current totals and formats one fixed-key line per interval:
//!
//! ```text
//! STATS: {"time":"12", "total_MiB/s":"118.42", ...}
//! ```
//!
//! Key order is part of the output contract; consumers parse these lines.

use crate::config::LiveConfig;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache-line aligned atomic counter to prevent false sharing
///
/// The vectored engine has up to 128 worker threads bumping these counters;
/// padding each to its own cache line keeps the commits from invalidating
/// one another.
#[repr(align(64))]
#[derive(Debug, Default)]
struct AlignedCounter {
    value: AtomicU64,
}

impl AlignedCounter {
    #[inline]
    fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-request / per-interval accounting record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub blocks: u64,
    pub blocks_read: u64,
    pub blocks_write: u64,
    pub kib_read: u64,
    pub kib_write: u64,
}

impl Stats {
    /// Accounting delta for a single request of `block_size` KiB
    pub fn for_request(block_size: u64, write: bool) -> Self {
        Self {
            blocks: 1,
            blocks_read: if write { 0 } else { 1 },
            blocks_write: if write { 1 } else { 0 },
            kib_read: if write { 0 } else { block_size },
            kib_write: if write { block_size } else { 0 },
        }
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, rhs: Stats) -> Stats {
        Stats {
            blocks: self.blocks + rhs.blocks,
            blocks_read: self.blocks_read + rhs.blocks_read,
            blocks_write: self.blocks_write + rhs.blocks_write,
            kib_read: self.kib_read + rhs.kib_read,
            kib_write: self.kib_write + rhs.kib_write,
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        *self = *self + rhs;
    }
}

impl Sub for Stats {
    type Output = Stats;

    fn sub(self, rhs: Stats) -> Stats {
        Stats {
            blocks: self.blocks - rhs.blocks,
            blocks_read: self.blocks_read - rhs.blocks_read,
            blocks_write: self.blocks_write - rhs.blocks_write,
            kib_read: self.kib_read - rhs.kib_read,
            kib_write: self.kib_write - rhs.kib_write,
        }
    }
}

/// Lock-free run totals shared between the engines and the sampler
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    blocks: AlignedCounter,
    blocks_read: AlignedCounter,
    blocks_write: AlignedCounter,
    kib_read: AlignedCounter,
    kib_write: AlignedCounter,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a delta to the run totals
    pub fn add(&self, delta: &Stats) {
        self.blocks.add(delta.blocks);
        self.blocks_read.add(delta.blocks_read);
        self.blocks_write.add(delta.blocks_write);
        self.kib_read.add(delta.kib_read);
        self.kib_write.add(delta.kib_write);
    }

    /// Point-in-time copy of the totals
    pub fn snapshot(&self) -> Stats {
        Stats {
            blocks: self.blocks.get(),
            blocks_read: self.blocks_read.get(),
            blocks_write: self.blocks_write.get(),
            kib_read: self.kib_read.get(),
            kib_write: self.kib_write.get(),
        }
    }

    /// Running count of written blocks, used for the flush cadence
    #[inline]
    pub fn blocks_write(&self) -> u64 {
        self.blocks_write.get()
    }
}

/// Periodic STATS line emitter
///
/// Owned by the program loop. `tick` returns a formatted line when an
/// interval has elapsed, or `None` when it is not yet time. When a command
/// has mutated the live configuration since the previous sample, one
/// interval is skipped so the line never mixes two regimes; the baseline
/// still advances.
pub struct StatsReporter {
    interval: Duration,
    started: Instant,
    last_sample: Instant,
    last_stats: Stats,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            started: now,
            last_sample: now,
            last_stats: Stats::default(),
        }
    }

    pub fn tick(&mut self, totals: Stats, live: &LiveConfig) -> Option<String> {
        let now = Instant::now();
        let elapsed = now - self.last_sample;
        if elapsed <= self.interval {
            return None;
        }

        let line = if live.clear_changed() {
            // Configuration changed mid-interval; skip one sample
            None
        } else {
            let delta = totals - self.last_stats;
            Some(format_stats_line(
                &delta,
                elapsed.as_millis() as u64,
                (now - self.started).as_secs(),
                live,
            ))
        };

        self.last_sample = now;
        self.last_stats = totals;
        line
    }
}

/// Format one STATS line; keys are stable and in this order
fn format_stats_line(delta: &Stats, elapsed_ms: u64, elapsed_s: u64, live: &LiveConfig) -> String {
    let mib_per_s = |kib: u64| (kib * 1000) as f64 / (elapsed_ms * 1024) as f64;
    let per_s = |count: u64| (count * 1000) as f64 / elapsed_ms as f64;

    format!(
        "STATS: {{\"time\":\"{}\", \"total_MiB/s\":\"{:.2}\", \"read_MiB/s\":\"{:.2}\", \
         \"write_MiB/s\":\"{:.2}\", \"blocks/s\":\"{:.1}\", \"blocks_read/s\":\"{:.1}\", \
         \"blocks_write/s\":\"{:.1}\", \"wait\":\"{}\", \"filesize\":\"{}\", \
         \"block_size\":\"{}\", \"flush_blocks\":\"{}\", \"write_ratio\":\"{}\", \
         \"random_ratio\":\"{}\", \"sleep_interval\":\"{}\", \"sleep_count\":\"{}\"}}",
        elapsed_s,
        mib_per_s(delta.kib_read + delta.kib_write),
        mib_per_s(delta.kib_read),
        mib_per_s(delta.kib_write),
        per_s(delta.blocks),
        per_s(delta.blocks_read),
        per_s(delta.blocks_write),
        live.wait(),
        live.filesize_mib(),
        live.block_size(),
        live.flush_blocks(),
        live.write_ratio(),
        live.random_ratio(),
        live.sleep_interval(),
        live.sleep_count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(blocks_read: u64, blocks_write: u64, kib_read: u64, kib_write: u64) -> Stats {
        Stats {
            blocks: blocks_read + blocks_write,
            blocks_read,
            blocks_write,
            kib_read,
            kib_write,
        }
    }

    #[test]
    fn test_stats_for_request() {
        let read = Stats::for_request(4, false);
        assert_eq!(read, sample(1, 0, 4, 0));

        let write = Stats::for_request(8, true);
        assert_eq!(write, sample(0, 1, 0, 8));
    }

    #[test]
    fn test_stats_add_sub() {
        let a = sample(10, 5, 40, 20);
        let b = sample(4, 1, 16, 4);

        assert_eq!(a + b, sample(14, 6, 56, 24));
        assert_eq!(a - b, sample(6, 4, 24, 16));

        let mut c = a;
        c += b;
        assert_eq!(c, a + b);
    }

    #[test]
    fn test_accumulator_totals() {
        let acc = StatsAccumulator::new();
        acc.add(&Stats::for_request(4, false));
        acc.add(&Stats::for_request(4, true));
        acc.add(&Stats::for_request(4, true));

        let total = acc.snapshot();
        assert_eq!(total.blocks, 3);
        assert_eq!(total.blocks_read, 1);
        assert_eq!(total.blocks_write, 2);
        assert_eq!(total.kib_read, 4);
        assert_eq!(total.kib_write, 8);
        assert_eq!(acc.blocks_write(), 2);
    }

    #[test]
    fn test_accumulator_concurrent_commits() {
        use std::sync::Arc;

        let acc = Arc::new(StatsAccumulator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let acc = Arc::clone(&acc);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    acc.add(&Stats::for_request(4, false));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(acc.snapshot().blocks, 4000);
        assert_eq!(acc.snapshot().kib_read, 16000);
    }

    #[test]
    fn test_stats_line_shape() {
        let live = LiveConfig::for_tests();
        let delta = sample(1024, 1024, 4096, 4096);
        let line = format_stats_line(&delta, 1000, 7, &live);

        assert!(line.starts_with("STATS: {\"time\":\"7\", \"total_MiB/s\":\"8.00\""));
        assert!(line.contains("\"read_MiB/s\":\"4.00\""));
        assert!(line.contains("\"write_MiB/s\":\"4.00\""));
        assert!(line.contains("\"blocks/s\":\"2048.0\""));
        assert!(line.contains("\"blocks_read/s\":\"1024.0\""));
        assert!(line.contains("\"blocks_write/s\":\"1024.0\""));
        assert!(line.ends_with("}"));

        // Key order is part of the contract
        let keys = [
            "time",
            "total_MiB/s",
            "read_MiB/s",
            "write_MiB/s",
            "blocks/s",
            "blocks_read/s",
            "blocks_write/s",
            "wait",
            "filesize",
            "block_size",
            "flush_blocks",
            "write_ratio",
            "random_ratio",
            "sleep_interval",
            "sleep_count",
        ];
        let mut pos = 0;
        for key in keys {
            let needle = format!("\"{}\":", key);
            let found = line[pos..].find(&needle).expect("missing stats key");
            pos += found;
        }
    }

    #[test]
    fn test_reporter_skips_one_interval_after_change() {
        let live = LiveConfig::for_tests();
        let mut reporter = StatsReporter::new(Duration::from_millis(0));

        std::thread::sleep(Duration::from_millis(2));
        live.set_write_ratio(0.5);
        assert!(reporter.tick(sample(1, 0, 4, 0), &live).is_none());

        std::thread::sleep(Duration::from_millis(2));
        assert!(reporter.tick(sample(2, 0, 8, 0), &live).is_some());
    }
}
