//! Run configuration
//!
//! Configuration is split in two:
//!
//! - [`Settings`]: validated once at startup and immutable afterwards
//!   (file identity, engine selection, open flags, iodepth, duration).
//! - [`LiveConfig`]: the knobs the command channel and command script may
//!   mutate while IO is in flight (ratios, flush cadence, block size,
//!   pacing, pause flag). Stored as relaxed atomics so engine threads read
//!   them on the request path without locks.
//!
//! Both the stdin reader and the script scheduler funnel mutations through
//! [`LiveConfig::execute_command`], the single entry point that validates,
//! applies, and flags the change for the stats reporter.

pub mod cli;
pub mod script;

use crate::engine::EngineKind;
use crate::error::Fault;
use crate::{Result, MAX_IODEPTH};
use cli::Cli;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// Validated startup configuration, immutable during the run
#[derive(Debug, Clone)]
pub struct Settings {
    pub filename: PathBuf,
    pub create_file: bool,
    pub delete_file: bool,
    /// File size in MiB; 0 means "derive from stat" when reusing a file
    pub filesize: u64,
    pub block_size: u64,
    pub flush_blocks: u64,
    pub write_ratio: f64,
    pub random_ratio: f64,
    pub sleep_interval: u64,
    pub sleep_count: u64,
    pub stats_interval: u64,
    pub wait: bool,
    pub io_engine: EngineKind,
    pub o_direct: bool,
    pub o_dsync: bool,
    pub iodepth: u32,
    pub duration: u64,
    pub command_script: String,
    pub require_full_io: bool,
    pub log_level: String,
    pub log_time_prefix: bool,
}

impl Settings {
    /// Build and validate settings from parsed CLI flags
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let settings = Self {
            filename: PathBuf::from(cli.filename),
            create_file: cli.create_file,
            delete_file: cli.delete_file,
            filesize: cli.filesize,
            block_size: cli.block_size,
            flush_blocks: cli.flush_blocks,
            write_ratio: cli.write_ratio,
            random_ratio: cli.random_ratio,
            sleep_interval: cli.sleep_interval,
            sleep_count: cli.sleep_count,
            stats_interval: cli.stats_interval,
            wait: cli.wait,
            io_engine: cli.io_engine,
            o_direct: cli.o_direct,
            o_dsync: cli.o_dsync,
            iodepth: cli.iodepth,
            duration: cli.duration,
            command_script: cli.command_script,
            require_full_io: cli.require_full_io,
            log_level: cli.log_level,
            log_time_prefix: cli.log_time_prefix,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.filename.as_os_str().is_empty() {
            return Err(Fault::Config("filename must not be empty".into()).into());
        }
        if self.create_file && self.filesize < 10 {
            return Err(Fault::Config(format!(
                "filesize must be >= 10 MiB when creating the file (got {})",
                self.filesize
            ))
            .into());
        }
        if self.block_size < 4 {
            return Err(Fault::Config(format!(
                "block_size must be >= 4 KiB (got {})",
                self.block_size
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&self.write_ratio) {
            return Err(Fault::Config(format!(
                "write_ratio must be within [0, 1] (got {})",
                self.write_ratio
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&self.random_ratio) {
            return Err(Fault::Config(format!(
                "random_ratio must be within [0, 1] (got {})",
                self.random_ratio
            ))
            .into());
        }
        if self.sleep_count == 0 {
            return Err(Fault::Config("sleep_count must be > 0".into()).into());
        }
        if self.stats_interval == 0 {
            return Err(Fault::Config("stats_interval must be > 0".into()).into());
        }
        if self.iodepth == 0 || self.iodepth as usize > MAX_IODEPTH {
            return Err(Fault::Config(format!(
                "iodepth must be within 1..={} (got {})",
                MAX_IODEPTH, self.iodepth
            ))
            .into());
        }
        if self.io_engine == EngineKind::Async && !self.o_direct {
            return Err(
                Fault::Config("the aio engine requires --o_direct=true".into()).into(),
            );
        }
        Ok(())
    }
}

/// Knobs mutable while the run is in flight
///
/// Ratios are stored as f64 bit patterns; everything else as plain counts.
/// All accesses are relaxed: a request observing a ratio one draw late is
/// part of the workload model, not a correctness issue.
#[derive(Debug)]
pub struct LiveConfig {
    filesize: AtomicU64,
    block_size: AtomicU64,
    write_ratio: AtomicU64,
    random_ratio: AtomicU64,
    flush_blocks: AtomicU64,
    sleep_interval: AtomicU64,
    sleep_count: AtomicU64,
    iodepth: AtomicU64,
    wait: AtomicBool,
    changed: AtomicBool,
}

impl LiveConfig {
    pub fn new(settings: &Settings) -> Self {
        Self {
            filesize: AtomicU64::new(settings.filesize),
            block_size: AtomicU64::new(settings.block_size),
            write_ratio: AtomicU64::new(settings.write_ratio.to_bits()),
            random_ratio: AtomicU64::new(settings.random_ratio.to_bits()),
            flush_blocks: AtomicU64::new(settings.flush_blocks),
            sleep_interval: AtomicU64::new(settings.sleep_interval),
            sleep_count: AtomicU64::new(settings.sleep_count),
            iodepth: AtomicU64::new(settings.iodepth as u64),
            wait: AtomicBool::new(settings.wait),
            changed: AtomicBool::new(false),
        }
    }

    pub fn filesize_mib(&self) -> u64 {
        self.filesize.load(Ordering::Relaxed)
    }

    /// Record the file size derived from stat when reusing an existing file
    pub fn set_filesize_mib(&self, mib: u64) {
        self.filesize.store(mib, Ordering::Relaxed);
    }

    pub fn block_size(&self) -> u64 {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn write_ratio(&self) -> f64 {
        f64::from_bits(self.write_ratio.load(Ordering::Relaxed))
    }

    pub fn set_write_ratio(&self, ratio: f64) {
        self.write_ratio.store(ratio.to_bits(), Ordering::Relaxed);
        self.changed.store(true, Ordering::Relaxed);
    }

    pub fn random_ratio(&self) -> f64 {
        f64::from_bits(self.random_ratio.load(Ordering::Relaxed))
    }

    pub fn flush_blocks(&self) -> u64 {
        self.flush_blocks.load(Ordering::Relaxed)
    }

    pub fn sleep_interval(&self) -> u64 {
        self.sleep_interval.load(Ordering::Relaxed)
    }

    pub fn sleep_count(&self) -> u64 {
        self.sleep_count.load(Ordering::Relaxed)
    }

    pub fn iodepth(&self) -> usize {
        self.iodepth.load(Ordering::Relaxed) as usize
    }

    pub fn wait(&self) -> bool {
        self.wait.load(Ordering::Relaxed)
    }

    pub fn set_wait(&self, value: bool) {
        self.wait.store(value, Ordering::Relaxed);
    }

    /// Take-and-clear the changed flag; the stats reporter uses this to
    /// skip the interval in which a mutation landed
    pub fn clear_changed(&self) -> bool {
        self.changed.swap(false, Ordering::Relaxed)
    }

    /// Apply one command line of the form `name` or `name=value`
    ///
    /// The stdin reader and the script scheduler both route through here.
    /// Validation failures leave the configuration untouched. `stop` is
    /// handled by the callers, which own the stop flags.
    pub fn execute_command(&self, line: &str) -> Result<()> {
        let (name, value) = match line.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => (line.trim(), ""),
        };

        match name {
            "help" => {
                info!(
                    "COMMANDS:\n\
                     \x20   stop           - terminate\n\
                     \x20   wait           - (true|false)\n\
                     \x20   sleep_interval - milliseconds\n\
                     \x20   sleep_count    - [1..]\n\
                     \x20   write_ratio    - [0..1]\n\
                     \x20   random_ratio   - [0..1]\n\
                     \x20   flush_blocks   - [0..]\n\
                     \x20   block_size     - KiB [4..]"
                );
            }
            "wait" => {
                let v = parse_bool(value, true)?;
                self.set_wait(v);
                info!("set wait={}", v);
            }
            "sleep_interval" => {
                let v = parse_uint(name, value)?;
                self.sleep_interval.store(v, Ordering::Relaxed);
                info!("set sleep_interval={}", v);
            }
            "sleep_count" => {
                let v = parse_uint(name, value)?;
                if v == 0 {
                    return Err(Fault::Config("sleep_count must be > 0".into()).into());
                }
                self.sleep_count.store(v, Ordering::Relaxed);
                self.changed.store(true, Ordering::Relaxed);
                info!("set sleep_count={}", v);
            }
            "write_ratio" => {
                let v = parse_ratio(name, value)?;
                self.set_write_ratio(v);
                info!("set write_ratio={}", v);
            }
            "random_ratio" => {
                let v = parse_ratio(name, value)?;
                self.random_ratio.store(v.to_bits(), Ordering::Relaxed);
                self.changed.store(true, Ordering::Relaxed);
                info!("set random_ratio={}", v);
            }
            "flush_blocks" => {
                let v = parse_uint(name, value)?;
                self.flush_blocks.store(v, Ordering::Relaxed);
                info!("set flush_blocks={}", v);
            }
            "block_size" => {
                let v = parse_uint(name, value)?;
                if v < 4 {
                    return Err(Fault::Config(format!(
                        "block_size must be >= 4 KiB (got {})",
                        v
                    ))
                    .into());
                }
                self.block_size.store(v, Ordering::Relaxed);
                self.changed.store(true, Ordering::Relaxed);
                info!("set block_size={}", v);
            }
            other => {
                return Err(Fault::Config(format!("invalid command: {}", other)).into());
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            filesize: AtomicU64::new(10),
            block_size: AtomicU64::new(4),
            write_ratio: AtomicU64::new(0.0f64.to_bits()),
            random_ratio: AtomicU64::new(0.0f64.to_bits()),
            flush_blocks: AtomicU64::new(1),
            sleep_interval: AtomicU64::new(0),
            sleep_count: AtomicU64::new(1),
            iodepth: AtomicU64::new(1),
            wait: AtomicBool::new(false),
            changed: AtomicBool::new(false),
        }
    }
}

fn parse_bool(value: &str, default: bool) -> Result<bool> {
    match value {
        "" => Ok(default),
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(Fault::Config(format!("invalid boolean value: {}", other)).into()),
    }
}

fn parse_uint(name: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Fault::Config(format!("invalid value for the command {}: {}", name, value)).into())
}

fn parse_ratio(name: &str, value: &str) -> Result<f64> {
    let v = value.parse::<f64>().map_err(|_| {
        Fault::Config(format!("invalid value for the command {}: {}", name, value))
    })?;
    if !(0.0..=1.0).contains(&v) {
        return Err(Fault::Config(format!(
            "{} must be within [0, 1] (got {})",
            name, v
        ))
        .into());
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            filename: PathBuf::from("/tmp/ioforge-test.bin"),
            create_file: true,
            delete_file: true,
            filesize: 10,
            block_size: 4,
            flush_blocks: 1,
            write_ratio: 0.0,
            random_ratio: 0.0,
            sleep_interval: 0,
            sleep_count: 1,
            stats_interval: 5,
            wait: false,
            io_engine: EngineKind::Sync,
            o_direct: false,
            o_dsync: false,
            iodepth: 1,
            duration: 0,
            command_script: String::new(),
            require_full_io: false,
            log_level: "info".to_string(),
            log_time_prefix: true,
        }
    }

    #[test]
    fn test_settings_valid() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn test_settings_filesize_too_small() {
        let mut s = base_settings();
        s.filesize = 9;
        assert!(s.validate().is_err());

        // Reusing an existing file lifts the startup minimum
        s.create_file = false;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_settings_block_size_minimum() {
        let mut s = base_settings();
        s.block_size = 2;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_settings_iodepth_bounds() {
        let mut s = base_settings();
        s.iodepth = 0;
        assert!(s.validate().is_err());
        s.iodepth = MAX_IODEPTH as u32;
        assert!(s.validate().is_ok());
        s.iodepth = MAX_IODEPTH as u32 + 1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_settings_async_requires_direct() {
        let mut s = base_settings();
        s.io_engine = EngineKind::Async;
        s.o_direct = false;
        assert!(s.validate().is_err());
        s.o_direct = true;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_settings_ratio_ranges() {
        let mut s = base_settings();
        s.write_ratio = 1.01;
        assert!(s.validate().is_err());
        s.write_ratio = 1.0;
        s.random_ratio = -0.1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_execute_command_updates_values() {
        let live = LiveConfig::for_tests();

        live.execute_command("write_ratio=0.5").unwrap();
        assert_eq!(live.write_ratio(), 0.5);
        assert!(live.clear_changed());

        live.execute_command("random_ratio=1.0").unwrap();
        assert_eq!(live.random_ratio(), 1.0);

        live.execute_command("flush_blocks=16").unwrap();
        assert_eq!(live.flush_blocks(), 16);

        live.execute_command("block_size=8").unwrap();
        assert_eq!(live.block_size(), 8);

        live.execute_command("sleep_interval=100").unwrap();
        assert_eq!(live.sleep_interval(), 100);

        live.execute_command("sleep_count=4").unwrap();
        assert_eq!(live.sleep_count(), 4);
    }

    #[test]
    fn test_execute_command_wait_defaults_true() {
        let live = LiveConfig::for_tests();
        live.execute_command("wait").unwrap();
        assert!(live.wait());
        live.execute_command("wait=false").unwrap();
        assert!(!live.wait());
    }

    #[test]
    fn test_execute_command_rejects_out_of_range() {
        let live = LiveConfig::for_tests();
        live.execute_command("write_ratio=0.25").unwrap();
        live.clear_changed();

        // Out-of-range value reported, state untouched, no changed flag
        assert!(live.execute_command("write_ratio=2.0").is_err());
        assert_eq!(live.write_ratio(), 0.25);
        assert!(!live.clear_changed());

        assert!(live.execute_command("sleep_count=0").is_err());
        assert_eq!(live.sleep_count(), 1);

        assert!(live.execute_command("block_size=2").is_err());
        assert_eq!(live.block_size(), 4);
    }

    #[test]
    fn test_execute_command_unknown() {
        let live = LiveConfig::for_tests();
        assert!(live.execute_command("warp_factor=9").is_err());
    }

    #[test]
    fn test_flush_blocks_does_not_flag_change() {
        // Cadence tweaks do not invalidate the in-flight stats interval
        let live = LiveConfig::for_tests();
        live.execute_command("flush_blocks=0").unwrap();
        assert!(!live.clear_changed());
    }
}
