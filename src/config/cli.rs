//! CLI argument parsing using clap

use crate::engine::EngineKind;
use clap::Parser;

/// ioforge - synthetic block-IO workload generator
///
/// Opens (or creates) a single target file and issues a stream of mixed
/// read/write requests against it, reporting throughput periodically.
/// Ratios, flush cadence, and block size can be changed while IO is in
/// flight through stdin commands or a timed command script.
#[derive(Parser, Debug, Clone)]
#[command(name = "ioforge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Target file name
    #[arg(long)]
    pub filename: String,

    /// Allocate the target file before the run
    #[arg(long = "create_file", action = clap::ArgAction::Set, default_value_t = true,
          num_args = 0..=1, default_missing_value = "true")]
    pub create_file: bool,

    /// Unlink the target file at teardown (only if it was created)
    #[arg(long = "delete_file", action = clap::ArgAction::Set, default_value_t = true,
          num_args = 0..=1, default_missing_value = "true")]
    pub delete_file: bool,

    /// File size in MiB (>= 10 when creating; derived from stat otherwise)
    #[arg(long, default_value_t = 0)]
    pub filesize: u64,

    /// Block size in KiB (>= 4, multiple of the filesystem block)
    #[arg(long = "block_size", default_value_t = 4)]
    pub block_size: u64,

    /// Issue fdatasync after every N written blocks (0 disables)
    #[arg(long = "flush_blocks", default_value_t = 1)]
    pub flush_blocks: u64,

    /// Write probability per request (0.0 - 1.0)
    #[arg(long = "write_ratio", default_value_t = 0.0)]
    pub write_ratio: f64,

    /// Random-access probability per request (0.0 - 1.0)
    #[arg(long = "random_ratio", default_value_t = 0.0)]
    pub random_ratio: f64,

    /// Advisory sleep interval between request batches (ms)
    #[arg(long = "sleep_interval", default_value_t = 0)]
    pub sleep_interval: u64,

    /// Advisory number of IOs issued before each sleep (> 0)
    #[arg(long = "sleep_count", default_value_t = 1)]
    pub sleep_count: u64,

    /// Statistics interval in seconds (> 0)
    #[arg(long = "stats_interval", default_value_t = 5)]
    pub stats_interval: u64,

    /// Start paused; resume with the wait=false command
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false,
          num_args = 0..=1, default_missing_value = "true")]
    pub wait: bool,

    /// IO engine backend
    #[arg(long = "io_engine", value_enum)]
    pub io_engine: EngineKind,

    /// Open the file with O_DIRECT (required by the aio engine)
    #[arg(long = "o_direct", action = clap::ArgAction::Set, default_value_t = false,
          num_args = 0..=1, default_missing_value = "true")]
    pub o_direct: bool,

    /// Durable writes: O_DSYNC open flag for the sync engine, per-request
    /// RWF_DSYNC for the vectored and aio engines
    #[arg(long = "o_dsync", action = clap::ArgAction::Set, default_value_t = false,
          num_args = 0..=1, default_missing_value = "true")]
    pub o_dsync: bool,

    /// Target number of concurrently in-flight requests (1 - 128)
    #[arg(long, default_value_t = 1)]
    pub iodepth: u32,

    /// Run duration in seconds (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    pub duration: u64,

    /// Timed command script: "t1[s|m]:cmd1=v1;t2[s|m]:cmd2=v2"
    #[arg(long = "command_script", default_value = "")]
    pub command_script: String,

    /// Treat a short read or write as a fatal error instead of success
    #[arg(long = "require_full_io", action = clap::ArgAction::Set, default_value_t = false,
          num_args = 0..=1, default_missing_value = "true")]
    pub require_full_io: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,

    /// Print date and time in each log line
    #[arg(long = "log_time_prefix", action = clap::ArgAction::Set, default_value_t = true,
          num_args = 0..=1, default_missing_value = "true")]
    pub log_time_prefix: bool,
}
