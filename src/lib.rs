//! ioforge - synthetic block-IO workload generator
//!
//! ioforge opens one regular file and hammers it with a stream of mixed
//! read/write requests under tunable write/random ratios, queue depth, and
//! pacing, reporting throughput at a fixed interval.
//!
//! # Architecture
//!
//! - **Interchangeable IO engines**: sync (blocking read/write), vectored
//!   (worker pool over preadv/pwritev2), aio (Linux AIO submit/reap ring)
//! - **One request-generator contract**: every engine pulls `AccessParams`
//!   from a shared pattern generator whose in-flight offset set guarantees
//!   that no two outstanding requests ever target the same file offset
//! - **Live reconfiguration**: a stdin command channel and a timed command
//!   script mutate ratios, flush cadence, and block size while IO is in
//!   flight
//! - **Lock-free run totals**: relaxed atomic counters sampled periodically
//!   from the program thread

pub mod command;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod pattern;
pub mod stats;
pub mod util;

pub use config::{LiveConfig, Settings};
pub use engine::Engine;

/// Compile-time cap on concurrently in-flight requests. Bounds the vectored
/// engine's thread pool, the AIO slot ring, and the offset exclusion set.
pub const MAX_IODEPTH: usize = 128;

/// Result type used throughout ioforge
pub type Result<T> = anyhow::Result<T>;
