//! Access-pattern generation
//!
//! Every engine, whatever its concurrency shape, obtains its next request
//! from [`RequestContext::next`]: a write-or-read draw, a random-or-
//! sequential draw, and an offset that is guaranteed not to collide with
//! any request still in flight. The in-flight guarantee comes from the
//! [`OffsetSet`] admission loop: a drawn offset is only returned once
//! `insert_if_absent` succeeds, and the engine reports it back through
//! [`RequestContext::offset_released`] exactly once, after the IO has
//! drained.
//!
//! Both draws rescale the configured probabilities to an integer comparison
//! against a uniform draw in `[0, 10000)`, so a ratio of 0.0 never fires
//! and 1.0 always fires.
//!
//! The generator state lives behind a [`StateLock`], chosen by the
//! controller: a mutex when the vectored engine's worker threads share it,
//! an uncontended cell when a single-threaded engine owns the request path.

pub mod offset_set;

use crate::config::LiveConfig;
use crate::error::Fault;
use crate::stats::{Stats, StatsAccumulator};
use crate::util::lock::StateLock;
use crate::{Result, MAX_IODEPTH};
use offset_set::OffsetSet;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use tracing::debug;

/// Scale for the write/random probability draws
const RATIO_SCALE: u32 = 10_000;

/// Everything an engine needs to issue one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessParams {
    /// Request size in KiB
    pub block_size: u64,
    /// Request size in bytes (`block_size * 1024`)
    pub size: u64,
    /// Byte offset, always a multiple of `size`
    pub offset: u64,
    /// Write (true) or read (false)
    pub write: bool,
    /// Request the durable-write flag on this write
    pub dsync: bool,
}

/// Mutable pattern-generator state, guarded by the context's lock
#[derive(Debug)]
pub struct PatternState {
    rng: Xoshiro256PlusPlus,
    filesize_mib: u64,
    block_size: u64,
    request_size: u64,
    file_blocks: u64,
    cur_block: u64,
    in_flight: OffsetSet,
}

impl PatternState {
    pub fn new(filesize_mib: u64, block_size: u64) -> Self {
        Self::with_rng(filesize_mib, block_size, Xoshiro256PlusPlus::from_entropy())
    }

    /// Deterministic state for reproducible tests
    pub fn with_seed(filesize_mib: u64, block_size: u64, seed: u64) -> Self {
        Self::with_rng(
            filesize_mib,
            block_size,
            Xoshiro256PlusPlus::seed_from_u64(seed),
        )
    }

    fn with_rng(filesize_mib: u64, block_size: u64, rng: Xoshiro256PlusPlus) -> Self {
        let mut state = Self {
            rng,
            filesize_mib,
            block_size: 0,
            request_size: 0,
            file_blocks: 0,
            cur_block: 0,
            in_flight: OffsetSet::with_capacity(MAX_IODEPTH),
        };
        state.set_block_size(block_size);
        state
    }

    /// Switch the request size
    ///
    /// Recomputes the block count and parks the sequential cursor at
    /// `file_blocks`, so the next sequential draw wraps to offset 0.
    fn set_block_size(&mut self, block_size: u64) {
        debug!(
            "block size changed from {} to {} KiB",
            self.block_size, block_size
        );
        self.block_size = block_size;
        self.request_size = block_size * 1024;
        self.file_blocks = (self.filesize_mib * 1024) / block_size;
        self.cur_block = self.file_blocks;
    }
}

/// Shared request-generation context handed to every engine
///
/// Bundles the live configuration, the locked pattern state, and the run
/// totals: one aggregate instead of a fistful of callbacks, with the lock
/// discipline visible in the type parameter.
pub struct RequestContext<L: StateLock<PatternState>> {
    live: Arc<LiveConfig>,
    stats: Arc<StatsAccumulator>,
    pattern: L,
    dsync: bool,
}

impl<L: StateLock<PatternState>> RequestContext<L> {
    pub fn new(
        live: Arc<LiveConfig>,
        stats: Arc<StatsAccumulator>,
        state: PatternState,
        dsync: bool,
    ) -> Self {
        Self {
            live,
            stats,
            pattern: L::new(state),
            dsync,
        }
    }

    pub fn live(&self) -> &LiveConfig {
        &self.live
    }

    pub fn stats(&self) -> &StatsAccumulator {
        &self.stats
    }

    /// Produce the next request
    ///
    /// Loops until the drawn offset is admitted into the in-flight set, so
    /// the caller may issue the returned request without aliasing another
    /// outstanding offset. With iodepth small relative to the block count
    /// this terminates in O(1) draws.
    pub fn next(&self) -> Result<AccessParams> {
        let write_cut = (self.live.write_ratio() * RATIO_SCALE as f64) as u32;
        let random_cut = (self.live.random_ratio() * RATIO_SCALE as f64) as u32;

        self.pattern.with(|state| {
            let write = state.rng.gen_range(0..RATIO_SCALE) < write_cut;
            let block_size = state.block_size;
            let size = state.request_size;

            let offset = loop {
                if state.rng.gen_range(0..RATIO_SCALE) < random_cut {
                    state.cur_block = state.rng.gen_range(0..state.file_blocks);
                } else {
                    state.cur_block += 1;
                    if state.cur_block >= state.file_blocks {
                        state.cur_block = 0;
                    }
                }
                let offset = state.cur_block * size;
                if state.in_flight.insert_if_absent(offset) {
                    break offset;
                }
            };

            if state.in_flight.len() > MAX_IODEPTH {
                return Err(Fault::Invariant(
                    "number of in-flight offsets exceeds the iodepth cap".into(),
                )
                .into());
            }

            Ok(AccessParams {
                block_size,
                size,
                offset,
                write,
                dsync: self.dsync,
            })
        })
    }

    /// Return an offset to the pool once its IO has drained
    ///
    /// Must be called exactly once per successful [`next`](Self::next).
    pub fn offset_released(&self, offset: u64) {
        self.pattern.with(|state| {
            state.in_flight.remove(offset);
        });
    }

    /// Commit an accounting delta to the run totals
    pub fn commit(&self, delta: &Stats) {
        self.stats.add(delta);
    }

    /// Apply a pending block-size change, if any
    ///
    /// Called by the controller between engine invocations; a no-op when
    /// the live block size already matches the generator state.
    pub fn refresh_block_size(&self) {
        let block_size = self.live.block_size();
        self.pattern.with(|state| {
            if state.block_size != block_size {
                state.set_block_size(block_size);
            }
        });
    }

    /// Number of offsets currently in flight (test instrumentation)
    pub fn in_flight_len(&self) -> usize {
        self.pattern.with(|state| state.in_flight.len())
    }
}
