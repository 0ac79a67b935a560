//! Synchronous IO engine
//!
//! The baseline backend: one blocking read or write per `make_requests`
//! call, issued from the controller thread with plain read(2)/write(2)
//! after positioning with lseek(2). The seek is skipped when the next
//! offset is contiguous with the previous request, so pure sequential
//! workloads cost one syscall per block.
//!
//! A short transfer counts as success for accounting purposes (the request
//! returned with data moved); `require_full_io` turns it into a hard error
//! for workloads where partial blocks would bias the numbers. A -1 return
//! is always fatal. Durability comes from the O_DSYNC open flag, not a
//! per-request flag, so `AccessParams::dsync` is ignored here.

use super::Engine;
use crate::pattern::{PatternState, RequestContext};
use crate::stats::Stats;
use crate::util::buffer::AlignedBuffer;
use crate::util::lock::UncontendedLock;
use crate::Result;
use anyhow::Context;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Single-threaded blocking engine
pub struct SyncEngine {
    fd: RawFd,
    ctx: Arc<RequestContext<UncontendedLock<PatternState>>>,
    buffer: Option<AlignedBuffer>,
    cur_size: u64,
    cur_offset: u64,
    require_full_io: bool,
    payload_rng: Xoshiro256PlusPlus,
}

impl SyncEngine {
    pub fn new(
        fd: RawFd,
        ctx: Arc<RequestContext<UncontendedLock<PatternState>>>,
        require_full_io: bool,
    ) -> Self {
        Self {
            fd,
            ctx,
            buffer: None,
            cur_size: 0,
            cur_offset: 0,
            require_full_io,
            payload_rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }
}

impl Engine for SyncEngine {
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let params = self.ctx.next()?;

        if self.cur_size != params.size {
            debug!(
                "request size changed from {} to {}",
                self.cur_size, params.size
            );
            self.cur_size = params.size;
            let mut buffer = AlignedBuffer::new(params.size as usize);
            buffer.fill_random(&mut self.payload_rng);
            self.buffer = Some(buffer);
        }
        let buffer = self.buffer.as_mut().expect("buffer sized above");

        let delta = Stats::for_request(params.block_size, params.write);

        // Reposition only when the target is not the next sequential byte
        if self.cur_offset + self.cur_size != params.offset {
            let ret = unsafe {
                libc::lseek(self.fd, params.offset as libc::off_t, libc::SEEK_SET)
            };
            if ret == -1 {
                let err = std::io::Error::last_os_error();
                return Err(err)
                    .context(format!("seek failed: offset={}", params.offset));
            }
        }
        self.cur_offset = params.offset;

        let ret = if params.write {
            unsafe {
                libc::write(
                    self.fd,
                    buffer.as_ptr() as *const libc::c_void,
                    self.cur_size as usize,
                )
            }
        } else {
            unsafe {
                libc::read(
                    self.fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    self.cur_size as usize,
                )
            }
        };

        if ret == -1 {
            let err = std::io::Error::last_os_error();
            self.ctx.offset_released(params.offset);
            return Err(err).context(format!(
                "{} failed: offset={}, size={}",
                if params.write { "write" } else { "read" },
                params.offset,
                self.cur_size
            ));
        }
        if self.require_full_io && (ret as u64) < self.cur_size {
            self.ctx.offset_released(params.offset);
            return Err(anyhow::anyhow!(
                "short {} at offset {}: {} of {} bytes",
                if params.write { "write" } else { "read" },
                params.offset,
                ret,
                self.cur_size
            ));
        }

        self.ctx.offset_released(params.offset);
        self.ctx.commit(&delta);
        Ok(())
    }
}
