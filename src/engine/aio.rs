//! Linux AIO engine
//!
//! Kernel asynchronous submit/reap over the native AIO interface, invoked
//! through raw syscalls (io_setup/io_submit/io_getevents/io_cancel/
//! io_destroy) so no LGPL binding library is needed.
//!
//! The engine owns a ring of [`MAX_IODEPTH`] preallocated request slots.
//! Each `make_requests` pass tops up every inactive slot with index below
//! the live iodepth, then waits up to 200 ms for completions. A reaped slot
//! releases its offset, contributes its per-request stats to a single
//! per-poll commit, and is resubmitted immediately while still under the
//! live depth. A slot whose index sits above a freshly lowered iodepth
//! simply finishes its last request and goes idle; in-flight work is never
//! canceled by a depth change.
//!
//! This backend requires O_DIRECT: slot buffers, sizes, and offsets are all
//! multiples of the 512-byte alignment unit. Durable writes set `RWF_DSYNC`
//! in the control block's rw-flags.
//!
//! Teardown polls once more with a 300 ms budget, cancels whatever is still
//! active (cancel errors are logged, not fatal), and destroys the context.
//!
//! [`MAX_IODEPTH`]: crate::MAX_IODEPTH

use super::Engine;
use crate::error::Fault;
use crate::pattern::{PatternState, RequestContext};
use crate::stats::Stats;
use crate::util::buffer::AlignedBuffer;
use crate::util::lock::UncontendedLock;
use crate::{Result, MAX_IODEPTH};
use anyhow::Context;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel AIO control block (struct iocb from linux/aio_abi.h)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IoControlBlock {
    data: u64,          // completion cookie (slot index here)
    key: u32,
    aio_rw_flags: u32,  // RWF_* flags
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

/// Kernel AIO completion record (struct io_event)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, maxevents, ctxp)
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

unsafe fn io_submit(
    ctx: AioContext,
    nr: libc::c_long,
    iocbpp: *mut *mut IoControlBlock,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

unsafe fn io_cancel(
    ctx: AioContext,
    iocb: *mut IoControlBlock,
    result: *mut IoEvent,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_cancel, ctx, iocb, result)
}

/// One preallocated in-flight request descriptor
///
/// The control block is embedded by value; slots live in a boxed slice that
/// never reallocates, so the kernel sees a stable iocb address for as long
/// as the request is submitted.
struct RequestSlot {
    active: bool,
    write: bool,
    size: u64,
    offset: u64,
    iocb: IoControlBlock,
    buffer: Option<AlignedBuffer>,
    stats: Stats,
}

impl RequestSlot {
    fn idle() -> Self {
        Self {
            active: false,
            write: false,
            size: 0,
            offset: 0,
            iocb: IoControlBlock::default(),
            buffer: None,
            stats: Stats::default(),
        }
    }
}

/// Submit/reap engine over the Linux AIO interface
pub struct AioEngine {
    ctx_id: AioContext,
    fd: RawFd,
    ctx: Arc<RequestContext<UncontendedLock<PatternState>>>,
    slots: Box<[RequestSlot]>,
    events: Vec<IoEvent>,
    payload_rng: Xoshiro256PlusPlus,
}

impl AioEngine {
    pub fn new(
        fd: RawFd,
        ctx: Arc<RequestContext<UncontendedLock<PatternState>>>,
    ) -> Result<Self> {
        let mut ctx_id: AioContext = 0;
        let ret = unsafe { io_setup(MAX_IODEPTH as libc::c_int, &mut ctx_id) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("io_setup failed with nr_events={}", MAX_IODEPTH));
        }

        let slots = (0..MAX_IODEPTH)
            .map(|_| RequestSlot::idle())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            ctx_id,
            fd,
            ctx,
            slots,
            events: vec![IoEvent::default(); MAX_IODEPTH],
            payload_rng: Xoshiro256PlusPlus::from_entropy(),
        })
    }

    /// Prepare and submit one request on an idle slot
    ///
    /// Returns true when the kernel accepted the submission. A return of 0
    /// and transient errno values are warnings; the slot stays idle and the
    /// next pass retries it.
    fn submit_slot(&mut self, index: usize) -> Result<bool> {
        let params = self.ctx.next()?;

        let slot = &mut self.slots[index];
        debug_assert!(!slot.active);

        if slot.size != params.size {
            debug!(
                "slot[{}]: request size changed from {} to {}",
                index, slot.size, params.size
            );
            slot.size = params.size;
            let mut buffer = AlignedBuffer::new(params.size as usize);
            buffer.fill_random(&mut self.payload_rng);
            slot.buffer = Some(buffer);
        }
        let buffer = slot.buffer.as_mut().expect("buffer sized above");

        slot.stats = Stats::for_request(params.block_size, params.write);
        slot.write = params.write;
        slot.offset = params.offset;

        slot.iocb = IoControlBlock {
            data: index as u64,
            lio_opcode: if params.write {
                IOCB_CMD_PWRITE
            } else {
                IOCB_CMD_PREAD
            },
            aio_rw_flags: if params.write && params.dsync {
                libc::RWF_DSYNC as u32
            } else {
                0
            },
            aio_fildes: self.fd as u32,
            buf: buffer.as_mut_ptr() as u64,
            nbytes: slot.size,
            offset: params.offset as i64,
            ..IoControlBlock::default()
        };

        let mut iocb_ptr = &mut slot.iocb as *mut IoControlBlock;
        let ret = unsafe { io_submit(self.ctx_id, 1, &mut iocb_ptr) };

        if ret == 1 {
            slot.active = true;
            return Ok(true);
        }

        // Whatever the submit outcome, the drawn offset is not in flight
        self.ctx.offset_released(params.offset);

        if ret == 0 {
            warn!("aio submit returned 0");
            return Ok(false);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => {
                warn!("aio submit returned transient error: {}", err);
                Ok(false)
            }
            _ => Err(err).context(format!(
                "failed to submit aio request: slot={}, offset={}",
                index, params.offset
            )),
        }
    }
}

impl Engine for AioEngine {
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        let iodepth = self.ctx.live().iodepth();

        for index in 0..iodepth {
            if !self.slots[index].active {
                self.submit_slot(index)?;
            }
        }

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 200 * 1_000_000,
        };
        let nevents = unsafe {
            io_getevents(
                self.ctx_id,
                1,
                MAX_IODEPTH as libc::c_long,
                self.events.as_mut_ptr(),
                &mut timeout,
            )
        };

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        if nevents < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {
                    warn!("io_getevents returned transient error: {}", err);
                    Ok(())
                }
                _ => Err(err).context("io_getevents failed"),
            };
        }

        let mut reaped = Stats::default();
        for i in 0..nevents as usize {
            let event = self.events[i];
            let index = event.data as usize;
            if index >= self.slots.len() || !self.slots[index].active {
                return Err(Fault::Invariant(format!(
                    "completion for unknown request slot {}",
                    index
                ))
                .into());
            }

            if event.res < 0 {
                warn!(
                    "slot[{}]: {} completed with error: {}",
                    index,
                    if self.slots[index].write { "write" } else { "read" },
                    std::io::Error::from_raw_os_error(-event.res as i32)
                );
            }

            self.slots[index].active = false;
            self.ctx.offset_released(self.slots[index].offset);
            reaped += self.slots[index].stats;

            if index < iodepth {
                self.submit_slot(index)?;
            }
        }
        if nevents > 0 {
            self.ctx.commit(&reaped);
        }

        Ok(())
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        info!("waiting for pending aio requests");

        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 300 * 1_000_000,
        };
        let nevents = unsafe {
            io_getevents(
                self.ctx_id,
                self.ctx.live().iodepth() as libc::c_long,
                MAX_IODEPTH as libc::c_long,
                self.events.as_mut_ptr(),
                &mut timeout,
            )
        };
        if nevents < 0 {
            error!(
                "io_getevents failed during shutdown: {}",
                std::io::Error::last_os_error()
            );
        } else {
            for i in 0..nevents as usize {
                let index = self.events[i].data as usize;
                if let Some(slot) = self.slots.get_mut(index) {
                    slot.active = false;
                    self.ctx.offset_released(slot.offset);
                }
            }
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.active {
                info!("request slot {} is still active, canceling it", index);
                let mut event = IoEvent::default();
                let ret = unsafe { io_cancel(self.ctx_id, &mut slot.iocb, &mut event) };
                if ret < 0 {
                    warn!(
                        "io_cancel failed for slot {}: {}",
                        index,
                        std::io::Error::last_os_error()
                    );
                }
                slot.active = false;
            }
        }

        let ret = unsafe { io_destroy(self.ctx_id) };
        if ret < 0 {
            error!(
                "io_destroy failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveConfig;
    use crate::stats::StatsAccumulator;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    fn test_file(dir: &TempDir) -> std::fs::File {
        let path = dir.path().join("aio.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(10 * 1024 * 1024).unwrap();
        file
    }

    fn context_for(
        dsync: bool,
    ) -> (
        Arc<RequestContext<UncontendedLock<PatternState>>>,
        Arc<StatsAccumulator>,
        Arc<LiveConfig>,
    ) {
        let live = Arc::new(LiveConfig::for_tests());
        let stats = Arc::new(StatsAccumulator::new());
        let state = PatternState::with_seed(10, 4, 31);
        let ctx = Arc::new(RequestContext::new(
            Arc::clone(&live),
            Arc::clone(&stats),
            state,
            dsync,
        ));
        (ctx, stats, live)
    }

    #[test]
    fn test_submit_and_reap() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let (ctx, stats, _live) = context_for(false);
        let mut engine = AioEngine::new(file.as_raw_fd(), ctx).unwrap();
        let stop = AtomicBool::new(false);

        // Buffered temp file: completions arrive within a pass or two
        for _ in 0..20 {
            engine.make_requests(&stop).unwrap();
            if stats.snapshot().blocks > 0 {
                break;
            }
        }

        let total = stats.snapshot();
        assert!(total.blocks > 0);
        assert_eq!(total.blocks_write, 0);
        assert_eq!(total.kib_read, total.blocks_read * 4);
    }

    #[test]
    fn test_dsync_write_sets_rw_flag() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let (ctx, _stats, live) = context_for(true);
        live.execute_command("write_ratio=1.0").unwrap();

        let mut engine = AioEngine::new(file.as_raw_fd(), ctx).unwrap();
        engine.submit_slot(0).unwrap();

        assert_eq!(engine.slots[0].iocb.lio_opcode, IOCB_CMD_PWRITE);
        assert_eq!(engine.slots[0].iocb.aio_rw_flags, libc::RWF_DSYNC as u32);
        assert_eq!(engine.slots[0].iocb.data, 0);
    }

    #[test]
    fn test_read_leaves_rw_flags_clear() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let (ctx, _stats, _live) = context_for(true);

        let mut engine = AioEngine::new(file.as_raw_fd(), ctx).unwrap();
        engine.submit_slot(0).unwrap();

        assert_eq!(engine.slots[0].iocb.lio_opcode, IOCB_CMD_PREAD);
        assert_eq!(engine.slots[0].iocb.aio_rw_flags, 0);
    }

    #[test]
    fn test_submitted_buffers_aligned() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let (ctx, _stats, _live) = context_for(false);

        let mut engine = AioEngine::new(file.as_raw_fd(), ctx).unwrap();
        for index in 0..4 {
            engine.submit_slot(index).unwrap();
            let iocb = &engine.slots[index].iocb;
            assert_eq!(iocb.buf % 512, 0);
            assert_eq!(iocb.nbytes % 512, 0);
            assert_eq!(iocb.offset % 512, 0);
        }
    }

    #[test]
    fn test_drop_with_active_slots() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let (ctx, _stats, _live) = context_for(false);

        let mut engine = AioEngine::new(file.as_raw_fd(), ctx).unwrap();
        for index in 0..8 {
            engine.submit_slot(index).unwrap();
        }
        // Teardown must reap or cancel everything without hanging
        drop(engine);
    }

    #[test]
    fn test_no_aliased_offsets_across_ring() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let (ctx, _stats, live) = context_for(false);
        live.execute_command("random_ratio=1.0").unwrap();

        let mut engine = AioEngine::new(file.as_raw_fd(), ctx).unwrap();
        for index in 0..16 {
            engine.submit_slot(index).unwrap();
        }

        let mut seen = Vec::new();
        for slot in engine.slots.iter().filter(|s| s.active) {
            assert!(
                !seen.contains(&slot.offset),
                "two active slots share offset {}",
                slot.offset
            );
            seen.push(slot.offset);
        }
    }
}
