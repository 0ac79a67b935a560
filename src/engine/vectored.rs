//! Vectored IO engine
//!
//! A fixed pool of [`MAX_IODEPTH`] worker threads issuing blocking vectored
//! reads and writes (preadv(2)/pwritev2(2)). Only the first `iodepth`
//! workers actively pull requests; the rest doze and re-check, so a live
//! iodepth change takes effect without restarting any thread: a worker
//! whose index rises above the new depth goes dormant, one that falls below
//! it resumes.
//!
//! Durable writes use the per-request `RWF_DSYNC` flag of pwritev2 rather
//! than an open flag, so read performance is unaffected.
//!
//! Worker faults are parked in a shared slot; the controller's next
//! heartbeat re-raises them. EAGAIN/EINTR are retried in place, a
//! zero-byte transfer is logged and skipped, anything else kills the run.
//!
//! [`MAX_IODEPTH`]: crate::MAX_IODEPTH

use super::Engine;
use crate::pattern::{PatternState, RequestContext};
use crate::stats::Stats;
use crate::util::buffer::AlignedBuffer;
use crate::util::lock::MutexLock;
use crate::{Result, MAX_IODEPTH};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// State shared between the controller handle and the worker pool
struct Shared {
    fd: RawFd,
    ctx: Arc<RequestContext<MutexLock<PatternState>>>,
    stop: AtomicBool,
    paused: AtomicBool,
    fault: Mutex<Option<anyhow::Error>>,
}

/// Worker-pool engine over blocking vectored IO
pub struct VectoredEngine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl VectoredEngine {
    pub fn new(fd: RawFd, ctx: Arc<RequestContext<MutexLock<PatternState>>>) -> Self {
        let shared = Arc::new(Shared {
            fd,
            ctx,
            stop: AtomicBool::new(false),
            // Workers start dormant until the first heartbeat
            paused: AtomicBool::new(true),
            fault: Mutex::new(None),
        });

        let workers = (0..MAX_IODEPTH)
            .map(|pos| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared, pos))
            })
            .collect();

        Self { shared, workers }
    }
}

impl Engine for VectoredEngine {
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        if let Some(fault) = self
            .shared
            .fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.shared.stop.store(true, Ordering::Relaxed);
            return Err(fault);
        }

        if stop.load(Ordering::Relaxed) {
            self.shared.stop.store(true, Ordering::Relaxed);
        }
        self.shared.paused.store(false, Ordering::Relaxed);

        // The workers do the actual IO; this heartbeat just paces the
        // controller and surfaces faults.
        std::thread::sleep(Duration::from_millis(200));
        Ok(())
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    fn is_multithread(&self) -> bool {
        true
    }
}

impl Drop for VectoredEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, pos: usize) {
    let mut cur_size = 0u64;
    let mut buffer: Option<AlignedBuffer> = None;
    let mut payload_rng = Xoshiro256PlusPlus::from_entropy();

    while !shared.stop.load(Ordering::Relaxed) {
        if shared.paused.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
            continue;
        }
        if pos >= shared.ctx.live().iodepth() {
            // Above the live depth: doze and re-check
            std::thread::sleep(Duration::from_millis(500));
            continue;
        }

        let params = match shared.ctx.next() {
            Ok(params) => params,
            Err(fault) => {
                park_fault(&shared, fault);
                break;
            }
        };

        if cur_size != params.size {
            debug!(
                "worker[{}]: request size changed from {} to {}",
                pos, cur_size, params.size
            );
            cur_size = params.size;
            let mut fresh = AlignedBuffer::new(params.size as usize);
            fresh.fill_random(&mut payload_rng);
            buffer = Some(fresh);
        }
        let buf = buffer.as_mut().expect("buffer sized above");

        let iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: cur_size as usize,
        };

        let ret = if params.write {
            let flags = if params.dsync { libc::RWF_DSYNC } else { 0 };
            unsafe {
                libc::pwritev2(shared.fd, &iov, 1, params.offset as libc::off_t, flags)
            }
        } else {
            unsafe { libc::preadv(shared.fd, &iov, 1, params.offset as libc::off_t) }
        };
        let errno = std::io::Error::last_os_error();

        // The offset leaves the exclusion set whatever the outcome
        shared.ctx.offset_released(params.offset);

        if ret > 0 {
            shared
                .ctx
                .commit(&Stats::for_request(params.block_size, params.write));
        } else if ret == 0 {
            error!("worker[{}]: read/write returned zero", pos);
        } else {
            match errno.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                _ => {
                    park_fault(
                        &shared,
                        anyhow::Error::new(errno).context(format!(
                            "worker[{}]: {} failed: offset={}, size={}",
                            pos,
                            if params.write { "write" } else { "read" },
                            params.offset,
                            cur_size
                        )),
                    );
                    break;
                }
            }
        }
    }
}

fn park_fault(shared: &Shared, fault: anyhow::Error) {
    let mut slot = shared.fault.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
        *slot = Some(fault);
    }
}
