//! Engine controller
//!
//! The controller owns the target file for the whole run: it creates the
//! file when asked, validates it against the filesystem block size, opens
//! it with the flags the selected engine needs, and deletes it at teardown
//! if it was created here.
//!
//! It then spawns one thread that drives the selected engine:
//!
//! ```text
//! loop {
//!     wait mode? -> engine.pause(), sleep 200 ms, re-check
//!     apply any pending block-size change
//!     engine.make_requests(stop)
//!     flush cadence reached? -> fdatasync
//! }
//! ```
//!
//! The lock protecting the pattern state is chosen here per engine: a real
//! mutex for the multi-threaded vectored engine, an uncontended cell for
//! the single-threaded sync and aio engines. Engine faults park in a shared
//! slot that [`Controller::is_active`] re-raises on the program thread.

use crate::config::{LiveConfig, Settings};
use crate::engine::{aio::AioEngine, sync::SyncEngine, vectored::VectoredEngine};
use crate::engine::{Engine, EngineKind};
use crate::error::Fault;
use crate::pattern::{PatternState, RequestContext};
use crate::stats::StatsAccumulator;
use crate::util::buffer::AlignedBuffer;
use crate::util::lock::{MutexLock, StateLock, UncontendedLock};
use crate::Result;
use anyhow::Context;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Owns the target file and the engine loop thread
pub struct Controller {
    settings: Arc<Settings>,
    stop: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<anyhow::Error>>>,
    thread: Option<JoinHandle<()>>,
    file: Option<File>,
}

impl Controller {
    /// Set up the file, then launch the engine loop
    pub fn new(
        settings: Arc<Settings>,
        live: Arc<LiveConfig>,
        stats: Arc<StatsAccumulator>,
    ) -> Result<Self> {
        if settings.create_file {
            create_file(&settings)?;
        }
        let file = open_file(&settings, &live)?;

        let stop = Arc::new(AtomicBool::new(false));
        let fault = Arc::new(Mutex::new(None));

        let thread = {
            let settings = Arc::clone(&settings);
            let live = Arc::clone(&live);
            let stats = Arc::clone(&stats);
            let stop = Arc::clone(&stop);
            let fault = Arc::clone(&fault);
            let fd = file.as_raw_fd();
            std::thread::spawn(move || {
                info!("engine controller thread started");
                if let Err(e) = engine_loop(fd, &settings, live, stats, &stop) {
                    let mut slot = fault.lock().unwrap_or_else(|p| p.into_inner());
                    *slot = Some(e);
                    stop.store(true, Ordering::Relaxed);
                }
                info!("engine controller thread finished");
            })
        };

        Ok(Self {
            settings,
            stop,
            fault,
            thread: Some(thread),
            file: Some(file),
        })
    }

    /// True while the engine loop is running; re-raises a parked fault
    pub fn is_active(&self) -> Result<bool> {
        let mut slot = self.fault.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(fault) = slot.take() {
            return Err(fault);
        }
        Ok(!self.stop.load(Ordering::Relaxed))
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // Close before unlinking
        drop(self.file.take());
        if self.settings.create_file && self.settings.delete_file {
            info!("deleting file {}", self.settings.filename.display());
            let _ = std::fs::remove_file(&self.settings.filename);
        }
    }
}

/// Allocate the target file: filesize_mib chunks of 1 MiB random payload
fn create_file(settings: &Settings) -> Result<()> {
    info!("creating file {}", settings.filename.display());

    const CHUNK: usize = 1024 * 1024;
    let mut buffer = AlignedBuffer::new(CHUNK);
    buffer.fill_random(&mut Xoshiro256PlusPlus::from_entropy());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o640)
        .open(&settings.filename)
        .with_context(|| {
            Fault::Setup(format!(
                "can't create file {}",
                settings.filename.display()
            ))
        })?;

    let fd = file.as_raw_fd();
    for _ in 0..settings.filesize {
        let ret = unsafe {
            libc::write(fd, buffer.as_ptr() as *const libc::c_void, CHUNK)
        };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            drop(file);
            let _ = std::fs::remove_file(&settings.filename);
            return Err(err).context(Fault::Setup("file creation write failed".into()));
        }
    }
    debug!("file created");
    Ok(())
}

/// Validate the target against the filesystem, then open it with the flags
/// the selected engine needs
fn open_file(settings: &Settings, live: &LiveConfig) -> Result<File> {
    let metadata = std::fs::metadata(&settings.filename).with_context(|| {
        Fault::Setup(format!(
            "can't read file stats for {}",
            settings.filename.display()
        ))
    })?;

    let fs_block = {
        use std::os::linux::fs::MetadataExt;
        metadata.st_blksize()
    };
    if (settings.block_size * 1024) % fs_block != 0 {
        return Err(Fault::Config(format!(
            "block size must be a multiple of the filesystem block size ({} B)",
            fs_block
        ))
        .into());
    }

    if !settings.create_file {
        let size_mib = metadata.len() / 1024 / 1024;
        info!("file already created; using filesize={} MiB", size_mib);
        if size_mib < 10 {
            return Err(Fault::Config(format!(
                "existing file is too small: {} MiB (minimum 10)",
                size_mib
            ))
            .into());
        }
        live.set_filesize_mib(size_mib);
    }

    let mut custom_flags = 0;
    let mut flag_names = vec!["O_RDWR"];
    if settings.o_direct {
        custom_flags |= libc::O_DIRECT;
        flag_names.push("O_DIRECT");
    }
    if settings.io_engine == EngineKind::Sync && settings.o_dsync {
        custom_flags |= libc::O_DSYNC;
        flag_names.push("O_DSYNC");
    }

    info!(
        "opening file '{}' with flags {}",
        settings.filename.display(),
        flag_names.join("|")
    );
    if settings.o_dsync && settings.io_engine != EngineKind::Sync {
        info!("write requests will use flag RWF_DSYNC");
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(custom_flags)
        .open(&settings.filename)
        .with_context(|| {
            Fault::Setup(format!("can't open file {}", settings.filename.display()))
        })
}

/// Build the selected engine and drive it until stop
fn engine_loop(
    fd: RawFd,
    settings: &Settings,
    live: Arc<LiveConfig>,
    stats: Arc<StatsAccumulator>,
    stop: &AtomicBool,
) -> Result<()> {
    info!("using {} engine", settings.io_engine);

    let state = PatternState::new(live.filesize_mib(), live.block_size());
    // Per-request durability flag only applies where the engine maps it to
    // RWF_DSYNC; the sync engine gets durability from its O_DSYNC open flag
    let dsync = settings.o_dsync && settings.io_engine != EngineKind::Sync;

    match settings.io_engine {
        EngineKind::Sync => {
            let ctx: Arc<RequestContext<UncontendedLock<PatternState>>> = Arc::new(
                RequestContext::new(Arc::clone(&live), stats, state, dsync),
            );
            let engine = SyncEngine::new(fd, Arc::clone(&ctx), settings.require_full_io);
            drive(engine, ctx, fd, &live, stop)
        }
        EngineKind::Vectored => {
            let ctx: Arc<RequestContext<MutexLock<PatternState>>> = Arc::new(
                RequestContext::new(Arc::clone(&live), stats, state, dsync),
            );
            let engine = VectoredEngine::new(fd, Arc::clone(&ctx));
            drive(engine, ctx, fd, &live, stop)
        }
        EngineKind::Async => {
            let ctx: Arc<RequestContext<UncontendedLock<PatternState>>> = Arc::new(
                RequestContext::new(Arc::clone(&live), stats, state, dsync),
            );
            let engine = AioEngine::new(fd, Arc::clone(&ctx))?;
            drive(engine, ctx, fd, &live, stop)
        }
    }
}

/// The controller loop proper, generic over the pattern-state lock
fn drive<L: StateLock<PatternState>>(
    mut engine: impl Engine,
    ctx: Arc<RequestContext<L>>,
    fd: RawFd,
    live: &LiveConfig,
    stop: &AtomicBool,
) -> Result<()> {
    let mut last_writes = 0u64;

    while !stop.load(Ordering::Relaxed) {
        if live.wait() {
            info!("engine controller in wait mode");
            while !stop.load(Ordering::Relaxed) && live.wait() {
                engine.pause();
                std::thread::sleep(Duration::from_millis(200));
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            info!("exit wait mode");
        }

        ctx.refresh_block_size();

        engine.make_requests(stop)?;

        let flush_blocks = live.flush_blocks();
        if !stop.load(Ordering::Relaxed) && flush_blocks > 0 {
            let cur_writes = ctx.stats().blocks_write();
            if cur_writes - last_writes >= flush_blocks {
                unsafe {
                    libc::fdatasync(fd);
                }
            }
            last_writes = cur_writes;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings_for(dir: &TempDir, engine: EngineKind) -> Settings {
        Settings {
            filename: dir.path().join("target.bin"),
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
            io_engine: engine,
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

    fn run_briefly(settings: Settings) -> crate::stats::Stats {
        let settings = Arc::new(settings);
        let live = Arc::new(LiveConfig::new(&settings));
        let stats = Arc::new(StatsAccumulator::new());

        let controller =
            Controller::new(Arc::clone(&settings), live, Arc::clone(&stats)).unwrap();
        assert!(controller.is_active().unwrap());

        std::thread::sleep(Duration::from_millis(400));
        controller.stop();
        drop(controller);

        stats.snapshot()
    }

    #[test]
    fn test_create_run_delete_sync() {
        let dir = TempDir::new().unwrap();
        let settings = settings_for(&dir, EngineKind::Sync);
        let path = settings.filename.clone();

        let total = run_briefly(settings);
        assert!(total.blocks > 0, "no requests completed");
        assert_eq!(total.blocks_write, 0);
        assert!(!path.exists(), "file not deleted at teardown");
    }

    #[test]
    fn test_file_created_with_requested_size() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_for(&dir, EngineKind::Sync);
        settings.delete_file = false;
        let path = settings.filename.clone();

        run_briefly(settings);
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 10 * 1024 * 1024);
    }

    #[test]
    fn test_vectored_engine_runs() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_for(&dir, EngineKind::Vectored);
        settings.iodepth = 4;
        settings.random_ratio = 1.0;
        settings.write_ratio = 0.5;

        let total = run_briefly(settings);
        assert!(total.blocks > 0, "no requests completed");
    }

    #[test]
    fn test_stop_propagates_quickly() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(settings_for(&dir, EngineKind::Sync));
        let live = Arc::new(LiveConfig::new(&settings));
        let stats = Arc::new(StatsAccumulator::new());

        let controller = Controller::new(settings, live, stats).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let begin = std::time::Instant::now();
        controller.stop();
        drop(controller);
        assert!(
            begin.elapsed() < Duration::from_millis(600),
            "teardown exceeded one suspension quantum"
        );
    }

    #[test]
    fn test_wait_mode_pauses_generation() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_for(&dir, EngineKind::Sync);
        settings.wait = true;
        let settings = Arc::new(settings);
        let live = Arc::new(LiveConfig::new(&settings));
        let stats = Arc::new(StatsAccumulator::new());

        let controller =
            Controller::new(Arc::clone(&settings), Arc::clone(&live), Arc::clone(&stats))
                .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(stats.snapshot().blocks, 0, "paused run made progress");

        live.set_wait(false);
        std::thread::sleep(Duration::from_millis(400));
        assert!(stats.snapshot().blocks > 0, "resume made no progress");

        controller.stop();
        drop(controller);
    }

    #[test]
    fn test_reusing_small_file_rejected() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_for(&dir, EngineKind::Sync);
        settings.create_file = false;
        std::fs::write(&settings.filename, vec![0u8; 1024 * 1024]).unwrap();

        let settings = Arc::new(settings);
        let live = Arc::new(LiveConfig::new(&settings));
        let stats = Arc::new(StatsAccumulator::new());
        assert!(Controller::new(settings, live, stats).is_err());
    }

    #[test]
    fn test_reused_file_size_derived() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_for(&dir, EngineKind::Sync);
        settings.create_file = false;
        settings.filesize = 0;
        std::fs::write(&settings.filename, vec![0u8; 12 * 1024 * 1024]).unwrap();

        let settings = Arc::new(settings);
        let live = Arc::new(LiveConfig::new(&settings));
        let stats = Arc::new(StatsAccumulator::new());

        let controller =
            Controller::new(Arc::clone(&settings), Arc::clone(&live), stats).unwrap();
        assert_eq!(live.filesize_mib(), 12);
        controller.stop();
        drop(controller);

        // Not created here, so never deleted
        assert!(settings.filename.exists());
    }
}
