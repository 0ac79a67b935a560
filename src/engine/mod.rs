//! IO engine abstraction
//!
//! An engine turns [`AccessParams`] pulled from the shared request context
//! into actual kernel IO. The three backends have fundamentally different
//! concurrency shapes behind the same controller-driven contract:
//!
//! - [`sync::SyncEngine`] issues one blocking read or write per invocation
//!   on the controller thread.
//! - [`vectored::VectoredEngine`] owns a fixed pool of worker threads, each
//!   independently pulling requests and issuing blocking vectored IO.
//! - [`aio::AioEngine`] owns a ring of request slots submitted to the Linux
//!   AIO interface and reaps completions with a bounded wait.
//!
//! The controller invokes [`Engine::make_requests`] in a loop; for the
//! single-threaded engines each call performs IO, while the vectored engine
//! uses it as a heartbeat that surfaces worker faults and paces the
//! controller. Dropping an engine drains or cancels whatever is still in
//! flight.
//!
//! [`AccessParams`]: crate::pattern::AccessParams

pub mod aio;
pub mod sync;
pub mod vectored;

use crate::Result;
use std::sync::atomic::AtomicBool;

/// Backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineKind {
    /// Single-threaded blocking read/write
    Sync,
    /// Worker pool over blocking vectored IO
    Vectored,
    /// Linux AIO submit/reap ring (requires O_DIRECT)
    Async,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Sync => write!(f, "sync"),
            EngineKind::Vectored => write!(f, "vectored"),
            EngineKind::Async => write!(f, "async"),
        }
    }
}

/// Common engine contract driven by the controller loop
pub trait Engine: Send {
    /// Issue and/or reap requests; returns on fault or after one quantum
    ///
    /// `stop` is the cooperative cancellation flag; engines observe it at
    /// their next suspension point.
    fn make_requests(&mut self, stop: &AtomicBool) -> Result<()>;

    /// Called while the controller sits in wait mode
    fn pause(&mut self) {}

    /// Whether the engine runs worker threads of its own; decides the lock
    /// type protecting the shared pattern state
    fn is_multithread(&self) -> bool {
        false
    }
}
