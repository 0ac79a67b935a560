//! Stdin command channel
//!
//! One command per input line, `name` or `name=value`, applied to the live
//! configuration while IO is in flight. The reader thread polls stdin with
//! a 300 ms timeout between reads so a stop request never waits on input.
//! EOF ends the run cleanly; a malformed command is reported and ignored.

use crate::config::LiveConfig;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Line-oriented control channel on stdin
pub struct CommandReader {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CommandReader {
    /// Spawn the reader thread
    pub fn spawn(live: Arc<LiveConfig>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                debug!("command reader thread started");
                reader_loop(&live, &stop);
                stop.store(true, Ordering::Relaxed);
                debug!("command reader thread finished");
            })
        };
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// True until stop was requested or stdin reached EOF
    pub fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for CommandReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn reader_loop(live: &LiveConfig, stop: &AtomicBool) {
    let stdin = std::io::stdin();

    while !stop.load(Ordering::Relaxed) {
        // Bounded poll so the stop flag is observed promptly
        let mut pollfd = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, 300) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!("poll on stdin failed: {}", err);
            return;
        }
        if ready == 0 {
            continue;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                debug!("end of input");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                error!("reading command input failed: {}", err);
                return;
            }
        }

        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command == "stop" {
            info!("stop command received");
            return;
        }
        if let Err(err) = live.execute_command(command) {
            // Malformed commands are reported, never fatal
            error!("{:#}", err);
        }
    }
}
