//! Lock-type selection for the shared pattern state
//!
//! The pattern generator's state (RNG, cursor, in-flight offset set) is
//! touched on every request. With the vectored engine, up to [`MAX_IODEPTH`]
//! worker threads race on it and a real mutex is mandatory. The sync and
//! aio engines issue every request from the single controller thread, where
//! a mutex acquisition per request is pure overhead.
//!
//! Instead of a runtime "is this lock active" toggle on the hot path, the
//! choice is made at the type level: the controller instantiates the request
//! context with [`MutexLock`] for the multi-threaded engine and
//! [`UncontendedLock`] for the single-threaded ones.
//!
//! [`MAX_IODEPTH`]: crate::MAX_IODEPTH

use std::cell::UnsafeCell;
use std::sync::Mutex;

/// Exclusive access to a value, with the synchronization cost decided by the
/// implementing type
pub trait StateLock<T>: Send + Sync {
    fn new(value: T) -> Self;

    /// Run `f` with exclusive access to the protected value
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

/// Real mutual exclusion, for state shared across engine worker threads
pub struct MutexLock<T>(Mutex<T>);

impl<T: Send> StateLock<T> for MutexLock<T> {
    fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

/// Zero-cost stand-in for state only ever accessed from one thread
///
/// The sync and aio engines run entirely on the controller thread, so their
/// pattern state never sees concurrent access. This type skips the mutex
/// while still satisfying the `Sync` bound that `Arc` sharing requires.
pub struct UncontendedLock<T>(UnsafeCell<T>);

// SAFETY: callers uphold the single-threaded contract. The controller only
// constructs an UncontendedLock for engines whose is_multithread() is false,
// and every access to the protected state happens on the engine loop thread.
unsafe impl<T: Send> Sync for UncontendedLock<T> {}

impl<T: Send> StateLock<T> for UncontendedLock<T> {
    fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    #[inline(always)]
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        // SAFETY: single-threaded access per the type contract above
        unsafe { f(&mut *self.0.get()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutex_lock_roundtrip() {
        let lock = MutexLock::new(41u64);
        lock.with(|v| *v += 1);
        assert_eq!(lock.with(|v| *v), 42);
    }

    #[test]
    fn test_mutex_lock_across_threads() {
        let lock = Arc::new(MutexLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.with(|v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.with(|v| *v), 8000);
    }

    #[test]
    fn test_uncontended_lock_roundtrip() {
        let lock = UncontendedLock::new(String::from("a"));
        lock.with(|v| v.push('b'));
        assert_eq!(lock.with(|v| v.clone()), "ab");
    }
}
