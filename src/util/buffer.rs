//! Aligned request buffers for direct IO
//!
//! O_DIRECT requires every buffer, transfer size, and file offset to be
//! aligned to the device alignment unit. This module provides the aligned
//! scratch memory each engine slot owns for the lifetime of a request.

use rand::RngCore;
use std::alloc::{alloc, dealloc, Layout};

/// Alignment unit for direct IO. 512 bytes covers all common block devices.
pub const IO_ALIGN: usize = 512;

/// Memory-aligned buffer suitable for O_DIRECT operations
///
/// Each engine slot owns exactly one of these, sized to the current request
/// size. When the request size changes, the owner replaces the buffer and
/// refills it with pseudo-random payload bytes.
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a buffer of `size` bytes aligned to [`IO_ALIGN`]
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero, not a multiple of [`IO_ALIGN`], or if the
    /// allocation fails. Request sizes are whole KiB blocks, so a violation
    /// here is a caller bug, not a runtime condition.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "buffer size must be greater than 0");
        assert!(
            size % IO_ALIGN == 0,
            "buffer size must be a multiple of the {} byte alignment unit",
            IO_ALIGN
        );

        let layout =
            Layout::from_size_align(size, IO_ALIGN).expect("invalid layout parameters");

        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            panic!("failed to allocate aligned buffer of {} bytes", size);
        }

        AlignedBuffer { ptr, size, layout }
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of self
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Verify that the buffer start is aligned to [`IO_ALIGN`]
    #[inline(always)]
    pub fn is_aligned(&self) -> bool {
        (self.ptr as usize) % IO_ALIGN == 0
    }

    /// Fill the buffer with pseudo-random payload bytes
    ///
    /// Called once per reallocation. Writes submit whatever the buffer holds;
    /// read contents are discarded, so the payload is never regenerated on
    /// the per-request path.
    pub fn fill_random(&mut self, rng: &mut impl RngCore) {
        rng.fill_bytes(self.as_mut_slice());
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

// SAFETY: AlignedBuffer owns its memory exclusively
unsafe impl Send for AlignedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_aligned_buffer_creation() {
        let buffer = AlignedBuffer::new(4096);
        assert_eq!(buffer.size(), 4096);
        assert!(buffer.is_aligned());
    }

    #[test]
    fn test_aligned_buffer_large() {
        let buffer = AlignedBuffer::new(1024 * 1024);
        assert_eq!(buffer.size(), 1024 * 1024);
        assert!(buffer.is_aligned());
    }

    #[test]
    #[should_panic(expected = "multiple of the 512 byte alignment unit")]
    fn test_unaligned_size_rejected() {
        let _ = AlignedBuffer::new(4000);
    }

    #[test]
    #[should_panic(expected = "greater than 0")]
    fn test_zero_size_rejected() {
        let _ = AlignedBuffer::new(0);
    }

    #[test]
    fn test_fill_random_deterministic() {
        let mut rng1 = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut rng2 = Xoshiro256PlusPlus::seed_from_u64(7);

        let mut a = AlignedBuffer::new(2048);
        let mut b = AlignedBuffer::new(2048);
        a.fill_random(&mut rng1);
        b.fill_random(&mut rng2);

        assert_eq!(a.as_slice(), b.as_slice());
        // Random payloads should not be all-zero
        assert!(a.as_slice().iter().any(|&byte| byte != 0));
    }

    #[test]
    fn test_slice_roundtrip() {
        let mut buffer = AlignedBuffer::new(512);
        buffer.as_mut_slice().fill(0xAB);
        assert!(buffer.as_slice().iter().all(|&byte| byte == 0xAB));
    }
}
