//! The event buffer: a pre-sized byte region with an atomic append cursor.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::record::TRACE_HEADER_LEN;

/// Fixed byte region that events are appended to.
///
/// Writers linearize on a compare-exchange loop over the cursor; a
/// successful [`reserve`](EventBuffer::reserve) grants the calling thread
/// exclusive write access to its byte range. There is no per-record
/// publication protocol for readers: the lifecycle stops the mutator world
/// before the finalizer walks the region, and the release ordering on the
/// cursor update is enough for a quiesced reader to observe every committed
/// byte below it.
///
/// Once the region cannot fit another record the overflow flag latches and
/// all further reservations fail; the cursor never moves past capacity.
pub struct EventBuffer {
    data: Box<[UnsafeCell<u8>]>,
    cursor: AtomicI32,
    overflow: AtomicBool,
}

// SAFETY: the byte region is only mutated through `commit`, on ranges handed
// out by `reserve`, which never overlap.
unsafe impl Sync for EventBuffer {}
unsafe impl Send for EventBuffer {}

impl EventBuffer {
    /// Allocate `buffer_size` zeroed bytes with `header` copied to the
    /// front; the cursor starts at the end of the header.
    pub fn new(buffer_size: usize, header: &[u8; TRACE_HEADER_LEN]) -> Self {
        assert!(
            buffer_size >= TRACE_HEADER_LEN,
            "trace buffer smaller than the header"
        );
        assert!(
            buffer_size <= i32::MAX as usize,
            "trace buffer does not fit the 32-bit cursor"
        );
        let data: Box<[UnsafeCell<u8>]> =
            (0..buffer_size).map(|_| UnsafeCell::new(0)).collect();
        let buffer = Self {
            data,
            cursor: AtomicI32::new(TRACE_HEADER_LEN as i32),
            overflow: AtomicBool::new(false),
        };
        // Construction is single-threaded; nobody else can observe this copy.
        buffer.commit(0, header);
        buffer
    }

    /// Reserve `len` bytes, returning the offset of the reserved range.
    ///
    /// `None` means the buffer is exhausted: the cursor does not move and
    /// the overflow flag is set.
    pub fn reserve(&self, len: usize) -> Option<usize> {
        let len = len as i32;
        let capacity = self.data.len() as i32;
        let mut old = self.cursor.load(Ordering::Relaxed);
        loop {
            let new = old + len;
            if new > capacity {
                self.overflow.store(true, Ordering::Relaxed);
                return None;
            }
            match self
                .cursor
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(old as usize),
                Err(current) => old = current,
            }
        }
    }

    /// Copy an encoded record into a range previously handed out by
    /// [`reserve`](EventBuffer::reserve).
    pub fn commit(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.data.len());
        // SAFETY: `reserve` hands out non-overlapping ranges and only the
        // reserving thread writes this one.
        unsafe {
            let base = self.data.as_ptr() as *mut u8;
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len());
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes appended so far, header included.
    pub fn published_len(&self) -> usize {
        self.cursor.load(Ordering::Acquire) as usize
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

    /// The whole region.
    ///
    /// # Safety
    ///
    /// No `reserve`/`commit` may be in flight: callers run with the mutator
    /// world stopped, or after joining every writer thread.
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.data.as_ptr() as *const u8, self.data.len())
    }
}
