//! Fixed-capacity, page-aligned I/O buffer
//!
//! A [`PeerBuffer`] is allocated once per peer and reused by every read and
//! write. It never grows: reads that would need more room fail instead.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Ethernet MSS, used when the path segment size is unknown.
pub const DEFAULT_SEGMENT_SIZE: usize = 1460;

/// Segments per buffer by default (64240 bytes with the default MSS).
pub const DEFAULT_BUFFER_SEGMENTS: usize = 44;

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// A zeroed, page-aligned byte buffer whose length is a whole number of
/// segments.
pub struct PeerBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: PeerBuffer uniquely owns its allocation, like Box<[u8]>.
unsafe impl Send for PeerBuffer {}
unsafe impl Sync for PeerBuffer {}

impl PeerBuffer {
    /// Allocate `segments` segments of `segment_size` bytes each.
    ///
    /// Zero arguments fall back to the defaults so the buffer is never empty.
    pub fn new(segment_size: usize, segments: usize) -> Self {
        let segment_size = if segment_size == 0 { DEFAULT_SEGMENT_SIZE } else { segment_size };
        let segments = if segments == 0 { DEFAULT_BUFFER_SEGMENTS } else { segments };
        let capacity = segment_size.saturating_mul(segments);
        Self::with_capacity(capacity)
    }

    /// Allocate exactly `capacity` bytes (at least one), aligned to a page.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let layout = match Layout::from_size_align(capacity, page_size()) {
            Ok(layout) => layout,
            Err(_) => Layout::array::<u8>(capacity).unwrap_or_else(|_| Layout::new::<u8>()),
        };
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        PeerBuffer { ptr, layout }
    }

    /// Total number of bytes the buffer can hold
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Whether the buffer start lies on a page boundary
    pub fn is_page_aligned(&self) -> bool {
        self.ptr.as_ptr() as usize % page_size() == 0
    }
}

impl Default for PeerBuffer {
    fn default() -> Self {
        PeerBuffer::new(DEFAULT_SEGMENT_SIZE, DEFAULT_BUFFER_SEGMENTS)
    }
}

impl Deref for PeerBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid and initialised for layout.size() bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for PeerBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for PeerBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in with_capacity with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for PeerBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}
