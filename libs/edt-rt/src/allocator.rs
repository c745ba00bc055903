// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use talc::{ErrOnOom, Span, Talc, Talck};

/// The memory allocator backing data blocks.
///
/// Implementations must be thread-safe, the runtime allocates and frees from every worker.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocates a block of memory described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the request cannot be satisfied.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Returns a block of memory to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Allocator::allocate`] on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

impl core::error::Error for AllocError {}

/// An [`Allocator`] that carves blocks out of a single, fixed-size arena.
pub struct ArenaAllocator {
    talc: Talck<parking_lot::RawMutex, ErrOnOom>,
    arena: NonNull<[u8]>,
    allocated: AtomicUsize,
}

// SAFETY: the arena is only ever accessed through `talc`, which serializes access with its lock.
unsafe impl Send for ArenaAllocator {}
// SAFETY: see above
unsafe impl Sync for ArenaAllocator {}

// === impl ArenaAllocator ===

impl ArenaAllocator {
    /// Creates an arena of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the arena is too small to be managed.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        let arena = NonNull::from(Box::leak(vec![0u8; size].into_boxed_slice()));
        let talc = Talc::new(ErrOnOom).lock::<parking_lot::RawMutex>();

        let span = Span::from_base_size(arena.as_ptr().cast::<u8>(), arena.len());
        // SAFETY: the arena was just leaked and is exclusively owned by this allocator until drop.
        let claimed = unsafe { talc.lock().claim(span) };

        if claimed.is_err() {
            // SAFETY: the arena came from `Box::leak` above and talc never claimed it
            drop(unsafe { Box::from_raw(arena.as_ptr()) });
            tracing::error!(size, "arena is too small");
            return Err(AllocError);
        }

        tracing::debug!(size, "created data block arena");

        Ok(Self {
            talc,
            arena,
            allocated: AtomicUsize::new(0),
        })
    }

    /// The size of the arena in bytes.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// The number of bytes currently handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Allocator for ArenaAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: talc requires a non-zero size, callers never request empty blocks
        let ptr = unsafe { self.talc.lock().malloc(layout) }.map_err(|()| {
            tracing::debug!(?layout, allocated = self.allocated(), "arena exhausted");
            AllocError
        })?;

        self.allocated.fetch_add(layout.size(), Ordering::Relaxed);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: ensured by caller
        unsafe { self.talc.lock().free(ptr, layout) };
        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        let leaked = self.allocated();
        if leaked > 0 {
            tracing::warn!(leaked, "dropping arena with live allocations");
        }

        // SAFETY: the arena was produced by `Box::leak` in `new`, talc is dropped with us and
        // never touches it again.
        drop(unsafe { Box::from_raw(self.arena.as_ptr()) });
    }
}

impl fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("size", &self.size())
            .field("allocated", &self.allocated())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free() {
        let arena = ArenaAllocator::new(64 * 1024).unwrap();
        let layout = Layout::from_size_align(128, 16).unwrap();

        let a = arena.allocate(layout).unwrap();
        let b = arena.allocate(layout).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr().align_offset(16), 0);
        assert_eq!(arena.allocated(), 256);

        // SAFETY: both blocks came from this arena with `layout`
        unsafe {
            arena.deallocate(a, layout);
            arena.deallocate(b, layout);
        }
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let arena = ArenaAllocator::new(4096).unwrap();
        let layout = Layout::from_size_align(8192, 8).unwrap();
        assert_eq!(arena.allocate(layout), Err(AllocError));
    }
}
