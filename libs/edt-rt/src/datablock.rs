// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::allocator::Allocator;
use crate::error::{Error, Result};
use crate::guid::Guid;
use core::alloc::Layout;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::{fmt, slice};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

const DATABLOCK_ALIGN: usize = 16;

/// A block of memory that tasks can depend on.
///
/// A data block is always available, adding it as a dependence satisfies the slot right away.
/// The bytes are handed out through [`DataBlock::read`] and [`DataBlock::write`] which take a
/// reader-writer lock, so tasks sharing a block never observe torn writes.
pub struct DataBlock {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    allocator: Arc<dyn Allocator>,
    lock: RwLock<()>,
    users: Mutex<Users>,
}

#[derive(Debug, Default)]
struct Users {
    count: usize,
    free_requested: bool,
}

// SAFETY: the memory is owned by the data block and all access goes through `lock`.
unsafe impl Send for DataBlock {}
// SAFETY: see above
unsafe impl Sync for DataBlock {}

/// Shared access to the bytes of a [`DataBlock`].
pub struct DataBlockRead<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    bytes: &'a [u8],
}

/// Exclusive access to the bytes of a [`DataBlock`].
pub struct DataBlockWrite<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    bytes: &'a mut [u8],
}

// === impl DataBlock ===

impl DataBlock {
    /// Allocates `len` zeroed bytes from `allocator`.
    pub(crate) fn new(allocator: Arc<dyn Allocator>, len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), DATABLOCK_ALIGN)
            .map_err(|_| Error::OutOfMemory)?;
        let ptr = allocator.allocate(layout).map_err(|_| Error::OutOfMemory)?;

        // SAFETY: the allocation is `layout.size()` bytes large and exclusively ours
        unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };

        Ok(Self {
            ptr,
            len,
            layout,
            allocator,
            lock: RwLock::new(()),
            users: Mutex::new(Users::default()),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read(&self) -> DataBlockRead<'_> {
        let guard = self.lock.read();
        DataBlockRead {
            _guard: guard,
            // SAFETY: `ptr` is valid for `len` bytes for as long as `self` lives and the read
            // lock excludes writers.
            bytes: unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) },
        }
    }

    pub fn write(&self) -> DataBlockWrite<'_> {
        let guard = self.lock.write();
        DataBlockWrite {
            _guard: guard,
            // SAFETY: `ptr` is valid for `len` bytes for as long as `self` lives and the write
            // lock makes this the only reference.
            bytes: unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) },
        }
    }

    /// Registers a user of this data block.
    pub(crate) fn acquire(&self, guid: Guid) -> Result<()> {
        let mut users = self.users.lock();
        if users.free_requested {
            return Err(Error::DataBlockFreed(guid));
        }
        users.count += 1;
        Ok(())
    }

    /// Unregisters a user. Returns `true` if a free was requested and this was the last user.
    pub(crate) fn release(&self) -> bool {
        let mut users = self.users.lock();
        debug_assert!(users.count > 0, "data block released more often than acquired");
        users.count = users.count.saturating_sub(1);
        users.free_requested && users.count == 0
    }

    /// Requests the data block to be freed. Returns `true` if no user remains and it can be
    /// freed right away.
    pub(crate) fn request_free(&self, guid: Guid) -> Result<bool> {
        let mut users = self.users.lock();
        if users.free_requested {
            return Err(Error::DataBlockFreed(guid));
        }
        users.free_requested = true;
        Ok(users.count == 0)
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated from `allocator` with `layout` in `new`
        unsafe { self.allocator.deallocate(self.ptr, self.layout) };
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let users = self.users.lock();
        f.debug_struct("DataBlock")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("users", &users.count)
            .field("free_requested", &users.free_requested)
            .finish_non_exhaustive()
    }
}

// === impl DataBlockRead ===

impl Deref for DataBlockRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.bytes
    }
}

// === impl DataBlockWrite ===

impl Deref for DataBlockWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.bytes
    }
}

impl DerefMut for DataBlockWrite<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.bytes
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::allocator::ArenaAllocator;

    fn arena() -> Arc<ArenaAllocator> {
        Arc::new(ArenaAllocator::new(64 * 1024).unwrap())
    }

    #[test]
    fn zeroed_and_writable() {
        let arena = arena();
        let db = DataBlock::new(arena.clone(), 32).unwrap();
        assert_eq!(db.len(), 32);
        assert!(db.read().iter().all(|b| *b == 0));

        db.write()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&db.read()[..4], &[1, 2, 3, 4]);

        drop(db);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn free_waits_for_last_user() {
        let db = DataBlock::new(arena(), 8).unwrap();
        let guid = Guid::from_parts(3, 1);

        db.acquire(guid).unwrap();
        db.acquire(guid).unwrap();
        assert!(!db.request_free(guid).unwrap());
        assert!(matches!(db.acquire(guid), Err(Error::DataBlockFreed(_))));

        assert!(!db.release());
        assert!(db.release());
    }

    #[test]
    fn free_without_users_is_immediate() {
        let db = DataBlock::new(arena(), 8).unwrap();
        let guid = Guid::from_parts(0, 1);
        assert!(db.request_free(guid).unwrap());
        assert!(matches!(
            db.request_free(guid),
            Err(Error::DataBlockFreed(_))
        ));
    }

    #[test]
    fn exhausting_the_arena() {
        let arena = Arc::new(ArenaAllocator::new(4096).unwrap());
        assert!(matches!(
            DataBlock::new(arena, 1 << 20),
            Err(Error::OutOfMemory)
        ));
    }
}
