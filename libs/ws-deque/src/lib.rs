// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded work-stealing deque.
//!
//! One thread owns a [`Deque`] and pushes and pops items at its *tail*, any number of other
//! threads may concurrently [`steal`][Deque::steal] items from its *head*. Only the owner ever
//! writes `tail`, while `head` is advanced through a compare-and-swap by thieves and, when a single
//! item is left, by the owner. Whoever wins that compare-and-swap gets the item, so every pushed
//! item is handed out exactly once.
//!
//! The capacity is fixed at construction. Pushing onto a full deque does not grow the buffer but
//! fails with [`Full`], handing the rejected item back to the caller.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

mod loom;

use crate::loom::sync::atomic::{self, AtomicIsize, AtomicU64, Ordering};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

/// The default number of slots of a [`Deque`].
pub const DEFAULT_CAPACITY: usize = 32768;

/// Values that can be stored in a [`Deque`].
///
/// Items are stored as raw 64-bit words so that every buffer slot can be a plain atomic.
pub trait Item: Copy {
    fn into_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;
}

impl Item for u64 {
    #[inline]
    fn into_raw(self) -> u64 {
        self
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        raw
    }
}

impl Item for u32 {
    #[inline]
    fn into_raw(self) -> u64 {
        u64::from(self)
    }

    #[inline]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "only values produced by `into_raw` are ever stored"
    )]
    fn from_raw(raw: u64) -> Self {
        raw as u32
    }
}

/// Error returned by [`Deque::push`] when the deque is at capacity. Carries the rejected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deque is at capacity")
    }
}

impl<T: fmt::Debug> core::error::Error for Full<T> {}

/// Error returned by [`Deque::steal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TryStealError {
    /// There was nothing to steal.
    Empty,
    /// The deque had an item but another thief (or the owner popping the last item) took it
    /// first.
    Contended,
}

impl fmt::Display for TryStealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryStealError::Empty => f.write_str("deque is empty"),
            TryStealError::Contended => f.write_str("lost the race for the head item"),
        }
    }
}

impl core::error::Error for TryStealError {}

/// A fixed-capacity work-stealing deque.
///
/// `head` and `tail` only ever grow, slots are addressed modulo the capacity. `tail - head` is the
/// number of items currently in the deque.
pub struct Deque<T> {
    head: AtomicIsize,
    tail: AtomicIsize,
    buffer: Box<[AtomicU64]>,
    _item: PhantomData<T>,
}

// === impl Deque ===

impl<T: Item> Deque<T> {
    /// Creates a deque with [`DEFAULT_CAPACITY`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a deque that can hold up to `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not fit into an `isize`.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "deque capacity must be non-zero");
        assert!(
            isize::try_from(capacity).is_ok(),
            "deque capacity {capacity} is too large"
        );

        let buffer: Vec<AtomicU64> = (0..capacity).map(|_| AtomicU64::new(0)).collect();

        Self {
            head: AtomicIsize::new(0),
            tail: AtomicIsize::new(0),
            buffer: buffer.into_boxed_slice(),
            _item: PhantomData,
        }
    }

    /// Returns the maximum number of items this deque can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of items currently in the deque.
    ///
    /// The value is a snapshot and may be stale by the time it is observed when thieves are
    /// active.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        usize::try_from(tail.wrapping_sub(head)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes an item onto the tail of the deque.
    ///
    /// Must only be called by the owning thread.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the item if the deque already holds [`Self::capacity`] items.
    pub fn push(&self, item: T) -> Result<(), Full<T>> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.capacity_isize() {
            tracing::trace!(capacity = self.capacity(), "deque is full, rejecting push");
            return Err(Full(item));
        }

        self.slot(tail).store(item.into_raw(), Ordering::Relaxed);
        // the slot write must be visible before thieves can observe the new tail
        atomic::fence(Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Pops the most recently pushed item from the tail of the deque.
    ///
    /// Must only be called by the owning thread.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed).wrapping_sub(1);
        // tentatively claim the tail slot
        self.tail.store(tail, Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Relaxed);

        let size = tail.wrapping_sub(head);

        if size < 0 {
            // thieves emptied the deque under us
            self.tail.store(head, Ordering::Relaxed);
            return None;
        }

        let raw = self.slot(tail).load(Ordering::Relaxed);

        if size > 0 {
            // more than one item left, thieves cannot reach this slot
            return Some(T::from_raw(raw));
        }

        // this is the last item, race the thieves for it
        let won = self
            .head
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok();

        // either way `head` is now `head + 1`
        self.tail.store(head.wrapping_add(1), Ordering::Relaxed);

        won.then(|| T::from_raw(raw))
    }

    /// Attempts to steal the least recently pushed item from the head of the deque.
    ///
    /// May be called from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`TryStealError::Empty`] when there was nothing to steal and
    /// [`TryStealError::Contended`] when another thread claimed the item first.
    pub fn steal(&self) -> Result<T, TryStealError> {
        let head = self.head.load(Ordering::Acquire);
        atomic::fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Acquire);

        if tail.wrapping_sub(head) <= 0 {
            return Err(TryStealError::Empty);
        }

        let buffer = self.buffer.as_ptr();
        let raw = self.slot(head).load(Ordering::Relaxed);
        // the buffer never moves, a growable deque would have to retry here
        debug_assert!(core::ptr::eq(buffer, self.buffer.as_ptr()));

        match self.head.compare_exchange(
            head,
            head.wrapping_add(1),
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(T::from_raw(raw)),
            Err(_) => Err(TryStealError::Contended),
        }
    }

    #[expect(
        clippy::cast_possible_wrap,
        reason = "capacity is checked to fit into an isize at construction"
    )]
    fn capacity_isize(&self) -> isize {
        self.buffer.len() as isize
    }

    #[expect(
        clippy::cast_sign_loss,
        reason = "indices are never negative when a slot is accessed"
    )]
    fn slot(&self, index: isize) -> &AtomicU64 {
        debug_assert!(index >= 0);
        &self.buffer[(index as usize) % self.buffer.len()]
    }
}

impl<T: Item> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deque")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("capacity", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
