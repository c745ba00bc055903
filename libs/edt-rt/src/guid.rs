// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Handles to runtime objects.
//!
//! Every task, template, event and data block, as well as the workers, workpiles and schedulers
//! of a policy domain, is named by a [`Guid`]. The [`GuidProvider`] owns the objects and maps
//! handles back to them. A handle packs the index of a slot in the provider's table together with
//! the generation the slot had when the handle was issued, so a handle that outlived its object
//! fails to resolve instead of aliasing whatever reused the slot.

use crate::datablock::DataBlock;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::task::{Task, TaskTemplate};
use core::fmt;
use parking_lot::RwLock;
use std::sync::Arc;

mycelium_bitfield::bitfield! {
    /// An opaque handle to a runtime object.
    ///
    /// The all-zero value is [`Guid::NULL`], no live object is ever named by it.
    #[derive(PartialEq, Eq, Hash)]
    pub struct Guid<u64> {
        /// Index of the slot in the provider's table.
        const INDEX = 32;
        /// Generation of the slot at the time the handle was issued. Never zero for a live
        /// handle and never `u32::MAX`.
        const GENERATION = ..;
    }
}

static_assertions::assert_eq_size!(Guid, u64);

/// The kind of object a [`Guid`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The kind of [`Guid::NULL`].
    None,
    Allocator,
    DataBlock,
    Task,
    TaskTemplate,
    Policy,
    Worker,
    MemTarget,
    CompTarget,
    Scheduler,
    Workpile,
    Comm,
    Affinity,
    Event(EventKind),
}

/// An object owned by the [`GuidProvider`].
#[derive(Clone)]
pub(crate) enum Object {
    Task(Arc<Task>),
    Template(Arc<TaskTemplate>),
    Event(Arc<Event>),
    DataBlock(Arc<DataBlock>),
    /// A component of the policy domain. The component itself lives in the domain, the payload is
    /// its index among components of the same kind.
    Component(usize),
}

/// Owns all runtime objects and maps [`Guid`]s to them.
///
/// Resolving takes a shared lock so concurrent lookups never block each other, only allocating
/// and releasing handles is exclusive.
pub struct GuidProvider {
    table: RwLock<Table>,
}

struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

struct Slot {
    generation: u32,
    entry: Option<(Kind, Object)>,
}

// === impl Guid ===

impl Guid {
    /// The null handle.
    pub const NULL: Self = Self::new();

    #[inline]
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self::new()
            .with(Self::INDEX, u64::from(index))
            .with(Self::GENERATION, u64::from(generation))
    }

    /// Reconstructs a handle from the value returned by [`Guid::as_u64`].
    #[inline]
    pub const fn from_u64(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw 64-bit value of this handle, e.g. for passing it as a task parameter.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[expect(clippy::cast_possible_truncation, reason = "the field is 32 bits wide")]
    pub(crate) fn index(self) -> u32 {
        self.get(Self::INDEX) as u32
    }

    #[inline]
    #[expect(clippy::cast_possible_truncation, reason = "the field is 32 bits wide")]
    pub(crate) fn generation(self) -> u32 {
        self.get(Self::GENERATION) as u32
    }
}

impl ws_deque::Item for Guid {
    #[inline]
    fn into_raw(self) -> u64 {
        self.0
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

// === impl Kind ===

impl Kind {
    pub fn is_event(self) -> bool {
        matches!(self, Kind::Event(_))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::None => "null handle",
            Kind::Allocator => "allocator",
            Kind::DataBlock => "data block",
            Kind::Task => "task",
            Kind::TaskTemplate => "task template",
            Kind::Policy => "policy domain",
            Kind::Worker => "worker",
            Kind::MemTarget => "memory target",
            Kind::CompTarget => "compute target",
            Kind::Scheduler => "scheduler",
            Kind::Workpile => "workpile",
            Kind::Comm => "comm endpoint",
            Kind::Affinity => "affinity",
            Kind::Event(EventKind::Once) => "once event",
            Kind::Event(EventKind::Idempotent) => "idempotent event",
            Kind::Event(EventKind::Sticky) => "sticky event",
            Kind::Event(EventKind::Latch) => "latch event",
        };
        f.write_str(s)
    }
}

// === impl GuidProvider ===

impl GuidProvider {
    /// Creates a provider that can hold at most `capacity` live handles.
    pub fn new(capacity: usize) -> Self {
        // slot indices have to fit the 32 bit index field
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            table: RwLock::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                capacity,
                live: 0,
            }),
        }
    }

    /// Stores `object` and issues a fresh handle for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] when the table is at capacity.
    pub(crate) fn allocate(&self, kind: Kind, object: Object) -> Result<Guid> {
        let mut table = self.table.write();

        let index = if let Some(index) = table.free.pop() {
            index
        } else if table.slots.len() < table.capacity {
            let index = u32::try_from(table.slots.len()).map_err(|_| Error::OutOfMemory)?;
            table.slots.push(Slot {
                generation: 0,
                entry: None,
            });
            index
        } else {
            tracing::warn!(capacity = table.capacity, "handle table exhausted");
            return Err(Error::OutOfMemory);
        };

        let slot = &mut table.slots[index as usize];
        debug_assert!(slot.entry.is_none());
        slot.generation = next_generation(slot.generation);
        slot.entry = Some((kind, object));
        let guid = Guid::from_parts(index, slot.generation);
        table.live += 1;

        tracing::trace!(?guid, %kind, "allocated handle");
        Ok(guid)
    }

    /// Returns the kind and object a handle refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is null, unknown, or was released.
    pub(crate) fn resolve(&self, guid: Guid) -> Result<(Kind, Object)> {
        let table = self.table.read();
        match table.slots.get(guid.index() as usize) {
            Some(Slot {
                generation,
                entry: Some((kind, object)),
            }) if *generation == guid.generation() && !guid.is_null() => {
                Ok((*kind, object.clone()))
            }
            _ => Err(Error::InvalidHandle(guid)),
        }
    }

    /// Returns the kind of object a handle refers to, [`Kind::None`] for the null handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is unknown or was released.
    pub fn kind_of(&self, guid: Guid) -> Result<Kind> {
        if guid.is_null() {
            return Ok(Kind::None);
        }
        self.resolve(guid).map(|(kind, _)| kind)
    }

    /// Invalidates a handle and hands back the object it referred to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] if the handle was already released and
    /// [`Error::InvalidHandle`] if it is unknown.
    pub(crate) fn release(&self, guid: Guid) -> Result<(Kind, Object)> {
        let mut table = self.table.write();
        let index = guid.index();

        let Some(slot) = table.slots.get_mut(index as usize) else {
            return Err(Error::InvalidHandle(guid));
        };
        if guid.is_null() || slot.generation != guid.generation() {
            return Err(Error::InvalidHandle(guid));
        }
        let Some(entry) = slot.entry.take() else {
            return Err(Error::DoubleRelease(guid));
        };

        table.free.push(index);
        table.live -= 1;

        tracing::trace!(?guid, kind = %entry.0, "released handle");
        Ok(entry)
    }

    /// Returns the number of live handles.
    pub fn len(&self) -> usize {
        self.table.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every live handle, returning them together with their kind.
    pub(crate) fn drain(&self) -> Vec<(Guid, Kind)> {
        let mut table = self.table.write();
        let mut drained = Vec::with_capacity(table.live);
        let mut freed = Vec::with_capacity(table.live);

        for (index, slot) in table.slots.iter_mut().enumerate() {
            if let Some((kind, _object)) = slot.entry.take() {
                let index = u32::try_from(index).unwrap_or(u32::MAX);
                drained.push((Guid::from_parts(index, slot.generation), kind));
                freed.push(index);
            }
        }

        table.free.extend(freed);
        table.live = 0;
        drained
    }

    pub(crate) fn task(&self, guid: Guid) -> Result<Arc<Task>> {
        match self.resolve(guid)? {
            (_, Object::Task(task)) => Ok(task),
            (found, _) => Err(mismatch(guid, "task", found)),
        }
    }

    pub(crate) fn template(&self, guid: Guid) -> Result<Arc<TaskTemplate>> {
        match self.resolve(guid)? {
            (_, Object::Template(template)) => Ok(template),
            (found, _) => Err(mismatch(guid, "task template", found)),
        }
    }

    pub(crate) fn event(&self, guid: Guid) -> Result<Arc<Event>> {
        match self.resolve(guid)? {
            (_, Object::Event(event)) => Ok(event),
            (found, _) => Err(mismatch(guid, "event", found)),
        }
    }

    pub(crate) fn datablock(&self, guid: Guid) -> Result<Arc<DataBlock>> {
        match self.resolve(guid)? {
            (_, Object::DataBlock(db)) => Ok(db),
            (found, _) => Err(mismatch(guid, "data block", found)),
        }
    }
}

impl fmt::Debug for GuidProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("GuidProvider")
            .field("live", &table.live)
            .field("slots", &table.slots.len())
            .field("capacity", &table.capacity)
            .finish()
    }
}

fn mismatch(guid: Guid, expected: &'static str, found: Kind) -> Error {
    Error::KindMismatch {
        guid,
        expected,
        found,
    }
}

fn next_generation(generation: u32) -> u32 {
    // zero is reserved for the null handle, `u32::MAX` for task slot sentinels
    match generation.wrapping_add(1) {
        0 | u32::MAX => 1,
        next => next,
    }
}
