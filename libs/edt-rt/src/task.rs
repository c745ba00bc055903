// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;

use crate::context::RuntimeContext;
use crate::datablock::DataBlock;
use crate::error::{Error, Result};
use crate::guid::Guid;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use mycelium_bitfield::enum_from_bits;
use parking_lot::RwLock;
use std::sync::Arc;

pub use builder::{SpawnedTask, TaskBuilder};

/// The signature of task functions.
///
/// A task receives its parameters and the values its dependence slots were satisfied with, and
/// returns a handle (or [`Guid::NULL`]) that is forwarded to its output event.
pub type TaskFn =
    dyn Fn(&RuntimeContext<'_>, &[u64], &[Dependence]) -> Result<Guid> + Send + Sync + 'static;

/// A parameter or dependence count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Known(u32),
    /// The count is decided when a task is created from the template.
    Unknown,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskProperties: u8 {
        /// Create a sticky event that is satisfied with the task's return value.
        const OUTPUT_EVENT = 1 << 0;
        /// Open a finish scope. The output event is satisfied only once this task and every task
        /// transitively created inside it completed.
        const FINISH = 1 << 1;
    }
}

/// An immutable description of a kind of task: its function and the number of parameters and
/// dependences instances of it take.
pub struct TaskTemplate {
    func: Box<TaskFn>,
    name: &'static str,
    params: Arity,
    deps: Arity,
}

/// A dependence as seen by a running task.
#[derive(Clone)]
pub struct Dependence {
    guid: Guid,
    data: Option<Arc<DataBlock>>,
}

/// Observable state of a task that has not run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Some dependences are not satisfied yet, or the final dependence count is not known yet.
    Waiting { pending: u32, sealed: bool },
    /// The task was handed to a scheduler.
    Ready,
    Running,
    Completed,
}

/// A single-shot task.
///
/// Slots hold either one of the two sentinels below or the raw value of the [`Guid`] they were
/// satisfied with. Live handles never carry generation `u32::MAX`, so neither sentinel can be
/// mistaken for a value.
pub(crate) struct Task {
    template: Arc<TaskTemplate>,
    params: Box<[u64]>,
    slots: RwLock<Vec<AtomicU64>>,
    state: AtomicU64,
    properties: TaskProperties,
    output: Guid,
    /// Task-local storage for the latch of the finish scope this task reports to. For finish
    /// tasks this is the latch they own.
    finish_latch: Guid,
}

const SLOT_UNBOUND: u64 = u64::MAX;
const SLOT_BOUND: u64 = u64::MAX - 1;

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's dependence state.
    #[derive(PartialEq, Eq)]
    struct Snapshot<u64> {
        /// The number of slots not satisfied yet, plus one while the task is being constructed.
        const PENDING = 32;
        /// Set once the final number of slots is known.
        const SEALED: bool;
        const LIFECYCLE: Lifecycle;
    }
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    enum Lifecycle<u8> {
        /// Waiting for dependences.
        Waiting = 0b00,
        /// Handed to a scheduler.
        Ready = 0b01,
        /// Claimed by a worker.
        Running = 0b10,
        Completed = 0b11,
    }
}

/// Whether a state change made the task ready. A task reports `Ready` exactly once.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Waiting,
    Ready,
}

// === impl TaskTemplate ===

impl TaskTemplate {
    pub(crate) fn new<F>(func: F, params: Arity, deps: Arity) -> Self
    where
        F: Fn(&RuntimeContext<'_>, &[u64], &[Dependence]) -> Result<Guid> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
            name: core::any::type_name::<F>(),
            params,
            deps,
        }
    }

    /// The type name of the task function.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> Arity {
        self.params
    }

    pub fn deps(&self) -> Arity {
        self.deps
    }

    pub(crate) fn call(
        &self,
        ctx: &RuntimeContext<'_>,
        params: &[u64],
        deps: &[Dependence],
    ) -> Result<Guid> {
        (self.func)(ctx, params, deps)
    }
}

impl fmt::Debug for TaskTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

// === impl Dependence ===

impl Dependence {
    pub(crate) fn new(guid: Guid, data: Option<Arc<DataBlock>>) -> Self {
        Self { guid, data }
    }

    /// The handle the slot was satisfied with. This is [`Guid::NULL`] for dependences on latches
    /// and on the null handle.
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// The data block behind this dependence, if it was satisfied with one.
    pub fn data(&self) -> Option<&DataBlock> {
        self.data.as_deref()
    }

    pub(crate) fn take_data(&mut self) -> Option<Arc<DataBlock>> {
        self.data.take()
    }
}

impl fmt::Debug for Dependence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependence")
            .field("guid", &self.guid)
            .field("len", &self.data.as_ref().map(|db| db.len()))
            .finish()
    }
}

// === impl Task ===

impl Task {
    /// Creates a task with `slots` dependence slots, or a growable slot array if the count is not
    /// known yet.
    ///
    /// The task starts out holding one extra pending count that is dropped through
    /// [`Task::release_hold`] once construction is finished, so slots satisfied while the task
    /// is still being wired up cannot make it ready early.
    pub(crate) fn new(
        template: Arc<TaskTemplate>,
        params: Box<[u64]>,
        slots: Option<u32>,
        properties: TaskProperties,
        output: Guid,
        finish_latch: Guid,
    ) -> Self {
        let (len, sealed) = match slots {
            Some(len) => (len, true),
            None => (0, false),
        };

        let state = Snapshot::new()
            .with(Snapshot::PENDING, u64::from(len) + 1)
            .with(Snapshot::SEALED, sealed)
            .with(Snapshot::LIFECYCLE, Lifecycle::Waiting);

        Self {
            template,
            params,
            slots: RwLock::new((0..len).map(|_| AtomicU64::new(SLOT_UNBOUND)).collect()),
            state: AtomicU64::new(state.0),
            properties,
            output,
            finish_latch,
        }
    }

    pub(crate) fn template(&self) -> &TaskTemplate {
        &self.template
    }

    pub(crate) fn params(&self) -> &[u64] {
        &self.params
    }

    pub(crate) fn properties(&self) -> TaskProperties {
        self.properties
    }

    pub(crate) fn output(&self) -> Guid {
        self.output
    }

    pub(crate) fn finish_latch(&self) -> Guid {
        self.finish_latch
    }

    /// Marks `slot` as bound to a dependence source.
    ///
    /// Slots beyond the current length grow the slot array if the task was created with an
    /// unknown dependence count and is not sealed yet.
    pub(crate) fn bind(&self, guid: Guid, slot: u32) -> Result<()> {
        {
            let slots = self.slots.read();
            if let Some(cell) = slots.get(slot as usize) {
                return bind_cell(cell, guid, slot);
            }
            if self.load().get(Snapshot::SEALED) {
                return Err(Error::InvalidSlot { guid, slot });
            }
        }

        let mut slots = self.slots.write();
        // sealing takes the write lock too, so this can't change under us anymore
        if self.load().get(Snapshot::SEALED) {
            return Err(Error::InvalidSlot { guid, slot });
        }

        let len = slot as usize + 1;
        if len > slots.len() {
            let added = (len - slots.len()) as u64;
            slots.resize_with(len, || AtomicU64::new(SLOT_UNBOUND));
            self.transition(|s| {
                let pending = s.get(Snapshot::PENDING);
                s.set(Snapshot::PENDING, pending + added);
            });
        }

        bind_cell(&slots[slot as usize], guid, slot)
    }

    /// Satisfies a bound slot with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySatisfied`] if the slot was satisfied before and
    /// [`Error::InvalidSlot`] if the slot does not exist or was never bound.
    pub(crate) fn satisfy(&self, guid: Guid, slot: u32, value: Guid) -> Result<Readiness> {
        {
            let slots = self.slots.read();
            let cell = slots
                .get(slot as usize)
                .ok_or(Error::InvalidSlot { guid, slot })?;

            match cell.compare_exchange(
                SLOT_BOUND,
                value.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(SLOT_UNBOUND) => return Err(Error::InvalidSlot { guid, slot }),
                Err(_) => return Err(Error::AlreadySatisfied(guid)),
            }
        }

        Ok(self.resolve_one())
    }

    /// Drops the construction hold taken in [`Task::new`].
    pub(crate) fn release_hold(&self) -> Readiness {
        self.resolve_one()
    }

    /// Declares that all dependences of a task with an unknown dependence count are bound.
    ///
    /// Sealing a task whose count was fixed at creation does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundSlotCountMismatch`] if a slot below the highest bound one was
    /// never bound.
    pub(crate) fn seal(&self, guid: Guid) -> Result<Readiness> {
        let slots = self.slots.write();
        if self.load().get(Snapshot::SEALED) {
            return Ok(Readiness::Waiting);
        }

        let bound = slots
            .iter()
            .filter(|cell| cell.load(Ordering::Acquire) != SLOT_UNBOUND)
            .count();
        if bound != slots.len() {
            return Err(Error::UnboundSlotCountMismatch {
                task: guid,
                bound: u32::try_from(bound).unwrap_or(u32::MAX),
                declared: u32::try_from(slots.len()).unwrap_or(u32::MAX),
            });
        }

        Ok(self.transition(|s| {
            s.set(Snapshot::SEALED, true);
            s.try_make_ready()
        }))
    }

    /// Claims a ready task for execution.
    ///
    /// Fails with the lifecycle state the task was in if it was not ready, which means it was
    /// scheduled twice or before all its dependences were satisfied.
    pub(crate) fn start(&self) -> Result<(), TaskStatus> {
        self.transition(|s| {
            if s.get(Snapshot::LIFECYCLE) != Lifecycle::Ready {
                return Err(s.status());
            }
            s.set(Snapshot::LIFECYCLE, Lifecycle::Running);
            Ok(())
        })
    }

    pub(crate) fn complete(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::LIFECYCLE), Lifecycle::Running);
            s.set(Snapshot::LIFECYCLE, Lifecycle::Completed);
        });
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.load().status()
    }

    /// Returns the values all slots were satisfied with, in slot order.
    pub(crate) fn slot_values(&self) -> Vec<Guid> {
        self.slots
            .read()
            .iter()
            .map(|cell| {
                let raw = cell.load(Ordering::Acquire);
                debug_assert!(raw != SLOT_UNBOUND && raw != SLOT_BOUND);
                Guid::from_u64(raw)
            })
            .collect()
    }

    fn resolve_one(&self) -> Readiness {
        self.transition(|s| {
            let pending = s.get(Snapshot::PENDING);
            debug_assert!(pending > 0, "task resolved more slots than it has");
            s.set(Snapshot::PENDING, pending.saturating_sub(1));
            s.try_make_ready()
        })
    }

    fn load(&self) -> Snapshot {
        Snapshot(self.state.load(Ordering::Acquire))
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load();
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.state.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("template", &self.template.name)
            .field("params", &self.params.len())
            .field("slots", &self.slots.read().len())
            .field("status", &self.status())
            .field("properties", &self.properties)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

fn bind_cell(cell: &AtomicU64, guid: Guid, slot: u32) -> Result<()> {
    cell.compare_exchange(
        SLOT_UNBOUND,
        SLOT_BOUND,
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(drop)
    .map_err(|_| Error::SlotAlreadyBound { task: guid, slot })
}

// === impl Snapshot ===

impl Snapshot {
    fn try_make_ready(&mut self) -> Readiness {
        if self.get(Snapshot::PENDING) == 0
            && self.get(Snapshot::SEALED)
            && self.get(Snapshot::LIFECYCLE) == Lifecycle::Waiting
        {
            self.set(Snapshot::LIFECYCLE, Lifecycle::Ready);
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }

    fn status(self) -> TaskStatus {
        match self.get(Snapshot::LIFECYCLE) {
            Lifecycle::Waiting => TaskStatus::Waiting {
                pending: u32::try_from(self.get(Snapshot::PENDING)).unwrap_or(u32::MAX),
                sealed: self.get(Snapshot::SEALED),
            },
            Lifecycle::Ready => TaskStatus::Ready,
            Lifecycle::Running => TaskStatus::Running,
            Lifecycle::Completed => TaskStatus::Completed,
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn template(deps: Arity) -> Arc<TaskTemplate> {
        Arc::new(TaskTemplate::new(
            |_, _, _| Ok(Guid::NULL),
            Arity::Known(0),
            deps,
        ))
    }

    fn task(slots: Option<u32>) -> Task {
        Task::new(
            template(slots.map_or(Arity::Unknown, Arity::Known)),
            Box::new([]),
            slots,
            TaskProperties::empty(),
            Guid::NULL,
            Guid::NULL,
        )
    }

    const ME: Guid = Guid::NULL;

    #[test]
    fn zero_slots_ready_after_construction() {
        let task = task(Some(0));
        assert_eq!(
            task.status(),
            TaskStatus::Waiting {
                pending: 1,
                sealed: true
            }
        );
        assert_eq!(task.release_hold(), Readiness::Ready);
        assert_eq!(task.status(), TaskStatus::Ready);
    }

    #[test]
    fn ready_exactly_once_regardless_of_order() {
        let task = task(Some(3));
        for slot in 0..3 {
            task.bind(ME, slot).unwrap();
        }
        let value = Guid::from_parts(4, 1);
        assert_eq!(task.satisfy(ME, 2, value).unwrap(), Readiness::Waiting);
        assert_eq!(task.satisfy(ME, 0, value).unwrap(), Readiness::Waiting);
        assert_eq!(task.release_hold(), Readiness::Waiting);
        assert_eq!(task.satisfy(ME, 1, value).unwrap(), Readiness::Ready);

        assert_eq!(task.slot_values(), vec![value; 3]);
        task.start().unwrap();
        assert_eq!(task.start(), Err(TaskStatus::Running));
        task.complete();
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn slot_errors() {
        let task = task(Some(2));
        task.bind(ME, 0).unwrap();
        assert!(matches!(
            task.bind(ME, 0),
            Err(Error::SlotAlreadyBound { slot: 0, .. })
        ));
        assert!(matches!(
            task.bind(ME, 2),
            Err(Error::InvalidSlot { slot: 2, .. })
        ));
        // slot 1 was never bound
        assert!(matches!(
            task.satisfy(ME, 1, Guid::NULL),
            Err(Error::InvalidSlot { slot: 1, .. })
        ));

        task.satisfy(ME, 0, Guid::NULL).unwrap();
        assert!(matches!(
            task.satisfy(ME, 0, Guid::NULL),
            Err(Error::AlreadySatisfied(_))
        ));
    }

    #[test]
    fn not_ready_cannot_start() {
        let task = task(Some(1));
        let _ = task.release_hold();
        assert_eq!(
            task.start(),
            Err(TaskStatus::Waiting {
                pending: 1,
                sealed: true
            })
        );
    }

    #[test]
    fn unknown_count_requires_seal() {
        let task = task(None);
        assert_eq!(task.release_hold(), Readiness::Waiting);

        task.bind(ME, 0).unwrap();
        task.bind(ME, 1).unwrap();
        assert_eq!(task.satisfy(ME, 0, Guid::NULL).unwrap(), Readiness::Waiting);
        assert_eq!(task.satisfy(ME, 1, Guid::NULL).unwrap(), Readiness::Waiting);
        // everything bound is satisfied, but the task was never told there is nothing more
        assert_eq!(
            task.status(),
            TaskStatus::Waiting {
                pending: 0,
                sealed: false
            }
        );

        assert_eq!(task.seal(ME).unwrap(), Readiness::Ready);
        assert!(matches!(
            task.bind(ME, 2),
            Err(Error::InvalidSlot { slot: 2, .. })
        ));
    }

    #[test]
    fn seal_with_gaps_fails() {
        let task = task(None);
        let _ = task.release_hold();
        task.bind(ME, 2).unwrap();
        assert!(matches!(
            task.seal(ME),
            Err(Error::UnboundSlotCountMismatch {
                bound: 1,
                declared: 3,
                ..
            })
        ));
    }

    #[test]
    fn sealing_fixed_task_is_noop() {
        let task = task(Some(0));
        assert_eq!(task.release_hold(), Readiness::Ready);
        assert_eq!(task.seal(ME).unwrap(), Readiness::Waiting);
        assert_eq!(task.status(), TaskStatus::Ready);
    }
}
