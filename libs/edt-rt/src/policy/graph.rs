// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dependence graph operations.
//!
//! Everything in here runs on behalf of a worker (or the master context, which acts as worker
//! 0). Tasks that become ready are handed to the scheduler of that worker, which pushes them to
//! the worker's own workpile.

use super::Shared;
use crate::datablock::DataBlock;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, LatchSlot, SatisfyAction, Waiter};
use crate::guid::{Guid, Kind, Object};
use crate::task::{Arity, Readiness, SpawnedTask, Task, TaskProperties};
use core::sync::atomic::{self, Ordering};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;

/// Everything needed to create a task, collected by a
/// [`TaskBuilder`](crate::task::TaskBuilder).
#[derive(Debug)]
pub(crate) struct NewTask<'a> {
    pub(crate) template: Guid,
    pub(crate) params: &'a [u64],
    pub(crate) deps: Option<&'a [Guid]>,
    pub(crate) dep_count: Option<Arity>,
    pub(crate) properties: TaskProperties,
}

impl Shared {
    pub(crate) fn trace_tasks(&self) -> bool {
        self.log_filter >= LevelFilter::TRACE
    }

    /// Hands a ready task to the scheduler serving `worker` and wakes one parked worker.
    ///
    /// A task that doesn't fit into the worker's workpile goes to the injector, a ready task is
    /// never dropped.
    pub(crate) fn give(&self, worker: usize, task: Guid) -> Result<()> {
        match self.schedulers[self.scheduler_of[worker]].give(worker, task) {
            Ok(()) => {}
            Err(Error::DequeFull { workpile }) => {
                tracing::warn!(worker, workpile, ?task, "workpile is full, spilling to injector");
                self.injector.lock().push_back(task);
            }
            Err(err) => return Err(err),
        }

        // pairs with the fence in `ParkingLot::park`, either the parked worker sees the task or
        // we see the parked worker
        atomic::fence(Ordering::SeqCst);
        self.parking_lot.unpark_one();
        Ok(())
    }

    /// Finds a task for `worker`. Once its own scheduler ran dry the injector is drained first,
    /// then the other schedulers are asked in round-robin order.
    pub(crate) fn take(&self, worker: usize) -> Option<Guid> {
        let own = self.scheduler_of[worker];
        if let Some(task) = self.schedulers[own].take(worker) {
            return Some(task);
        }

        let spilled = self.injector.lock().pop_front();
        if let Some(task) = spilled {
            tracing::trace!(worker, ?task, "took task from injector");
            return Some(task);
        }

        let len = self.schedulers.len();
        (1..len).find_map(|i| self.schedulers[(own + i) % len].steal_for(worker))
    }

    pub(crate) fn has_work(&self) -> bool {
        self.workpiles.iter().any(|workpile| !workpile.is_empty())
            || !self.injector.lock().is_empty()
    }

    /// Creates a task from a template and wires up its dependences.
    ///
    /// `scope` is the finish latch of the creating task, the new task registers with it and
    /// deregisters once it completed. Nothing is left behind if creation fails.
    pub(crate) fn create_task(
        &self,
        worker: usize,
        scope: Guid,
        new: NewTask<'_>,
    ) -> Result<SpawnedTask> {
        let template = self.guids.template(new.template)?;

        if let Arity::Known(expected) = template.params() {
            let found = len_u32(new.params.len());
            if found != expected {
                return Err(Error::ArityMismatch {
                    what: "parameters",
                    expected,
                    found,
                });
            }
        }

        let deps = new.deps.unwrap_or_default();
        let slots = match (template.deps(), new.dep_count) {
            (Arity::Known(expected), Some(Arity::Known(found))) if found != expected => {
                return Err(Error::ArityMismatch {
                    what: "dependences",
                    expected,
                    found,
                });
            }
            (Arity::Known(expected), Some(Arity::Unknown)) => {
                return Err(Error::ArityMismatch {
                    what: "dependences",
                    expected,
                    found: len_u32(deps.len()),
                });
            }
            (Arity::Known(n), _) | (Arity::Unknown, Some(Arity::Known(n))) => Some(n),
            (Arity::Unknown, Some(Arity::Unknown)) => None,
            (Arity::Unknown, None) => match new.deps {
                Some(deps) => Some(len_u32(deps.len())),
                None => {
                    return Err(Error::UnknownArity {
                        template: new.template,
                    });
                }
            },
        };

        if let Some(expected) = slots
            && new.deps.is_some()
            && len_u32(deps.len()) != expected
        {
            return Err(Error::ArityMismatch {
                what: "dependences",
                expected,
                found: len_u32(deps.len()),
            });
        }

        for &dep in deps {
            self.check_source(dep)?;
        }

        let properties = new.properties;
        let output = if properties.contains(TaskProperties::OUTPUT_EVENT) {
            self.new_event(Event::new(EventKind::Sticky))?
        } else {
            Guid::NULL
        };

        let own_latch = if properties.contains(TaskProperties::FINISH) {
            match self.new_event(Event::finish_latch(output, scope)) {
                Ok(latch) => latch,
                Err(err) => {
                    self.discard(&[output]);
                    return Err(err);
                }
            }
        } else {
            Guid::NULL
        };
        let latch = if own_latch.is_null() { scope } else { own_latch };

        let task = Arc::new(Task::new(
            template,
            new.params.into(),
            slots,
            properties,
            output,
            latch,
        ));
        let guid = match self.guids.allocate(Kind::Task, Object::Task(task.clone())) {
            Ok(guid) => guid,
            Err(err) => {
                self.discard(&[own_latch, output]);
                return Err(err);
            }
        };

        if !scope.is_null()
            && let Err(err) = self.satisfy(worker, scope, Guid::NULL, LatchSlot::Incr.into())
        {
            self.discard(&[guid, own_latch, output]);
            return Err(err);
        }

        for (slot, &dep) in deps.iter().enumerate() {
            if let Err(err) = self.add_dependence(worker, dep, guid, len_u32(slot)) {
                tracing::warn!(task = ?guid, slot, ?dep, %err, "failed to bind dependence");
                if !scope.is_null()
                    && let Err(err) =
                        self.satisfy(worker, scope, Guid::NULL, LatchSlot::Decr.into())
                {
                    tracing::warn!(?scope, %err, "failed to leave finish scope");
                }
                self.unregister_waiters(guid, &deps[..slot]);
                self.discard(&[guid, own_latch, output]);
                return Err(err);
            }
        }

        if self.trace_tasks() {
            tracing::trace!(
                task = ?guid,
                template = task.template().name(),
                ?slots,
                ?properties,
                "task created"
            );
        }

        if task.release_hold() == Readiness::Ready {
            self.give(worker, guid)?;
        }

        Ok(SpawnedTask::new(guid, (!output.is_null()).then_some(output)))
    }

    /// Declares that all dependences of a task created with an unknown dependence count are
    /// bound.
    pub(crate) fn seal_dependences(&self, worker: usize, guid: Guid) -> Result<()> {
        let task = self.guids.task(guid)?;
        if task.seal(guid)? == Readiness::Ready {
            self.give(worker, guid)?;
        }
        Ok(())
    }

    /// Makes `source` a dependence of `slot` of `dest`, which is either a task or an event.
    ///
    /// Null handles and data blocks satisfy the slot right away, so do events that already
    /// fired.
    pub(crate) fn add_dependence(
        &self,
        worker: usize,
        source: Guid,
        dest: Guid,
        slot: u32,
    ) -> Result<()> {
        let source_kind = self.check_source(source)?;

        match self.guids.resolve(dest) {
            Ok((_, Object::Task(task))) => task.bind(dest, slot)?,
            Ok((_, Object::Event(event))) => event.check_slot(dest, slot)?,
            Ok((found, _)) => {
                return Err(Error::KindMismatch {
                    guid: dest,
                    expected: "task or event",
                    found,
                });
            }
            Err(err) => return Err(err),
        }

        let waiter = Waiter { guid: dest, slot };
        match source_kind {
            Kind::DataBlock => self.signal(worker, waiter, source),
            Kind::Event(_) => match self.guids.event(source)?.register(waiter) {
                Some(value) => self.signal(worker, waiter, value),
                None => Ok(()),
            },
            _ => self.signal(worker, waiter, Guid::NULL),
        }
    }

    /// Satisfies `slot` of the event `guid` with `value`.
    pub(crate) fn satisfy(&self, worker: usize, guid: Guid, value: Guid, slot: u32) -> Result<()> {
        let event = self.guids.event(guid)?;
        self.satisfy_event(worker, guid, &event, value, slot)
    }

    /// Runs the epilogue of an executed task: satisfies its output event and leaves its finish
    /// scope, or, for finish tasks, drops the count the task holds on its own latch.
    pub(crate) fn complete_task(
        &self,
        worker: usize,
        guid: Guid,
        task: &Task,
        result: Guid,
    ) -> Result<()> {
        task.complete();

        if task.properties().contains(TaskProperties::FINISH) {
            let latch = self.guids.event(task.finish_latch())?;
            if let Some(scope) = latch.finish_scope() {
                scope.set_result(result);
            }
            return self.satisfy_event(
                worker,
                task.finish_latch(),
                &latch,
                Guid::NULL,
                LatchSlot::Decr.into(),
            );
        }

        if self.trace_tasks() {
            tracing::trace!(task = ?guid, ?result, "task completed");
        }

        let mut res = Ok(());
        if !task.output().is_null() {
            res = self.satisfy(worker, task.output(), result, 0);
        }
        if !task.finish_latch().is_null() {
            let left = self.satisfy(
                worker,
                task.finish_latch(),
                Guid::NULL,
                LatchSlot::Decr.into(),
            );
            res = res.and(left);
        }
        res
    }

    pub(crate) fn new_event(&self, event: Event) -> Result<Guid> {
        let kind = Kind::Event(event.kind());
        self.guids.allocate(kind, Object::Event(Arc::new(event)))
    }

    pub(crate) fn new_datablock(&self, len: usize) -> Result<Guid> {
        let db = DataBlock::new(self.allocator.clone(), len)?;
        self.guids
            .allocate(Kind::DataBlock, Object::DataBlock(Arc::new(db)))
    }

    /// Requests the data block to be freed, which happens once its last user released it.
    pub(crate) fn destroy_datablock(&self, guid: Guid) -> Result<()> {
        let db = self.guids.datablock(guid)?;
        if db.request_free(guid)? {
            self.free_datablock(guid);
        }
        Ok(())
    }

    pub(crate) fn free_datablock(&self, guid: Guid) {
        match self.guids.release(guid) {
            Ok(_) => tracing::trace!(?guid, "data block freed"),
            Err(err) => tracing::warn!(?guid, %err, "failed to free data block"),
        }
    }

    fn satisfy_event(
        &self,
        worker: usize,
        guid: Guid,
        event: &Event,
        value: Guid,
        slot: u32,
    ) -> Result<()> {
        let SatisfyAction::Fire { value, waiters } = event.satisfy(guid, value, slot)? else {
            return Ok(());
        };
        tracing::trace!(event = ?guid, ?value, waiters = waiters.len(), "event fired");

        // the event fired no matter what, every waiter is notified and the first error reported
        let mut res = Ok(());
        for waiter in waiters {
            if let Err(err) = self.signal(worker, waiter, value) {
                tracing::warn!(event = ?guid, ?waiter, %err, "failed to notify waiter");
                if res.is_ok() {
                    res = Err(err);
                }
            }
        }

        res.and(self.after_fire(worker, guid, event))
    }

    fn after_fire(&self, worker: usize, guid: Guid, event: &Event) -> Result<()> {
        if event.kind() == EventKind::Once {
            self.guids.release(guid)?;
            return Ok(());
        }

        let Some(scope) = event.finish_scope() else {
            return Ok(());
        };
        tracing::trace!(latch = ?guid, output = ?scope.output, "finish scope completed");

        let mut res = Ok(());
        if !scope.output.is_null() {
            res = self.satisfy(worker, scope.output, scope.result(), 0);
        }
        if !scope.parent.is_null() {
            let left = self.satisfy(worker, scope.parent, Guid::NULL, LatchSlot::Decr.into());
            res = res.and(left);
        }
        self.guids.release(guid)?;
        res
    }

    /// Delivers `value` to a waiting task slot or event.
    fn signal(&self, worker: usize, waiter: Waiter, value: Guid) -> Result<()> {
        match self.guids.resolve(waiter.guid)? {
            (_, Object::Task(task)) => {
                if task.satisfy(waiter.guid, waiter.slot, value)? == Readiness::Ready {
                    self.give(worker, waiter.guid)?;
                }
                Ok(())
            }
            (_, Object::Event(event)) => {
                self.satisfy_event(worker, waiter.guid, &event, value, waiter.slot)
            }
            (found, _) => Err(Error::KindMismatch {
                guid: waiter.guid,
                expected: "task or event",
                found,
            }),
        }
    }

    /// Checks that `guid` can be the source of a dependence and returns its kind.
    fn check_source(&self, guid: Guid) -> Result<Kind> {
        match self.guids.kind_of(guid)? {
            kind @ (Kind::None | Kind::DataBlock | Kind::Event(_)) => Ok(kind),
            found => Err(Error::KindMismatch {
                guid,
                expected: "event, data block or null handle",
                found,
            }),
        }
    }

    /// Removes the waiters `task` registered on the events among `deps`, slot `i` waiting on
    /// `deps[i]`.
    pub(crate) fn unregister_waiters(&self, task: Guid, deps: &[Guid]) {
        for (slot, &dep) in deps.iter().enumerate() {
            if let Ok(event) = self.guids.event(dep) {
                event.unregister(Waiter {
                    guid: task,
                    slot: len_u32(slot),
                });
            }
        }
    }

    /// Releases handles of a task that failed to be created.
    fn discard(&self, guids: &[Guid]) {
        for &guid in guids.iter().filter(|guid| !guid.is_null()) {
            if let Err(err) = self.guids.release(guid) {
                tracing::warn!(?guid, %err, "failed to discard handle");
            }
        }
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
