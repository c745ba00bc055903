// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::datablock::DataBlock;
use crate::error::Result;
use crate::event::{Event, EventKind, LatchSlot};
use crate::guid::{Guid, Kind, Object};
use crate::policy::Shared;
use crate::task::{Arity, Dependence, TaskBuilder, TaskStatus, TaskTemplate};
use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

/// The runtime as seen by a task.
///
/// Every task function receives a context naming the worker it runs on and the task itself. All
/// runtime operations go through it, tasks created through it are scheduled on the context's
/// worker and join the current task's finish scope.
pub struct RuntimeContext<'a> {
    shared: &'a Shared,
    worker: usize,
    task: Guid,
    /// The finish latch the current task reports to, null outside of finish scopes.
    finish: Guid,
    /// Tasks given through the context are pushed onto the worker's own workpile, which only
    /// the worker's thread may do.
    _not_send: PhantomData<*const ()>,
}

impl<'a> RuntimeContext<'a> {
    pub(crate) fn new(shared: &'a Shared, worker: usize, task: Guid, finish: Guid) -> Self {
        Self {
            shared,
            worker,
            task,
            finish,
            _not_send: PhantomData,
        }
    }

    /// The id of the worker executing the current task.
    pub fn current_worker(&self) -> usize {
        self.worker
    }

    /// The handle of the current task, null in the master context.
    pub fn current_task(&self) -> Guid {
        self.task
    }

    /// The latch of the innermost finish scope the current task belongs to, null if there is
    /// none.
    pub fn finish_scope(&self) -> Guid {
        self.finish
    }

    /// Returns the kind of object `guid` refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`](crate::Error::InvalidHandle) if the handle is stale or
    /// unknown.
    pub fn kind_of(&self, guid: Guid) -> Result<Kind> {
        self.shared.guids.kind_of(guid)
    }

    /// Registers a task function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the handle table is full.
    pub fn create_template<F>(&self, params: Arity, deps: Arity, func: F) -> Result<Guid>
    where
        F: Fn(&RuntimeContext<'_>, &[u64], &[Dependence]) -> Result<Guid> + Send + Sync + 'static,
    {
        let template = TaskTemplate::new(func, params, deps);
        tracing::trace!(template = template.name(), ?params, ?deps, "creating template");
        self.shared
            .guids
            .allocate(Kind::TaskTemplate, Object::Template(Arc::new(template)))
    }

    /// Destroys a template. Tasks already created from it are not affected.
    pub fn destroy_template(&self, template: Guid) -> Result<()> {
        self.shared.guids.template(template)?;
        self.shared.guids.release(template).map(drop)
    }

    /// Starts building a task from `template`.
    pub fn create_task(&self, template: Guid) -> TaskBuilder<'a> {
        TaskBuilder::new(self.shared, self.worker, self.finish, template)
    }

    /// Declares that every dependence of a task created with [`Arity::Unknown`] is bound. The
    /// task becomes ready once all of them are satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundSlotCountMismatch`](crate::Error::UnboundSlotCountMismatch) if a
    /// slot below the highest bound slot was never bound.
    pub fn seal_dependences(&self, task: Guid) -> Result<()> {
        self.shared.seal_dependences(self.worker, task)
    }

    /// Returns the state of a task that has not been released yet.
    pub fn task_status(&self, task: Guid) -> Result<TaskStatus> {
        Ok(self.shared.guids.task(task)?.status())
    }

    /// Creates an event. Latches created here start with a count of zero.
    pub fn create_event(&self, kind: EventKind) -> Result<Guid> {
        self.shared.new_event(Event::new(kind))
    }

    /// Creates a latch that fires once `count` more decrements than increments were applied.
    pub fn create_latch(&self, count: i64) -> Result<Guid> {
        self.shared.new_event(Event::latch(count))
    }

    /// Satisfies an event with `value`. For latches this is a decrement.
    ///
    /// If the event fires, all waiters are notified even if some of them fail, and the first
    /// failure is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySatisfied`](crate::Error::AlreadySatisfied) for sticky and once
    /// events that were satisfied before and latches that already fired.
    pub fn satisfy(&self, event: Guid, value: Guid) -> Result<()> {
        let slot = match self.shared.guids.event(event)?.kind() {
            EventKind::Latch => LatchSlot::Decr.into(),
            _ => 0,
        };
        self.shared.satisfy(self.worker, event, value, slot)
    }

    /// Satisfies a specific slot of an event, e.g. [`LatchSlot::Incr`] of a latch.
    pub fn satisfy_slot(&self, event: Guid, value: Guid, slot: impl Into<u32>) -> Result<()> {
        self.shared.satisfy(self.worker, event, value, slot.into())
    }

    /// Returns the value the event was satisfied with, `None` if it has not fired yet.
    pub fn get(&self, event: Guid) -> Result<Option<Guid>> {
        Ok(self.shared.guids.event(event)?.get())
    }

    /// Destroys an event. Waiters that were not notified yet never will be.
    pub fn destroy_event(&self, event: Guid) -> Result<()> {
        let ev = self.shared.guids.event(event)?;
        let pending = ev.pending_waiters();
        if pending > 0 {
            tracing::warn!(?event, pending, "destroying event with pending waiters");
        }
        self.shared.guids.release(event).map(drop)
    }

    /// Allocates a zeroed data block of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the allocator or the handle
    /// table is exhausted.
    pub fn create_datablock(&self, len: usize) -> Result<Guid> {
        self.shared.new_datablock(len)
    }

    /// Looks up a data block, e.g. to fill it before handing it to tasks.
    pub fn datablock(&self, guid: Guid) -> Result<Arc<DataBlock>> {
        self.shared.guids.datablock(guid)
    }

    /// Requests a data block to be freed. Tasks currently using it keep it alive until they
    /// completed, no new task can acquire it anymore.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataBlockFreed`](crate::Error::DataBlockFreed) if a free was already
    /// requested.
    pub fn destroy_datablock(&self, guid: Guid) -> Result<()> {
        self.shared.destroy_datablock(guid)
    }

    /// Makes `source` a dependence of `slot` of `dest`.
    ///
    /// `source` is an event, a data block or the null handle, `dest` is a task or an event.
    /// Null handles and data blocks satisfy the slot immediately, events satisfy it once they
    /// fire. For latch destinations the slot is one of [`LatchSlot`].
    pub fn add_dependence(&self, source: Guid, dest: Guid, slot: u32) -> Result<()> {
        self.shared.add_dependence(self.worker, source, dest, slot)
    }

    /// Asks the runtime to shut down. Every worker stops once its current task completed, the
    /// code is returned by [`PolicyDomain::stop`](crate::PolicyDomain::stop).
    pub fn shutdown(&self, code: i32) {
        tracing::debug!(task = ?self.task, code, "task requested shutdown");
        self.shared.shutdown(code);
    }
}

impl fmt::Debug for RuntimeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("worker", &self.worker)
            .field("task", &self.task)
            .field("finish", &self.finish)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::PolicyDomain;
    use crate::task::TaskProperties;
    use edt_config::RuntimeConfig;

    fn domain() -> PolicyDomain {
        PolicyDomain::new(RuntimeConfig::with_workers(1)).unwrap()
    }

    fn noop(ctx: &RuntimeContext<'_>, deps: u32) -> Guid {
        ctx.create_template(Arity::Known(0), Arity::Known(deps), |_, _, _| Ok(Guid::NULL))
            .unwrap()
    }

    #[test]
    fn arity_is_checked() {
        let mut domain = domain();
        let ctx = domain.master_context().unwrap();
        let template = noop(&ctx, 2);

        assert!(matches!(
            ctx.create_task(template).params(&[1]).spawn(),
            Err(Error::ArityMismatch {
                what: "parameters",
                expected: 0,
                found: 1
            })
        ));
        assert!(matches!(
            ctx.create_task(template).deps(&[Guid::NULL]).spawn(),
            Err(Error::ArityMismatch {
                what: "dependences",
                expected: 2,
                found: 1
            })
        ));
        assert!(matches!(
            ctx.create_task(template).dep_count(Arity::Known(3)).spawn(),
            Err(Error::ArityMismatch { found: 3, .. })
        ));

        let unknown = ctx
            .create_template(Arity::Unknown, Arity::Unknown, |_, _, _| Ok(Guid::NULL))
            .unwrap();
        assert!(matches!(
            ctx.create_task(unknown).spawn(),
            Err(Error::UnknownArity { .. })
        ));
        // the dependence vector implies the count
        ctx.create_task(unknown)
            .params(&[1, 2, 3])
            .deps(&[Guid::NULL])
            .spawn()
            .unwrap();
    }

    #[test]
    fn failed_creation_leaves_nothing_behind() {
        let mut domain = domain();
        let live = domain.live_handles();
        let ctx = domain.master_context().unwrap();
        let template = noop(&ctx, 1);

        // a template is not a valid dependence source
        assert!(matches!(
            ctx.create_task(template)
                .deps(&[template])
                .properties(TaskProperties::OUTPUT_EVENT | TaskProperties::FINISH)
                .spawn(),
            Err(Error::KindMismatch { .. })
        ));
        assert!(matches!(
            ctx.create_task(Guid::NULL).spawn(),
            Err(Error::InvalidHandle(_))
        ));
        ctx.destroy_template(template).unwrap();
        drop(ctx);
        assert_eq!(domain.live_handles(), live);
    }

    #[test]
    fn readiness_through_dependences() {
        let mut domain = domain();
        let ctx = domain.master_context().unwrap();
        let template = noop(&ctx, 2);

        let event = ctx.create_event(EventKind::Sticky).unwrap();
        let db = ctx.create_datablock(16).unwrap();
        let spawned = ctx
            .create_task(template)
            .deps(&[db, event])
            .spawn()
            .unwrap();
        assert_eq!(spawned.output(), None);
        assert_eq!(
            ctx.task_status(spawned.guid()).unwrap(),
            TaskStatus::Waiting {
                pending: 1,
                sealed: true
            }
        );

        ctx.satisfy(event, Guid::NULL).unwrap();
        assert_eq!(ctx.task_status(spawned.guid()).unwrap(), TaskStatus::Ready);
        assert!(matches!(
            ctx.satisfy(event, Guid::NULL),
            Err(Error::AlreadySatisfied(_))
        ));
    }

    #[test]
    fn dependences_between_events() {
        let mut domain = domain();
        let ctx = domain.master_context().unwrap();

        let source = ctx.create_event(EventKind::Once).unwrap();
        let dest = ctx.create_event(EventKind::Sticky).unwrap();
        let latch = ctx.create_latch(1).unwrap();
        ctx.add_dependence(source, dest, 0).unwrap();
        ctx.add_dependence(dest, latch, LatchSlot::Decr.into()).unwrap();
        assert!(matches!(
            ctx.add_dependence(dest, latch, 2),
            Err(Error::InvalidSlot { slot: 2, .. })
        ));

        let value = ctx.create_datablock(1).unwrap();
        ctx.satisfy(source, value).unwrap();

        assert_eq!(ctx.get(dest).unwrap(), Some(value));
        assert_eq!(ctx.get(latch).unwrap(), Some(Guid::NULL));
        // once events are gone after they fired
        assert!(matches!(ctx.get(source), Err(Error::InvalidHandle(_))));
        assert!(matches!(
            ctx.satisfy_slot(latch, Guid::NULL, LatchSlot::Incr),
            Err(Error::AlreadySatisfied(_))
        ));
    }

    #[test]
    fn datablock_lifecycle() {
        let mut domain = domain();
        let ctx = domain.master_context().unwrap();

        let guid = ctx.create_datablock(4).unwrap();
        ctx.datablock(guid).unwrap().write().copy_from_slice(b"edt!");
        assert_eq!(&*ctx.datablock(guid).unwrap().read(), b"edt!");
        assert_eq!(ctx.kind_of(guid).unwrap(), Kind::DataBlock);

        ctx.destroy_datablock(guid).unwrap();
        assert!(matches!(
            ctx.datablock(guid),
            Err(Error::InvalidHandle(_))
        ));
        assert!(ctx.create_datablock(usize::MAX / 2).is_err());
    }
}
