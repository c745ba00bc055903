// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::backoff::Backoff;
use crate::context::RuntimeContext;
use crate::guid::{Guid, Kind, Object};
use crate::policy::Shared;
use crate::task::{Dependence, Task};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A worker drains the workpiles of its scheduler on one OS thread.
pub(crate) struct Worker {
    id: usize,
    guid: Guid,
    running: AtomicBool,
    /// The task this worker is currently executing, null while idle.
    current: AtomicU64,
}

impl Worker {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            guid: Guid::NULL,
            running: AtomicBool::new(true),
            current: AtomicU64::new(Guid::NULL.as_u64()),
        }
    }

    pub(crate) fn set_guid(&mut self, guid: Guid) {
        self.guid = guid;
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn guid(&self) -> Guid {
        self.guid
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn current_task(&self) -> Guid {
        Guid::from_u64(self.current.load(Ordering::Acquire))
    }

    /// Runs the take-execute loop until the domain shuts down.
    ///
    /// Tasks that are already in flight always run to completion, the running flag is only
    /// checked between tasks.
    pub(crate) fn run(&self, shared: &Shared) {
        let _span = tracing::debug_span!("worker main loop", worker = self.id).entered();
        let mut backoff = Backoff::new(shared.config.idle.spin_rounds);

        loop {
            if !self.is_running() {
                tracing::debug!(worker = self.id, "stop signal received, shutting down");
                break;
            }

            if let Some(task) = shared.take(self.id) {
                backoff.reset();
                self.execute(shared, task);
                continue;
            }

            if !backoff.is_completed() {
                backoff.spin();
                continue;
            }

            tracing::trace!("going to sleep");
            shared
                .parking_lot
                .park(shared.config.idle.park_timeout(), || {
                    !self.is_running() || shared.has_work()
                });
            tracing::trace!("woke up");
        }
    }

    fn execute(&self, shared: &Shared, guid: Guid) {
        let task = match shared.guids.task(guid) {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(
                    worker = self.id,
                    ?guid,
                    %err,
                    "scheduled handle is not a live task"
                );
                panic!("worker {} took {guid:?} which is not a live task: {err}", self.id);
            }
        };

        if let Err(status) = task.start() {
            tracing::error!(worker = self.id, ?guid, ?status, "scheduled task was not ready");
            panic!(
                "worker {} took task {guid:?} which was not ready ({status:?})",
                self.id
            );
        }

        self.current.store(guid.as_u64(), Ordering::Release);
        if shared.trace_tasks() {
            tracing::trace!(
                worker = self.id,
                ?guid,
                template = task.template().name(),
                "executing task"
            );
        }

        let mut deps = acquire_dependences(shared, &task);

        let ctx = RuntimeContext::new(shared, self.id, guid, task.finish_latch());
        let result = match task.template().call(&ctx, task.params(), &deps) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    worker = self.id,
                    ?guid,
                    template = task.template().name(),
                    %err,
                    "task function failed"
                );
                Guid::NULL
            }
        };

        for dep in &mut deps {
            if let Some(db) = dep.take_data()
                && db.release()
            {
                shared.free_datablock(dep.guid());
            }
        }

        if let Err(err) = shared.complete_task(self.id, guid, &task, result) {
            tracing::error!(worker = self.id, ?guid, %err, "failed to propagate task completion");
        }

        self.current.store(Guid::NULL.as_u64(), Ordering::Release);

        if let Err(err) = shared.guids.release(guid) {
            tracing::error!(
                worker = self.id,
                ?guid,
                %err,
                "executed task was released concurrently"
            );
            panic!("task {guid:?} was released while worker {} executed it: {err}", self.id);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .field("running", &self.is_running())
            .field("current", &self.current_task())
            .finish()
    }
}

/// Resolves the values of all slots, acquiring every data block among them.
fn acquire_dependences(shared: &Shared, task: &Task) -> Vec<Dependence> {
    task.slot_values()
        .into_iter()
        .map(|value| {
            let data = match shared.guids.resolve(value) {
                Ok((Kind::DataBlock, Object::DataBlock(db))) => match db.acquire(value) {
                    Ok(()) => Some(db),
                    Err(err) => {
                        tracing::warn!(
                            ?value,
                            %err,
                            "dependence on a data block pending destruction"
                        );
                        None
                    }
                },
                _ => None,
            };
            Dependence::new(value, data)
        })
        .collect()
}
