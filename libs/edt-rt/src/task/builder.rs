// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Result;
use crate::guid::Guid;
use crate::policy::{NewTask, Shared};
use crate::task::{Arity, TaskProperties};
use core::marker::PhantomData;
use core::panic::Location;

/// Configures and creates a task. Returned by
/// [`RuntimeContext::create_task`](crate::RuntimeContext::create_task).
#[must_use = "a task is only created by calling `spawn`"]
pub struct TaskBuilder<'a> {
    shared: &'a Shared,
    worker: usize,
    scope: Guid,
    template: Guid,
    params: &'a [u64],
    deps: Option<&'a [Guid]>,
    dep_count: Option<Arity>,
    properties: TaskProperties,
    _not_send: PhantomData<*const ()>,
}

/// A freshly created task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedTask {
    guid: Guid,
    output: Option<Guid>,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new(shared: &'a Shared, worker: usize, scope: Guid, template: Guid) -> Self {
        Self {
            shared,
            worker,
            scope,
            template,
            params: &[],
            deps: None,
            dep_count: None,
            properties: TaskProperties::empty(),
            _not_send: PhantomData,
        }
    }

    /// Sets the parameters passed to the task function.
    ///
    /// By default, tasks get no parameters.
    pub fn params(mut self, params: &'a [u64]) -> Self {
        self.params = params;
        self
    }

    /// Binds `deps` to slots `0..deps.len()` in order.
    ///
    /// Slots that are not bound here are bound later through
    /// [`RuntimeContext::add_dependence`](crate::RuntimeContext::add_dependence).
    pub fn deps(mut self, deps: &'a [Guid]) -> Self {
        self.deps = Some(deps);
        self
    }

    /// Overrides the dependence count of the template.
    ///
    /// This is required for templates with an [`Arity::Unknown`] dependence count unless the
    /// dependences are given through [`TaskBuilder::deps`]. Passing [`Arity::Unknown`] creates a
    /// task whose slots are bound one by one and that only becomes ready after
    /// [`RuntimeContext::seal_dependences`](crate::RuntimeContext::seal_dependences).
    pub fn dep_count(mut self, count: Arity) -> Self {
        self.dep_count = Some(count);
        self
    }

    pub fn properties(mut self, properties: TaskProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Shorthand for adding [`TaskProperties::OUTPUT_EVENT`].
    pub fn output_event(mut self) -> Self {
        self.properties |= TaskProperties::OUTPUT_EVENT;
        self
    }

    /// Shorthand for adding [`TaskProperties::FINISH`].
    pub fn finish(mut self) -> Self {
        self.properties |= TaskProperties::FINISH;
        self
    }

    /// Creates the task. It is handed to the scheduler right away if it has no unsatisfied
    /// dependences.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is invalid, the parameter or dependence counts don't
    /// match it, a dependence is not an event, data block or the null handle, or the runtime is
    /// out of memory. No task is created in that case.
    #[track_caller]
    pub fn spawn(self) -> Result<SpawnedTask> {
        let loc = Location::caller();
        let _span = tracing::trace_span!(
            "create task",
            template = ?self.template,
            loc.file = loc.file(),
            loc.line = loc.line(),
        )
        .entered();

        self.shared.create_task(
            self.worker,
            self.scope,
            NewTask {
                template: self.template,
                params: self.params,
                deps: self.deps,
                dep_count: self.dep_count,
                properties: self.properties,
            },
        )
    }
}

impl SpawnedTask {
    pub(crate) fn new(guid: Guid, output: Option<Guid>) -> Self {
        Self { guid, output }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// The output event, if the task was created with [`TaskProperties::OUTPUT_EVENT`].
    pub fn output(&self) -> Option<Guid> {
        self.output
    }
}
