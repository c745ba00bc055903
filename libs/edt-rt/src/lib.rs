// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An event-driven task runtime.
//!
//! Programs are expressed as a graph of single-shot tasks. A task declares a number of
//! dependence slots, each of which is satisfied by an event firing or by a data block, and runs
//! exactly once after the last slot was satisfied. Ready tasks are pushed to per-worker
//! work-stealing deques and executed by a fixed pool of OS threads.
//!
//! Every object is named by a [`Guid`] and owned by the runtime. Tasks are released once they ran
//! and once events right after they fired, everything else lives until it is destroyed
//! explicitly or the [`PolicyDomain`] is dropped.
//!
//! ```no_run
//! use edt_rt::{Arity, Guid, PolicyDomain};
//! use edt_config::RuntimeConfig;
//!
//! let mut domain = PolicyDomain::new(RuntimeConfig::default()).unwrap();
//! let ctx = domain.master_context().unwrap();
//! let main = ctx
//!     .create_template(Arity::Known(0), Arity::Known(0), |ctx, _, _| {
//!         ctx.shutdown(0);
//!         Ok(Guid::NULL)
//!     })
//!     .unwrap();
//! ctx.create_task(main).spawn().unwrap();
//!
//! domain.start().unwrap();
//! assert_eq!(domain.stop().unwrap(), 0);
//! ```

mod allocator;
pub mod args;
mod backoff;
mod context;
mod datablock;
mod error;
mod event;
mod guid;
mod park;
mod policy;
pub mod scheduler;
mod task;
mod worker;
mod workpile;

pub use allocator::{AllocError, Allocator, ArenaAllocator};
pub use context::RuntimeContext;
pub use datablock::{DataBlock, DataBlockRead, DataBlockWrite};
pub use error::{Error, Result};
pub use event::{EventKind, LatchSlot};
pub use guid::{Guid, GuidProvider, Kind};
pub use policy::{DomainState, PolicyDomain, Topology, TopologyNode};
pub use task::{
    Arity, Dependence, SpawnedTask, TaskBuilder, TaskFn, TaskProperties, TaskStatus, TaskTemplate,
};
pub use workpile::Workpile;

static_assertions::assert_impl_all!(PolicyDomain: Send);
static_assertions::assert_impl_all!(DataBlock: Send, Sync);
static_assertions::assert_impl_all!(Guid: Send, Sync, Copy);
static_assertions::assert_not_impl_any!(RuntimeContext<'static>: Send, Sync);
static_assertions::assert_not_impl_any!(TaskBuilder<'static>: Send, Sync);
