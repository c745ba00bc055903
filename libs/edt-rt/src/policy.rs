// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The policy domain owns every runtime component and drives startup and shutdown.
//!
//! ```text
//!   Constructed --start()--> Started --shutdown(code)--> Stopping --stop()--> Stopped
//!        \                                                                      |
//!         `------------------------------- drop --------------------------------`--> Destroyed
//! ```

mod graph;
mod topology;

use crate::allocator::{Allocator, ArenaAllocator};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::guid::{Guid, GuidProvider, Kind, Object};
use crate::park::ParkingLot;
use crate::scheduler::{self, Scheduler};
use crate::worker::Worker;
use crate::workpile::Workpile;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use edt_config::RuntimeConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::level_filters::LevelFilter;

pub(crate) use graph::NewTask;
pub use topology::{Topology, TopologyNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DomainState {
    Constructed = 0,
    Started = 1,
    Stopping = 2,
    Stopped = 3,
    Destroyed = 4,
}

/// A policy domain: the workers, workpiles and schedulers of one runtime instance, together with
/// the handle table and the allocator backing data blocks.
pub struct PolicyDomain {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

/// State shared between the domain handle and all worker threads.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) guids: GuidProvider,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) workpiles: Arc<[Workpile]>,
    pub(crate) schedulers: Box<[Box<dyn Scheduler>]>,
    /// Maps a worker to the index of the scheduler serving it.
    pub(crate) scheduler_of: Box<[usize]>,
    pub(crate) workers: Box<[Worker]>,
    /// Ready tasks that did not fit into the workpile they were given to. Any worker takes from
    /// here once its own scheduler ran dry.
    pub(crate) injector: Mutex<VecDeque<Guid>>,
    pub(crate) parking_lot: ParkingLot,
    pub(crate) topology: Topology,
    pub(crate) log_filter: LevelFilter,
    guid: Guid,
    state: AtomicU8,
    shutdown_code: AtomicI32,
}

// === impl DomainState ===

impl DomainState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => DomainState::Constructed,
            1 => DomainState::Started,
            2 => DomainState::Stopping,
            3 => DomainState::Stopped,
            _ => DomainState::Destroyed,
        }
    }
}

// === impl PolicyDomain ===

impl PolicyDomain {
    /// Builds a domain from `config`, with an [`ArenaAllocator`] of `config.heap.size` bytes
    /// backing data blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid and [`Error::OutOfMemory`] if
    /// the arena cannot be set up or the handle table is too small for the domain's components.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let allocator = ArenaAllocator::new(config.heap.size).map_err(|_| Error::OutOfMemory)?;
        Self::with_allocator(config, Arc::new(allocator))
    }

    /// Builds a domain that allocates data blocks from `allocator`.
    ///
    /// # Errors
    ///
    /// See [`PolicyDomain::new`].
    pub fn with_allocator(config: RuntimeConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;

        let guids = GuidProvider::new(config.guid_capacity);
        let guid = guids.allocate(Kind::Policy, Object::Component(0))?;
        let allocator_guid = guids.allocate(Kind::Allocator, Object::Component(0))?;

        let mut topology = Topology::new(guid);
        topology.add(0, Kind::Allocator, allocator_guid, 0);

        let mut workpiles = Vec::with_capacity(config.workpiles);
        for id in 0..config.workpiles {
            let mut workpile = Workpile::new(id, config.deque_capacity);
            workpile.set_guid(guids.allocate(Kind::Workpile, Object::Component(id))?);
            workpiles.push(workpile);
        }
        let workpiles: Arc<[Workpile]> = workpiles.into();

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let mut worker = Worker::new(id);
            worker.set_guid(guids.allocate(Kind::Worker, Object::Component(id))?);
            workers.push(worker);
        }

        // split the workers into contiguous ranges, one per scheduler
        let mut schedulers = Vec::with_capacity(config.schedulers);
        for id in 0..config.schedulers {
            let range = (id * config.workers / config.schedulers)
                ..((id + 1) * config.workers / config.schedulers);

            let sched_guid = guids.allocate(Kind::Scheduler, Object::Component(id))?;
            let node = topology.add(0, Kind::Scheduler, sched_guid, id);
            for worker in &workers[range.clone()] {
                let worker_node = topology.add(node, Kind::Worker, worker.guid(), worker.id());
                let workpile = &workpiles[worker.id()];
                topology.add(worker_node, Kind::Workpile, workpile.guid(), workpile.id());
            }

            schedulers.push(scheduler::build(config.scheduler, workpiles.clone(), range));
        }

        let scheduler_of = topology.scheduler_of_workers(config.workers);

        tracing::info!(
            workers = config.workers,
            schedulers = config.schedulers,
            scheduler = ?config.scheduler,
            heap = config.heap.size,
            "policy domain constructed"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                log_filter: config.log_level.as_filter(),
                injector: Mutex::new(VecDeque::new()),
                parking_lot: ParkingLot::with_capacity(config.workers),
                config,
                guids,
                allocator,
                workpiles,
                schedulers: schedulers.into_boxed_slice(),
                scheduler_of,
                workers: workers.into_boxed_slice(),
                topology,
                guid,
                state: AtomicU8::new(DomainState::Constructed as u8),
                shutdown_code: AtomicI32::new(0),
            }),
            threads: Vec::new(),
        })
    }

    pub fn guid(&self) -> Guid {
        self.shared.guid
    }

    pub fn state(&self) -> DomainState {
        self.shared.state()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    /// The number of live handles, including the domain's own components.
    pub fn live_handles(&self) -> usize {
        self.shared.guids.len()
    }

    /// Returns a context for creating the main task and its inputs before the domain is started.
    ///
    /// The context acts on behalf of worker 0 and has no current task, so tasks given through it
    /// land on the workpile of the worker that runs on the thread calling [`PolicyDomain::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the domain was already started.
    pub fn master_context(&mut self) -> Result<RuntimeContext<'_>> {
        self.shared.expect_state(DomainState::Constructed)?;
        Ok(RuntimeContext::new(&self.shared, 0, Guid::NULL, Guid::NULL))
    }

    /// Starts all workers.
    ///
    /// Workers `1..N` get their own threads, worker 0 runs on the calling thread. This returns
    /// once a task requested shutdown and worker 0 observed it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the domain was started before and [`Error::Spawn`] if a
    /// worker thread could not be spawned, in which case the domain is shutting down.
    pub fn start(&mut self) -> Result<()> {
        self.shared
            .transition(DomainState::Constructed, DomainState::Started)?;
        tracing::debug!("starting policy domain");

        for id in 1..self.shared.workers.len() {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("edt-worker-{id}"))
                .spawn(move || {
                    let _guard = ShutdownOnPanic::new(&shared, id);
                    shared.workers[id].run(&shared);
                });

            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(err) => {
                    tracing::error!(worker = id, %err, "failed to spawn worker thread");
                    self.shared.shutdown(-1);
                    return Err(Error::Spawn(err));
                }
            }
        }

        let _guard = ShutdownOnPanic::new(&self.shared, 0);
        self.shared.workers[0].run(&self.shared);
        Ok(())
    }

    /// Requests shutdown with `code`. Only the first request takes effect.
    pub fn shutdown(&self, code: i32) {
        self.shared.shutdown(code);
    }

    /// Stops all workers, waits for their threads to exit and returns the shutdown code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the domain is started or stopping.
    ///
    /// # Panics
    ///
    /// Resumes the panic of a worker thread that panicked.
    pub fn stop(&mut self) -> Result<i32> {
        match self.state() {
            DomainState::Started => self.shared.shutdown(0),
            DomainState::Stopping => {}
            actual => {
                return Err(Error::InvalidState {
                    expected: DomainState::Stopping,
                    actual,
                });
            }
        }

        let panic = self.join();
        self.shared.set_state(DomainState::Stopped);
        tracing::debug!("policy domain stopped");

        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }

        Ok(self.shared.shutdown_code.load(Ordering::Acquire))
    }

    /// Joins every worker thread, returning the payload of the first one that panicked.
    fn join(&mut self) -> Option<Box<dyn Any + Send + 'static>> {
        let mut panic = None;
        for handle in self.threads.drain(..) {
            if let Err(payload) = handle.join() {
                panic.get_or_insert(payload);
            }
        }
        panic
    }
}

impl Drop for PolicyDomain {
    fn drop(&mut self) {
        self.shared.shutdown(0);
        if self.join().is_some() {
            tracing::warn!("a worker thread panicked");
        }

        let leaked = self.shared.guids.drain();
        tracing::debug!(handles = leaked.len(), "releasing remaining handles");
        self.shared.set_state(DomainState::Destroyed);
    }
}

impl fmt::Debug for PolicyDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDomain")
            .field("shared", &self.shared)
            .field("threads", &self.threads.len())
            .finish()
    }
}

// === impl Shared ===

impl Shared {
    pub(crate) fn state(&self) -> DomainState {
        DomainState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DomainState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn expect_state(&self, expected: DomainState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::InvalidState { expected, actual })
        }
    }

    fn transition(&self, from: DomainState, to: DomainState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|actual| Error::InvalidState {
                expected: from,
                actual: DomainState::from_u8(actual),
            })
    }

    /// Requests shutdown: stores `code`, clears every worker's running flag and wakes all parked
    /// workers. Later calls are ignored.
    pub(crate) fn shutdown(&self, code: i32) {
        let requested = self
            .transition(DomainState::Started, DomainState::Stopping)
            .or_else(|_| self.transition(DomainState::Constructed, DomainState::Stopping));

        if requested.is_err() {
            tracing::trace!(code, state = ?self.state(), "ignoring repeated shutdown request");
            return;
        }

        self.shutdown_code.store(code, Ordering::Release);
        for worker in &self.workers {
            worker.stop();
        }
        let unparked = self.parking_lot.unpark_all();
        tracing::info!(code, unparked, "shutdown requested");
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("guid", &self.guid)
            .field("state", &self.state())
            .field("guids", &self.guids)
            .field("allocator", &self.allocator)
            .field("workpiles", &self.workpiles)
            .field("injector", &self.injector.lock().len())
            .field("schedulers", &self.schedulers)
            .field("workers", &self.workers)
            .field("shutdown_code", &self.shutdown_code)
            .finish_non_exhaustive()
    }
}

/// Shuts the domain down if the worker thread it lives on unwinds, so the other workers don't
/// wait for work that will never arrive.
#[must_use]
struct ShutdownOnPanic<'a> {
    shared: &'a Shared,
    worker: usize,
}

impl<'a> ShutdownOnPanic<'a> {
    fn new(shared: &'a Shared, worker: usize) -> Self {
        Self { shared, worker }
    }
}

impl Drop for ShutdownOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let task = self.shared.workers[self.worker].current_task();
            tracing::error!(worker = self.worker, ?task, "worker panicked, shutting down");
            self.shared.shutdown(-1);
        }
    }
}
