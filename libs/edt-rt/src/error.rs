// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::guid::{Guid, Kind};
use crate::policy::DomainState;
use core::fmt;
use std::io;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The handle is unknown, stale, or was already released.
    InvalidHandle(Guid),
    /// The handle is live but refers to a different kind of object than the operation requires.
    KindMismatch {
        guid: Guid,
        expected: &'static str,
        found: Kind,
    },
    /// A sticky or once event, a fired latch, or a task slot was satisfied a second time.
    AlreadySatisfied(Guid),
    /// The workpile a ready task was handed to is at capacity.
    DequeFull { workpile: usize },
    /// The backing allocator or the handle table is exhausted.
    OutOfMemory,
    /// A task with an unknown dependence count was sealed while some of its slots were never
    /// bound.
    UnboundSlotCountMismatch { task: Guid, bound: u32, declared: u32 },
    /// The handle was already released.
    DoubleRelease(Guid),
    /// The slot index is out of range for the task or event.
    InvalidSlot { guid: Guid, slot: u32 },
    /// A dependence was already added for this task slot.
    SlotAlreadyBound { task: Guid, slot: u32 },
    /// The number of parameters or dependences does not match the task template.
    ArityMismatch {
        what: &'static str,
        expected: u32,
        found: u32,
    },
    /// The template declares an unknown dependence count and the task did not specify one.
    UnknownArity { template: Guid },
    /// The data block has a pending free and cannot be acquired anymore.
    DataBlockFreed(Guid),
    /// A lifecycle operation was attempted in the wrong policy domain state.
    InvalidState {
        expected: DomainState,
        actual: DomainState,
    },
    /// Spawning a worker thread failed.
    Spawn(io::Error),
    /// The runtime configuration was invalid.
    Config(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Config(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Spawn(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidHandle(guid) => write!(f, "invalid handle {guid:?}"),
            Error::KindMismatch {
                guid,
                expected,
                found,
            } => write!(f, "handle {guid:?} refers to a {found}, expected a {expected}"),
            Error::AlreadySatisfied(guid) => write!(f, "{guid:?} was already satisfied"),
            Error::DequeFull { workpile } => write!(f, "workpile {workpile} is at capacity"),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::UnboundSlotCountMismatch {
                task,
                bound,
                declared,
            } => write!(
                f,
                "task {task:?} has {declared} dependence slots but only {bound} are bound"
            ),
            Error::DoubleRelease(guid) => write!(f, "handle {guid:?} was released twice"),
            Error::InvalidSlot { guid, slot } => write!(f, "{guid:?} has no slot {slot}"),
            Error::SlotAlreadyBound { task, slot } => {
                write!(f, "slot {slot} of task {task:?} is already bound")
            }
            Error::ArityMismatch {
                what,
                expected,
                found,
            } => write!(f, "expected {expected} {what}, found {found}"),
            Error::UnknownArity { template } => write!(
                f,
                "template {template:?} has an unknown dependence count, the task must specify one"
            ),
            Error::DataBlockFreed(guid) => {
                write!(f, "data block {guid:?} is pending destruction")
            }
            Error::InvalidState { expected, actual } => {
                write!(f, "policy domain is {actual:?}, expected {expected:?}")
            }
            Error::Spawn(err) => write!(f, "failed to spawn worker thread: {err}"),
            Error::Config(err) => write!(f, "invalid runtime configuration: {err:#}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Spawn(err) => Some(err),
            Error::Config(err) => Some(&**err),
            _ => None,
        }
    }
}
