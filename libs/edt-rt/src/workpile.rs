// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, Result};
use crate::guid::Guid;
use core::fmt;
use ws_deque::{Deque, TryStealError};

/// A queue of ready tasks owned by exactly one worker.
///
/// Only the owning worker may [`push`](Workpile::push) and [`pop`](Workpile::pop), any other
/// worker may [`steal`](Workpile::steal).
pub struct Workpile {
    id: usize,
    guid: Guid,
    deque: Deque<Guid>,
}

impl Workpile {
    pub(crate) fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            guid: Guid::NULL,
            deque: Deque::with_capacity(capacity),
        }
    }

    pub(crate) fn set_guid(&mut self, guid: Guid) {
        self.guid = guid;
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn len(&self) -> usize {
        self.deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    /// # Errors
    ///
    /// Returns [`Error::DequeFull`] if the workpile is at capacity. The deque never grows.
    pub(crate) fn push(&self, task: Guid) -> Result<()> {
        self.deque
            .push(task)
            .map_err(|_| Error::DequeFull { workpile: self.id })
    }

    pub(crate) fn pop(&self) -> Option<Guid> {
        self.deque.pop()
    }

    /// Steals the oldest task, retrying while other thieves are racing for the same item.
    pub(crate) fn steal(&self) -> Option<Guid> {
        loop {
            match self.deque.steal() {
                Ok(task) => return Some(task),
                Err(TryStealError::Contended) => core::hint::spin_loop(),
                Err(_) => return None,
            }
        }
    }
}

impl fmt::Debug for Workpile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workpile")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .field("len", &self.len())
            .finish()
    }
}
