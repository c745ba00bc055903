// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Scheduler, steal_round};
use crate::error::Result;
use crate::guid::Guid;
use crate::workpile::Workpile;
use core::fmt;
use core::ops::Range;
use std::sync::Arc;

/// Pops from the worker's own workpile and steals from every other workpile of the domain when
/// that is empty.
pub struct WorkStealing {
    workpiles: Arc<[Workpile]>,
    workers: Range<usize>,
}

impl WorkStealing {
    pub fn new(workpiles: Arc<[Workpile]>, workers: Range<usize>) -> Self {
        Self { workpiles, workers }
    }
}

impl Scheduler for WorkStealing {
    fn workers(&self) -> Range<usize> {
        self.workers.clone()
    }

    fn take(&self, worker: usize) -> Option<Guid> {
        if let Some(task) = self.workpiles[worker].pop() {
            return Some(task);
        }
        steal_round(&self.workpiles, 0..self.workpiles.len(), worker)
    }

    fn give(&self, worker: usize, task: Guid) -> Result<()> {
        debug_assert!(self.workers.contains(&worker));
        self.workpiles[worker].push(task)?;
        tracing::trace!(worker, ?task, "task given");
        Ok(())
    }

    fn steal_for(&self, worker: usize) -> Option<Guid> {
        steal_round(&self.workpiles, 0..self.workpiles.len(), worker)
    }
}

impl fmt::Debug for WorkStealing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealing")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn own_work_first_then_steal() {
        let piles: Arc<[Workpile]> = (0..3).map(|id| Workpile::new(id, 8)).collect();
        let sched = WorkStealing::new(piles.clone(), 0..3);

        sched.give(0, Guid::from_parts(1, 1)).unwrap();
        sched.give(0, Guid::from_parts(2, 1)).unwrap();
        piles[2].push(Guid::from_parts(3, 1)).unwrap();

        // LIFO for the owner
        assert_eq!(sched.take(0), Some(Guid::from_parts(2, 1)));
        // worker 1 steals from worker 2 before wrapping around to 0
        assert_eq!(sched.take(1), Some(Guid::from_parts(3, 1)));
        assert_eq!(sched.take(1), Some(Guid::from_parts(1, 1)));
        assert_eq!(sched.take(0), None);
    }
}
