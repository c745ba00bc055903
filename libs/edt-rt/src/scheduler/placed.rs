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

/// Keeps work within a range of workers.
///
/// Workers only steal from workpiles in their own range through [`Scheduler::take`], work moves
/// between ranges only when the policy domain explicitly asks through [`Scheduler::steal_for`]
/// after a worker's own range ran dry.
pub struct Placed {
    workpiles: Arc<[Workpile]>,
    workers: Range<usize>,
}

impl Placed {
    pub fn new(workpiles: Arc<[Workpile]>, workers: Range<usize>) -> Self {
        Self { workpiles, workers }
    }
}

impl Scheduler for Placed {
    fn workers(&self) -> Range<usize> {
        self.workers.clone()
    }

    fn take(&self, worker: usize) -> Option<Guid> {
        debug_assert!(self.workers.contains(&worker));
        if let Some(task) = self.workpiles[worker].pop() {
            return Some(task);
        }
        steal_round(&self.workpiles, self.workers.clone(), worker)
    }

    fn give(&self, worker: usize, task: Guid) -> Result<()> {
        debug_assert!(self.workers.contains(&worker));
        self.workpiles[worker].push(task)?;
        tracing::trace!(worker, ?task, "task placed");
        Ok(())
    }

    fn steal_for(&self, worker: usize) -> Option<Guid> {
        steal_round(&self.workpiles, self.workers.clone(), worker)
    }
}

impl fmt::Debug for Placed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placed")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn take_stays_in_range() {
        let piles: Arc<[Workpile]> = (0..4).map(|id| Workpile::new(id, 8)).collect();
        let low = Placed::new(piles.clone(), 0..2);
        let high = Placed::new(piles.clone(), 2..4);

        high.give(3, Guid::from_parts(7, 1)).unwrap();
        assert_eq!(low.take(0), None);
        assert_eq!(low.take(1), None);

        // only an explicit cross-range request moves work out of the range
        assert_eq!(high.steal_for(0), Some(Guid::from_parts(7, 1)));
        assert_eq!(high.take(2), None);
    }
}
