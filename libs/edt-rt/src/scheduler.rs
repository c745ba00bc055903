// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Schedulers decide which workpile a ready task is pushed to and where an idle worker looks for
//! work.
//!
//! Every worker owns exactly one workpile. A scheduler serves a contiguous range of workers, the
//! policy domain creates one scheduler per range.

mod placed;
mod work_stealing;

use crate::error::Result;
use crate::guid::Guid;
use crate::workpile::Workpile;
use core::fmt;
use core::ops::Range;
use edt_config::SchedulerKind;
use std::sync::Arc;

pub use placed::Placed;
pub use work_stealing::WorkStealing;

pub trait Scheduler: Send + Sync + fmt::Debug {
    /// The workers this scheduler serves.
    fn workers(&self) -> Range<usize>;

    /// Returns a task for `worker` to execute.
    ///
    /// Pops from the worker's own workpile first and falls back to stealing.
    fn take(&self, worker: usize) -> Option<Guid>;

    /// Hands a ready task to the scheduler on behalf of `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DequeFull`](crate::Error::DequeFull) if the target workpile is at
    /// capacity.
    fn give(&self, worker: usize, task: Guid) -> Result<()>;

    /// Steals a task from one of this scheduler's workpiles for a worker served by another
    /// scheduler.
    fn steal_for(&self, worker: usize) -> Option<Guid>;
}

/// Creates a scheduler of the given kind serving `workers`.
pub fn build(
    kind: SchedulerKind,
    workpiles: Arc<[Workpile]>,
    workers: Range<usize>,
) -> Box<dyn Scheduler> {
    debug_assert!(workers.end <= workpiles.len());
    match kind {
        SchedulerKind::WorkStealing => Box::new(WorkStealing::new(workpiles, workers)),
        SchedulerKind::Placed => Box::new(Placed::new(workpiles, workers)),
    }
}

/// Tries to steal from every workpile in `victims` once, starting just after `thief` and
/// wrapping around. The thief's own workpile is skipped.
fn steal_round(workpiles: &[Workpile], victims: Range<usize>, thief: usize) -> Option<Guid> {
    let len = victims.len();
    let start = if victims.contains(&thief) {
        thief - victims.start + 1
    } else {
        0
    };

    for i in 0..len {
        let victim = victims.start + (start + i) % len;

        // Don't steal from ourselves! We know we don't have work.
        if victim == thief {
            continue;
        }

        if let Some(task) = workpiles[victim].steal() {
            tracing::trace!(thief, victim, ?task, "stole task");
            return Some(task);
        }
    }

    None
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn workpiles(n: usize) -> Arc<[Workpile]> {
        (0..n).map(|id| Workpile::new(id, 16)).collect()
    }

    fn task(i: u32) -> Guid {
        Guid::from_parts(i, 1)
    }

    #[test]
    fn steal_round_starts_after_thief() {
        let piles = workpiles(4);
        piles[0].push(task(0)).unwrap();
        piles[3].push(task(3)).unwrap();

        // worker 1 visits 2, 3, 0
        assert_eq!(steal_round(&piles, 0..4, 1), Some(task(3)));
        assert_eq!(steal_round(&piles, 0..4, 1), Some(task(0)));
        assert_eq!(steal_round(&piles, 0..4, 1), None);
    }

    #[test]
    fn steal_round_skips_thief() {
        let piles = workpiles(2);
        piles[0].push(task(0)).unwrap();
        assert_eq!(steal_round(&piles, 0..2, 0), None);
        assert_eq!(steal_round(&piles, 0..2, 1), Some(task(0)));
    }

    #[test]
    fn steal_round_outside_range() {
        let piles = workpiles(4);
        piles[2].push(task(2)).unwrap();
        assert_eq!(steal_round(&piles, 2..4, 0), Some(task(2)));
        assert_eq!(steal_round(&piles, 0..2, 3), None);
    }

    #[test]
    fn build_picks_variant() {
        let piles = workpiles(2);
        let ws = build(SchedulerKind::WorkStealing, piles.clone(), 0..2);
        let placed = build(SchedulerKind::Placed, piles, 0..2);
        assert!(format!("{ws:?}").starts_with("WorkStealing"));
        assert!(format!("{placed:?}").starts_with("Placed"));
        assert_eq!(ws.workers(), 0..2);
    }
}
