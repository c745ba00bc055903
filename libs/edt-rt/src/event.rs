// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Events.
//!
//! An event collects waiters (task slots or other events) and hands them a value once it is
//! satisfied. The four kinds differ only in how they treat repeated satisfaction:
//!
//! - [`EventKind::Sticky`] keeps its value forever, satisfying it twice is an error.
//! - [`EventKind::Once`] is destroyed right after it propagated its value.
//! - [`EventKind::Idempotent`] keeps the first value and silently ignores later ones.
//! - [`EventKind::Latch`] counts `Incr` and `Decr` satisfactions and fires once when the count
//!   reaches zero.
//!
//! This module only implements the per-event state machine. Delivering values to waiters and
//! destroying once events is done by the policy domain, which also owns the scheduler.

use crate::error::{Error, Result};
use crate::guid::Guid;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Once,
    Idempotent,
    Sticky,
    Latch,
}

/// The two satisfaction slots of a latch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LatchSlot {
    Decr = 0,
    Incr = 1,
}

/// A task slot or event slot waiting for an event to be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub(crate) guid: Guid,
    pub(crate) slot: u32,
}

pub(crate) struct Event {
    kind: EventKind,
    state: Mutex<State>,
    /// Present if this latch tracks a finish scope.
    finish: Option<FinishScope>,
}

enum State {
    Pending { waiters: Vec<Waiter>, count: i64 },
    Satisfied(Guid),
}

/// Book-keeping for the latch of a finish task.
#[derive(Debug)]
pub(crate) struct FinishScope {
    /// The output event of the finish task, satisfied when the scope completes.
    pub(crate) output: Guid,
    /// The enclosing finish scope's latch, decremented when this scope completes.
    pub(crate) parent: Guid,
    /// The return value of the finish task itself.
    result: AtomicU64,
}

/// What the caller of [`Event::satisfy`] has to do next.
#[must_use]
#[derive(Debug)]
pub(crate) enum SatisfyAction {
    /// The event fired, `value` must be delivered to all `waiters`.
    Fire { value: Guid, waiters: Vec<Waiter> },
    /// The event is an idempotent event that was already satisfied.
    Ignore,
    /// The latch count changed but did not reach zero.
    Count(i64),
}

// === impl LatchSlot ===

impl From<LatchSlot> for u32 {
    fn from(slot: LatchSlot) -> Self {
        slot as u32
    }
}

impl TryFrom<u32> for LatchSlot {
    type Error = u32;

    fn try_from(slot: u32) -> Result<Self, Self::Error> {
        match slot {
            0 => Ok(LatchSlot::Decr),
            1 => Ok(LatchSlot::Incr),
            _ => Err(slot),
        }
    }
}

// === impl Event ===

impl Event {
    pub(crate) fn new(kind: EventKind) -> Self {
        Self::with_count(kind, 0)
    }

    /// Creates a latch with an initial `count`.
    pub(crate) fn latch(count: i64) -> Self {
        Self::with_count(EventKind::Latch, count)
    }

    /// Creates the latch of a finish scope. The count starts at one, accounting for the finish
    /// task itself.
    pub(crate) fn finish_latch(output: Guid, parent: Guid) -> Self {
        Self {
            finish: Some(FinishScope {
                output,
                parent,
                result: AtomicU64::new(Guid::NULL.as_u64()),
            }),
            ..Self::with_count(EventKind::Latch, 1)
        }
    }

    fn with_count(kind: EventKind, count: i64) -> Self {
        Self {
            kind,
            state: Mutex::new(State::Pending {
                waiters: Vec::new(),
                count,
            }),
            finish: None,
        }
    }

    pub(crate) fn kind(&self) -> EventKind {
        self.kind
    }

    pub(crate) fn finish_scope(&self) -> Option<&FinishScope> {
        self.finish.as_ref()
    }

    /// Checks that `slot` is a valid satisfaction slot for this event.
    pub(crate) fn check_slot(&self, guid: Guid, slot: u32) -> Result<()> {
        let valid = match self.kind {
            EventKind::Latch => LatchSlot::try_from(slot).is_ok(),
            _ => slot == 0,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidSlot { guid, slot })
        }
    }

    /// Satisfies the event with `value` through `slot`.
    ///
    /// For latches `value` is ignored and `slot` selects whether the count is incremented or
    /// decremented. A latch fires with [`Guid::NULL`] the first time its count reaches zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySatisfied`] if a sticky or once event, or a latch that already
    /// fired, is satisfied again, and [`Error::InvalidSlot`] for a slot the event doesn't have.
    pub(crate) fn satisfy(&self, guid: Guid, value: Guid, slot: u32) -> Result<SatisfyAction> {
        self.check_slot(guid, slot)?;

        let mut state = self.state.lock();
        let State::Pending { waiters, count } = &mut *state else {
            return match self.kind {
                EventKind::Idempotent => Ok(SatisfyAction::Ignore),
                _ => Err(Error::AlreadySatisfied(guid)),
            };
        };

        let value = if self.kind == EventKind::Latch {
            match LatchSlot::try_from(slot) {
                Ok(LatchSlot::Incr) => *count += 1,
                _ => *count -= 1,
            }
            if *count != 0 {
                return Ok(SatisfyAction::Count(*count));
            }
            Guid::NULL
        } else {
            value
        };

        let waiters = core::mem::take(waiters);
        *state = State::Satisfied(value);
        Ok(SatisfyAction::Fire { value, waiters })
    }

    /// Registers `waiter` to be notified when the event fires.
    ///
    /// Returns the value right away if the event already fired, the caller is responsible for
    /// delivering it.
    pub(crate) fn register(&self, waiter: Waiter) -> Option<Guid> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Pending { waiters, .. } => {
                waiters.push(waiter);
                None
            }
            State::Satisfied(value) => Some(*value),
        }
    }

    /// Removes `waiter` from an event that did not fire yet. Returns `true` if it was
    /// registered.
    pub(crate) fn unregister(&self, waiter: Waiter) -> bool {
        let mut state = self.state.lock();
        let State::Pending { waiters, .. } = &mut *state else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|registered| *registered != waiter);
        waiters.len() != before
    }

    /// Returns the value the event was satisfied with, if any.
    pub(crate) fn get(&self) -> Option<Guid> {
        match &*self.state.lock() {
            State::Pending { .. } => None,
            State::Satisfied(value) => Some(*value),
        }
    }

    /// Returns the number of waiters that have not been notified yet.
    pub(crate) fn pending_waiters(&self) -> usize {
        match &*self.state.lock() {
            State::Pending { waiters, .. } => waiters.len(),
            State::Satisfied(_) => 0,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Event");
        s.field("kind", &self.kind);
        match &*self.state.lock() {
            State::Pending { waiters, count } => {
                s.field("waiters", &waiters.len());
                if self.kind == EventKind::Latch {
                    s.field("count", count);
                }
            }
            State::Satisfied(value) => {
                s.field("value", value);
            }
        }
        s.field("finish", &self.finish).finish()
    }
}

// === impl FinishScope ===

impl FinishScope {
    pub(crate) fn set_result(&self, value: Guid) {
        self.result.store(value.as_u64(), Ordering::Release);
    }

    pub(crate) fn result(&self) -> Guid {
        Guid::from_u64(self.result.load(Ordering::Acquire))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn guid(index: u32) -> Guid {
        Guid::from_parts(index, 1)
    }

    fn waiter(index: u32) -> Waiter {
        Waiter {
            guid: guid(index),
            slot: 0,
        }
    }

    #[test]
    fn sticky_rejects_second_satisfy() {
        let ev = Event::new(EventKind::Sticky);
        let me = guid(1);
        assert_eq!(ev.register(waiter(2)), None);

        match ev.satisfy(me, guid(10), 0).unwrap() {
            SatisfyAction::Fire { value, waiters } => {
                assert_eq!(value, guid(10));
                assert_eq!(waiters, vec![waiter(2)]);
            }
            action => panic!("unexpected {action:?}"),
        }

        assert!(matches!(
            ev.satisfy(me, guid(11), 0),
            Err(Error::AlreadySatisfied(g)) if g == me
        ));
        assert_eq!(ev.get(), Some(guid(10)));
        // late waiters observe the stored value immediately
        assert_eq!(ev.register(waiter(3)), Some(guid(10)));
    }

    #[test]
    fn unregistered_waiter_is_not_notified() {
        let ev = Event::new(EventKind::Sticky);
        assert_eq!(ev.register(waiter(2)), None);
        assert_eq!(ev.register(waiter(3)), None);

        assert!(ev.unregister(waiter(2)));
        assert!(!ev.unregister(waiter(2)));
        assert_eq!(ev.pending_waiters(), 1);

        match ev.satisfy(guid(1), guid(10), 0).unwrap() {
            SatisfyAction::Fire { waiters, .. } => assert_eq!(waiters, vec![waiter(3)]),
            action => panic!("unexpected {action:?}"),
        }
        assert!(!ev.unregister(waiter(3)));
    }

    #[test]
    fn idempotent_keeps_first_value() {
        let ev = Event::new(EventKind::Idempotent);
        let me = guid(1);
        assert!(matches!(
            ev.satisfy(me, guid(10), 0).unwrap(),
            SatisfyAction::Fire { .. }
        ));
        assert!(matches!(
            ev.satisfy(me, guid(11), 0).unwrap(),
            SatisfyAction::Ignore
        ));
        assert_eq!(ev.get(), Some(guid(10)));
    }

    #[test]
    fn once_rejects_second_satisfy() {
        let ev = Event::new(EventKind::Once);
        let me = guid(1);
        assert!(matches!(
            ev.satisfy(me, guid(10), 0).unwrap(),
            SatisfyAction::Fire { .. }
        ));
        assert!(matches!(
            ev.satisfy(me, guid(10), 0),
            Err(Error::AlreadySatisfied(_))
        ));
    }

    #[test]
    fn invalid_slots() {
        let me = guid(1);
        let sticky = Event::new(EventKind::Sticky);
        assert!(matches!(
            sticky.satisfy(me, Guid::NULL, 1),
            Err(Error::InvalidSlot { slot: 1, .. })
        ));
        let latch = Event::latch(0);
        assert!(matches!(
            latch.satisfy(me, Guid::NULL, 2),
            Err(Error::InvalidSlot { slot: 2, .. })
        ));
    }

    #[test]
    fn latch_fires_once_at_zero() {
        let ev = Event::latch(0);
        let me = guid(1);
        ev.register(waiter(5));

        for _ in 0..3 {
            assert!(matches!(
                ev.satisfy(me, Guid::NULL, LatchSlot::Incr.into()).unwrap(),
                SatisfyAction::Count(_)
            ));
        }
        for _ in 0..2 {
            assert!(matches!(
                ev.satisfy(me, Guid::NULL, LatchSlot::Decr.into()).unwrap(),
                SatisfyAction::Count(_)
            ));
        }
        assert_eq!(ev.get(), None);

        match ev.satisfy(me, Guid::NULL, LatchSlot::Decr.into()).unwrap() {
            SatisfyAction::Fire { value, waiters } => {
                assert_eq!(value, Guid::NULL);
                assert_eq!(waiters, vec![waiter(5)]);
            }
            action => panic!("unexpected {action:?}"),
        }

        assert_eq!(ev.get(), Some(Guid::NULL));
        assert!(matches!(
            ev.satisfy(me, Guid::NULL, LatchSlot::Incr.into()),
            Err(Error::AlreadySatisfied(_))
        ));
    }

    #[test]
    fn latch_may_go_negative() {
        let ev = Event::latch(0);
        let me = guid(1);
        assert!(matches!(
            ev.satisfy(me, Guid::NULL, LatchSlot::Decr.into()).unwrap(),
            SatisfyAction::Count(-1)
        ));
        assert!(matches!(
            ev.satisfy(me, Guid::NULL, LatchSlot::Incr.into()).unwrap(),
            SatisfyAction::Fire { .. }
        ));
    }

    #[test]
    fn finish_latch_starts_at_one() {
        let ev = Event::finish_latch(guid(7), Guid::NULL);
        let scope = ev.finish_scope().unwrap();
        assert_eq!(scope.output, guid(7));
        scope.set_result(guid(9));
        assert_eq!(scope.result(), guid(9));

        assert!(matches!(
            ev.satisfy(guid(1), Guid::NULL, LatchSlot::Decr.into()).unwrap(),
            SatisfyAction::Fire { .. }
        ));
    }
}
