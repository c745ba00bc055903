// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{self, AtomicUsize, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use std::thread::{self, Thread};

/// Idle workers park here until new work is given to the domain or it shuts down.
#[derive(Debug)]
pub(crate) struct ParkingLot {
    /// Number of parked workers
    num_parked: AtomicUsize,
    parked: Mutex<Vec<Thread>>,
}

impl ParkingLot {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            num_parked: AtomicUsize::new(0),
            parked: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::SeqCst)
    }

    /// Parks the calling thread for at most `timeout`.
    ///
    /// `should_wake` is checked after the thread registered itself, so work given between the
    /// caller's last check and the registration is not missed. An unpark that arrives between the
    /// check and the actual park makes the park return immediately.
    pub(crate) fn park(&self, timeout: Duration, should_wake: impl FnOnce() -> bool) {
        let me = thread::current();
        let id = me.id();

        self.parked.lock().push(me);
        self.num_parked.fetch_add(1, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);

        if !should_wake() {
            thread::park_timeout(timeout);
        }

        self.num_parked.fetch_sub(1, Ordering::SeqCst);
        // a timed out park leaves our token behind
        self.parked.lock().retain(|thread| thread.id() != id);
    }

    /// Unparks an arbitrary parked thread. Returns `true` if there was one.
    ///
    /// The caller must issue a `SeqCst` fence between publishing work and calling this.
    pub(crate) fn unpark_one(&self) -> bool {
        if self.num_parked() == 0 {
            return false;
        }

        if let Some(thread) = self.parked.lock().pop() {
            thread.unpark();
            true
        } else {
            false
        }
    }

    /// Unparks every parked thread, returning how many there were.
    pub(crate) fn unpark_all(&self) -> usize {
        let mut parked = self.parked.lock();
        let unparked = parked.len();
        for thread in parked.drain(..) {
            thread.unpark();
        }
        unparked
    }
}
