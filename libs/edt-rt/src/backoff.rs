// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An [exponential backoff] for idle workers.
///
/// Each call to [`Backoff::spin`] issues `2^exp` spin loop hints, up to `2^MAX_EXPONENT`. After
/// the configured number of rounds [`Backoff::is_completed`] reports that the worker should stop
/// spinning and park instead.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    rounds: u32,
    max_rounds: u32,
}

impl Backoff {
    const MAX_EXPONENT: u8 = 8;

    pub(crate) const fn new(max_rounds: u32) -> Self {
        Self {
            exp: 0,
            rounds: 0,
            max_rounds,
        }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        let spins = 1_u32 << self.exp;
        for _ in 0..spins {
            hint::spin_loop();
        }

        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
        self.rounds = self.rounds.saturating_add(1);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.rounds >= self.max_rounds
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.exp = 0;
        self.rounds = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn completes_after_rounds() {
        let mut backoff = Backoff::new(3);
        for _ in 0..3 {
            assert!(!backoff.is_completed());
            backoff.spin();
        }
        assert!(backoff.is_completed());

        backoff.reset();
        assert!(!backoff.is_completed());
        assert!(Backoff::new(0).is_completed());
    }
}
