// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};
use ws_deque::{Deque, Full, TryStealError};

#[derive(Debug, Clone)]
enum Op {
    Push(u64),
    Pop,
    Steal,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u64>().prop_map(Op::Push),
        2 => Just(Op::Pop),
        1 => Just(Op::Steal),
    ]
}

proptest! {
    // Without concurrent thieves the owner end behaves like a stack and the thief end like a queue.
    #[test]
    fn matches_vecdeque(capacity in 1usize..16, ops in prop::collection::vec(op(), 0..256)) {
        let deque = Deque::<u64>::with_capacity(capacity);
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(item) => {
                    let res = deque.push(item);
                    if model.len() == capacity {
                        prop_assert_eq!(res, Err(Full(item)));
                    } else {
                        prop_assert_eq!(res, Ok(()));
                        model.push_back(item);
                    }
                }
                Op::Pop => prop_assert_eq!(deque.pop(), model.pop_back()),
                Op::Steal => {
                    let expected = model.pop_front().ok_or(TryStealError::Empty);
                    prop_assert_eq!(deque.steal(), expected);
                }
            }
            prop_assert_eq!(deque.len(), model.len());
        }
    }

    #[test]
    fn n_pushes_then_n_pops_reverse(items in prop::collection::vec(any::<u64>(), 0..128)) {
        let deque = Deque::<u64>::with_capacity(128);
        for &item in &items {
            deque.push(item).unwrap();
        }
        let popped: Vec<_> = std::iter::from_fn(|| deque.pop()).collect();
        let mut expected = items.clone();
        expected.reverse();
        prop_assert_eq!(popped, expected);
    }
}

/// Counts the events recorded while it is installed.
struct CountEvents(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for CountEvents {
    fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn rejected_push_is_traced() {
    let events = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::new("ws_deque=trace"))
        .with(CountEvents(events.clone()));

    tracing::subscriber::with_default(subscriber, || {
        let deque = Deque::<u64>::with_capacity(2);
        deque.push(1).unwrap();
        deque.push(2).unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 0);

        assert_eq!(deque.push(3), Err(Full(3)));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        // the rejected item didn't displace anything
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.steal(), Ok(1));
    });
}
