// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

use edt_config::RuntimeConfig;
use edt_rt::{Error, EventKind, Guid, Kind, PolicyDomain};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    Event(EventKind),
    DataBlock(usize),
    /// Destroys the live handle at this position, modulo the number of live handles.
    Destroy(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop_oneof![
            Just(EventKind::Once),
            Just(EventKind::Idempotent),
            Just(EventKind::Sticky),
            Just(EventKind::Latch),
        ]
        .prop_map(Op::Event),
        (1usize..256).prop_map(Op::DataBlock),
        any::<usize>().prop_map(Op::Destroy),
    ]
}

proptest! {
    #[test]
    fn handles_resolve_until_destroyed(ops in prop::collection::vec(op(), 1..128)) {
        let mut config = RuntimeConfig::with_workers(1);
        config.guid_capacity = 64;
        let mut domain = PolicyDomain::new(config).unwrap();
        let ctx = domain.master_context().unwrap();

        let mut live: Vec<(Guid, Kind)> = Vec::new();
        let mut dead: Vec<Guid> = Vec::new();
        let mut issued = HashSet::new();

        for op in ops {
            let created = match op {
                Op::Event(kind) => ctx.create_event(kind).map(|guid| (guid, Kind::Event(kind))),
                Op::DataBlock(len) => ctx.create_datablock(len).map(|guid| (guid, Kind::DataBlock)),
                Op::Destroy(at) => {
                    if !live.is_empty() {
                        let (guid, kind) = live.swap_remove(at % live.len());
                        match kind {
                            Kind::DataBlock => ctx.destroy_datablock(guid).unwrap(),
                            _ => ctx.destroy_event(guid).unwrap(),
                        }
                        dead.push(guid);
                    }
                    continue;
                }
            };

            match created {
                Ok((guid, kind)) => {
                    prop_assert!(!guid.is_null());
                    // a handle is never issued twice, even when its slot is reused
                    prop_assert!(issued.insert(guid));
                    live.push((guid, kind));
                }
                Err(Error::OutOfMemory) => {}
                Err(err) => prop_assert!(false, "unexpected error {err}"),
            }

            for &(guid, kind) in &live {
                prop_assert_eq!(ctx.kind_of(guid).unwrap(), kind);
            }
            for &guid in &dead {
                prop_assert!(matches!(ctx.kind_of(guid), Err(Error::InvalidHandle(_))));
            }
        }

        prop_assert_eq!(ctx.kind_of(Guid::NULL).unwrap(), Kind::None);
    }

    #[test]
    fn raw_round_trip(bits in any::<u64>()) {
        prop_assert_eq!(Guid::from_u64(bits).as_u64(), bits);
        prop_assert_eq!(Guid::from_u64(bits).is_null(), bits == 0);
    }
}
