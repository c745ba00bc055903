// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use edt_config::RuntimeConfig;
use edt_rt::{Arity, Guid, PolicyDomain, TaskProperties};

/// Computes `fib(n)` by spawning one task per call inside a single finish scope.
fn fib(workers: usize, n: u64) -> u64 {
    let mut domain = PolicyDomain::new(RuntimeConfig::with_workers(workers)).unwrap();
    let sum = Arc::new(AtomicU64::new(0));

    let ctx = domain.master_context().unwrap();
    let step = ctx
        .create_template(Arity::Known(2), Arity::Known(0), {
            let sum = sum.clone();
            move |ctx, params, _| {
                let (n, this) = (params[0], params[1]);
                if n < 2 {
                    sum.fetch_add(n, Ordering::Relaxed);
                } else {
                    ctx.create_task(Guid::from_u64(this))
                        .params(&[n - 1, this])
                        .spawn()?;
                    ctx.create_task(Guid::from_u64(this))
                        .params(&[n - 2, this])
                        .spawn()?;
                }
                Ok(Guid::NULL)
            }
        })
        .unwrap();
    let done = ctx
        .create_template(Arity::Known(0), Arity::Known(1), |ctx, _, _| {
            ctx.shutdown(0);
            Ok(Guid::NULL)
        })
        .unwrap();

    let root = ctx
        .create_task(step)
        .params(&[n, step.as_u64()])
        .properties(TaskProperties::FINISH | TaskProperties::OUTPUT_EVENT)
        .spawn()
        .unwrap();
    ctx.create_task(done)
        .deps(&[root.output().unwrap()])
        .spawn()
        .unwrap();

    domain.start().unwrap();
    domain.stop().unwrap();
    sum.load(Ordering::Relaxed)
}

fn fork_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib");
    for workers in [1, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| assert_eq!(fib(workers, black_box(15)), 610));
        });
    }
    group.finish();
}

criterion_group!(benches, fork_join);
criterion_main!(benches);
