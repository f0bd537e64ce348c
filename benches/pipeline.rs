// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use cotask::sync::Event;
use cotask::{SharedTask, Task, sync_wait, when_all_ready, when_all_ready_vec};
use criterion::{Criterion, criterion_group, criterion_main};

fn task_chain_10k_single_threaded(c: &mut Criterion) {
    const LINKS: usize = 10_000;

    c.bench_function("task_chain_10k_single_threaded", |b| {
        b.iter(|| {
            let chain = Task::new(async move {
                let mut value = 0usize;
                for _ in 0..LINKS {
                    value = Task::new(async move { value + 1 }).await.unwrap();
                }
                value
            });
            sync_wait(chain).unwrap()
        });
    });
}

fn shared_fanout_100_single_threaded(c: &mut Criterion) {
    const CLONES: usize = 100;

    c.bench_function("shared_fanout_100_single_threaded", |b| {
        b.iter(|| {
            let shared = SharedTask::new(async { 1u32 });
            let clones: Vec<_> = (0..CLONES).map(|_| shared.clone()).collect();
            sync_wait(when_all_ready_vec(clones))
        });
    });
}

fn event_ping_pong_1k_single_threaded(c: &mut Criterion) {
    const PINGS: usize = 1_000;

    c.bench_function("event_ping_pong_1k_single_threaded", |b| {
        b.iter(|| {
            let ping = Arc::new(Event::new());
            let pong = Arc::new(Event::new());

            let pinger = Task::new({
                let ping = ping.clone();
                let pong = pong.clone();
                async move {
                    for _ in 0..PINGS {
                        pong.set();
                        ping.wait().await;
                        ping.reset();
                    }
                }
            });

            let ponger = Task::new({
                let ping = ping.clone();
                let pong = pong.clone();
                async move {
                    for _ in 0..PINGS {
                        pong.wait().await;
                        pong.reset();
                        ping.set();
                    }
                }
            });

            let (a, b) = sync_wait(when_all_ready((pinger, ponger)));
            a.unwrap();
            b.unwrap();
        });
    });
}

criterion_group!(
    pipeline,
    task_chain_10k_single_threaded,
    shared_fanout_100_single_threaded,
    event_ping_pong_1k_single_threaded,
);
criterion_main!(pipeline);
