/*
 * Created on Tue Mar 28 2023
 *
 * This file is a part of Workpool
 * Workpool is a free and open-source process-backed task executor written
 * by Sayan Nandan ("the Author") with the vision to contain crash-prone,
 * CPU-bound and runaway workloads without compromising on throughput or
 * reliability.
 *
 * Copyright (c) 2023, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! End-to-end scenarios for the pool
//!
//! This driver manages its own `main` (the manifest sets `harness = false`)
//! because worker processes re-execute the test binary: the first thing it
//! does is hand the process over to the worker loop when the worker marker
//! is set in the environment.

#[macro_use]
extern crate log;

use {
    libworkpool::{worker, HandleStage, Job, PoolConfig, PoolError, WorkerPool},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        env, thread,
        time::Duration,
    },
};

#[derive(Debug, Serialize, Deserialize)]
enum StressJob {
    /// multiply and return
    Arith { a: i64, b: i64 },
    /// print to stdout, then return
    Shout { message: String, ret: i64 },
    /// panic with the given message
    Explode { message: String },
    /// sleep for the given time, then return
    Snooze { ms: u64, ret: i64 },
    /// return the given index
    Nth { index: i64 },
}

impl Job for StressJob {
    type Output = i64;
    fn run(self) -> i64 {
        match self {
            StressJob::Arith { a, b } => a * b,
            StressJob::Shout { message, ret } => {
                println!("{message}");
                ret
            }
            StressJob::Explode { message } => panic!("{}", message),
            StressJob::Snooze { ms, ret } => {
                thread::sleep(Duration::from_millis(ms));
                ret
            }
            StressJob::Nth { index } => index,
        }
    }
}

fn main() {
    worker::run_if_worker::<StressJob>();
    env_logger::Builder::new()
        .parse_filters(&env::var("WORKPOOL_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    run("clean value and empty logs", clean_value_and_empty_logs);
    run("stdout capture", stdout_capture);
    run("panic capture", panic_capture);
    run("timeout kills and respawns", timeout_kills_and_respawns);
    run("hundred tasks, no losses", hundred_tasks_no_losses);
    run("cancellation before start", cancellation_before_start);
    run("shutdown with a backlog", shutdown_with_backlog);
    run("shutdown is idempotent", shutdown_is_idempotent);
    run("bad worker count", bad_worker_count);
    info!("all scenarios passed");
}

fn run(name: &str, scenario: fn()) {
    info!("running scenario: {name}");
    scenario();
    info!("scenario passed: {name}");
}

fn clean_value_and_empty_logs() {
    let pool = WorkerPool::<StressJob>::new(Some(2)).unwrap();
    let handle = pool.submit(StressJob::Arith { a: 21, b: 2 }).unwrap();
    assert!(handle.wait(Some(Duration::from_secs(30))));
    assert_eq!(handle.value(), Some(42));
    assert_eq!(handle.logs(), "");
    pool.shutdown(true, Duration::from_secs(5));
}

fn stdout_capture() {
    let pool = WorkerPool::<StressJob>::new(Some(2)).unwrap();
    let handle = pool
        .submit(StressJob::Shout {
            message: "x marks the spot".to_owned(),
            ret: 1,
        })
        .unwrap();
    assert!(handle.wait(Some(Duration::from_secs(30))));
    assert_eq!(handle.value(), Some(1));
    assert!(handle.logs().contains("x marks the spot"));
    pool.shutdown(true, Duration::from_secs(5));
}

fn panic_capture() {
    let pool = WorkerPool::<StressJob>::new(Some(2)).unwrap();
    let handle = pool
        .submit(StressJob::Explode {
            message: "boom".to_owned(),
        })
        .unwrap();
    assert!(handle.wait(Some(Duration::from_secs(30))));
    assert_eq!(handle.stage(), HandleStage::Failed);
    match handle.error() {
        Some(PoolError::TaskPanicked(report)) => assert!(report.contains("boom")),
        other => panic!("unexpected error kind: {other:?}"),
    }
    // the report is also appended to the captured logs
    assert!(handle.logs().contains("boom"));
    pool.shutdown(true, Duration::from_secs(5));
}

fn timeout_kills_and_respawns() {
    let pool = WorkerPool::<StressJob>::with_config(PoolConfig {
        workers: Some(1),
        ..PoolConfig::default()
    })
    .unwrap();
    let slow = pool
        .schedule(
            StressJob::Snooze { ms: 10_000, ret: 0 },
            Some(Duration::from_millis(200)),
        )
        .unwrap();
    // the killer sweeps once a second, so allow it some slack
    assert!(slow.wait(Some(Duration::from_secs(5))));
    assert_eq!(slow.error(), Some(PoolError::TaskTimedOut));
    // capacity must be restored: a fresh task still runs to completion
    let next = pool.submit(StressJob::Nth { index: 7 }).unwrap();
    assert!(next.wait(Some(Duration::from_secs(30))));
    assert_eq!(next.value(), Some(7));
    pool.shutdown(true, Duration::from_secs(5));
}

fn hundred_tasks_no_losses() {
    let pool = WorkerPool::<StressJob>::new(Some(4)).unwrap();
    let handles: Vec<_> = (0..100)
        .map(|index| pool.submit(StressJob::Nth { index }).unwrap())
        .collect();
    let mut seen = HashSet::new();
    for handle in &handles {
        assert!(handle.wait(Some(Duration::from_secs(60))));
        let value = handle.value().expect("every task should succeed");
        assert!(seen.insert(value), "duplicate result {value}");
    }
    assert_eq!(seen, (0..100).collect::<HashSet<i64>>());
    pool.shutdown(true, Duration::from_secs(5));
}

fn cancellation_before_start() {
    let pool = WorkerPool::<StressJob>::new(Some(1)).unwrap();
    // one task on the worker, two in the running queue, one in the
    // feeder's hand blocked on the full queue: the fifth submission has
    // nowhere to go and stays pending
    let busy = pool.submit(StressJob::Snooze { ms: 3000, ret: 0 }).unwrap();
    let queued: Vec<_> = (0..3)
        .map(|_| pool.submit(StressJob::Snooze { ms: 10, ret: 0 }).unwrap())
        .collect();
    let parked = pool.submit(StressJob::Nth { index: 99 }).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(parked.cancel(), "the parked task should still be pending");
    assert!(parked.is_cancelled());
    for handle in queued.iter().chain([&busy]) {
        assert!(handle.wait(Some(Duration::from_secs(30))));
    }
    // the cancelled task was never executed
    assert!(parked.value().is_none());
    assert!(matches!(parked.error(), Some(PoolError::TaskCancelled(_))));
    pool.shutdown(true, Duration::from_secs(5));
}

fn shutdown_with_backlog() {
    let pool = WorkerPool::<StressJob>::new(Some(2)).unwrap();
    let handles: Vec<_> = (0..10)
        .map(|_| pool.submit(StressJob::Snooze { ms: 3000, ret: 1 }).unwrap())
        .collect();
    // let a couple of tasks actually start
    thread::sleep(Duration::from_millis(200));
    let exit_codes = pool.shutdown(true, Duration::from_secs(1));
    assert_eq!(exit_codes.len(), 2);
    for handle in &handles {
        assert!(
            handle.is_done(),
            "every handle must be terminal after shutdown"
        );
    }
}

fn shutdown_is_idempotent() {
    let pool = WorkerPool::<StressJob>::new(Some(2)).unwrap();
    let first = pool.shutdown(true, Duration::from_secs(5));
    assert_eq!(first.len(), 2);
    let second = pool.shutdown(true, Duration::from_secs(5));
    assert!(second.is_empty());
    // and the pool refuses new work
    match pool.submit(StressJob::Nth { index: 0 }) {
        Err(PoolError::Closed(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("a stopped pool accepted a submission"),
    }
}

fn bad_worker_count() {
    match WorkerPool::<StressJob>::new(Some(0)) {
        Err(PoolError::BadWorkerCount(count)) => assert_eq!(count, 0),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("a zero-worker pool should not construct"),
    }
}
