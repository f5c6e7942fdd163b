/*
 * Created on Wed Apr 05 2023
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

//! Correctness-under-load driver for `libworkpool`
//!
//! Hammers a full-width pool with a checksum sweep (no result may be lost
//! or duplicated) and a deadline storm (kills must never cost capacity),
//! then shuts down cleanly.

#![deny(unused_crate_dependencies)]
#![deny(unused_imports)]

#[macro_use]
extern crate log;

use {
    libworkpool::{worker, Job, PoolError, WorkerPool},
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::{env, process, thread, time::Duration},
};

const SWEEP_TASKS: usize = 512;
const STORM_WAVES: usize = 3;
const PAYLOAD_LEN: usize = 64;

macro_rules! logstress {
    ($stage:expr, $extra:expr) => {
        log::info!("Stress ({}): {}", $stage, $extra);
    };
}

#[derive(Debug, Serialize, Deserialize)]
enum StressJob {
    /// checksum a payload by summing its bytes
    Checksum { payload: String },
    /// hold a worker for the given time
    Spin { ms: u64 },
}

impl Job for StressJob {
    type Output = u64;
    fn run(self) -> u64 {
        match self {
            StressJob::Checksum { payload } => payload.bytes().map(u64::from).sum(),
            StressJob::Spin { ms } => {
                thread::sleep(Duration::from_millis(ms));
                ms
            }
        }
    }
}

fn main() {
    worker::run_if_worker::<StressJob>();
    env_logger::Builder::new()
        .parse_filters(&env::var("WORKPOOL_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let workers = num_cpus::get();
    info!("spawning a pool with {workers} workers");
    let pool = match WorkerPool::<StressJob>::new(Some(workers)) {
        Ok(pool) => pool,
        Err(e) => {
            error!("failed to start the pool: {e}");
            process::exit(0x01);
        }
    };
    sweep(&pool);
    storm(&pool, workers);
    let exit_codes = pool.shutdown(true, Duration::from_secs(5));
    info!("pool stopped; worker exit codes: {exit_codes:?}");
    info!("SUCCESS. Stress run complete!");
}

/// Submit a pile of checksum tasks and verify every single result
fn sweep(pool: &WorkerPool<StressJob>) {
    logstress!("A [SWEEP]", "concurrent checksum tasks, no losses tolerated");
    let mut rng = rand::thread_rng();
    let jobs: Vec<(String, u64)> = (0..SWEEP_TASKS)
        .map(|_| {
            let payload: String = (0..PAYLOAD_LEN).map(|_| rng.gen_range('a'..='z')).collect();
            let expected = payload.bytes().map(u64::from).sum();
            (payload, expected)
        })
        .collect();
    let handles: Vec<_> = jobs
        .iter()
        .map(|(payload, _)| {
            pool.submit(StressJob::Checksum {
                payload: payload.clone(),
            })
            .expect("the pool refused work mid-sweep")
        })
        .collect();
    for (handle, (_, expected)) in handles.iter().zip(&jobs) {
        assert!(
            handle.wait(Some(Duration::from_secs(120))),
            "a sweep task did not settle"
        );
        assert_eq!(handle.value(), Some(*expected));
    }
    info!("sweep done: {SWEEP_TASKS} tasks submitted, {SWEEP_TASKS} results verified");
}

/// Overrun deadlines across the full pool width, wave after wave, and
/// prove the pool keeps its capacity. Each wave is at most one task per
/// worker so every doomed task is actually running when its deadline hits
fn storm(pool: &WorkerPool<StressJob>, workers: usize) {
    logstress!("B [STORM]", "deadline overruns must not sink the pool");
    for wave in 0..STORM_WAVES {
        let doomed: Vec<_> = (0..workers)
            .map(|_| {
                pool.schedule(
                    StressJob::Spin { ms: 60_000 },
                    Some(Duration::from_millis(250)),
                )
                .expect("the pool refused work mid-storm")
            })
            .collect();
        for handle in &doomed {
            assert!(
                handle.wait(Some(Duration::from_secs(60))),
                "the killer missed a deadline"
            );
            assert_eq!(handle.error(), Some(PoolError::TaskTimedOut));
        }
        info!("storm wave {wave} done: {workers} workers killed and replaced");
    }
    // after the massacre, the pool must still do real work
    let survivor = pool
        .submit(StressJob::Checksum {
            payload: "still alive".to_owned(),
        })
        .expect("the pool refused work after the storm");
    assert!(survivor.wait(Some(Duration::from_secs(60))));
    assert!(survivor.value().is_some());
    info!("storm done: capacity survived {STORM_WAVES} waves of kills");
}
