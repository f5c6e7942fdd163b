/*
 * Created on Tue Mar 14 2023
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

//! # Workpool
//!
//! Workpool is a worker-pool task executor: a concurrency substrate that
//! ships user-supplied computations to a bounded pool of isolated worker
//! processes, enforces per-task deadlines by killing and replacing the
//! offenders, captures everything a task writes while it runs, and reports
//! outcomes through completion handles.
//!
//! Workers are re-executions of the current binary with a fresh address
//! space, so a binary embedding a pool must hand the process over to
//! [`worker::run_if_worker`] at the very top of `main`. See [`WorkerPool`]
//! for a full example.

#![deny(unused_crate_dependencies)]
#![deny(unused_imports)]

#[macro_use]
extern crate log;

pub mod error;
mod handle;
mod ipc;
mod os;
mod pool;
mod proc;
pub mod task;
#[cfg(test)]
mod test_utils;
pub mod worker;

pub use {
    error::{PoolError, PoolResult},
    handle::{HandleStage, TaskHandle},
    pool::{PoolConfig, PoolState, WorkerPool},
    proc::ExitCode,
    task::Job,
};
