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

use {crate::pool::PoolState, std::fmt};

/// A generic result for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Everything that can go wrong while constructing a pool, submitting work
/// or running a task. Task-level failures are delivered on the completion
/// handle, never raised at the submitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The configured worker count is unusable
    BadWorkerCount(usize),
    /// The pool no longer accepts submissions
    Closed(PoolState),
    /// The job panicked inside its worker; carries the rendered report
    TaskPanicked(String),
    /// The task overran its deadline and its worker was put down
    TaskTimedOut,
    /// The task was cancelled before any worker picked it up
    TaskCancelled(String),
    /// An operating system level failure (spawn, pipes, descriptors)
    Os(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::BadWorkerCount(count) => {
                write!(f, "worker count should be strictly positive, got `{count}`")
            }
            PoolError::Closed(state) => write!(f, "cannot submit when the pool is {state}"),
            PoolError::TaskPanicked(report) => write!(f, "task failed: {report}"),
            PoolError::TaskTimedOut => write!(f, "task took too long"),
            PoolError::TaskCancelled(reason) => write!(f, "task cancelled: {reason}"),
            PoolError::Os(e) => write!(f, "os error: {e}"),
        }
    }
}

impl std::error::Error for PoolError {}
