/*
 * Created on Wed Mar 15 2023
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

use {
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::time::Instant,
    uuid::Uuid,
};

/// An opaque identifier minted at submission; unique across the pool's
/// lifetime
pub type TaskId = String;

pub(crate) fn generate_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

/// A unit of work that can be shipped to a worker process
///
/// The payload carries the *arguments* of the computation; the code is the
/// `run` implementation compiled into the host binary, which every worker
/// shares because workers re-execute that binary. A job reports failure by
/// panicking: the worker turns the panic into a textual report delivered on
/// the completion handle.
pub trait Job: Serialize + DeserializeOwned + Send + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;
    fn run(self) -> Self::Output;
}

/// A submitted task
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Task<J> {
    pub id: TaskId,
    pub job: J,
}

/// What a worker hands back for one task. Exactly one of `value` and
/// `error` is populated; `logs` holds everything the job wrote to stdout,
/// stderr and the log stream while it ran
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TaskOutcome<R> {
    pub id: TaskId,
    pub value: Option<R>,
    pub error: Option<String>,
    pub logs: String,
}

/// A deadline watched by the killer
pub(crate) struct TimeoutEntry {
    pub id: TaskId,
    pub deadline: Instant,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    #[test]
    fn task_ids_do_not_collide() {
        let ids: HashSet<_> = (0..1024).map(|_| super::generate_task_id()).collect();
        assert_eq!(ids.len(), 1024);
    }
}
