/*
 * Created on Tue Mar 21 2023
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

//! Controller-side management of worker processes: spawning, liveness
//! polling and the SIGTERM-then-SIGKILL termination ladder

use {
    crate::{
        error::{PoolError, PoolResult},
        os,
        worker::WORKER_ENV,
    },
    std::{
        env,
        process::{Child, ChildStdin, ChildStdout, Command, Stdio},
        thread,
        time::{Duration, Instant},
    },
};

/// A worker's exit code; `None` when it was ended by a signal
pub type ExitCode = Option<i32>;

/// Liveness polling granularity
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A live worker process, as the controller's process table sees it
pub(crate) struct WorkerProc {
    child: Child,
}

impl WorkerProc {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
    /// SIGTERM; the caller escalates stragglers to SIGKILL
    pub fn terminate(&mut self) {
        if let Err(e) = os::send_sigterm(self.pid()) {
            debug!("could not SIGTERM worker {}: {e}", self.pid());
        }
    }
    /// SIGKILL
    pub fn kill(&mut self) {
        let _ = self.child.kill();
    }
    pub fn exit_code(&mut self) -> ExitCode {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }
}

/// Spawn one worker: a re-execution of the current binary with the worker
/// marker set, protocol pipes on its stdin/stdout, stderr shared with the
/// controller
pub(crate) fn spawn_worker_proc() -> PoolResult<(WorkerProc, ChildStdin, ChildStdout)> {
    let exe = env::current_exe()
        .map_err(|e| PoolError::Os(format!("cannot locate the current executable: {e}")))?;
    let mut child = Command::new(exe)
        .env(WORKER_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| PoolError::Os(format!("failed to spawn a worker: {e}")))?;
    let stdin = match child.stdin.take() {
        Some(stdin) => stdin,
        None => return Err(PoolError::Os("worker spawned without a stdin pipe".to_owned())),
    };
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => return Err(PoolError::Os("worker spawned without a stdout pipe".to_owned())),
    };
    Ok((WorkerProc { child }, stdin, stdout))
}

/// Poll until every process in the batch has exited or `timeout` elapses
pub(crate) fn wait_procs_stop(procs: &mut [WorkerProc], timeout: Duration) {
    let end = Instant::now() + timeout;
    while procs.iter_mut().any(|p| p.is_alive()) && Instant::now() < end {
        thread::sleep(POLL_INTERVAL);
    }
}

/// Put a batch of workers down: SIGTERM first, then SIGKILL for whatever is
/// still standing. Returns the exit codes in batch order
pub(crate) fn stop_procs(
    mut procs: Vec<WorkerProc>,
    term_grace: Duration,
    kill_grace: Duration,
) -> Vec<ExitCode> {
    for proc_ in procs.iter_mut() {
        if proc_.is_alive() {
            proc_.terminate();
        }
    }
    wait_procs_stop(&mut procs, term_grace);
    for proc_ in procs.iter_mut() {
        if proc_.is_alive() {
            proc_.kill();
        }
    }
    wait_procs_stop(&mut procs, kill_grace);
    procs.iter_mut().map(|p| p.exit_code()).collect()
}
