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

//! The worker process body
//!
//! A worker is a re-execution of the current binary with [`WORKER_ENV`] set
//! in its environment. It pulls one order at a time off its pipe and runs it
//! to completion. For the duration of every task, descriptors 1 and 2 are
//! repointed at a capture file so nothing a job prints can bleed into the
//! protocol stream or into another task's logs; the worker keeps private
//! duplicates of the protocol pipes from before the first redirection.

use {
    crate::{
        ipc::{self, WorkOrder, WorkerEvent},
        os,
        task::{Job, Task, TaskOutcome},
    },
    parking_lot::Mutex,
    std::{
        any::Any,
        backtrace::Backtrace,
        env,
        fs::{self, File, OpenOptions},
        io::{self, Write},
        os::unix::io::{AsRawFd, FromRawFd},
        panic::{self, AssertUnwindSafe},
        path::PathBuf,
        process,
        sync::atomic::{AtomicU64, Ordering},
    },
};

/// Set in a worker's environment by the controller that spawned it
pub const WORKER_ENV: &str = "WORKPOOL_WORKER";
/// Filter variable for the worker-side logger
pub const WORKER_LOG_ENV: &str = "WORKPOOL_LOG";

/// The report left behind by the panic hook for the task that just failed
static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);
/// Capture files get distinct names even if two land in the same tempdir
static CAPTURE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hand the process over to the worker loop if it was spawned as a worker
///
/// Call this at the very top of `main`, before argument parsing, logger
/// setup or anything else. In the controller role it returns immediately;
/// in the worker role it never returns. Every binary that constructs a
/// [`WorkerPool`](crate::WorkerPool) for `J` must call this, because
/// workers are re-executions of that binary.
pub fn run_if_worker<J: Job>() {
    if env::var_os(WORKER_ENV).is_none() {
        return;
    }
    match worker_loop::<J>() {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("worker {}: protocol failure: {e}", process::id());
            process::exit(0x01);
        }
    }
}

fn worker_loop<J: Job>() -> io::Result<()> {
    // private duplicates of the protocol pipes; fds 1/2 stay free for
    // per-task redirection
    let mut orders = unsafe { File::from_raw_fd(os::duplicate_fd(0)?) };
    let mut events = unsafe { File::from_raw_fd(os::duplicate_fd(1)?) };
    // the root logger writes to fd 2, which the capture repoints, so log
    // records emitted by a job are recorded with its output
    let _ = env_logger::Builder::new()
        .parse_filters(&env::var(WORKER_LOG_ENV).unwrap_or_else(|_| "info".to_owned()))
        .try_init();
    panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        *LAST_PANIC.lock() = Some(format!("{info}\nstack backtrace:\n{backtrace}"));
    }));
    let pid = process::id();
    loop {
        match ipc::read_frame::<WorkOrder<J>>(&mut orders) {
            Ok(WorkOrder::Run(task)) => {
                ipc::write_frame(
                    &mut events,
                    &WorkerEvent::<J::Output>::Started {
                        id: task.id.clone(),
                        pid,
                    },
                )?;
                let outcome = execute(task);
                ipc::write_frame(&mut events, &WorkerEvent::Finished(outcome))?;
            }
            // the sentinel, or the controller went away: stop cleanly
            Ok(WorkOrder::Stop) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Run one task under the output capture, turning a panic into a textual
/// report. The capture is restored on every exit path
fn execute<J: Job>(task: Task<J>) -> TaskOutcome<J::Output> {
    let capture = match OutputCapture::install() {
        Ok(capture) => capture,
        Err(e) => {
            return TaskOutcome {
                id: task.id,
                value: None,
                error: Some(format!("could not install the output capture: {e}")),
                logs: String::new(),
            }
        }
    };
    debug!("running task {}", task.id);
    *LAST_PANIC.lock() = None;
    let verdict = panic::catch_unwind(AssertUnwindSafe(|| task.job.run()));
    let logs = capture.finish();
    match verdict {
        Ok(value) => TaskOutcome {
            id: task.id,
            value: Some(value),
            error: None,
            logs,
        },
        Err(payload) => {
            let report = render_panic(payload.as_ref());
            TaskOutcome {
                id: task.id,
                value: None,
                error: Some(report.clone()),
                logs: format!("{logs}\n{report}"),
            }
        }
    }
}

/// Produce the failure report for a panic payload, preferring the full
/// record (message, location, backtrace) left behind by the panic hook
fn render_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(report) = LAST_PANIC.lock().take() {
        return report;
    }
    // the hook missed it; fall back to the bare payload
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked with a non-string payload".to_owned()
    }
}

/// Scoped redirection of descriptors 1 and 2 into a capture file. The
/// original descriptors come back and the file is unlinked when this goes
/// out of scope, panics included
struct OutputCapture {
    saved_stdout: i32,
    saved_stderr: i32,
    path: PathBuf,
    restored: bool,
}

impl OutputCapture {
    fn install() -> io::Result<Self> {
        let path = env::temp_dir().join(format!(
            "workpool-capture-{}-{}.log",
            process::id(),
            CAPTURE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let sink = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let saved_stdout = os::duplicate_fd(1)?;
        let saved_stderr = match os::duplicate_fd(2) {
            Ok(fd) => fd,
            Err(e) => {
                os::close_fd(saved_stdout);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };
        // whatever was buffered so far belongs to the previous owner of the
        // descriptors, not to this task
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        let redirected = os::redirect_fd(sink.as_raw_fd(), 1)
            .and_then(|_| os::redirect_fd(sink.as_raw_fd(), 2));
        if let Err(e) = redirected {
            let _ = os::redirect_fd(saved_stdout, 1);
            let _ = os::redirect_fd(saved_stderr, 2);
            os::close_fd(saved_stdout);
            os::close_fd(saved_stderr);
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        // fds 1/2 keep the open description alive from here
        drop(sink);
        Ok(Self {
            saved_stdout,
            saved_stderr,
            path,
            restored: false,
        })
    }
    fn restore(&mut self) {
        if self.restored {
            return;
        }
        // push anything the job left in the userspace buffers down to the
        // capture before unhooking it
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        let _ = os::redirect_fd(self.saved_stdout, 1);
        let _ = os::redirect_fd(self.saved_stderr, 2);
        self.restored = true;
    }
    /// Unhook the capture and return everything the task wrote
    fn finish(mut self) -> String {
        self.restore();
        match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        self.restore();
        os::close_fd(self.saved_stdout);
        os::close_fd(self.saved_stderr);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use {super::render_panic, std::any::Any};

    #[test]
    fn panic_payloads_render_without_the_hook() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(render_panic(payload.as_ref()), "panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new("boom".to_owned());
        assert_eq!(render_panic(payload.as_ref()), "panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(
            render_panic(payload.as_ref()),
            "panicked with a non-string payload"
        );
    }
}
