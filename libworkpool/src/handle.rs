/*
 * Created on Thu Mar 16 2023
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
    crate::error::PoolError,
    parking_lot::{Condvar, Mutex, MutexGuard},
    std::{
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// The lifecycle stage of a completion handle. `Done`, `Failed` and
/// `Cancelled` are terminal: a handle settles exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStage {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl HandleStage {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

type DoneCallback<R> = Box<dyn FnOnce(&TaskHandle<R>) + Send>;

struct HandleSlot<R> {
    stage: HandleStage,
    value: Option<R>,
    error: Option<PoolError>,
    logs: String,
    callbacks: Vec<DoneCallback<R>>,
}

struct HandleInner<R> {
    slot: Mutex<HandleSlot<R>>,
    cvar: Condvar,
}

/// A single-assignment container for the eventual outcome of a submitted
/// task
///
/// Handles are cheap to clone; every clone observes the same slot. The
/// submitter keeps one, the pool keeps another until the result is
/// delivered.
pub struct TaskHandle<R> {
    inner: Arc<HandleInner<R>>,
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> TaskHandle<R> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                slot: Mutex::new(HandleSlot {
                    stage: HandleStage::Pending,
                    value: None,
                    error: None,
                    logs: String::new(),
                    callbacks: Vec::new(),
                }),
                cvar: Condvar::new(),
            }),
        }
    }
    pub fn stage(&self) -> HandleStage {
        self.inner.slot.lock().stage
    }
    /// The handle settled: done, failed or cancelled
    pub fn is_done(&self) -> bool {
        self.stage().is_terminal()
    }
    pub fn is_cancelled(&self) -> bool {
        self.stage() == HandleStage::Cancelled
    }
    /// Everything the task wrote while it ran. Empty until the result is
    /// collected
    pub fn logs(&self) -> String {
        self.inner.slot.lock().logs.clone()
    }
    pub fn error(&self) -> Option<PoolError> {
        self.inner.slot.lock().error.clone()
    }
    pub fn value(&self) -> Option<R>
    where
        R: Clone,
    {
        self.inner.slot.lock().value.clone()
    }
    /// Block until the handle settles, or until `timeout` elapses if one is
    /// given. Returns true if the handle is terminal on return
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut slot = self.inner.slot.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !slot.stage.is_terminal() {
                    if self.inner.cvar.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !slot.stage.is_terminal() {
                    self.inner.cvar.wait(&mut slot);
                }
            }
        }
        slot.stage.is_terminal()
    }
    /// Attempt to cancel the task. Succeeds only while it is still pending;
    /// a task already on a worker cannot be cancelled cooperatively
    pub fn cancel(&self) -> bool {
        self.cancel_with("task was cancelled")
    }
    /// Register an observer to run when the handle settles. A handle that
    /// already settled runs the observer immediately on the calling thread
    pub fn on_done(&self, callback: impl FnOnce(&TaskHandle<R>) + Send + 'static) {
        let mut slot = self.inner.slot.lock();
        if slot.stage.is_terminal() {
            drop(slot);
            callback(self);
        } else {
            slot.callbacks.push(Box::new(callback));
        }
    }
    pub(crate) fn cancel_with(&self, reason: &str) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.stage != HandleStage::Pending {
            return false;
        }
        slot.stage = HandleStage::Cancelled;
        slot.error = Some(PoolError::TaskCancelled(reason.to_owned()));
        self.settle(slot);
        true
    }
    /// Force the handle into `Cancelled` even if the task was already
    /// running. Shutdown uses this for results that will never arrive
    pub(crate) fn abandon(&self, reason: &str) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.stage.is_terminal() {
            return false;
        }
        slot.stage = HandleStage::Cancelled;
        slot.error = Some(PoolError::TaskCancelled(reason.to_owned()));
        self.settle(slot);
        true
    }
    /// Pending -> Running. Fails if the handle was cancelled (or settled)
    /// first
    pub(crate) fn mark_running(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.stage == HandleStage::Pending {
            slot.stage = HandleStage::Running;
            true
        } else {
            false
        }
    }
    pub(crate) fn set_logs(&self, logs: String) {
        self.inner.slot.lock().logs = logs;
    }
    pub(crate) fn fulfill(&self, value: R) {
        let mut slot = self.inner.slot.lock();
        if slot.stage.is_terminal() {
            // lost the race against a kill or a cancellation
            return;
        }
        slot.stage = HandleStage::Done;
        slot.value = Some(value);
        self.settle(slot);
    }
    pub(crate) fn fail(&self, error: PoolError) {
        let mut slot = self.inner.slot.lock();
        if slot.stage.is_terminal() {
            return;
        }
        slot.stage = HandleStage::Failed;
        slot.error = Some(error);
        self.settle(slot);
    }
    /// Wake the waiters and run the observers. Consumes the guard so no
    /// observer ever runs under the lock
    fn settle(&self, mut slot: MutexGuard<'_, HandleSlot<R>>) {
        let callbacks = std::mem::take(&mut slot.callbacks);
        self.inner.cvar.notify_all();
        drop(slot);
        for callback in callbacks {
            callback(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{HandleStage, TaskHandle},
        crate::{error::PoolError, test_utils},
        std::{sync::mpsc, thread, time::Duration},
    };

    #[test]
    fn fulfillment_settles_the_handle() {
        let handle: TaskHandle<u32> = TaskHandle::new();
        assert_eq!(handle.stage(), HandleStage::Pending);
        assert!(handle.mark_running());
        handle.fulfill(42);
        assert!(handle.is_done());
        assert_eq!(handle.value(), Some(42));
        assert!(handle.error().is_none());
    }

    #[test]
    fn cancellation_only_works_while_pending() {
        let handle: TaskHandle<u32> = TaskHandle::new();
        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        // and is sticky
        assert!(!handle.cancel());
        let running: TaskHandle<u32> = TaskHandle::new();
        assert!(running.mark_running());
        assert!(!running.cancel());
    }

    #[test]
    fn late_results_lose_the_race() {
        let handle: TaskHandle<u32> = TaskHandle::new();
        handle.fail(PoolError::TaskTimedOut);
        handle.fulfill(42);
        assert_eq!(handle.stage(), HandleStage::Failed);
        assert!(handle.value().is_none());
        assert_eq!(handle.error(), Some(PoolError::TaskTimedOut));
    }

    #[test]
    fn waiting_times_out_on_a_pending_handle() {
        let handle: TaskHandle<u32> = TaskHandle::new();
        assert!(!handle.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn waiters_see_a_fulfillment_from_another_thread() {
        test_utils::init_logger();
        let handle: TaskHandle<u32> = TaskHandle::new();
        let writer = handle.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.fulfill(7);
        });
        assert!(handle.wait(Some(Duration::from_secs(5))));
        assert_eq!(handle.value(), Some(7));
        t.join().unwrap();
    }

    #[test]
    fn observers_run_once_on_settlement() {
        let handle: TaskHandle<u32> = TaskHandle::new();
        let (tx, rx) = mpsc::channel();
        handle.on_done(move |h| tx.send(h.value()).unwrap());
        handle.fulfill(9);
        assert_eq!(rx.recv().unwrap(), Some(9));
        // registered after settlement: runs immediately
        let (tx, rx) = mpsc::channel();
        handle.on_done(move |h| tx.send(h.is_done()).unwrap());
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn abandonment_overrides_running() {
        let handle: TaskHandle<u32> = TaskHandle::new();
        assert!(handle.mark_running());
        assert!(handle.abandon("pool shut down before the task settled"));
        assert!(handle.is_cancelled());
        match handle.error() {
            Some(PoolError::TaskCancelled(_)) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
