/*
 * Created on Wed Mar 22 2023
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

//! The pool controller and its background coordinators
//!
//! Five kinds of actors cooperate here: the submitter (any caller of
//! [`WorkerPool::schedule`]), the feeder, the collector, the killer and the
//! worker links. The feeder moves tasks pending -> running; worker links
//! bridge the running queue to their worker's pipes and apply the worker's
//! announcements to the task->worker map; the collector settles completion
//! handles; the killer enforces deadlines. All of them block on channels and
//! are woken by the shutdown signal channel being closed, never by polling.

use {
    crate::{
        error::{PoolError, PoolResult},
        handle::TaskHandle,
        ipc::{self, WorkOrder, WorkerEvent},
        proc::{self, ExitCode, WorkerProc},
        task::{self, Job, Task, TaskId, TaskOutcome, TimeoutEntry},
    },
    crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender},
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        fmt,
        process::{ChildStdin, ChildStdout},
        sync::{
            atomic::{AtomicU8, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// How long shutdown waits for one coordinator thread to wind down
const COORDINATOR_JOIN_GRACE: Duration = Duration::from_secs(1);
/// How long shutdown waits to place one stop sentinel
const SENTINEL_PUT_GRACE: Duration = Duration::from_secs(1);
/// The killer's sweep granularity
const KILLER_TICK: Duration = Duration::from_secs(1);

/// The lifecycle state of the pool. `Broken`, `Stopping` and `Stopped` are
/// terminal: every background actor exits as soon as it observes one of
/// them, and no transition ever leaves them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Starting = 0,
    Started = 1,
    Broken = 2,
    Stopping = 3,
    Stopped = 4,
}

impl PoolState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Broken | Self::Stopping | Self::Stopped)
    }
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Started,
            2 => Self::Broken,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Starting => "starting",
            PoolState::Started => "started",
            PoolState::Broken => "broken",
            PoolState::Stopping => "stopping",
            PoolState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Atomic cell holding the pool state
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: PoolState) -> Self {
        Self(AtomicU8::new(state as u8))
    }
    fn get(&self) -> PoolState {
        PoolState::from_u8(self.0.load(Ordering::SeqCst))
    }
    fn set(&self, state: PoolState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
    /// Move a live pool into `Stopping`. Returns false if the pool was
    /// already terminal, which is what makes shutdown idempotent under
    /// concurrent callers
    fn begin_stopping(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            if PoolState::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .0
                .compare_exchange(
                    current,
                    PoolState::Stopping as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Construction parameters for a [`WorkerPool`]
pub struct PoolConfig {
    /// worker count; defaults to the host CPU count
    pub workers: Option<usize>,
    /// how long a terminated worker gets to honor SIGTERM
    pub term_grace: Duration,
    /// how long to wait after escalating to SIGKILL
    pub kill_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            term_grace: Duration::from_secs(1),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// What travels over the running queue. `Stop` is the shutdown sentinel:
/// one is queued per worker and each is consumed by exactly one link
enum Dispatch<J> {
    Run(Task<J>),
    Stop,
}

/// State shared between the controller, the coordinators and the worker
/// links. The coordinators hold this through an `Arc`: they borrow the
/// controller's contract, while the lifetime of the whole arrangement is
/// driven exclusively by [`WorkerPool::shutdown`]
struct PoolShared<J: Job> {
    state: StateCell,
    nb_workers: usize,
    term_grace: Duration,
    kill_grace: Duration,
    /// handle table: task id -> completion handle. Lives only in the
    /// controller process; written by the submitter (insert), the feeder
    /// (delete on cancelled) and the collector (delete on completion)
    handles: Mutex<HashMap<TaskId, TaskHandle<<J as Job>::Output>>>,
    /// task -> owning worker pid; written by the links on behalf of their
    /// worker (single writer per key), read by the killer
    task_owners: RwLock<HashMap<TaskId, u32>>,
    /// process table: pid -> worker process; written by the controller and
    /// the killer only
    procs: Mutex<HashMap<u32, WorkerProc>>,
    /// the running queue, bounded at `nb_workers + 1`: the one slack slot
    /// keeps a worker from idling during handoff
    running_tx: Sender<Dispatch<J>>,
    running_rx: Receiver<Dispatch<J>>,
    /// the result queue
    results_tx: Sender<TaskOutcome<<J as Job>::Output>>,
    /// dropped by shutdown, which wakes every coordinator at once
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

/// A pool of isolated worker processes executing [`Job`]s under optional
/// per-task deadlines
///
/// Tasks flow `schedule -> pending queue -> feeder -> running queue ->
/// worker -> result queue -> collector -> completion handle`. A task that
/// overruns its deadline gets its worker killed and replaced, so one
/// runaway job never costs the pool capacity. Results carry everything the
/// job wrote to stdout, stderr and the log stream while it ran.
///
/// ```no_run
/// use libworkpool::{worker, Job, WorkerPool};
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Square(i64);
///
/// impl Job for Square {
///     type Output = i64;
///     fn run(self) -> i64 {
///         self.0 * self.0
///     }
/// }
///
/// fn main() {
///     // workers re-execute this binary, so this must come first
///     worker::run_if_worker::<Square>();
///     let pool = WorkerPool::new(Some(2)).unwrap();
///     let handle = pool.submit(Square(11)).unwrap();
///     handle.wait(None);
///     assert_eq!(handle.value(), Some(121));
///     pool.shutdown(true, Duration::from_secs(5));
/// }
/// ```
pub struct WorkerPool<J: Job> {
    shared: Arc<PoolShared<J>>,
    pending_tx: Sender<Task<J>>,
    timeout_tx: Sender<TimeoutEntry>,
    coordinators: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl<J: Job> WorkerPool<J> {
    /// Create a pool with `workers` worker processes, defaulting to the
    /// host CPU count. Fails with [`PoolError::BadWorkerCount`] on zero
    pub fn new(workers: Option<usize>) -> PoolResult<Self> {
        Self::with_config(PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }
    pub fn with_config(config: PoolConfig) -> PoolResult<Self> {
        let nb_workers = config.workers.unwrap_or_else(num_cpus::get);
        if nb_workers == 0 {
            return Err(PoolError::BadWorkerCount(nb_workers));
        }
        let (pending_tx, pending_rx) = unbounded::<Task<J>>();
        let (running_tx, running_rx) = bounded::<Dispatch<J>>(nb_workers + 1);
        let (results_tx, results_rx) = unbounded::<TaskOutcome<J::Output>>();
        let (timeout_tx, timeout_rx) = unbounded::<TimeoutEntry>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let shared = Arc::new(PoolShared {
            state: StateCell::new(PoolState::Starting),
            nb_workers,
            term_grace: config.term_grace,
            kill_grace: config.kill_grace,
            handles: Mutex::new(HashMap::new()),
            task_owners: RwLock::new(HashMap::new()),
            procs: Mutex::new(HashMap::new()),
            running_tx,
            running_rx,
            results_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        });
        let pool = Self {
            shared: Arc::clone(&shared),
            pending_tx,
            timeout_tx,
            coordinators: Mutex::new(Vec::new()),
        };
        pool.start_coordinator("workpool_feeder", {
            let shared = Arc::clone(&shared);
            let shutdown_rx = shutdown_rx.clone();
            move || feeder(shared, pending_rx, shutdown_rx)
        })?;
        pool.start_coordinator("workpool_collector", {
            let shared = Arc::clone(&shared);
            let shutdown_rx = shutdown_rx.clone();
            move || collector(shared, results_rx, shutdown_rx)
        })?;
        pool.start_coordinator("workpool_killer", {
            let shared = Arc::clone(&shared);
            move || killer(shared, timeout_rx, shutdown_rx)
        })?;
        for _ in 0..nb_workers {
            if let Err(e) = spawn_worker(&shared) {
                pool.shutdown(false, Duration::from_secs(1));
                return Err(e);
            }
        }
        shared.state.set(PoolState::Started);
        Ok(pool)
    }
    fn start_coordinator(
        &self,
        name: &'static str,
        body: impl FnOnce() + Send + 'static,
    ) -> PoolResult<()> {
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(body)
            .map_err(|e| PoolError::Os(format!("failed to spawn `{name}`: {e}")))?;
        self.coordinators.lock().push((name, handle));
        Ok(())
    }
    /// The current pool state
    pub fn state(&self) -> PoolState {
        self.shared.state.get()
    }
    /// Submit a job with no deadline
    pub fn submit(&self, job: J) -> PoolResult<TaskHandle<J::Output>> {
        self.schedule(job, None)
    }
    /// Submit a job, optionally bounding its lifetime: a task that has not
    /// settled `timeout` after submission gets its worker killed
    ///
    /// The handle is registered before the task enters the pending queue,
    /// so the feeder can never observe a task without a handle. Fails with
    /// [`PoolError::Closed`] once the pool is terminal; a call racing
    /// shutdown may fail the same way even after the state check passed.
    pub fn schedule(
        &self,
        job: J,
        timeout: Option<Duration>,
    ) -> PoolResult<TaskHandle<J::Output>> {
        let state = self.shared.state.get();
        if state.is_terminal() {
            return Err(PoolError::Closed(state));
        }
        let task = Task {
            id: task::generate_task_id(),
            job,
        };
        let id = task.id.clone();
        let handle = TaskHandle::new();
        self.shared.handles.lock().insert(id.clone(), handle.clone());
        if self.pending_tx.send(task).is_err() {
            // shutdown won the race and the feeder took the queue with it
            self.shared.handles.lock().remove(&id);
            return Err(PoolError::Closed(self.shared.state.get()));
        }
        if let Some(timeout) = timeout {
            let _ = self.timeout_tx.send(TimeoutEntry {
                id,
                deadline: Instant::now() + timeout,
            });
        }
        Ok(handle)
    }
    /// Stop the pool. Idempotent: the first caller runs the teardown and
    /// gets the worker exit codes, later callers get an empty list
    ///
    /// Pending tasks are cancelled. Running tasks are abandoned: their
    /// workers get a stop sentinel, then SIGTERM, then SIGKILL. Every
    /// handle issued before this call is terminal once it returns. With
    /// `wait`, workers get up to `timeout` to drain before being forced.
    pub fn shutdown(&self, wait: bool, timeout: Duration) -> Vec<ExitCode> {
        if !self.shared.state.begin_stopping() {
            return Vec::new();
        }
        // cancel everything still waiting for a worker
        let live_handles: Vec<TaskHandle<J::Output>> =
            self.shared.handles.lock().values().cloned().collect();
        for handle in &live_handles {
            handle.cancel_with("pool is stopping");
        }
        // wake the coordinators
        self.shared.shutdown_tx.lock().take();
        // make room for the sentinels, then queue one per worker
        while self.shared.running_rx.try_recv().is_ok() {}
        for _ in 0..self.shared.nb_workers {
            if let Err(e) = self
                .shared
                .running_tx
                .send_timeout(Dispatch::Stop, SENTINEL_PUT_GRACE)
            {
                debug!("could not queue a stop sentinel: {e}");
            }
        }
        // give the workers a chance to exit on their own
        if wait {
            let end = Instant::now() + timeout;
            loop {
                let any_alive = self.shared.procs.lock().values_mut().any(|p| p.is_alive());
                if !any_alive || Instant::now() >= end {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
        // bounded join on the coordinators
        for (name, handle) in self.coordinators.lock().drain(..) {
            let end = Instant::now() + COORDINATOR_JOIN_GRACE;
            while !handle.is_finished() && Instant::now() < end {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("thread `{name}` still alive at shutdown");
            }
        }
        self.shared.state.set(PoolState::Stopped);
        // force whatever survived and reap everything
        let procs: Vec<WorkerProc> = {
            let mut table = self.shared.procs.lock();
            table.drain().map(|(_, proc_)| proc_).collect()
        };
        let exit_codes = proc::stop_procs(procs, self.shared.term_grace, self.shared.kill_grace);
        // handles whose results will never arrive settle as cancelled, so
        // no caller is left waiting on an abandoned task
        let leftovers: Vec<(TaskId, TaskHandle<J::Output>)> = {
            let mut handles = self.shared.handles.lock();
            handles.drain().collect()
        };
        for (id, handle) in leftovers {
            if handle.abandon("pool shut down before the task settled") {
                debug!("task {id} abandoned at shutdown");
            }
        }
        self.shared.task_owners.write().clear();
        exit_codes
    }
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        // a pool abandoned without an explicit shutdown still reaps its
        // children; the state check inside makes this a no-op otherwise
        self.shutdown(false, Duration::from_secs(1));
    }
}

/// Spawn one worker process, register it in the process table and start its
/// link thread. Called `nb_workers` times at startup and by the killer
/// after every forced termination
fn spawn_worker<J: Job>(shared: &Arc<PoolShared<J>>) -> PoolResult<()> {
    if shared.state.get().is_terminal() {
        // a respawn racing shutdown would outlive the process table sweep
        return Ok(());
    }
    let (proc_, stdin, stdout) = proc::spawn_worker_proc()?;
    let pid = proc_.pid();
    shared.procs.lock().insert(pid, proc_);
    let link_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("workpool_link_{pid}"))
        .spawn(move || worker_link(link_shared, pid, stdin, stdout))
        .map_err(|e| {
            PoolError::Os(format!("failed to spawn the link thread for worker {pid}: {e}"))
        })?;
    info!("started a new worker with pid {pid}");
    Ok(())
}

/// The controller-side agent of one worker process
///
/// Competes with its sibling links on the shared running queue, feeds its
/// worker over the pipe and applies the worker's start/finish announcements
/// to the task->worker map. Exits on a stop sentinel or when its worker
/// dies; a replacement worker gets a replacement link.
fn worker_link<J: Job>(
    shared: Arc<PoolShared<J>>,
    pid: u32,
    mut stdin: ChildStdin,
    mut stdout: ChildStdout,
) {
    loop {
        let task = match shared.running_rx.recv() {
            Ok(Dispatch::Run(task)) => task,
            Ok(Dispatch::Stop) | Err(_) => {
                // pass the sentinel down so the worker exits cleanly
                let _ = ipc::write_frame(&mut stdin, &WorkOrder::<J>::Stop);
                return;
            }
        };
        let id = task.id.clone();
        if ipc::write_frame(&mut stdin, &WorkOrder::Run(task)).is_err() {
            debug!("worker {pid} is gone; task {id} could not be dispatched");
            return;
        }
        loop {
            match ipc::read_frame::<WorkerEvent<J::Output>>(&mut stdout) {
                Ok(WorkerEvent::Started { id, pid }) => {
                    shared.task_owners.write().insert(id, pid);
                }
                Ok(WorkerEvent::Finished(outcome)) => {
                    // the map entry goes away before the result is pushed,
                    // so the killer can never race a finished task
                    shared.task_owners.write().remove(&outcome.id);
                    if shared.results_tx.send(outcome).is_err() {
                        debug!("discarding a result from worker {pid}: the pool is shut down");
                    }
                    break;
                }
                Err(e) => {
                    // killed or crashed mid-task; the killer (or shutdown)
                    // owns the handle from here
                    shared.task_owners.write().remove(&id);
                    debug!("worker {pid} died while task {id} was in flight: {e}");
                    return;
                }
            }
        }
    }
}

/// Moves tasks from the pending queue onto the running queue, transitioning
/// their handles to running first
///
/// A task is pulled off the pending queue *before* its handle is checked:
/// if the handle was cancelled in the meantime the task is dropped right
/// here and its table entry removed. The dispatch into the bounded running
/// queue is raced against the shutdown signal so a full queue cannot wedge
/// teardown.
fn feeder<J: Job>(
    shared: Arc<PoolShared<J>>,
    pending_rx: Receiver<Task<J>>,
    shutdown_rx: Receiver<()>,
) {
    loop {
        let task = select! {
            recv(pending_rx) -> task => match task {
                Ok(task) => task,
                Err(_) => return,
            },
            recv(shutdown_rx) -> _ => return,
        };
        let handle = shared.handles.lock().get(&task.id).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => continue,
        };
        if handle.mark_running() {
            select! {
                send(shared.running_tx, Dispatch::Run(task)) -> result => {
                    if result.is_err() {
                        return;
                    }
                },
                recv(shutdown_rx) -> _ => return,
            }
        } else {
            // cancelled before dispatch; it never reaches a worker
            shared.handles.lock().remove(&task.id);
        }
    }
}

/// Drains the result queue and settles completion handles. The sole writer
/// of terminal results for tasks that actually ran, which keeps the handle
/// table's deletion policy in one place
fn collector<J: Job>(
    shared: Arc<PoolShared<J>>,
    results_rx: Receiver<TaskOutcome<J::Output>>,
    shutdown_rx: Receiver<()>,
) {
    loop {
        let outcome = select! {
            recv(results_rx) -> outcome => match outcome {
                Ok(outcome) => outcome,
                Err(_) => return,
            },
            recv(shutdown_rx) -> _ => return,
        };
        let handle = shared.handles.lock().get(&outcome.id).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => continue,
        };
        if handle.is_cancelled() {
            shared.handles.lock().remove(&outcome.id);
            continue;
        }
        handle.set_logs(outcome.logs);
        match outcome.value {
            Some(value) => handle.fulfill(value),
            None => handle.fail(PoolError::TaskPanicked(outcome.error.unwrap_or_default())),
        }
        shared.handles.lock().remove(&outcome.id);
    }
}

/// Watches per-task deadlines
///
/// Mostly asleep: it wakes when a deadline is registered, once a second
/// while any deadline is outstanding, and at shutdown. A task that overruns
/// gets its worker terminated and the pool's capacity restored with a fresh
/// spawn. The one failure it cannot absorb is being denied that respawn,
/// which breaks the pool.
fn killer<J: Job>(
    shared: Arc<PoolShared<J>>,
    timeout_rx: Receiver<TimeoutEntry>,
    shutdown_rx: Receiver<()>,
) {
    let mut watchlist: Vec<TimeoutEntry> = Vec::new();
    let ticker = tick(KILLER_TICK);
    loop {
        select! {
            recv(timeout_rx) -> entry => match entry {
                Ok(entry) => watchlist.push(entry),
                Err(_) => return,
            },
            recv(ticker) -> _ => {
                if !watchlist.is_empty() {
                    if let Err(e) = sweep(&shared, &mut watchlist) {
                        error!("could not replace a killed worker, the pool is now broken: {e}");
                        shared.state.set(PoolState::Broken);
                        return;
                    }
                }
            },
            recv(shutdown_rx) -> _ => return,
        }
        if shared.state.get().is_terminal() {
            return;
        }
    }
}

/// One pass over the watchlist: records of completed tasks fall off,
/// overdue tasks get their worker killed
fn sweep<J: Job>(shared: &Arc<PoolShared<J>>, watchlist: &mut Vec<TimeoutEntry>) -> PoolResult<()> {
    let now = Instant::now();
    let mut remaining = Vec::with_capacity(watchlist.len());
    for entry in watchlist.drain(..) {
        if !shared.handles.lock().contains_key(&entry.id) {
            // already completed; stop watching it
            continue;
        }
        if now < entry.deadline {
            remaining.push(entry);
            continue;
        }
        let owner = shared.task_owners.read().get(&entry.id).copied();
        let pid = match owner {
            Some(pid) => pid,
            // not on any worker: it must have finished right at its
            // deadline. The record is spent either way
            None => continue,
        };
        let handle = shared.handles.lock().get(&entry.id).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => continue,
        };
        if handle.cancel() {
            // never actually started; nothing to kill
            shared.handles.lock().remove(&entry.id);
            continue;
        }
        warn!("killing worker {pid}: task {} overran its deadline", entry.id);
        handle.fail(PoolError::TaskTimedOut);
        shared.handles.lock().remove(&entry.id);
        let victim = shared.procs.lock().remove(&pid);
        if let Some(proc_) = victim {
            proc::stop_procs(vec![proc_], shared.term_grace, shared.kill_grace);
        }
        spawn_worker(shared)?;
    }
    *watchlist = remaining;
    Ok(())
}
