//! TaskManager: the single entry and exit point for "run this task now".
//!
//! Owns the task registry, the execute-state table, the priority queues, the
//! worker pool, and the load-balancing loop. Submissions never block the
//! caller: they register an entry, push an id, and return. Workers pull from
//! the queues; completions are routed back through here to the task's sink
//! and to any owning runner.
//!
//! Lock layout follows a two-tier discipline: `tasks`, `states`, and the
//! runner registry each have their own reader-writer lock for cheap
//! concurrent lookup; the queues and worker wakeup share one mutex+condvar;
//! every runner guards its own admission state. No completion sink or
//! rejection is ever invoked while any of these are held.

use super::task::{
    CompletionSink, ExecuteState, Owner, PendingHandle, Priority, TaskBody, TaskEntry, TaskId,
    TaskOutcome,
};
use super::worker::{Directive, Worker, WorkerState};
use crate::config::Config;
use crate::error::Error;
use crate::notify::Notifier;
use crate::runner::RunnerRegistry;
use crate::scheduler::{compute_target_workers, LoadEstimator, PoolStats, PriorityQueue};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct SchedCore {
    queue: PriorityQueue,
    shutdown: bool,
    /// Excess idle workers the balancer has asked to retire.
    exit_requests: usize,
}

struct WorkerSlot {
    state: Arc<WorkerState>,
    thread: Option<JoinHandle<()>>,
}

pub(crate) struct TaskManager {
    config: Config,
    epoch: Instant,

    next_task_id: AtomicU64,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    states: RwLock<HashMap<TaskId, ExecuteState>>,

    sched: Mutex<SchedCore>,
    work_ready: Condvar,

    next_worker_id: AtomicU64,
    workers: Mutex<Vec<WorkerSlot>>,
    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    expansions_in_flight: AtomicUsize,

    estimator: LoadEstimator,
    runners: RunnerRegistry,
    notifier: Notifier,

    balance_stop: Mutex<Option<crossbeam_channel::Sender<()>>>,
    balance_thread: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl TaskManager {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            epoch: Instant::now(),
            next_task_id: AtomicU64::new(1),
            tasks: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            sched: Mutex::new(SchedCore {
                queue: PriorityQueue::new(),
                shutdown: false,
                exit_requests: 0,
            }),
            work_ready: Condvar::new(),
            next_worker_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
            live_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            expansions_in_flight: AtomicUsize::new(0),
            estimator: LoadEstimator::new(),
            runners: RunnerRegistry::new(),
            notifier: Notifier::new(),
            balance_stop: Mutex::new(None),
            balance_thread: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Spawns the minimum worker set and the balance loop.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }

        let mgr = Arc::clone(self);
        let interval = self.config.balance_interval;
        // The stop channel doubles as the tick timer, so teardown never has
        // to wait out a sleeping balancer.
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("taskpool-balance".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => mgr.balance_tick(),
                    _ => break,
                }
            });

        match handle {
            Ok(handle) => {
                *self.balance_stop.lock() = Some(stop_tx);
                *self.balance_thread.lock() = Some(handle);
            }
            // Pool still works at its initial size.
            Err(err) => tracing::warn!("balance thread failed to start: {err}"),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    pub fn epoch_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ---- task registry ----------------------------------------------------

    /// Strictly increasing, never 0.
    fn generate_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a task whose completion resolves a `PendingHandle`.
    pub fn register_task(
        &self,
        body: TaskBody,
        priority: Priority,
        owner: Owner,
    ) -> (Arc<TaskEntry>, PendingHandle) {
        let (tx, rx) = crossbeam_channel::bounded::<TaskOutcome>(1);
        let sink: CompletionSink = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        let entry = self.register_task_with_sink(body, priority, owner, sink);
        let handle = PendingHandle::new(entry.id, rx);
        (entry, handle)
    }

    /// Registers a task with an arbitrary completion sink (group members).
    pub fn register_task_with_sink(
        &self,
        body: TaskBody,
        priority: Priority,
        owner: Owner,
        sink: CompletionSink,
    ) -> Arc<TaskEntry> {
        let id = self.generate_task_id();
        let entry = Arc::new(TaskEntry::new(id, priority, owner, body, sink));
        self.tasks.write().insert(id, Arc::clone(&entry));
        self.states.write().insert(id, ExecuteState::Waiting);
        entry
    }

    /// Wires `entry` behind `deps`: it stays out of the queues until every
    /// dependency reaches a terminal state. Unknown or already-terminal ids
    /// count as satisfied. Returns true if the task was enqueued immediately.
    pub fn hold_for_dependencies(self: &Arc<Self>, entry: &Arc<TaskEntry>, deps: &[TaskId]) -> bool {
        // Pre-load one guard so a dependency completing mid-wiring cannot
        // release the task before all edges exist.
        entry.add_pending_dep();
        let tasks = self.tasks.read();
        for &dep in deps {
            let Some(dep_entry) = tasks.get(&dep) else {
                continue;
            };
            // The edge must be wired while the state lock pins the
            // dependency as non-terminal; otherwise it can finish in
            // between and never see its new dependent.
            let states = self.states.read();
            let terminal = states
                .get(&dep)
                .map_or(true, |state| state.is_terminal());
            if !terminal {
                entry.add_pending_dep();
                dep_entry.add_ref();
                dep_entry.add_dependent(entry.id);
            }
        }
        drop(tasks);

        if entry.resolve_dep() {
            self.enqueue_task(entry);
            true
        } else {
            false
        }
    }

    fn lookup(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn query_state(&self, id: TaskId) -> ExecuteState {
        self.states
            .read()
            .get(&id)
            .copied()
            .unwrap_or(ExecuteState::NotFound)
    }

    /// Compare-and-set on the execute-state table. All Waiting->Running and
    /// Waiting->Canceled races are decided here, under the table's lock.
    pub fn transition(&self, id: TaskId, from: ExecuteState, to: ExecuteState) -> bool {
        let mut states = self.states.write();
        match states.get_mut(&id) {
            Some(state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    fn set_state(&self, id: TaskId, to: ExecuteState) {
        if let Some(state) = self.states.write().get_mut(&id) {
            *state = to;
        }
    }

    /// Drops a task from both registries once nothing references it.
    fn retire(&self, id: TaskId) {
        self.tasks.write().remove(&id);
        self.states.write().remove(&id);
    }

    // ---- dispatch ---------------------------------------------------------

    /// Pushes a registered task onto its priority queue and wakes a worker.
    /// Never blocks; expands the pool eagerly if nobody is idle.
    pub fn enqueue_task(self: &Arc<Self>, entry: &Arc<TaskEntry>) {
        let rejected = {
            let mut sched = self.sched.lock();
            if sched.shutdown {
                true
            } else {
                sched.queue.push(entry.id, entry.priority);
                false
            }
        };
        if rejected {
            // The task will never run; resolve its handle instead of leaving
            // the caller blocked on a sink that never fires.
            self.finalize_rejected(entry, Error::ShutDown);
            return;
        }
        self.work_ready.notify_one();
        self.try_trigger_expand();
    }

    /// Blocks until there is a task, an exit request, or shutdown.
    pub(crate) fn next_task(self: &Arc<Self>, state: &Arc<WorkerState>) -> Directive {
        use super::worker::WorkerPhase;

        let mut sched = self.sched.lock();
        let mut idled_out = false;
        loop {
            if sched.shutdown {
                return Directive::Shutdown;
            }

            if let Some((id, _priority)) = sched.queue.pop() {
                state.set_phase(WorkerPhase::Running);
                match self.lookup(id) {
                    Some(entry) => return Directive::Execute(entry),
                    // Retired between enqueue and dequeue; nothing to run.
                    None => continue,
                }
            }

            // Only retire after a full idle-timeout with no work, and never
            // below the configured minimum.
            if idled_out
                && sched.exit_requests > 0
                && self.live_workers.load(Ordering::Acquire) > self.config.min_workers
            {
                sched.exit_requests -= 1;
                return Directive::Exit;
            }

            state.set_phase(WorkerPhase::Idle);
            self.idle_workers.fetch_add(1, Ordering::AcqRel);
            let result = self
                .work_ready
                .wait_for(&mut sched, self.config.idle_timeout);
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);
            state.set_phase(WorkerPhase::Running);
            idled_out = result.timed_out();
        }
    }

    pub(crate) fn record_execution(&self, elapsed: Duration) {
        self.estimator.record(elapsed);
    }

    /// Routes a finished body's result: sink first, then terminal state,
    /// then dependents and the owning runner.
    pub(crate) fn finish_task(self: &Arc<Self>, entry: &Arc<TaskEntry>, outcome: TaskOutcome) {
        let success = outcome.is_ok();
        self.set_state(entry.id, ExecuteState::Ending);
        if let Some(sink) = entry.take_sink() {
            sink(outcome);
        }
        self.set_state(
            entry.id,
            if success {
                ExecuteState::Finished
            } else {
                ExecuteState::Terminated
            },
        );

        if let Owner::Runner(runner) = entry.owner {
            self.runners.on_task_complete(runner, entry.id, self);
        }
        self.release_dependents(entry);
        if entry.release_ref() {
            self.retire(entry.id);
        }
    }

    fn release_dependents(self: &Arc<Self>, entry: &Arc<TaskEntry>) {
        for dependent_id in entry.take_dependents() {
            if let Some(dependent) = self.lookup(dependent_id) {
                if dependent.resolve_dep()
                    && self.query_state(dependent_id) == ExecuteState::Waiting
                {
                    self.enqueue_task(&dependent);
                }
            }
            if entry.release_ref() {
                self.retire(entry.id);
            }
        }
    }

    // ---- cancellation -----------------------------------------------------

    /// Waiting tasks are pulled out of their queue and canceled outright;
    /// running tasks only get their cooperative flag set.
    pub fn cancel_task(self: &Arc<Self>, id: TaskId) {
        let Some(entry) = self.lookup(id) else {
            tracing::debug!(task = id.get(), "cancel ignored: unknown task");
            return;
        };

        if self.transition(id, ExecuteState::Waiting, ExecuteState::Canceled) {
            // Never ran. It sits in the manager queue, in a runner's pending
            // queue, or behind unresolved dependencies.
            {
                let mut sched = self.sched.lock();
                sched.queue.remove(id, entry.priority);
            }
            self.finalize_rejected(&entry, Error::canceled("task canceled while waiting"));
            if let Owner::Runner(runner) = entry.owner {
                self.runners.on_waiting_task_canceled(runner, id, self);
            }
        } else {
            match self.query_state(id) {
                ExecuteState::Running | ExecuteState::Ending => entry.cancel.cancel(),
                state => {
                    tracing::debug!(task = id.get(), ?state, "cancel ignored");
                }
            }
        }
    }

    /// Overflow eviction from a bounded runner. State becomes Canceled and a
    /// DISCARDED rejection is delivered off-stack.
    pub(crate) fn discard_waiting(self: &Arc<Self>, entry: &Arc<TaskEntry>) {
        if self.transition(entry.id, ExecuteState::Waiting, ExecuteState::Canceled) {
            self.finalize_rejected(entry, Error::discarded("evicted from waiting queue"));
        }
    }

    /// Delivers a rejection through the notifier and releases the entry.
    pub(crate) fn finalize_rejected(self: &Arc<Self>, entry: &Arc<TaskEntry>, error: Error) {
        if let Some(sink) = entry.take_sink() {
            self.notifier.reject(sink, error);
        }
        self.release_dependents(entry);
        if entry.release_ref() {
            self.retire(entry.id);
        }
    }

    // ---- worker pool ------------------------------------------------------

    pub fn worker_count(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.sched.lock().queue.len()
    }

    fn spawn_worker(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if self.torn_down.load(Ordering::Acquire)
            || workers.iter().filter(|s| s.thread.is_some()).count() >= self.config.max_workers
        {
            self.expansion_settled();
            return;
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(WorkerState::new(id));
        let mgr = Arc::clone(self);
        let worker_state = Arc::clone(&state);

        let mut builder =
            thread::Builder::new().name(format!("{}-{}", self.config.thread_name_prefix, id));
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        self.live_workers.fetch_add(1, Ordering::AcqRel);
        match builder.spawn(move || {
            Worker::new(worker_state).run(&mgr);
        }) {
            Ok(thread) => {
                workers.push(WorkerSlot {
                    state,
                    thread: Some(thread),
                });
            }
            Err(err) => {
                // Recoverable: the pool keeps going with fewer workers.
                self.live_workers.fetch_sub(1, Ordering::AcqRel);
                self.expansion_settled();
                tracing::warn!("worker thread spawn failed: {err}");
            }
        }
    }

    /// Immediate, throttled expansion when work arrives and nobody is idle.
    fn try_trigger_expand(self: &Arc<Self>) {
        if self.idle_workers.load(Ordering::Acquire) > 0 {
            return;
        }
        if self.live_workers.load(Ordering::Acquire) >= self.config.max_workers {
            return;
        }
        // Throttle so a burst of enqueues does not stampede thread creation.
        let in_flight = self.expansions_in_flight.fetch_add(1, Ordering::AcqRel);
        if in_flight >= self.config.max_expansions_in_flight {
            self.expansions_in_flight.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.spawn_worker();
    }

    /// Called by a worker once its loop is running (or by the spawn path on
    /// failure) to release the expansion throttle.
    pub(crate) fn expansion_settled(&self) {
        let _ = self
            .expansions_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn worker_exited(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    // ---- load balancing ---------------------------------------------------

    fn collect_stats(&self) -> PoolStats {
        use super::worker::WorkerPhase;

        let now_ms = self.epoch_millis();
        let threshold_ms = self.config.task_timeout_threshold.as_millis() as u64;

        let mut running = 0;
        let mut timeout_flagged = 0;
        for slot in self.workers.lock().iter() {
            if slot.state.phase() == WorkerPhase::Terminated {
                continue;
            }
            let current = slot.state.current_task.load(Ordering::Acquire);
            if current != 0 {
                running += 1;
                let started = slot.state.task_start_ms.load(Ordering::Acquire);
                if now_ms.saturating_sub(started) > threshold_ms {
                    timeout_flagged += 1;
                }
            }
        }

        PoolStats {
            workers: self.live_workers.load(Ordering::Acquire),
            idle: self.idle_workers.load(Ordering::Acquire),
            running,
            timeout_flagged,
            queue_len: self.pending_tasks(),
            avg_exec_ns: self.estimator.estimate_ns(),
        }
    }

    fn balance_tick(self: &Arc<Self>) {
        self.reap_terminated();
        let stats = self.collect_stats();
        let target = compute_target_workers(&stats, &self.config);
        self.create_or_delete_workers(target, &stats);
    }

    fn create_or_delete_workers(self: &Arc<Self>, target: usize, stats: &PoolStats) {
        let live = stats.workers;
        if target >= live {
            // Demand caught back up; retire requests from an earlier tick
            // must not keep thinning the pool.
            self.sched.lock().exit_requests = 0;
        }
        if target > live {
            tracing::debug!(live, want = target, queue = stats.queue_len, "expanding pool");
            for _ in live..target {
                self.spawn_worker();
            }
        } else if target < live {
            let excess = (live - target).min(live.saturating_sub(self.config.min_workers));
            if excess > 0 {
                tracing::debug!(live, want = target, "retiring {excess} idle workers");
                self.sched.lock().exit_requests = excess;
                self.work_ready.notify_all();
            }
        }
    }

    /// Joins workers that already left their loop so finished threads do not
    /// accumulate across grow/shrink cycles.
    fn reap_terminated(&self) {
        use super::worker::WorkerPhase;

        let mut finished = Vec::new();
        {
            let mut workers = self.workers.lock();
            for slot in workers.iter_mut() {
                if slot.state.phase() == WorkerPhase::Terminated {
                    if let Some(thread) = slot.thread.take() {
                        tracing::debug!(
                            worker = slot.state.id,
                            executed = slot.state.tasks_executed.load(Ordering::Relaxed),
                            "reaping retired worker"
                        );
                        finished.push(thread);
                    }
                }
            }
            workers.retain(|slot| slot.thread.is_some());
        }
        for thread in finished {
            let _ = thread.join();
        }
    }

    // ---- teardown ---------------------------------------------------------

    /// Stops the balancer, wakes and joins every worker, drains the notifier,
    /// and discards all queued work. Idempotent.
    pub fn shutdown(self: &Arc<Self>) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.balance_stop.lock().take());
        if let Some(handle) = self.balance_thread.lock().take() {
            let _ = handle.join();
        }

        {
            let mut sched = self.sched.lock();
            sched.shutdown = true;
        }
        self.work_ready.notify_all();

        let slots = std::mem::take(&mut *self.workers.lock());
        for slot in slots {
            if let Some(thread) = slot.thread {
                let _ = thread.join();
            }
        }

        self.notifier.shutdown();

        // Dropping entries closes their result channels; anyone still
        // waiting observes ShutDown.
        self.tasks.write().clear();
        self.states.write().clear();
    }
}
