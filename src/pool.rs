//! The public facade: a handle on one scheduling engine instance.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::manager::TaskManager;
use crate::executor::task::{
    CancelToken, ExecuteState, Owner, Payload, PendingHandle, Priority, TaskId,
};
use crate::group::{GroupHandle, GroupInfo, TaskGroup};
use crate::runner::concurrent::ConcurrentCore;
use crate::runner::sequence::SequenceCore;
use crate::runner::{ConcurrentRunner, RunnerPolicy, SequenceRunner};
use std::sync::Arc;
use std::time::Duration;

/// A bounded, adaptively sized pool of worker threads fed by per-priority
/// FIFO queues.
///
/// Submission never blocks; results come back through [`PendingHandle`]s.
/// Dropping the pool tears it down: queued work is discarded and workers
/// are joined.
pub struct TaskPool {
    mgr: Arc<TaskManager>,
}

impl TaskPool {
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        let mgr = TaskManager::new(config);
        mgr.start();
        Ok(Self { mgr })
    }

    pub fn config(&self) -> &Config {
        self.mgr.config()
    }

    /// Submits opaque work at the default priority.
    pub fn submit<F>(&self, body: F) -> PendingHandle
    where
        F: FnOnce(&CancelToken) -> Result<Payload> + Send + 'static,
    {
        self.submit_with_priority(body, Priority::default())
    }

    pub fn submit_with_priority<F>(&self, body: F, priority: Priority) -> PendingHandle
    where
        F: FnOnce(&CancelToken) -> Result<Payload> + Send + 'static,
    {
        let (entry, handle) = self
            .mgr
            .register_task(Box::new(body), priority, Owner::None);
        self.mgr.enqueue_task(&entry);
        handle
    }

    /// Submits work that stays WAITING until every task in `deps` has
    /// reached a terminal state. Unknown or already-finished ids count as
    /// satisfied.
    pub fn submit_dependent<F>(
        &self,
        body: F,
        priority: Priority,
        deps: &[TaskId],
    ) -> PendingHandle
    where
        F: FnOnce(&CancelToken) -> Result<Payload> + Send + 'static,
    {
        let (entry, handle) = self
            .mgr
            .register_task(Box::new(body), priority, Owner::None);
        self.mgr.hold_for_dependencies(&entry, deps);
        handle
    }

    /// Cancels a task. Waiting work never runs and its handle resolves with
    /// a CANCELED rejection; running work only has its cooperative flag set.
    pub fn cancel(&self, id: TaskId) {
        self.mgr.cancel_task(id);
    }

    pub fn query_state(&self, id: TaskId) -> ExecuteState {
        self.mgr.query_state(id)
    }

    // ---- runners ----------------------------------------------------------

    /// A private strictly ordered runner at the given priority.
    pub fn sequence_runner(&self, priority: Priority) -> SequenceRunner {
        let core = self
            .mgr
            .runners()
            .register(|id| Arc::new(SequenceCore::new(id, None, priority)) as Arc<dyn RunnerPolicy>);
        SequenceRunner::new(Arc::clone(&self.mgr), core)
    }

    /// The shared strictly ordered runner registered under `name`; created
    /// on first use, and every later caller must pass the same priority.
    pub fn named_sequence_runner(&self, name: &str, priority: Priority) -> Result<SequenceRunner> {
        let kind = crate::runner::RunnerKind::Sequence { priority };
        let core = self.mgr.runners().create_or_get_named(name, kind, |id, name| {
            Arc::new(SequenceCore::new(id, Some(name), priority)) as Arc<dyn RunnerPolicy>
        })?;
        Ok(SequenceRunner::new(Arc::clone(&self.mgr), core))
    }

    /// A private capacity-bounded runner: at most `running_capacity` tasks
    /// in flight, `waiting_capacity` waiting (0 = unbounded), oldest waiter
    /// evicted on overflow.
    pub fn concurrent_runner(
        &self,
        running_capacity: usize,
        waiting_capacity: usize,
    ) -> Result<ConcurrentRunner> {
        validate_capacities(running_capacity)?;
        let core = self.mgr.runners().register(|id| {
            Arc::new(ConcurrentCore::new(
                id,
                None,
                running_capacity,
                waiting_capacity,
            )) as Arc<dyn RunnerPolicy>
        });
        Ok(ConcurrentRunner::new(Arc::clone(&self.mgr), core))
    }

    /// The shared capacity-bounded runner registered under `name`. Reuse
    /// with different capacities fails without touching the existing runner.
    pub fn named_concurrent_runner(
        &self,
        name: &str,
        running_capacity: usize,
        waiting_capacity: usize,
    ) -> Result<ConcurrentRunner> {
        validate_capacities(running_capacity)?;
        let kind = crate::runner::RunnerKind::Concurrent {
            running_capacity,
            waiting_capacity,
        };
        let core = self.mgr.runners().create_or_get_named(name, kind, |id, name| {
            Arc::new(ConcurrentCore::new(
                id,
                Some(name),
                running_capacity,
                waiting_capacity,
            )) as Arc<dyn RunnerPolicy>
        })?;
        Ok(ConcurrentRunner::new(Arc::clone(&self.mgr), core))
    }

    // ---- groups -----------------------------------------------------------

    /// Schedules every task of `group` as one cohort.
    pub fn submit_group(&self, group: &TaskGroup, priority: Priority) -> GroupHandle {
        self.submit_group_inner(group, priority, None)
    }

    /// As [`submit_group`](Self::submit_group), but the cohort resolves with
    /// a TIMEOUT rejection if it has not landed within `timeout`.
    pub fn submit_group_with_timeout(
        &self,
        group: &TaskGroup,
        priority: Priority,
        timeout: Duration,
    ) -> GroupHandle {
        self.submit_group_inner(group, priority, Some(timeout))
    }

    fn submit_group_inner(
        &self,
        group: &TaskGroup,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> GroupHandle {
        let bodies = group.snapshot_bodies();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let info = Arc::new(GroupInfo::new(group.id(), bodies.len(), tx));

        // Register the whole cohort before enqueueing any member, so a fast
        // completion cannot observe a half-built submission.
        let mut entries = Vec::with_capacity(bodies.len());
        for (index, body) in bodies.into_iter().enumerate() {
            let slot_info = Arc::clone(&info);
            let entry = self.mgr.register_task_with_sink(
                Box::new(move |cancel| body(cancel)),
                priority,
                Owner::Group(group.id()),
                Box::new(move |outcome| slot_info.record(index, outcome)),
            );
            entries.push(entry);
        }
        info.set_task_ids(entries.iter().map(|entry| entry.id).collect());
        group.track(Arc::clone(&info));

        if let Some(timeout) = timeout {
            info.arm_timeout(timeout);
        }

        for entry in &entries {
            self.mgr.enqueue_task(entry);
        }
        info.resolve_if_complete();

        GroupHandle::new(group.id(), rx)
    }

    /// Cancels the group's current (most recent unresolved) submission:
    /// members still waiting never run.
    pub fn cancel_group(&self, group: &TaskGroup) {
        match group.current() {
            Some(info) => {
                for id in info.task_ids() {
                    self.mgr.cancel_task(id);
                }
            }
            None => {
                tracing::debug!(group = group.id().get(), "cancel ignored: no submission in flight");
            }
        }
    }

    // ---- introspection / teardown -----------------------------------------

    /// Live worker threads.
    pub fn worker_count(&self) -> usize {
        self.mgr.worker_count()
    }

    /// Tasks currently queued for dispatch.
    pub fn pending_tasks(&self) -> usize {
        self.mgr.pending_tasks()
    }

    /// Tears the engine down: discards queued work, joins workers and
    /// service threads. Idempotent; also runs on Drop.
    pub fn shutdown(&self) {
        self.mgr.shutdown();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.mgr.shutdown();
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.worker_count())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

fn validate_capacities(running_capacity: usize) -> Result<()> {
    if running_capacity == 0 {
        return Err(Error::config("running_capacity must be >= 1"));
    }
    Ok(())
}
