//! Capacity-bounded execution: at most `running_capacity` tasks in flight,
//! a bounded waiting queue, and oldest-first eviction on overflow.

use super::{RunnerBase, RunnerId, RunnerKind, RunnerPolicy};
use crate::error::Result;
use crate::executor::manager::TaskManager;
use crate::executor::task::{CancelToken, Owner, Payload, PendingHandle, Priority, TaskEntry, TaskId};
use std::sync::Arc;

pub(crate) struct ConcurrentCore {
    base: RunnerBase,
    running_capacity: usize,
    waiting_capacity: usize,
}

impl ConcurrentCore {
    pub fn new(
        id: RunnerId,
        name: Option<String>,
        running_capacity: usize,
        waiting_capacity: usize,
    ) -> Self {
        Self {
            base: RunnerBase::new(id, name),
            running_capacity,
            waiting_capacity,
        }
    }
}

impl RunnerPolicy for ConcurrentCore {
    fn base(&self) -> &RunnerBase {
        &self.base
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Concurrent {
            running_capacity: self.running_capacity,
            waiting_capacity: self.waiting_capacity,
        }
    }

    fn admit(&self, mgr: &Arc<TaskManager>, entry: Arc<TaskEntry>) {
        let mut evicted = None;
        let run_now = {
            let mut state = self.base.state.lock();
            if state.active < self.running_capacity {
                state.active += 1;
                state.admitted.push(entry.id);
                true
            } else {
                // waiting_capacity == 0 means an unbounded queue.
                if self.waiting_capacity > 0 && state.pending.len() == self.waiting_capacity {
                    evicted = state.pending.pop_front();
                }
                state.pending.push_back(Arc::clone(&entry));
                false
            }
        };

        if run_now {
            mgr.enqueue_task(&entry);
        }
        if let Some(oldest) = evicted {
            // Off-stack rejection; never re-enters the caller.
            mgr.discard_waiting(&oldest);
        }
    }

    fn on_task_complete(&self, mgr: &Arc<TaskManager>, id: TaskId) {
        let mut promoted = Vec::new();
        {
            let mut state = self.base.state.lock();
            match state.admitted.iter().position(|&admitted| admitted == id) {
                Some(pos) => {
                    state.admitted.swap_remove(pos);
                    state.active -= 1;
                    while state.active < self.running_capacity {
                        match state.pending.pop_front() {
                            Some(entry) => {
                                state.active += 1;
                                state.admitted.push(entry.id);
                                promoted.push(entry);
                            }
                            None => break,
                        }
                    }
                }
                // Evicted or otherwise never admitted; it holds no slot.
                None => {
                    tracing::debug!(
                        runner = self.base.id.get(),
                        task = id.get(),
                        "completion signal for a task without a running slot"
                    );
                }
            }
        }

        for entry in promoted {
            mgr.enqueue_task(&entry);
        }
        mgr.runners().maybe_destroy(&self.base);
    }

    fn on_waiting_canceled(&self, mgr: &Arc<TaskManager>, id: TaskId) {
        if self.base.remove_waiting(id) {
            return;
        }
        // Already admitted: the canceled task occupied a running slot.
        self.on_task_complete(mgr, id);
    }
}

/// Handle to a capacity-bounded runner. Cloning shares the backing instance.
pub struct ConcurrentRunner {
    mgr: Arc<TaskManager>,
    core: Arc<dyn RunnerPolicy>,
}

impl ConcurrentRunner {
    pub(crate) fn new(mgr: Arc<TaskManager>, core: Arc<dyn RunnerPolicy>) -> Self {
        Self { mgr, core }
    }

    pub fn id(&self) -> RunnerId {
        self.core.base().id
    }

    /// Submits a task at the default priority.
    pub fn execute<F>(&self, body: F) -> PendingHandle
    where
        F: FnOnce(&CancelToken) -> Result<Payload> + Send + 'static,
    {
        self.execute_with_priority(body, Priority::default())
    }

    /// Submits a task that runs as soon as a running slot frees up, at its
    /// own priority. Admission order among waiting tasks is preserved;
    /// completion order is not.
    pub fn execute_with_priority<F>(&self, body: F, priority: Priority) -> PendingHandle
    where
        F: FnOnce(&CancelToken) -> Result<Payload> + Send + 'static,
    {
        let (entry, handle) =
            self.mgr
                .register_task(Box::new(body), priority, Owner::Runner(self.id()));
        self.core.admit(&self.mgr, entry);
        handle
    }
}

impl Clone for ConcurrentRunner {
    fn clone(&self) -> Self {
        self.core.base().add_ref();
        Self {
            mgr: Arc::clone(&self.mgr),
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for ConcurrentRunner {
    fn drop(&mut self) {
        self.mgr.runners().unref(self.id());
    }
}

impl std::fmt::Debug for ConcurrentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRunner")
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn register(mgr: &Arc<TaskManager>, runner: RunnerId) -> Arc<TaskEntry> {
        let (entry, _handle) = mgr.register_task(
            Box::new(|_| Ok(Box::new(()) as Payload)),
            Priority::Medium,
            Owner::Runner(runner),
        );
        entry
    }

    #[test]
    fn test_cancel_of_evicted_task_frees_no_slot() {
        let mgr = TaskManager::new(Config::default());
        let core = ConcurrentCore::new(RunnerId(1), None, 1, 1);

        let first = register(&mgr, RunnerId(1));
        let second = register(&mgr, RunnerId(1));
        let third = register(&mgr, RunnerId(1));

        core.admit(&mgr, Arc::clone(&first));
        core.admit(&mgr, Arc::clone(&second));
        // Overflows the waiting queue and evicts `second`.
        core.admit(&mgr, Arc::clone(&third));

        // A cancel racing the eviction lands here with the task neither
        // pending nor admitted; the running slot must stay occupied.
        core.on_waiting_canceled(&mgr, second.id);
        assert_eq!(core.base().state.lock().active, 1);

        core.on_task_complete(&mgr, first.id);
        let state = core.base().state.lock();
        assert_eq!(state.active, 1);
        assert_eq!(state.admitted, vec![third.id]);
    }

    #[test]
    fn test_completion_promotes_in_admission_order() {
        let mgr = TaskManager::new(Config::default());
        let core = ConcurrentCore::new(RunnerId(2), None, 2, 0);

        let entries: Vec<_> = (0..4).map(|_| register(&mgr, RunnerId(2))).collect();
        for entry in &entries {
            core.admit(&mgr, Arc::clone(entry));
        }
        assert_eq!(core.base().state.lock().active, 2);

        core.on_task_complete(&mgr, entries[0].id);
        let state = core.base().state.lock();
        assert_eq!(state.active, 2);
        assert_eq!(state.admitted, vec![entries[1].id, entries[2].id]);
        assert_eq!(state.pending.len(), 1);
    }
}
