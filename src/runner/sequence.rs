//! Strictly ordered execution: at most one task of this runner is ever in
//! flight, and completion order equals submission order.

use super::{RunnerBase, RunnerId, RunnerKind, RunnerPolicy};
use crate::error::Result;
use crate::executor::manager::TaskManager;
use crate::executor::task::{CancelToken, Owner, Payload, PendingHandle, Priority, TaskEntry, TaskId};
use std::sync::Arc;

pub(crate) struct SequenceCore {
    base: RunnerBase,
    priority: Priority,
}

impl SequenceCore {
    pub fn new(id: RunnerId, name: Option<String>, priority: Priority) -> Self {
        Self {
            base: RunnerBase::new(id, name),
            priority,
        }
    }
}

impl RunnerPolicy for SequenceCore {
    fn base(&self) -> &RunnerBase {
        &self.base
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Sequence {
            priority: self.priority,
        }
    }

    fn admit(&self, mgr: &Arc<TaskManager>, entry: Arc<TaskEntry>) {
        let promote = {
            let mut state = self.base.state.lock();
            if state.current.is_none() {
                state.current = Some(entry.id);
                true
            } else {
                state.pending.push_back(Arc::clone(&entry));
                false
            }
        };
        if promote {
            mgr.enqueue_task(&entry);
        }
    }

    fn on_task_complete(&self, mgr: &Arc<TaskManager>, id: TaskId) {
        let next = {
            let mut state = self.base.state.lock();
            // Stale or duplicate signal; ignoring it is what keeps this
            // runner at one active task.
            if state.current != Some(id) {
                tracing::debug!(
                    runner = self.base.id.get(),
                    task = id.get(),
                    "stale completion signal ignored"
                );
                return;
            }
            let next = state.pending.pop_front();
            state.current = next.as_ref().map(|entry| entry.id);
            next
        };

        match next {
            Some(entry) => mgr.enqueue_task(&entry),
            None => mgr.runners().maybe_destroy(&self.base),
        }
    }

    fn on_waiting_canceled(&self, mgr: &Arc<TaskManager>, id: TaskId) {
        // Still pending: just drop it, order among the rest is unchanged.
        if self.base.remove_waiting(id) {
            return;
        }
        // Already promoted: completing it unblocks the queue.
        self.on_task_complete(mgr, id);
    }
}

/// Handle to a strictly ordered runner. Cloning shares the same backing
/// instance; the runner is destroyed when the last handle drops and its
/// queue has drained.
pub struct SequenceRunner {
    mgr: Arc<TaskManager>,
    core: Arc<dyn RunnerPolicy>,
}

impl SequenceRunner {
    pub(crate) fn new(mgr: Arc<TaskManager>, core: Arc<dyn RunnerPolicy>) -> Self {
        Self { mgr, core }
    }

    pub fn id(&self) -> RunnerId {
        self.core.base().id
    }

    /// Submits a task. It runs at the runner's fixed priority, after every
    /// task submitted before it has reached a terminal state.
    pub fn execute<F>(&self, body: F) -> PendingHandle
    where
        F: FnOnce(&CancelToken) -> Result<Payload> + Send + 'static,
    {
        let priority = match self.core.kind() {
            RunnerKind::Sequence { priority } => priority,
            _ => Priority::default(),
        };
        let (entry, handle) =
            self.mgr
                .register_task(Box::new(body), priority, Owner::Runner(self.id()));
        self.core.admit(&self.mgr, entry);
        handle
    }
}

impl Clone for SequenceRunner {
    fn clone(&self) -> Self {
        self.core.base().add_ref();
        Self {
            mgr: Arc::clone(&self.mgr),
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for SequenceRunner {
    fn drop(&mut self) {
        self.mgr.runners().unref(self.id());
    }
}

impl std::fmt::Debug for SequenceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRunner")
            .field("id", &self.id())
            .finish()
    }
}
