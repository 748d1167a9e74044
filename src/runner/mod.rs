//! Admission-policy runners.
//!
//! A runner holds tasks back from the dispatch queues until its policy
//! admits them: `sequence` admits at most one at a time in submission order,
//! `concurrent` admits at most N with a bounded waiting queue. Both share
//! `RunnerBase` (identity, refcount, pending queue) and live in the
//! `RunnerRegistry`, which is the single source of truth for named sharing.

pub mod concurrent;
pub mod sequence;

pub use concurrent::ConcurrentRunner;
pub use sequence::SequenceRunner;

use crate::error::{Error, Result};
use crate::executor::manager::TaskManager;
use crate::executor::task::{Priority, TaskEntry, TaskId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Stable runner identity. A monotonic handle, never derived from an
/// object's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunnerId(pub(crate) u64);

impl RunnerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Configuration fingerprint used to reject mismatched reuse of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunnerKind {
    Sequence {
        priority: Priority,
    },
    Concurrent {
        running_capacity: usize,
        waiting_capacity: usize,
    },
}

/// State every policy mutates under one private lock, so admission checks
/// and promotion of waiting tasks can never over-admit against each other.
#[derive(Default)]
pub(crate) struct AdmissionState {
    pub pending: VecDeque<Arc<TaskEntry>>,
    /// Tasks this runner has admitted that are not yet terminal.
    pub active: usize,
    /// Ids of the admitted tasks. A completion or cancel signal frees a
    /// running slot only if its id is in here; an evicted waiter never is.
    pub admitted: Vec<TaskId>,
    /// Sequence runners: the single task allowed in flight.
    pub current: Option<TaskId>,
}

pub(crate) struct RunnerBase {
    pub id: RunnerId,
    pub name: Option<String>,
    ref_count: AtomicU32,
    pending_destroy: AtomicBool,
    pub state: Mutex<AdmissionState>,
}

impl RunnerBase {
    fn new(id: RunnerId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            ref_count: AtomicU32::new(1),
            pending_destroy: AtomicBool::new(false),
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release_ref(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Removes `id` from the pending queue by identity.
    pub fn remove_waiting(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        if let Some(pos) = state.pending.iter().position(|entry| entry.id == id) {
            state.pending.remove(pos);
            true
        } else {
            false
        }
    }
}

pub(crate) trait RunnerPolicy: Send + Sync {
    fn base(&self) -> &RunnerBase;

    fn kind(&self) -> RunnerKind;

    /// Decides whether `entry` runs now or waits. Never blocks; never
    /// delivers rejections on this call stack.
    fn admit(&self, mgr: &Arc<TaskManager>, entry: Arc<TaskEntry>);

    /// Reaction to one of this runner's admitted tasks reaching a terminal
    /// state. Stale or duplicate signals must be ignored.
    fn on_task_complete(&self, mgr: &Arc<TaskManager>, id: TaskId);

    /// A task of this runner was canceled while still WAITING. It may sit in
    /// the pending queue (not yet admitted) or already be admitted.
    fn on_waiting_canceled(&self, mgr: &Arc<TaskManager>, id: TaskId);

    /// True when nothing is in flight or pending.
    fn is_idle(&self) -> bool {
        let state = self.base().state.lock();
        state.active == 0 && state.current.is_none() && state.pending.is_empty()
    }
}

/// Id- and name-keyed runner maps. Named ("global") runners are shared: one
/// backing instance, one lifetime, an explicit handle refcount.
pub(crate) struct RunnerRegistry {
    next_id: AtomicU64,
    runners: RwLock<HashMap<RunnerId, Arc<dyn RunnerPolicy>>>,
    named: RwLock<HashMap<String, RunnerId>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            runners: RwLock::new(HashMap::new()),
            named: RwLock::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> RunnerId {
        RunnerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers an anonymous runner (refcount 1).
    pub fn register<F>(&self, make: F) -> Arc<dyn RunnerPolicy>
    where
        F: FnOnce(RunnerId) -> Arc<dyn RunnerPolicy>,
    {
        let id = self.allocate_id();
        let runner = make(id);
        self.runners.write().insert(id, Arc::clone(&runner));
        runner
    }

    /// Returns the runner registered under `name`, creating it on first use.
    /// Reuse with a different configuration fails and leaves the existing
    /// instance untouched.
    pub fn create_or_get_named<F>(
        &self,
        name: &str,
        kind: RunnerKind,
        make: F,
    ) -> Result<Arc<dyn RunnerPolicy>>
    where
        F: FnOnce(RunnerId, String) -> Arc<dyn RunnerPolicy>,
    {
        let mut named = self.named.write();
        if let Some(&id) = named.get(name) {
            let existing = self
                .runners
                .read()
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::scheduler(format!("named runner {name:?} vanished")))?;
            if existing.kind() != kind {
                return Err(Error::config(format!(
                    "runner {name:?} already exists with a different configuration"
                )));
            }
            existing.base().add_ref();
            // Reviving a runner whose last handle just dropped; withdraw the
            // deferred destroy before `remove` can act on it.
            existing
                .base()
                .pending_destroy
                .store(false, Ordering::Release);
            return Ok(existing);
        }

        let id = self.allocate_id();
        let runner = make(id, name.to_string());
        self.runners.write().insert(id, Arc::clone(&runner));
        named.insert(name.to_string(), id);
        Ok(runner)
    }

    pub fn get(&self, id: RunnerId) -> Option<Arc<dyn RunnerPolicy>> {
        self.runners.read().get(&id).cloned()
    }

    /// Drops one handle. At zero the runner is destroyed, deferred until its
    /// last task drains.
    pub fn unref(&self, id: RunnerId) {
        let Some(runner) = self.get(id) else {
            return;
        };
        if runner.base().release_ref() {
            if runner.is_idle() {
                self.remove(runner.base());
            } else {
                runner.base().pending_destroy.store(true, Ordering::Release);
            }
        }
    }

    /// Completes a deferred destroy if the runner has drained.
    pub fn maybe_destroy(&self, base: &RunnerBase) {
        if base.pending_destroy.load(Ordering::Acquire) && base.ref_count() == 0 {
            if let Some(runner) = self.get(base.id) {
                if runner.is_idle() {
                    self.remove(base);
                }
            }
        }
    }

    // Lock order is always `named` before `runners`.
    fn remove(&self, base: &RunnerBase) {
        let mut named = self.named.write();
        // `create_or_get_named` revives under the `named` lock, so this
        // recheck is race-free: a runner someone just re-acquired stays.
        if base.ref_count() != 0 {
            base.pending_destroy.store(false, Ordering::Release);
            return;
        }
        if let Some(name) = &base.name {
            named.remove(name);
        }
        self.runners.write().remove(&base.id);
    }

    pub fn on_task_complete(&self, id: RunnerId, task: TaskId, mgr: &Arc<TaskManager>) {
        match self.get(id) {
            Some(runner) => runner.on_task_complete(mgr, task),
            None => tracing::debug!(runner = id.get(), "completion for unknown runner"),
        }
    }

    pub fn on_waiting_task_canceled(&self, id: RunnerId, task: TaskId, mgr: &Arc<TaskManager>) {
        if let Some(runner) = self.get(id) {
            runner.on_waiting_canceled(mgr, task);
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: RunnerId) -> bool {
        self.runners.read().contains_key(&id)
    }

    #[cfg(test)]
    pub fn named_len(&self) -> usize {
        self.named.read().len()
    }
}
