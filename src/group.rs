//! All-or-nothing cohorts: a group submits N tasks together and resolves
//! once, with every result, or with the first failure after all members
//! have landed.

use crate::error::{Error, Result};
use crate::executor::task::{CancelToken, GroupBody, Payload, TaskId, TaskOutcome};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

static GROUP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    fn next() -> Self {
        GroupId(GROUP_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A reusable cohort of task bodies. Submitting it schedules every body and
/// yields a handle that resolves once all of them have reached a terminal
/// state. The same group may be resubmitted while a prior submission is
/// still in flight; each submission tracks its own progress.
pub struct TaskGroup {
    id: GroupId,
    name: Option<String>,
    bodies: Mutex<Vec<GroupBody>>,
    pending: Mutex<Vec<Arc<GroupInfo>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            id: GroupId::next(),
            name: None,
            bodies: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name<S: Into<String>>(name: S) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Appends a task body. The body must be callable repeatedly because the
    /// group itself can be submitted more than once.
    pub fn add_task<F>(&self, body: F)
    where
        F: Fn(&CancelToken) -> Result<Payload> + Send + Sync + 'static,
    {
        self.bodies.lock().push(Arc::new(body));
    }

    pub fn len(&self) -> usize {
        self.bodies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.lock().is_empty()
    }

    pub(crate) fn snapshot_bodies(&self) -> Vec<GroupBody> {
        self.bodies.lock().clone()
    }

    /// Records a new in-flight submission and prunes resolved ones.
    pub(crate) fn track(&self, info: Arc<GroupInfo>) {
        let mut pending = self.pending.lock();
        pending.retain(|info| !info.is_resolved());
        pending.push(info);
    }

    /// The submission considered active for cancellation: the most recent
    /// unresolved one.
    pub(crate) fn current(&self) -> Option<Arc<GroupInfo>> {
        let mut pending = self.pending.lock();
        pending.retain(|info| !info.is_resolved());
        pending.last().cloned()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tasks", &self.len())
            .finish()
    }
}

struct GroupProgress {
    slots: Vec<Option<TaskOutcome>>,
    finished: usize,
    /// First failing member; later failures land in their slot but do not
    /// overwrite this.
    failed_index: Option<usize>,
    resolved: bool,
}

/// Progress record for one submission of a group.
pub(crate) struct GroupInfo {
    group: GroupId,
    total: usize,
    task_ids: Mutex<Vec<TaskId>>,
    state: Mutex<GroupProgress>,
    resolved_cv: Condvar,
    sender: Sender<GroupResult>,
}

impl GroupInfo {
    pub fn new(group: GroupId, total: usize, sender: Sender<GroupResult>) -> Self {
        Self {
            group,
            total,
            task_ids: Mutex::new(Vec::with_capacity(total)),
            state: Mutex::new(GroupProgress {
                slots: (0..total).map(|_| None).collect(),
                finished: 0,
                failed_index: None,
                resolved: false,
            }),
            resolved_cv: Condvar::new(),
            sender,
        }
    }

    pub fn set_task_ids(&self, ids: Vec<TaskId>) {
        *self.task_ids.lock() = ids;
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.task_ids.lock().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().resolved
    }

    /// Writes member `index`'s outcome; resolves the cohort when it is the
    /// last one in. No-op after a timeout already resolved this submission.
    pub fn record(&self, index: usize, outcome: TaskOutcome) {
        let result = {
            let mut progress = self.state.lock();
            if progress.resolved || progress.slots[index].is_some() {
                return;
            }
            if outcome.is_err() && progress.failed_index.is_none() {
                progress.failed_index = Some(index);
            }
            progress.slots[index] = Some(outcome);
            progress.finished += 1;

            if progress.finished < self.total {
                return;
            }
            progress.resolved = true;
            self.resolved_cv.notify_all();
            GroupResult {
                group: self.group,
                slots: std::mem::take(&mut progress.slots),
                failed_index: progress.failed_index,
                timed_out: false,
            }
        };
        let _ = self.sender.send(result);
    }

    /// Resolves immediately if the whole submission is already in (an empty
    /// group, typically).
    pub fn resolve_if_complete(&self) {
        if self.total == 0 {
            let _ = self.sender.send(GroupResult {
                group: self.group,
                slots: Vec::new(),
                failed_index: None,
                timed_out: false,
            });
            self.state.lock().resolved = true;
        }
    }

    /// Forces a TIMEOUT resolution after `timeout` unless the cohort lands
    /// first. The timer parks on the progress condvar, so normal resolution
    /// releases it early.
    pub fn arm_timeout(self: &Arc<Self>, timeout: Duration) {
        let info = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("taskpool-group-timer".to_string())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                let result = {
                    let mut progress = info.state.lock();
                    while !progress.resolved {
                        if info
                            .resolved_cv
                            .wait_until(&mut progress, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    if progress.resolved {
                        return;
                    }
                    progress.resolved = true;
                    GroupResult {
                        group: info.group,
                        slots: std::mem::take(&mut progress.slots),
                        failed_index: progress.failed_index,
                        timed_out: true,
                    }
                };
                let _ = info.sender.send(result);
            });
        if let Err(err) = spawned {
            tracing::warn!(group = self.group.get(), "group timer failed to start: {err}");
        }
    }
}

/// Resolved state of one group submission.
pub struct GroupResult {
    group: GroupId,
    slots: Vec<Option<TaskOutcome>>,
    failed_index: Option<usize>,
    timed_out: bool,
}

impl GroupResult {
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn failed_index(&self) -> Option<usize> {
        self.failed_index
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.failed_index.is_none()
    }

    /// Per-member outcomes, in submission order. Members that had not
    /// finished when a timeout fired are `None`.
    pub fn slots(&self) -> &[Option<TaskOutcome>] {
        &self.slots
    }

    pub fn take_slot(&mut self, index: usize) -> Option<TaskOutcome> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Collapses to the aggregate contract: all payloads on success, the
    /// first failure's error otherwise.
    pub fn into_outcome(mut self) -> std::result::Result<Vec<Payload>, Error> {
        if self.timed_out {
            return Err(Error::timeout("task group timed out"));
        }
        match self.failed_index {
            Some(index) => match self.slots.get_mut(index).and_then(Option::take) {
                Some(Err(error)) => Err(error),
                _ => Err(Error::scheduler("failed group slot is missing its error")),
            },
            None => self
                .slots
                .into_iter()
                .map(|slot| match slot {
                    Some(Ok(payload)) => Ok(payload),
                    _ => Err(Error::scheduler("group slot is missing its result")),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for GroupResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupResult")
            .field("group", &self.group)
            .field("slots", &self.slots.len())
            .field("failed_index", &self.failed_index)
            .field("timed_out", &self.timed_out)
            .finish()
    }
}

/// Caller-side handle for one group submission.
pub struct GroupHandle {
    group: GroupId,
    receiver: Receiver<GroupResult>,
}

impl GroupHandle {
    pub(crate) fn new(group: GroupId, receiver: Receiver<GroupResult>) -> Self {
        Self { group, receiver }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Blocks until the cohort resolves.
    pub fn wait(self) -> std::result::Result<GroupResult, Error> {
        self.receiver.recv().map_err(|_| Error::ShutDown)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<GroupResult> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl std::fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHandle")
            .field("group", &self.group)
            .finish()
    }
}
