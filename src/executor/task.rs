//! Task representation: ids, priorities, execution states, and the entry
//! record the scheduler tracks for each submission.

use crate::error::{Error, Result};
use crate::group::GroupId;
use crate::runner::RunnerId;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a task. Never 0; ids are strictly increasing
/// within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Rebuilds an id from its raw value, e.g. one carried across an FFI or
    /// IPC boundary. An id that was never allocated simply names no task.
    pub fn from_raw(raw: u64) -> TaskId {
        TaskId(raw)
    }
}

/// Dequeue precedence. `High` always drains before `Medium`, and so on down
/// to `Idle`; within one level dispatch is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
    Idle = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(idx: usize) -> Priority {
        match idx {
            0 => Priority::High,
            1 => Priority::Medium,
            2 => Priority::Low,
            _ => Priority::Idle,
        }
    }
}

/// Observable lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteState {
    /// Unknown id.
    NotFound,
    /// Registered; queued, held back by a runner, or blocked on dependencies.
    Waiting,
    /// A worker is executing the body.
    Running,
    /// Body returned; result is being routed.
    Ending,
    /// Terminal: body succeeded.
    Finished,
    /// Terminal: body returned an error or panicked.
    Terminated,
    /// Terminal: canceled or discarded before it ever ran.
    Canceled,
}

impl ExecuteState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecuteState::Finished | ExecuteState::Terminated | ExecuteState::Canceled
        )
    }
}

/// Cooperative cancellation flag threaded into every task body.
///
/// Canceling running work never preempts it; the body must poll.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Opaque task result. The scheduler never looks inside.
pub type Payload = Box<dyn Any + Send>;

/// What a completed task yields: its payload, or why it failed.
pub type TaskOutcome = std::result::Result<Payload, Error>;

/// One-shot task body, called on a worker thread with the task's cancel flag.
pub type TaskBody = Box<dyn FnOnce(&CancelToken) -> Result<Payload> + Send>;

/// Reusable body for group members, so a group can be resubmitted.
pub type GroupBody = Arc<dyn Fn(&CancelToken) -> Result<Payload> + Send + Sync>;

pub(crate) type CompletionSink = Box<dyn FnOnce(TaskOutcome) + Send>;

/// Who admits and reacts to this task, besides the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    None,
    Runner(RunnerId),
    Group(GroupId),
}

/// Registry record for one submission. The body and sink are each taken
/// exactly once; `refs` counts the pending sink plus live dependents and
/// gates removal from the registries.
pub(crate) struct TaskEntry {
    pub id: TaskId,
    pub priority: Priority,
    pub owner: Owner,
    pub cancel: CancelToken,
    body: Mutex<Option<TaskBody>>,
    sink: Mutex<Option<CompletionSink>>,
    refs: AtomicU32,
    deps_pending: AtomicUsize,
    dependents: Mutex<Vec<TaskId>>,
}

impl TaskEntry {
    pub fn new(
        id: TaskId,
        priority: Priority,
        owner: Owner,
        body: TaskBody,
        sink: CompletionSink,
    ) -> Self {
        Self {
            id,
            priority,
            owner,
            cancel: CancelToken::new(),
            body: Mutex::new(Some(body)),
            sink: Mutex::new(Some(sink)),
            refs: AtomicU32::new(1),
            deps_pending: AtomicUsize::new(0),
            dependents: Mutex::new(Vec::new()),
        }
    }

    pub fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    pub fn take_sink(&self) -> Option<CompletionSink> {
        self.sink.lock().take()
    }

    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; true once the count reaches zero.
    pub fn release_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn add_dependent(&self, id: TaskId) {
        self.dependents.lock().push(id);
    }

    pub fn take_dependents(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.dependents.lock())
    }

    pub fn add_pending_dep(&self) {
        self.deps_pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolves one dependency; true when that was the last one.
    pub fn resolve_dep(&self) -> bool {
        self.deps_pending.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Caller-side handle for an in-flight submission.
pub struct PendingHandle {
    id: TaskId,
    receiver: Receiver<TaskOutcome>,
}

impl PendingHandle {
    pub(crate) fn new(id: TaskId, receiver: Receiver<TaskOutcome>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the task resolves. Yields `Error::ShutDown` if the pool
    /// was torn down with this task still queued.
    pub fn wait(self) -> TaskOutcome {
        self.receiver.recv().unwrap_or(Err(Error::ShutDown))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_wait(&self) -> Option<TaskOutcome> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandle").field("id", &self.id).finish()
    }
}
