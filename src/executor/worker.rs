// worker thread lifecycle
use super::manager::TaskManager;
use super::task::TaskEntry;
use crate::executor::task::{ExecuteState, Payload};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub(crate) type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerPhase {
    Starting = 0,
    Running = 1,
    Idle = 2,
    Terminated = 3,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> WorkerPhase {
        match v {
            0 => WorkerPhase::Starting,
            1 => WorkerPhase::Running,
            2 => WorkerPhase::Idle,
            _ => WorkerPhase::Terminated,
        }
    }
}

/// Shared per-worker record. The balance loop reads these to size the pool;
/// the worker itself writes them.
pub(crate) struct WorkerState {
    pub id: WorkerId,
    phase: AtomicU8,
    /// Id of the task being executed, 0 when between tasks.
    pub current_task: AtomicU64,
    /// Start of the current task, as millis since the pool epoch.
    pub task_start_ms: AtomicU64,
    pub tasks_executed: AtomicU64,
}

impl WorkerState {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            phase: AtomicU8::new(WorkerPhase::Starting as u8),
            current_task: AtomicU64::new(0),
            task_start_ms: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// What the manager tells a worker that asked for work.
pub(crate) enum Directive {
    Execute(Arc<TaskEntry>),
    /// Retired by the balancer after idling out.
    Exit,
    Shutdown,
}

pub(crate) struct Worker {
    pub state: Arc<WorkerState>,
}

impl Worker {
    pub fn new(state: Arc<WorkerState>) -> Self {
        Self { state }
    }

    // main loop: ask for work, run it, repeat until retired or torn down
    pub fn run(&self, manager: &Arc<TaskManager>) {
        self.state.set_phase(WorkerPhase::Running);
        manager.expansion_settled();

        loop {
            match manager.next_task(&self.state) {
                Directive::Execute(entry) => self.execute_task(manager, entry),
                Directive::Exit | Directive::Shutdown => break,
            }
        }

        self.state.set_phase(WorkerPhase::Terminated);
        manager.worker_exited();
    }

    fn execute_task(&self, manager: &Arc<TaskManager>, entry: Arc<TaskEntry>) {
        // A concurrent cancel may have won between dequeue and here; the
        // cancel path already delivered the rejection.
        if !manager.transition(entry.id, ExecuteState::Waiting, ExecuteState::Running) {
            return;
        }

        self.state.current_task.store(entry.id.get(), Ordering::Release);
        self.state
            .task_start_ms
            .store(manager.epoch_millis(), Ordering::Release);

        let start = Instant::now();
        let outcome = match entry.take_body() {
            Some(body) => run_body(body, &entry),
            None => Err(crate::error::Error::scheduler("task body already taken")),
        };
        let elapsed = start.elapsed();

        self.state.current_task.store(0, Ordering::Release);
        self.state.tasks_executed.fetch_add(1, Ordering::Relaxed);
        manager.record_execution(elapsed);
        manager.finish_task(&entry, outcome);
    }
}

fn run_body(
    body: super::task::TaskBody,
    entry: &TaskEntry,
) -> std::result::Result<Payload, crate::error::Error> {
    let cancel = entry.cancel.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || body(&cancel)));
    match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic_message(&*panic);
            tracing::warn!(task = entry.id.get(), "task body panicked: {msg}");
            Err(crate::error::Error::task_failed(format!(
                "task body panicked: {msg}"
            )))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
