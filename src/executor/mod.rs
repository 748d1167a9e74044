//! Task execution infrastructure: the manager, its worker threads, and the
//! per-task records they share.

pub mod manager;
pub mod task;
pub mod worker;

pub use task::{
    CancelToken, ExecuteState, Payload, PendingHandle, Priority, TaskId, TaskOutcome,
};
