//! taskpool - priority task scheduling on an adaptive worker pool
//!
//! Callers submit units of opaque work with a priority; the engine
//! dispatches them onto a bounded pool of OS worker threads, resizing the
//! pool under load. Admission can be constrained through runners
//! (strict sequencing, bounded concurrency) or aggregated into task groups
//! that resolve as one cohort.
//!
//! # Quick Start
//!
//! ```no_run
//! use taskpool::{Payload, Priority, TaskPool};
//!
//! let pool = TaskPool::new().unwrap();
//!
//! let handle = pool.submit_with_priority(
//!     |_cancel| Ok(Box::new(21 * 2) as Payload),
//!     Priority::High,
//! );
//!
//! let answer = *handle.wait().unwrap().downcast::<i32>().unwrap();
//! assert_eq!(answer, 42);
//! ```
//!
//! # Features
//!
//! - **Priority dispatch**: four levels, strict dominance, FIFO per level
//! - **Adaptive pool**: grows under queue pressure, retires idle workers
//! - **Sequence runners**: strict submission-order execution
//! - **Concurrent runners**: at-most-N execution with bounded waiting
//! - **Task groups**: all-or-nothing cohorts with combined resolution
//! - **Cooperative cancellation**: running work is flagged, never preempted

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod group;
pub mod pool;
pub mod runner;
pub mod scheduler;

mod notify;

pub use config::{Config, ConfigBuilder};
pub use error::{Error, ErrorCode, Result};
pub use executor::{
    CancelToken, ExecuteState, Payload, PendingHandle, Priority, TaskId, TaskOutcome,
};
pub use group::{GroupHandle, GroupId, GroupResult, TaskGroup};
pub use pool::TaskPool;
pub use runner::{ConcurrentRunner, RunnerId, SequenceRunner};
