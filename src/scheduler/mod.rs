//! Dispatch-order and pool-sizing policy.
//!
//! `priority` decides which task a worker takes next; `adaptive` decides how
//! many workers should exist at all.

pub mod adaptive;
pub mod priority;

pub use adaptive::{compute_target_workers, LoadEstimator, PoolStats};
pub use priority::PriorityQueue;
