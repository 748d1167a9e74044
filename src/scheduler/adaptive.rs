use crate::config::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot the balance loop feeds into pool sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Live worker threads.
    pub workers: usize,
    /// Workers blocked waiting for a task.
    pub idle: usize,
    /// Workers currently executing a body.
    pub running: usize,
    /// Running workers whose current task exceeded the timeout threshold.
    pub timeout_flagged: usize,
    /// Tasks sitting in the priority queues.
    pub queue_len: usize,
    /// Smoothed execution duration, nanoseconds.
    pub avg_exec_ns: u64,
}

/// Exponentially weighted moving average of task execution time.
#[derive(Debug)]
pub struct LoadEstimator {
    estimate_ns: AtomicU64,
}

impl LoadEstimator {
    const ALPHA: f64 = 0.3;

    pub fn new() -> Self {
        Self {
            estimate_ns: AtomicU64::new(0),
        }
    }

    pub fn record(&self, duration: Duration) {
        let sample = duration.as_nanos() as f64;
        let old = self.estimate_ns.load(Ordering::Relaxed) as f64;
        let new = if old == 0.0 {
            sample
        } else {
            Self::ALPHA * sample + (1.0 - Self::ALPHA) * old
        };
        self.estimate_ns.store(new as u64, Ordering::Relaxed);
    }

    pub fn estimate_ns(&self) -> u64 {
        self.estimate_ns.load(Ordering::Relaxed)
    }
}

impl Default for LoadEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Tasks whose smoothed duration exceeds this count as slow; queued work
/// behind slow tasks weighs more when sizing the pool.
const SLOW_TASK_NS: u64 = 50_000_000;

/// Target worker count for the next balance tick.
///
/// Demand is everyone doing useful work plus one replacement per stuck
/// worker plus pressure from the queue, clamped into [min, max]. Stuck
/// workers are compensated, never aborted, so new submissions keep a bounded
/// wait even while one body hogs a thread. Constants here are tunable
/// policy, not contract.
pub fn compute_target_workers(stats: &PoolStats, config: &Config) -> usize {
    let mut demand = stats.running + stats.timeout_flagged;

    if stats.queue_len > 0 {
        // With quick tasks a single worker chews through several queued
        // entries per tick, so the queue is damped; slow tasks get a
        // worker per queued entry.
        let pressure = if stats.avg_exec_ns >= SLOW_TASK_NS {
            stats.queue_len
        } else {
            (stats.queue_len + 1) / 2
        };
        demand += pressure;
    }

    demand.clamp(config.min_workers, config.max_workers)
}
