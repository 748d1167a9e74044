use crate::error::{Error, Result};
use std::time::Duration;

/// Pool sizing and timing knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// The pool never shrinks below this many workers.
    pub min_workers: usize,
    /// The pool never grows beyond this many workers.
    pub max_workers: usize,
    /// How long an idle worker lingers before it may be retired.
    pub idle_timeout: Duration,
    /// Period of the load-balancing control loop.
    pub balance_interval: Duration,
    /// A worker whose current task has run longer than this is counted as
    /// stuck when sizing the pool; the task itself is never aborted.
    pub task_timeout_threshold: Duration,
    /// Cap on concurrent eager expansions triggered by enqueues.
    pub max_expansions_in_flight: usize,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: num_cpus::get().max(1),
            idle_timeout: Duration::from_millis(500),
            balance_interval: Duration::from_millis(100),
            task_timeout_threshold: Duration::from_secs(3),
            max_expansions_in_flight: 2,
            thread_name_prefix: "taskpool-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(Error::config("min_workers must be > 0"));
        }
        if self.max_workers < self.min_workers {
            return Err(Error::config("max_workers must be >= min_workers"));
        }
        if self.max_workers > 1024 {
            return Err(Error::config("max_workers too large (max 1024)"));
        }
        if self.balance_interval.is_zero() {
            return Err(Error::config("balance_interval must be > 0"));
        }
        if self.max_expansions_in_flight == 0 {
            return Err(Error::config("max_expansions_in_flight must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn min_workers(mut self, n: usize) -> Self {
        self.config.min_workers = n;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn balance_interval(mut self, interval: Duration) -> Self {
        self.config.balance_interval = interval;
        self
    }

    pub fn task_timeout_threshold(mut self, threshold: Duration) -> Self {
        self.config.task_timeout_threshold = threshold;
        self
    }

    pub fn max_expansions_in_flight(mut self, n: usize) -> Self {
        self.config.max_expansions_in_flight = n;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
