pub type Result<T> = std::result::Result<T, Error>;

/// Cause of an asynchronously delivered rejection.
///
/// Each policy-driven rejection carries a distinct code so callers can tell
/// an overflow eviction apart from a user cancellation or a group timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Evicted from a bounded runner's waiting queue to make room.
    Discarded,
    /// Canceled before it ever ran.
    Canceled,
    /// A task group's timeout fired before all members finished.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("task rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("pool shut down")]
    ShutDown,
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        Error::Scheduler(msg.into())
    }

    pub fn task_failed<S: Into<String>>(msg: S) -> Self {
        Error::TaskFailed(msg.into())
    }

    pub fn discarded<S: Into<String>>(msg: S) -> Self {
        Error::Rejected {
            code: ErrorCode::Discarded,
            message: msg.into(),
        }
    }

    pub fn canceled<S: Into<String>>(msg: S) -> Self {
        Error::Rejected {
            code: ErrorCode::Canceled,
            message: msg.into(),
        }
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Rejected {
            code: ErrorCode::Timeout,
            message: msg.into(),
        }
    }

    /// Rejection code, if this error came through the rejection path.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
