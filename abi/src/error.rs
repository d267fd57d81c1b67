//! Unified error type for the task runtime.
//!
//! Every recoverable failure on the public surface maps to one variant here;
//! scheduler-internal failures are asserted instead of returned.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Caller is not a task, or the task/scheduler role forbids the call.
    PermissionDenied,
    /// Bad argument: unknown id, bad count, invalid flag combination.
    InvalidArgument,
    /// Name already exported, or coupling with an exiting scheduler.
    Busy,
    /// Non-blocking import found no published value.
    WouldBlock,
    /// Self-import of a name the caller never exported.
    Deadlock,
    /// Waiter resumed by table finalization.
    Canceled,
    /// Dequeue from an empty queue.
    NotFound,
    /// Target task is not alive or has no export table.
    NotAlive,
    /// Allocation failure.
    NoMemory,
    /// The task arena is full.
    TooManyTasks,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "operation not permitted for this caller"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Busy => write!(f, "resource busy"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Deadlock => write!(f, "operation would deadlock on the caller"),
            Self::Canceled => write!(f, "wait canceled by finalization"),
            Self::NotFound => write!(f, "no queued task"),
            Self::NotAlive => write!(f, "target task is not alive"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::TooManyTasks => write!(f, "task arena is full"),
        }
    }
}

/// Convenience result type for runtime operations.
pub type TaskResult<T = ()> = Result<T, TaskError>;
