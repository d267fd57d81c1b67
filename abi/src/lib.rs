//! Weft runtime ABI types.
//!
//! This crate provides the canonical definitions for all types shared between
//! the runtime core and embedders. Having a single source of truth eliminates
//! duplicate definitions and mismatched constants across crates.
//!
//! Everything here is plain data; no_std and free of unsafe code.

#![no_std]
#![forbid(unsafe_code)]

pub mod error;
pub mod sync;
pub mod task;

pub use error::{TaskError, TaskResult};
pub use sync::{SyncFlags, YieldFlags};
pub use task::{
    MAX_TASKS, SLEEP_STACK_SIZE, TASK_ALL, TASK_ANY, TASK_MYSELF, TASK_NAME_MAX_LEN, TASK_ROOT,
    TASK_STACK_SIZE, TaskState,
};
