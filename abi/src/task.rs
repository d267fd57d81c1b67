//! Task ABI types shared across the runtime.
//!
//! This module contains **only** the types, constants, and enums that form
//! the stable surface of the task model. Runtime-internal implementation
//! details (the `Task` record, register contexts, scheduler linkage) live in
//! `weft_core::sched::task_struct`.

// --- Task configuration ---

/// Maximum number of spawned tasks the arena can hold (the root is extra).
pub const MAX_TASKS: usize = 100;
/// Body stack for scheduled (BLT) tasks.
pub const TASK_STACK_SIZE: usize = 1 << 20; // 1 MiB
/// Stack hosting a task's own sleep/dispatch loop.
pub const SLEEP_STACK_SIZE: usize = 1 << 18; // 256 KiB
pub const TASK_NAME_MAX_LEN: usize = 32;

// --- Task identity ---

/// The bootstrap task that seeds the runtime.
pub const TASK_ROOT: i32 = -1;
/// "Pick any free id" argument sentinel.
pub const TASK_ANY: i32 = -2;
/// "The calling task" argument sentinel.
pub const TASK_MYSELF: i32 = -3;

/// "All queued tasks" count sentinel for the bulk resume operations.
pub const TASK_ALL: i32 = -1;

// --- TaskState ---

/// Type-safe task state with explicit state-machine semantics.
///
/// `Invalid` and `Terminated` are arena bookkeeping values; a live task is
/// always `Running`, `Suspended`, or (transiently) `Exiting`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Arena slot is not in use.
    #[default]
    Invalid = 0,
    /// Task is executing, or dispatched and about to execute.
    Running = 1,
    /// Task is parked in some queue with a saved context.
    Suspended = 2,
    /// Task is running its exit protocol.
    Exiting = 3,
    /// Task has terminated; the slot awaits finalization.
    Terminated = 4,
}

impl TaskState {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Exiting,
            4 => Self::Terminated,
            _ => Self::Invalid,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Invalid => matches!(target, Self::Running | Self::Suspended),
            Self::Running => matches!(target, Self::Suspended | Self::Exiting),
            Self::Suspended => matches!(target, Self::Running),
            Self::Exiting => matches!(target, Self::Terminated),
            Self::Terminated => matches!(target, Self::Invalid),
        }
    }

    #[inline]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Suspended | Self::Exiting)
    }
}
