//! Sync-discipline and yield flag sets.

use bitflags::bitflags;

bitflags! {
    /// Parking discipline for an idle scheduler.
    ///
    /// Exactly one of the four bits may be selected; empty means AUTO.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        /// Spin on the wakeup flag with CPU relaxation.
        const BUSYWAIT = 0x01;
        /// Relax-read bursts separated by a system yield.
        const YIELD    = 0x02;
        /// Park on the sleep semaphore.
        const BLOCKING = 0x04;
        /// Adaptive: bounded YIELD rounds, then fall through to BLOCKING.
        const AUTO     = 0x08;
    }
}

impl SyncFlags {
    pub const MASK: SyncFlags = SyncFlags::all();

    /// Validates a user-supplied flag set, resolving "unspecified" to AUTO.
    /// More than one discipline bit is invalid.
    pub fn checked(self) -> Option<SyncFlags> {
        let masked = self & Self::MASK;
        if masked != self {
            return None;
        }
        match masked.bits().count_ones() {
            0 => Some(SyncFlags::AUTO),
            1 => Some(masked),
            _ => None,
        }
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        SyncFlags::AUTO
    }
}

bitflags! {
    /// What `yield_with` should give up.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct YieldFlags: u32 {
        /// Let the host OS reschedule the current thread.
        const SYSTEM = 0x01;
        /// Rotate the caller to the tail of its scheduler's runnable queue.
        const USER   = 0x02;
    }
}

impl YieldFlags {
    /// Empty flags select both system and user yield.
    #[inline]
    pub fn wants_system(self) -> bool {
        self.is_empty() || self.contains(YieldFlags::SYSTEM)
    }

    #[inline]
    pub fn wants_user(self) -> bool {
        self.is_empty() || self.contains(YieldFlags::USER)
    }
}
