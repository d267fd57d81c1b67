//! Counting semaphore.
//!
//! The blocking sleep primitive: an idle scheduler parks here and a waker
//! posts. Posts accumulate, so a post that races ahead of the wait is never
//! lost. Built on `Mutex` + `Condvar`; the permit count is what carries the
//! wakeup, the condvar only sleeps the thread.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Add one permit and wake a waiter if any.
    pub fn post(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits = permits.saturating_add(1);
        drop(permits);
        self.cond.notify_one();
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
    }

    /// Consume a permit if one is available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Drop any accumulated permits (used when recycling a task slot).
    pub fn drain(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits = 0;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
