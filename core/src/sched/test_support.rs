//! Shared test scaffolding.
//!
//! The runtime is process-wide state and the libtest harness runs tests on
//! concurrent threads, so every test touching the runtime takes the fixture,
//! which serializes on a global mutex and brings the runtime up and down.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::spawn::{runtime_fin, runtime_init};
use super::task_struct::{set_task_current, uninstall_runtime};

static TEST_LOCK: Mutex<()> = Mutex::new(());

pub(crate) struct SchedFixture {
    _guard: MutexGuard<'static, ()>,
}

impl SchedFixture {
    pub(crate) fn new() -> Self {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        runtime_init().expect("runtime_init failed");
        Self { _guard: guard }
    }
}

impl Drop for SchedFixture {
    fn drop(&mut self) {
        // Give stragglers a moment to finish terminating before teardown.
        for _ in 0..200 {
            if runtime_fin().is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        // A failing test may strand live tasks; leak the runtime so their
        // backing threads keep referencing valid memory, and let the next
        // fixture start fresh.
        set_task_current(core::ptr::null_mut());
        if let Some(rt) = uninstall_runtime() {
            std::mem::forget(rt);
        }
    }
}
