//! Named export/import unit tests: round trips, one-shot publish rules,
//! the non-blocking miss paths, and cancellation at task exit.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use weft_abi::{TASK_MYSELF, TaskError};
use weft_lib::system_yield;

use super::namexp::{named_export, named_import, named_tryimport};
use super::spawn::{task_spawn, task_wait};
use super::test_support::SchedFixture;

static ANSWER: u32 = 42;

fn answer_ptr() -> *mut c_void {
    &ANSWER as *const u32 as *mut c_void
}

#[test]
fn export_then_tryimport_self_round_trips() {
    let _fixture = SchedFixture::new();
    named_export(answer_ptr(), "answer").expect("export");
    let got = named_tryimport(TASK_MYSELF, "answer").expect("tryimport");
    assert_eq!(got, answer_ptr());
    let value = unsafe { *(got as *const u32) };
    assert_eq!(value, 42);
}

#[test]
fn export_is_one_shot() {
    let _fixture = SchedFixture::new();
    named_export(answer_ptr(), "once").expect("first export");
    assert_eq!(
        named_export(answer_ptr(), "once").unwrap_err(),
        TaskError::Busy
    );
}

#[test]
fn self_import_of_unknown_name_deadlocks() {
    let _fixture = SchedFixture::new();
    assert_eq!(
        named_tryimport(TASK_MYSELF, "never-exported").unwrap_err(),
        TaskError::Deadlock
    );
    assert_eq!(
        named_import(TASK_MYSELF, "never-exported").unwrap_err(),
        TaskError::Deadlock
    );
}

struct ExportCtl {
    exported: AtomicBool,
    release: AtomicBool,
}

extern "C" fn export_and_linger(arg: *mut c_void) {
    let ctl: *const ExportCtl = arg.cast();
    named_export(answer_ptr(), "shared").expect("export in task");
    unsafe {
        (*ctl).exported.store(true, Ordering::Release);
        while !(*ctl).release.load(Ordering::Acquire) {
            system_yield();
        }
    }
}

#[test]
fn tryimport_misses_with_would_block() {
    let _fixture = SchedFixture::new();
    let ctl = Box::new(ExportCtl {
        exported: AtomicBool::new(false),
        release: AtomicBool::new(false),
    });
    let pipid = task_spawn(
        "exporter",
        export_and_linger,
        &*ctl as *const ExportCtl as *mut c_void,
    )
    .unwrap();

    while !ctl.exported.load(Ordering::Acquire) {
        system_yield();
    }
    assert_eq!(named_tryimport(pipid, "shared").unwrap(), answer_ptr());
    assert_eq!(
        named_tryimport(pipid, "unpublished").unwrap_err(),
        TaskError::WouldBlock
    );

    ctl.release.store(true, Ordering::Release);
    assert_eq!(task_wait(pipid).unwrap(), 0);
}

extern "C" fn exit_without_export(arg: *mut c_void) {
    let armed: *const AtomicBool = arg.cast();
    // Give the importer a window to park first; either interleaving must
    // surface Canceled.
    while !unsafe { (*armed).load(Ordering::Acquire) } {
        system_yield();
    }
    std::thread::sleep(Duration::from_millis(50));
}

#[test]
fn blocking_import_is_canceled_by_owner_exit() {
    let _fixture = SchedFixture::new();
    let armed = Box::new(AtomicBool::new(false));
    let pipid = task_spawn(
        "quitter",
        exit_without_export,
        &*armed as *const AtomicBool as *mut c_void,
    )
    .unwrap();

    armed.store(true, Ordering::Release);
    // Parks until the owner's finalizer cancels the queried entry (or, if
    // the owner already finalized, observes the closed table).
    let err = named_import(pipid, "never-coming").unwrap_err();
    assert_eq!(err, TaskError::Canceled);
    assert_eq!(task_wait(pipid).unwrap(), 0);
}

#[test]
fn import_from_unused_slot_is_invalid() {
    let _fixture = SchedFixture::new();
    assert_eq!(
        named_tryimport(0, "anything").unwrap_err(),
        TaskError::InvalidArgument
    );
}

extern "C" fn import_blocking(arg: *mut c_void) {
    let seen: *const AtomicUsize = arg.cast();
    // Count only a successful rendezvous with the right value; the root
    // asserts the total.
    if named_import(weft_abi::TASK_ROOT, "late") == Ok(answer_ptr()) {
        unsafe { (*seen).fetch_add(1, Ordering::SeqCst) };
    }
}

#[test]
fn late_export_wakes_blocking_importers() {
    let _fixture = SchedFixture::new();
    let seen = Box::new(AtomicUsize::new(0));
    let arg = &*seen as *const AtomicUsize as *mut c_void;
    let first = task_spawn("importer-a", import_blocking, arg).unwrap();
    let second = task_spawn("importer-b", import_blocking, arg).unwrap();

    // Let both reach the rendezvous (one installs the queried entry, the
    // other parks on the secondary queue), then publish from the root.
    std::thread::sleep(Duration::from_millis(50));
    named_export(answer_ptr(), "late").expect("export");

    assert_eq!(task_wait(first).unwrap(), 0);
    assert_eq!(task_wait(second).unwrap(), 0);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    // The published entry survives: a later import sees it directly.
    assert_eq!(named_tryimport(weft_abi::TASK_ROOT, "late").unwrap(), answer_ptr());
}
