//! Scheduler unit tests: state/flag round trips, resume permission rules,
//! the refcount discipline across a suspend/resume cycle, and basic task
//! lifecycle through the public surface.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use weft_abi::{SyncFlags, TASK_MYSELF, TaskError, TaskState};
use weft_lib::system_yield;

use super::scheduler::{
    dequeue_and_resume, get_aux, get_syncflag, get_task_by_pipid, resume, set_aux, set_syncflag,
    task_self, task_stat, yield_with,
};
use super::spawn::{task_spawn, task_wait};
use super::task_struct::TASK_ROOT;
use super::taskq::{EnqueueCallback, TaskQueue};
use super::test_support::SchedFixture;

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        system_yield();
    }
}

// =============================================================================
// Flag and accessor round trips
// =============================================================================

#[test]
fn sync_flag_round_trip() {
    let _fixture = SchedFixture::new();
    for flags in [
        SyncFlags::BUSYWAIT,
        SyncFlags::YIELD,
        SyncFlags::BLOCKING,
        SyncFlags::AUTO,
    ] {
        set_syncflag(flags).expect("set_syncflag");
        assert_eq!(get_syncflag().expect("get_syncflag"), flags);
    }
    // Unspecified resolves to AUTO.
    set_syncflag(SyncFlags::empty()).expect("empty selects AUTO");
    assert_eq!(get_syncflag().unwrap(), SyncFlags::AUTO);
}

#[test]
fn sync_flag_rejects_combinations() {
    let _fixture = SchedFixture::new();
    set_syncflag(SyncFlags::AUTO).unwrap();
    let err = set_syncflag(SyncFlags::BUSYWAIT | SyncFlags::BLOCKING).unwrap_err();
    assert_eq!(err, TaskError::InvalidArgument);
    // The latched value is untouched by the failed set.
    assert_eq!(get_syncflag().unwrap(), SyncFlags::AUTO);
}

#[test]
fn aux_round_trip() {
    let _fixture = SchedFixture::new();
    let marker = 0x5117_u64;
    let p = &marker as *const u64 as *mut c_void;
    set_aux(core::ptr::null_mut(), p).expect("set_aux");
    assert_eq!(get_aux(core::ptr::null_mut()).expect("get_aux"), p);
}

#[test]
fn pipid_resolution() {
    let _fixture = SchedFixture::new();
    let root = get_task_by_pipid(TASK_ROOT).expect("root resolves");
    assert_eq!(root, task_self());
    let me = get_task_by_pipid(TASK_MYSELF).expect("myself resolves");
    assert_eq!(me, task_self());
    assert_eq!(
        get_task_by_pipid(9999).unwrap_err(),
        TaskError::InvalidArgument
    );
    assert_eq!(
        get_task_by_pipid(0).unwrap_err(),
        TaskError::InvalidArgument,
        "unused slot is not a task"
    );
}

#[test]
fn yield_with_empty_queue_reports_no_switch() {
    let _fixture = SchedFixture::new();
    assert_eq!(yield_with(weft_abi::YieldFlags::USER), Ok(false));
}

// =============================================================================
// Basic lifecycle
// =============================================================================

extern "C" fn bump_counter(arg: *mut c_void) {
    let counter: *const AtomicU32 = arg.cast();
    unsafe { (*counter).fetch_add(1, Ordering::SeqCst) };
}

#[test]
fn spawn_runs_body_and_reports_status() {
    let _fixture = SchedFixture::new();
    let counter = Box::new(AtomicU32::new(0));
    let pipid = task_spawn(
        "bump",
        bump_counter,
        &*counter as *const AtomicU32 as *mut c_void,
    )
    .expect("spawn");
    assert_eq!(task_wait(pipid).expect("wait"), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let stat = task_stat(pipid).unwrap();
    assert_eq!(stat.state, TaskState::Terminated);
    assert_eq!(stat.refcount, 0);
}

extern "C" fn exit_with_seven(_arg: *mut c_void) {
    super::spawn::task_exit(7);
}

#[test]
fn explicit_exit_status_is_reported() {
    let _fixture = SchedFixture::new();
    let pipid = task_spawn("status", exit_with_seven, core::ptr::null_mut()).unwrap();
    assert_eq!(task_wait(pipid).unwrap(), 7);
}

// =============================================================================
// Resume permission rules
// =============================================================================

struct SpinCtl {
    release: AtomicBool,
}

extern "C" fn spin_until_released(arg: *mut c_void) {
    let ctl: *const SpinCtl = arg.cast();
    while !unsafe { (*ctl).release.load(Ordering::Acquire) } {
        system_yield();
    }
}

#[test]
fn resume_of_running_task_is_denied() {
    let _fixture = SchedFixture::new();
    let ctl = Box::new(SpinCtl {
        release: AtomicBool::new(false),
    });
    let pipid = task_spawn(
        "spinner",
        spin_until_released,
        &*ctl as *const SpinCtl as *mut c_void,
    )
    .unwrap();
    let task = get_task_by_pipid(pipid).unwrap();

    assert_eq!(
        resume(task, core::ptr::null_mut()),
        Err(TaskError::PermissionDenied)
    );

    ctl.release.store(true, Ordering::Release);
    assert_eq!(task_wait(pipid).unwrap(), 0);
}

#[test]
fn resume_of_self_is_a_successful_noop() {
    let _fixture = SchedFixture::new();
    assert_eq!(resume(task_self(), core::ptr::null_mut()), Ok(()));
}

#[test]
fn resume_of_null_is_invalid() {
    let _fixture = SchedFixture::new();
    assert_eq!(
        resume(core::ptr::null_mut(), core::ptr::null_mut()),
        Err(TaskError::InvalidArgument)
    );
}

// =============================================================================
// Suspend / resume refcount discipline
// =============================================================================

struct SuspendCtl {
    queue: TaskQueue,
    resumed: AtomicBool,
}

extern "C" fn suspend_once(arg: *mut c_void) {
    let ctl: *mut SuspendCtl = arg.cast();
    unsafe {
        // The task's own domain has no other runnable work, so this takes
        // the no-successor path and decouples into its own sleep loop.
        super::scheduler::suspend_and_enqueue(&mut (*ctl).queue, EnqueueCallback::None)
            .expect("suspend");
        (*ctl).resumed.store(true, Ordering::Release);
    }
}

#[test]
fn suspend_resume_restores_refcount() {
    let _fixture = SchedFixture::new();
    let mut ctl = Box::new(SuspendCtl {
        queue: TaskQueue::new(),
        resumed: AtomicBool::new(false),
    });
    ctl.queue.init();
    let arg = &mut *ctl as *mut SuspendCtl as *mut c_void;
    let pipid = task_spawn("sleeper", suspend_once, arg).unwrap();

    wait_until(|| ctl.queue.len() == 1);
    let stat = task_stat(pipid).unwrap();
    assert_eq!(stat.state, TaskState::Suspended);
    // The suspended task is its own scheduler; it carries the obligation.
    assert_eq!(stat.refcount, 1);
    assert!(!ctl.resumed.load(Ordering::Acquire));

    dequeue_and_resume(&mut ctl.queue, core::ptr::null_mut()).expect("resume");
    assert_eq!(task_wait(pipid).unwrap(), 0);
    assert!(ctl.resumed.load(Ordering::Acquire));
    assert_eq!(task_stat(pipid).unwrap().refcount, 0);
}

#[test]
fn dequeue_from_empty_queue_is_not_found() {
    let _fixture = SchedFixture::new();
    let mut queue = Box::new(TaskQueue::new());
    queue.init();
    assert_eq!(
        dequeue_and_resume(&mut *queue, core::ptr::null_mut()),
        Err(TaskError::NotFound)
    );
}
