//! Runtime bring-up, task spawning, and teardown.
//!
//! Thread backing: every spawned task gets one OS thread. An *active* spawn
//! runs its body directly on that thread; a *scheduled* (BLT) spawn prepares
//! its body context on an allocated stack, hands the task to its scheduler
//! via OOD enqueue, and parks the backing thread in the task's own domain
//! loop, ready to take the body back on `couple()` and to drive final
//! termination.
//!
//! Each backing thread saves a host context at startup; `terminate_task`
//! re-enters it so the thread unwinds normally.

use core::ffi::c_void;
use core::sync::atomic::Ordering;
use std::thread;

use weft_abi::{SyncFlags, TaskError, TaskResult, TaskState};
use weft_lib::rlog;

use super::context::{enter_sleep_loop, post_switch};
use super::namexp;
use super::scheduler::{check_pipid, do_exit, sched_ood_enqueue, wakeup};
use super::switch_asm::{SwitchContext, init_current_context, make_entry_context};
use super::task_struct::{
    MAX_TASKS, Runtime, SLEEP_STACK_SIZE, StackStorage, TASK_STACK_SIZE, Task, install_runtime,
    runtime, set_host_context, set_task_current, task_current, uninstall_runtime,
};

pub use super::task_struct::TaskEntry;

fn sync_default_from_env() -> SyncFlags {
    match std::env::var("WEFT_SYNC").as_deref() {
        Ok("busywait") => SyncFlags::BUSYWAIT,
        Ok("yield") => SyncFlags::YIELD,
        Ok("blocking") => SyncFlags::BLOCKING,
        Ok("auto") => SyncFlags::AUTO,
        _ => SyncFlags::AUTO,
    }
}

fn yield_iters_from_env() -> u32 {
    std::env::var("WEFT_YIELD_ITERS")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(100)
}

/// Log-attribution probe: name the task the current flow is executing.
fn log_context() -> Option<i32> {
    let taski = task_current();
    if taski.is_null() {
        None
    } else {
        Some(unsafe { (*taski).pipid })
    }
}

/// Turn the calling thread into the root task and install the process-wide
/// runtime. Fails with `Busy` when a runtime is already installed.
pub fn runtime_init() -> TaskResult {
    rlog::init_from_env();
    rlog::set_context_probe(log_context);
    let opts = sync_default_from_env();
    let rt = Box::new(Runtime::new(yield_iters_from_env(), opts));

    let root = rt.root_ptr();
    unsafe {
        (*root).node.init();
        (*root).schedq.init();
        (*root).oodq.init();
        (*root).sched.store(root, Ordering::Release);
        (*root).opts.store(opts.bits(), Ordering::Release);
        (*root).opts_sync.store(opts.bits(), Ordering::Release);
        (*root).sleep_stack = StackStorage::alloc(SLEEP_STACK_SIZE).ok_or(TaskError::NoMemory)?;
        (*root).force_state(TaskState::Running);
        namexp::named_export_init(root);
    }

    if !install_runtime(rt) {
        return Err(TaskError::Busy);
    }
    set_task_current(runtime_root());
    rlog!(Debug, "runtime up ({} task slots)", MAX_TASKS);
    Ok(())
}

fn runtime_root() -> *mut Task {
    let rt = runtime();
    debug_assert!(!rt.is_null());
    unsafe { (*rt).root_ptr() }
}

unsafe fn init_slot(
    taski: *mut Task,
    name: &str,
    entry: TaskEntry,
    arg: *mut c_void,
    needs_body_stack: bool,
) -> TaskResult {
    unsafe {
        let rt = runtime();
        let opts = (*rt).opts_default.load(Ordering::Acquire);

        (*taski).node.init();
        (*taski).schedq.init();
        (*taski).oodq.init();
        (*taski).refcount.store(0, Ordering::Release);
        (*taski).flag_wakeup.store(false, Ordering::Release);
        (*taski).flag_exit.store(false, Ordering::Release);
        (*taski).wakeup_deferred.store(core::ptr::null_mut(), Ordering::Release);
        (*taski).flag_stackp.store(false, Ordering::Release);
        (*taski).stk_owner.store(core::ptr::null_mut(), Ordering::Release);
        (*taski).coupled_sched.store(core::ptr::null_mut(), Ordering::Release);
        (*taski).opts.store(opts, Ordering::Release);
        (*taski).opts_sync.store(opts, Ordering::Release);
        (*taski).exit_status.store(0, Ordering::Release);
        (*taski).set_name(name);
        (*taski).entry = Some(entry);
        (*taski).entry_arg = arg;

        (*taski).sleep_stack =
            StackStorage::alloc(SLEEP_STACK_SIZE).ok_or(TaskError::NoMemory)?;
        if needs_body_stack {
            (*taski).body_stack =
                StackStorage::alloc(TASK_STACK_SIZE).ok_or(TaskError::NoMemory)?;
        }
        namexp::named_export_init(taski);
        Ok(())
    }
}

fn release_slot(taski: *mut Task) {
    unsafe {
        namexp::named_export_destroy(taski);
        (*taski).body_stack.release();
        (*taski).sleep_stack.release();
        (*taski).force_state(TaskState::Invalid);
    }
}

// Backing-thread wrappers.
//
// The wrapper saves a host context in its own frame and then makes the task
// flow its LAST call at this stack depth. `terminate_task` re-enters the
// saved context, which resumes at the call's return slot, i.e. right after
// that last call, so the wrapper (and the thread) unwinds normally. The
// flow functions are `#[inline(never)]` and typed as returning so the
// compiler keeps that continuation; nothing else may be called at wrapper
// depth after `init_current_context`.

fn host_thread_active(taski: *mut Task) {
    let mut host = SwitchContext::zero();
    set_host_context(&mut host);
    init_current_context(&mut host);
    run_active_flow(taski);
    // Reached only via terminate_task re-entering `host`.
}

fn host_thread_scheduled(taski: *mut Task) {
    let mut host = SwitchContext::zero();
    set_host_context(&mut host);
    init_current_context(&mut host);
    run_scheduled_flow(taski);
    // Reached only via terminate_task re-entering `host`.
}

// The null guards keep these functions returning in the eyes of the
// optimizer; without a returning path it may prove them noreturn and drop
// the wrapper continuation the host context resumes into.

#[inline(never)]
fn run_active_flow(taski: *mut Task) {
    if taski.is_null() {
        return;
    }
    set_task_current(taski);
    unsafe {
        let entry = (*taski).entry.expect("active task without entry");
        let arg = (*taski).entry_arg;
        entry(arg);
        do_exit(taski);
    }
}

#[inline(never)]
fn run_scheduled_flow(taski: *mut Task) {
    if taski.is_null() {
        return;
    }
    set_task_current(taski);
    unsafe { enter_sleep_loop(taski) }
}

/// Body entry for scheduled spawns, dispatched through the trampoline on
/// the task's own stack.
extern "C" fn scheduled_body_entry(arg: *mut c_void) {
    let taski: *mut Task = arg.cast();
    unsafe {
        // First act on our own stack: release the dispatcher's predecessor
        // and fire any deferred wakeup aimed at us.
        post_switch(taski);
        let entry = (*taski).entry.expect("scheduled task without entry");
        entry((*taski).entry_arg);
    }
    // Returning lands in the trampoline's exit path.
}

struct SendPtr(*mut Task);
// SAFETY: task records live in the arena for the runtime's lifetime.
unsafe impl Send for SendPtr {}

fn spawn_backing_thread(
    taski: *mut Task,
    name: &str,
    body: fn(*mut Task),
) -> TaskResult<thread::JoinHandle<()>> {
    let carried = SendPtr(taski);
    thread::Builder::new()
        .name(format!("weft-{name}"))
        .spawn(move || {
            let carried = carried;
            body(carried.0)
        })
        .map_err(|_| TaskError::NoMemory)
}

fn reserve_and_init(
    name: &str,
    entry: TaskEntry,
    arg: *mut c_void,
    needs_body_stack: bool,
) -> TaskResult<(i32, *mut Task)> {
    let rt = runtime();
    if rt.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    let idx = unsafe { (*rt).reserve_slot() }.ok_or(TaskError::TooManyTasks)?;
    let taski = unsafe { (*rt).task_ptr(idx) };
    if let Err(err) = unsafe { init_slot(taski, name, entry, arg, needs_body_stack) } {
        release_slot(taski);
        return Err(err);
    }
    Ok((idx as i32, taski))
}

/// Spawn a self-scheduling task: its backing thread runs the body directly.
pub fn task_spawn(name: &str, entry: TaskEntry, arg: *mut c_void) -> TaskResult<i32> {
    if task_current().is_null() {
        return Err(TaskError::PermissionDenied);
    }
    let (pipid, taski) = reserve_and_init(name, entry, arg, false)?;
    unsafe {
        (*taski).sched.store(taski, Ordering::Release);
        (*taski).force_state(TaskState::Running);
    }
    match spawn_backing_thread(taski, name, host_thread_active) {
        Ok(handle) => {
            unsafe { *(*taski).join.lock() = Some(handle) };
            rlog!(Debug, "spawned task {} ('{}')", pipid, name);
            Ok(pipid)
        }
        Err(err) => {
            release_slot(taski);
            Err(err)
        }
    }
}

/// Spawn a task scheduled under `sched_pipid`'s domain: the body runs
/// cooperatively there, handed over via OOD enqueue; the backing thread
/// parks in the task's own domain loop.
pub fn task_spawn_under(
    name: &str,
    entry: TaskEntry,
    arg: *mut c_void,
    sched_pipid: i32,
) -> TaskResult<i32> {
    let caller = task_current();
    if caller.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    let schedi = check_pipid(sched_pipid)?;
    unsafe {
        if !(*schedi).is_alive() || (*schedi).flag_exit.load(Ordering::Acquire) {
            return Err(TaskError::Busy);
        }
    }

    let (pipid, taski) = reserve_and_init(name, entry, arg, true)?;
    unsafe {
        let ctx = make_entry_context(
            scheduled_body_entry,
            taski.cast(),
            (*taski).body_stack.top(),
        );
        *(*taski).ctx_suspend.get() = ctx;
        (*taski).force_state(TaskState::Running);
    }

    let handle = match spawn_backing_thread(taski, name, host_thread_scheduled) {
        Ok(handle) => handle,
        Err(err) => {
            release_slot(taski);
            return Err(err);
        }
    };
    unsafe {
        *(*taski).join.lock() = Some(handle);
        if sched_ood_enqueue(schedi, taski) && schedi != caller {
            wakeup(schedi);
        }
    }
    rlog!(Debug, "spawned task {} ('{}') under sched {}", pipid, name, sched_pipid);
    Ok(pipid)
}

/// Explicit exit with a status code. Normal return from a task body takes
/// the same path with status 0.
pub fn task_exit(status: i32) -> ! {
    let taski = task_current();
    if taski.is_null() {
        rlog!(Error, "task_exit from a non-task thread");
        std::process::exit(status);
    }
    unsafe {
        (*taski).exit_status.store(status, Ordering::Release);
        do_exit(taski)
    }
}

/// Block until the target task terminates; returns its exit status. One
/// waiter per task. The caller's OS thread parks, so the target must be
/// able to make progress without the caller's cooperation.
pub fn task_wait(pipid: i32) -> TaskResult<i32> {
    let taski = task_current();
    if taski.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    if pipid < 0 {
        return Err(TaskError::InvalidArgument);
    }
    let target = check_pipid(pipid)?;
    if target == taski {
        return Err(TaskError::Deadlock);
    }
    unsafe {
        (*target).exit_sem.wait();
        Ok((*target).exit_status.load(Ordering::Acquire))
    }
}

/// Tear the runtime down. Only the root may call this, and only once every
/// spawned task has terminated.
pub fn runtime_fin() -> TaskResult {
    let rt = runtime();
    if rt.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    let taski = task_current();
    unsafe {
        if taski != (*rt).root_ptr() {
            return Err(TaskError::PermissionDenied);
        }
        if (*rt).live_tasks() > 0 {
            return Err(TaskError::Busy);
        }

        for i in 0..MAX_TASKS {
            let slot = (*rt).task_ptr(i);
            let handle = (*slot).join.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            namexp::named_export_destroy(slot);
        }
        namexp::named_export_fin((*rt).root_ptr());
        namexp::named_export_destroy((*rt).root_ptr());
    }

    set_task_current(core::ptr::null_mut());
    drop(uninstall_runtime());
    rlog!(Debug, "runtime down");
    Ok(())
}
