//! Higher-level context operations and the stack-protect handshake.
//!
//! The protocol that keeps a suspending task's stack single-writer: before
//! `t` publishes itself to any queue it arms `flag_stackp` on itself and
//! records itself as `stk_owner` on its successor. The successor's first act
//! on reaching its own stack (`post_switch`) is to clear that flag; anyone
//! who wants to enter `t`'s saved context (or tear its stack down) spins
//! on the flag first.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{Ordering, fence};

use weft_lib::cpu_relax;

use super::scheduler::{sleep_loop_entry, wakeup};
use super::switch_asm::{SwitchContext, make_entry_context, switch_registers};
use super::task_struct::{Task, set_task_current};

/// Arm the protect pair: `t` is about to publish itself; `successor` will
/// release it after the switch off `t`'s stack completes.
///
/// # Safety
/// Both pointers must be live task records; `t` must be the task executing
/// on the current flow.
pub unsafe fn stack_protect(t: *mut Task, successor: *mut Task) {
    unsafe {
        debug_assert!((*successor).stk_owner.load(Ordering::Relaxed).is_null());
        (*t).flag_stackp.store(true, Ordering::Release);
        (*successor).stk_owner.store(t, Ordering::Release);
    }
}

/// Release the recorded predecessor, if any.
///
/// # Safety
/// `me` must be the task (or scheduler) now executing on its own stack.
pub unsafe fn stack_unprotect(me: *mut Task) {
    let owner = unsafe { (*me).stk_owner.swap(ptr::null_mut(), Ordering::AcqRel) };
    if !owner.is_null() {
        fence(Ordering::SeqCst);
        unsafe { (*owner).flag_stackp.store(false, Ordering::Release) };
    }
}

/// Spin until `t`'s stack is no longer in flight.
///
/// # Safety
/// `t` must be a live task record.
pub unsafe fn stack_wait(t: *mut Task) {
    while unsafe { (*t).flag_stackp.load(Ordering::Acquire) } {
        cpu_relax();
    }
}

/// Release the predecessor and carry out the deferred wakeup, in that
/// order: the woken party may immediately try to enter the predecessor's
/// context.
///
/// # Safety
/// `me` must be the task whose flow just reached its own stack.
pub unsafe fn post_switch(me: *mut Task) {
    unsafe {
        stack_unprotect(me);
        let deferred = (*me).wakeup_deferred.swap(ptr::null_mut(), Ordering::AcqRel);
        if !deferred.is_null() {
            wakeup(deferred);
        }
    }
}

/// Swap to a peer: save `t`'s context, enter `next`'s. `t` resumes here
/// when some dispatcher enters its saved context again.
///
/// # Safety
/// `t` must be the task executing on this flow; `next` must hold a valid
/// saved (or fresh) context not being entered by anyone else.
pub unsafe fn swap_ctx(t: *mut Task, next: *mut Task) {
    unsafe {
        set_task_current(next);
        stack_wait(next);
        switch_registers((*t).ctx_suspend.get(), (*next).ctx_suspend.get());
        // t is running again, on whichever thread resumed it.
        post_switch(t);
    }
}

/// Enter a peer's saved context without saving the current flow (the sleep
/// loop abandoning its frames).
///
/// # Safety
/// As `swap_ctx`; the current flow must be disposable.
pub unsafe fn jump_ctx(next: *mut Task) -> ! {
    unsafe {
        set_task_current(next);
        stack_wait(next);
        switch_registers(ptr::null_mut(), (*next).ctx_suspend.get());
    }
    unreachable!("switch with null prev returned");
}

fn sleep_entry_context(sched: *mut Task) -> SwitchContext {
    // SAFETY: the sleep stack is exclusively owned by `sched`'s domain and
    // the caller is its current host (see decouple_ctx / enter_sleep_loop).
    unsafe {
        make_entry_context(
            sleep_loop_entry,
            sched as *mut c_void,
            (*sched).sleep_stack.top(),
        )
    }
}

/// Save `t` and hand the CPU to scheduler `sched`, whose sleep loop starts
/// fresh at the top of its sleep stack.
///
/// # Safety
/// `t` must be the task executing on this flow, and this flow must be the
/// current host of `sched`'s domain.
pub unsafe fn decouple_ctx(t: *mut Task, sched: *mut Task) {
    unsafe {
        set_task_current(sched);
        let entry = sleep_entry_context(sched);
        switch_registers((*t).ctx_suspend.get(), &entry);
        // t is running again.
        post_switch(t);
    }
}

/// Enter `sched`'s sleep loop, abandoning the current flow entirely.
///
/// # Safety
/// This flow must be the current host of `sched`'s domain and must be
/// disposable (fresh backing thread, or a terminating flow).
pub unsafe fn enter_sleep_loop(sched: *mut Task) -> ! {
    set_task_current(sched);
    let entry = sleep_entry_context(sched);
    switch_registers(ptr::null_mut(), &entry);
    unreachable!("switch with null prev returned");
}
