//! Scheduler core: OOD intake, the sleep/dispatch loop, suspend/resume,
//! yield, couple/decouple, and the termination protocol.
//!
//! One domain (one scheduling task) is single-threaded: its `schedq` is
//! touched only by the flow currently hosting the domain, so it needs no
//! lock. The only cross-domain edges are the OOD inbox (under `oodq_lock`)
//! and `wakeup`.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{Ordering, fence};
use std::io::Write;

use weft_abi::{SyncFlags, TASK_ALL, TaskError, TaskResult, TaskState, YieldFlags};
use weft_lib::{cpu_relax, system_yield};
use weft_lib::rlog;

use super::context::{decouple_ctx, jump_ctx, post_switch, stack_protect, stack_wait, swap_ctx};
use super::namexp;
use super::switch_asm::switch_registers;
use super::task_struct::{
    MAX_TASKS, Runtime, TASK_MYSELF, TASK_ROOT, Task, host_context, runtime, task_current,
};
use super::taskq::{EnqueueCallback, TaskQueue};

// =============================================================================
// Helpers
// =============================================================================

#[inline]
fn runtime_ref() -> TaskResult<*mut Runtime> {
    let rt = runtime();
    if rt.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    Ok(rt)
}

#[inline]
fn current_or_perm() -> TaskResult<*mut Task> {
    let taski = task_current();
    if taski.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    Ok(taski)
}

/// Resolve a user-supplied id to a task record. Sentinels: `TASK_ROOT`
/// resolves to the root, `TASK_MYSELF` to the caller. The slot must be in
/// use (any live or terminated state).
pub(crate) fn check_pipid(pipid: i32) -> TaskResult<*mut Task> {
    let rt = runtime_ref()?;
    let taski = task_current();
    unsafe {
        match pipid {
            TASK_ROOT => Ok((*rt).root_ptr()),
            TASK_MYSELF => {
                if taski.is_null() {
                    Err(TaskError::PermissionDenied)
                } else {
                    Ok(taski)
                }
            }
            id if id >= 0 && (id as usize) < MAX_TASKS => {
                let t = (*rt).task_ptr(id as usize);
                if (*t).state() == TaskState::Invalid {
                    Err(TaskError::InvalidArgument)
                } else {
                    Ok(t)
                }
            }
            _ => Err(TaskError::InvalidArgument),
        }
    }
}

// =============================================================================
// OOD handoff
// =============================================================================

/// Hand `taski` to another scheduling domain: stamp its scheduler and
/// append to the target's inbox. Returns true when the inbox was previously
/// empty, i.e. the target may be sleeping and needs a wakeup.
pub(crate) unsafe fn sched_ood_enqueue(schedi: *mut Task, taski: *mut Task) -> bool {
    unsafe {
        rlog!(
            Trace,
            "ood: task {} -> sched {}",
            (*taski).pipid,
            (*schedi).pipid
        );
        (*taski).sched.store(schedi, Ordering::Release);
        (*schedi).oodq_lock.lock();
        let was_empty = (*schedi).oodq.is_empty();
        (*schedi).oodq.enqueue(taski);
        (*schedi).oodq_lock.unlock();
        was_empty
    }
}

/// Splice the OOD inbox onto the runnable queue. Returns true iff the
/// runnable queue is non-empty afterwards.
pub(crate) unsafe fn takein_ood(schedi: *mut Task) -> bool {
    unsafe {
        (*schedi).oodq_lock.lock();
        if !(*schedi).oodq.is_empty() {
            let oodq = &mut (*schedi).oodq as *mut TaskQueue;
            (*schedi).schedq.append(&mut *oodq);
        }
        (*schedi).oodq_lock.unlock();
        !(*schedi).schedq.is_empty()
    }
}

/// Intake OOD work and pop the next runnable task, if any.
unsafe fn schedq_next(schedi: *mut Task) -> *mut Task {
    unsafe {
        if takein_ood(schedi) {
            (*schedi).schedq.dequeue()
        } else {
            ptr::null_mut()
        }
    }
}

// =============================================================================
// Sleep / wakeup
// =============================================================================

unsafe fn do_sleep(taski: *mut Task) {
    unsafe {
        let rt = runtime();
        debug_assert!(!rt.is_null());
        let opts = SyncFlags::from_bits_truncate((*taski).opts.load(Ordering::Acquire));
        (*taski).opts_sync.store(opts.bits(), Ordering::Release);
        let yield_iters = (*rt).yield_iters;

        (*rt).deadlock_count.fetch_add(1, Ordering::AcqRel);
        rlog!(Trace, "task {} sleeping ({:?})", (*taski).pipid, opts);

        let flag = &(*taski).flag_wakeup;
        if opts == SyncFlags::BUSYWAIT {
            while !flag.load(Ordering::Acquire) {
                cpu_relax();
            }
        } else if opts == SyncFlags::YIELD {
            'outer: loop {
                for _ in 0..yield_iters {
                    cpu_relax();
                    if flag.load(Ordering::Acquire) {
                        break 'outer;
                    }
                }
                system_yield();
            }
        } else if opts == SyncFlags::BLOCKING {
            while !flag.load(Ordering::Acquire) {
                (*taski).sleep_sem.wait();
            }
        } else {
            // AUTO / unspecified: bounded yield rounds, then block.
            let mut woken = false;
            'auto: for _ in 0..100 {
                system_yield();
                for _ in 0..yield_iters {
                    if flag.load(Ordering::Acquire) {
                        woken = true;
                        break 'auto;
                    }
                }
            }
            if !woken {
                while !flag.load(Ordering::Acquire) {
                    (*taski).sleep_sem.wait();
                }
            }
        }

        (*rt).deadlock_count.fetch_sub(1, Ordering::AcqRel);
        flag.store(false, Ordering::Release);
        fence(Ordering::SeqCst);
        rlog!(Trace, "task {} woke", (*taski).pipid);
    }
}

/// Wake a sleeping scheduler. Idempotent within one sleep episode.
pub(crate) fn wakeup(taski: *mut Task) {
    unsafe {
        if (*taski).flag_wakeup.load(Ordering::Acquire) {
            return;
        }
        fence(Ordering::SeqCst);
        (*taski).flag_wakeup.store(true, Ordering::Release);
        let opts = SyncFlags::from_bits_truncate((*taski).opts_sync.load(Ordering::Acquire));
        if opts != SyncFlags::BUSYWAIT && opts != SyncFlags::YIELD {
            (*taski).sleep_sem.post();
        }
    }
}

pub(crate) unsafe fn able_to_terminate_now(taski: *mut Task) -> bool {
    unsafe {
        (*taski).flag_exit.load(Ordering::Acquire)
            && (*taski).schedq.is_empty()
            && (*taski).oodq.is_empty()
            && (*taski).refcount.load(Ordering::Acquire) == 0
    }
}

/// The domain loop: release the predecessor, wait for work (or for the
/// exit condition), then dispatch the head of the runnable queue.
///
/// Every entry starts fresh at the top of the owning task's sleep stack;
/// dispatching abandons the frames, and the next decouple rebuilds them.
pub(crate) unsafe fn sleep_loop(schedi: *mut Task) -> ! {
    unsafe {
        post_switch(schedi);
        loop {
            if takein_ood(schedi) {
                break;
            }
            if (*schedi).flag_exit.load(Ordering::Acquire)
                && (*schedi).refcount.load(Ordering::Acquire) == 0
            {
                rlog!(Debug, "sched {} woke to exit", (*schedi).pipid);
                stack_wait(schedi);
                terminate_task(schedi);
            }
            do_sleep(schedi);
        }
        let next = (*schedi).schedq.dequeue();
        debug_assert!(!next.is_null());
        rlog!(Trace, "sched {} ==>> task {}", (*schedi).pipid, (*next).pipid);
        jump_ctx(next)
    }
}

/// Trampoline-compatible entry for `sleep_loop`.
pub extern "C" fn sleep_loop_entry(arg: *mut c_void) {
    unsafe { sleep_loop(arg.cast()) }
}

// =============================================================================
// Suspend and enqueue
// =============================================================================

unsafe fn enqueue_task(
    taski: *mut Task,
    queue: *mut TaskQueue,
    flag_lock: bool,
    callback: EnqueueCallback,
) {
    unsafe {
        if flag_lock {
            (*queue).lock();
            (*queue).enqueue(taski);
            (*queue).unlock();
            match callback {
                EnqueueCallback::Call(f, arg) => f(arg),
                EnqueueCallback::None | EnqueueCallback::UnlockQueue => {}
            }
        } else {
            (*queue).enqueue_with(taski, callback);
        }
    }
}

pub(crate) unsafe fn suspend_and_enqueue_generic(
    taski: *mut Task,
    queue: *mut TaskQueue,
    flag_lock: bool,
    callback: EnqueueCallback,
) {
    unsafe {
        let schedi = (*taski).sched_ptr();
        debug_assert!(!schedi.is_null());
        let nexti = schedq_next(schedi);

        (*taski).set_state(TaskState::Suspended);
        (*schedi).refcount.fetch_add(1, Ordering::AcqRel);
        rlog!(
            Trace,
            "suspend task {} (sched {} rfc {})",
            (*taski).pipid,
            (*schedi).pipid,
            (*schedi).refcount.load(Ordering::Relaxed)
        );

        if !nexti.is_null() {
            // Context-switch to the next runnable task. The enqueue must
            // happen after the protect arming: a resumer that pops `taski`
            // spins until `nexti` has left this stack.
            stack_protect(taski, nexti);
            enqueue_task(taski, queue, flag_lock, callback);
            swap_ctx(taski, nexti);
        } else {
            // Nothing to dispatch: hand the CPU to the scheduler's loop.
            stack_protect(taski, schedi);
            enqueue_task(taski, queue, flag_lock, callback);
            decouple_ctx(taski, schedi);
        }
        // taski has been resumed.
    }
}

/// Suspend the caller and place it on `queue` under the queue's own lock.
pub fn suspend_and_enqueue(queue: *mut TaskQueue, callback: EnqueueCallback) -> TaskResult {
    let taski = current_or_perm()?;
    if queue.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    unsafe {
        if (*taski).is_suspended() {
            return Err(TaskError::PermissionDenied);
        }
        suspend_and_enqueue_generic(taski, queue, true, callback);
    }
    Ok(())
}

/// As `suspend_and_enqueue`, but the caller already holds the queue lock
/// (typically released via `EnqueueCallback`).
pub fn suspend_and_enqueue_nolock(queue: *mut TaskQueue, callback: EnqueueCallback) -> TaskResult {
    let taski = current_or_perm()?;
    if queue.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    unsafe {
        if (*taski).is_suspended() {
            return Err(TaskError::PermissionDenied);
        }
        suspend_and_enqueue_generic(taski, queue, false, callback);
    }
    Ok(())
}

// =============================================================================
// Resume
// =============================================================================

pub(crate) unsafe fn do_resume(resumed: *mut Task, schedi: *mut Task) -> TaskResult {
    unsafe {
        let taski = current_or_perm()?;
        if taski == resumed {
            return Ok(());
        }
        if !(*resumed).is_suspended() {
            return Err(TaskError::PermissionDenied);
        }

        let sched_curr = (*resumed).sched_ptr();
        let sched_new = if schedi.is_null() {
            debug_assert!(!sched_curr.is_null());
            sched_curr
        } else {
            if (*schedi).flag_exit.load(Ordering::Acquire) {
                return Err(TaskError::Busy);
            }
            schedi
        };

        (*resumed).set_state(TaskState::Running);

        if sched_new == (*taski).sched_ptr() {
            // Same scheduling domain as the caller: straight onto the
            // runnable queue this flow owns.
            rlog!(Trace, "resume(self-domain): {}/{}", (*resumed).pipid, (*sched_new).pipid);
            (*sched_new).schedq.enqueue(resumed);
            (*resumed).sched.store(sched_new, Ordering::Release);
        } else {
            rlog!(Trace, "resume(ood): {}/{}", (*resumed).pipid, (*sched_new).pipid);
            if sched_ood_enqueue(sched_new, resumed) && sched_new != taski {
                wakeup(sched_new);
            }
        }

        let rfc = (*sched_curr).refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(rfc >= 0, "refcount underflow on sched {}", (*sched_curr).pipid);
        if able_to_terminate_now(sched_curr) {
            wakeup(sched_curr);
        }
        Ok(())
    }
}

/// Resume a suspended task, optionally migrating it to scheduler `sched`
/// (null keeps its previous domain).
pub fn resume(resumed: *mut Task, sched: *mut Task) -> TaskResult {
    if resumed.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    unsafe { do_resume(resumed, sched) }
}

pub fn dequeue_and_resume(queue: *mut TaskQueue, sched: *mut Task) -> TaskResult {
    current_or_perm()?;
    if queue.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    unsafe {
        (*queue).lock();
        let resumed = (*queue).dequeue();
        (*queue).unlock();
        if resumed.is_null() {
            return Err(TaskError::NotFound);
        }
        do_resume(resumed, sched)
    }
}

pub fn dequeue_and_resume_nolock(queue: *mut TaskQueue, sched: *mut Task) -> TaskResult {
    current_or_perm()?;
    if queue.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    unsafe {
        let resumed = (*queue).dequeue();
        if resumed.is_null() {
            return Err(TaskError::NotFound);
        }
        do_resume(resumed, sched)
    }
}

unsafe fn dequeue_and_resume_multiple(
    queue: *mut TaskQueue,
    sched: *mut Task,
    n: i32,
    flag_lock: bool,
) -> TaskResult<i32> {
    unsafe {
        current_or_perm()?;
        if queue.is_null() {
            return Err(TaskError::InvalidArgument);
        }
        if n < 0 && n != TASK_ALL {
            return Err(TaskError::InvalidArgument);
        }

        // Drain into a private queue first so the user-visible lock is held
        // only for the dequeues, not for the resume work.
        let mut tmpq = TaskQueue::new();
        tmpq.init();
        let mut count = 0i32;

        if flag_lock {
            (*queue).lock();
        }
        loop {
            if n != TASK_ALL && count >= n {
                break;
            }
            let resumed = (*queue).dequeue();
            if resumed.is_null() {
                break;
            }
            tmpq.enqueue(resumed);
            count += 1;
        }
        if flag_lock {
            (*queue).unlock();
        }

        loop {
            let resumed = tmpq.dequeue();
            if resumed.is_null() {
                break;
            }
            do_resume(resumed, sched)?;
        }
        Ok(count)
    }
}

/// Pop up to `n` tasks (or all with `TASK_ALL`) from `queue` and resume
/// each. Returns the number dequeued.
pub fn dequeue_and_resume_n(queue: *mut TaskQueue, sched: *mut Task, n: i32) -> TaskResult<i32> {
    unsafe { dequeue_and_resume_multiple(queue, sched, n, true) }
}

pub fn dequeue_and_resume_n_nolock(
    queue: *mut TaskQueue,
    sched: *mut Task,
    n: i32,
) -> TaskResult<i32> {
    unsafe { dequeue_and_resume_multiple(queue, sched, n, false) }
}

/// Move up to `n` (or all) runnable tasks of the caller's scheduler into a
/// user queue, suspending each. The inverse of `dequeue_and_resume_n`.
pub fn enqueue_runnable_n(queue: *mut TaskQueue, n: i32) -> TaskResult<i32> {
    let taski = current_or_perm()?;
    if queue.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    if n < 0 && n != TASK_ALL {
        return Err(TaskError::InvalidArgument);
    }
    unsafe {
        let schedi = (*taski).sched_ptr();
        let mut count = 0i32;
        (*queue).lock();
        loop {
            if n != TASK_ALL && count >= n {
                break;
            }
            let moved = (*schedi).schedq.dequeue();
            if moved.is_null() {
                break;
            }
            (*moved).set_state(TaskState::Suspended);
            (*schedi).refcount.fetch_add(1, Ordering::AcqRel);
            (*queue).enqueue(moved);
            count += 1;
        }
        (*queue).unlock();
        Ok(count)
    }
}

// =============================================================================
// Yield
// =============================================================================

/// Give up the CPU. With `USER` (or empty) flags, rotates the caller to the
/// tail of its domain's runnable queue when a successor exists. Returns
/// `Ok(true)` iff an actual user-level switch happened.
pub fn yield_with(flags: YieldFlags) -> TaskResult<bool> {
    let taski = current_or_perm()?;
    if flags.wants_system() {
        system_yield();
    }
    let mut switched = false;
    if flags.wants_user() {
        unsafe {
            let schedi = (*taski).sched_ptr();
            if !(*schedi).oodq.is_empty() {
                let _ = takein_ood(schedi);
            }
            if (*schedi).schedq.is_empty() {
                return Ok(false);
            }
            (*schedi).schedq.enqueue(taski);
            let next = (*schedi).schedq.dequeue();
            debug_assert!(next != taski);
            switched = true;
            swap_ctx(taski, next);
        }
    }
    Ok(switched)
}

/// Switch directly to `target`, which must be runnable in the caller's
/// scheduling domain. Cross-domain targets are rejected.
pub fn yield_to(target: *mut Task) -> TaskResult {
    if target.is_null() {
        yield_with(YieldFlags::empty())?;
        return Ok(());
    }
    let taski = current_or_perm()?;
    if target == taski {
        return Ok(());
    }
    unsafe {
        let schedi = (*taski).sched_ptr();
        if (*target).sched_ptr() != schedi {
            return Err(TaskError::PermissionDenied);
        }
        if !(*schedi).oodq.is_empty() {
            let _ = takein_ood(schedi);
        }
        if !(*schedi).schedq.remove(target) {
            return Err(TaskError::PermissionDenied);
        }
        (*schedi).schedq.enqueue(taski);
        swap_ctx(taski, target);
    }
    Ok(())
}

// =============================================================================
// Couple / decouple
// =============================================================================

/// Detach the caller from its scheduler and become self-scheduling: the
/// caller migrates back to its own domain (and backing thread).
pub fn couple() -> TaskResult {
    let taski = current_or_perm()?;
    unsafe {
        let schedi = (*taski).sched_ptr();
        if schedi == taski {
            return Err(TaskError::Busy);
        }
        if !(*taski).coupled_sched.load(Ordering::Acquire).is_null() {
            return Err(TaskError::Busy);
        }
        (*taski).coupled_sched.store(schedi, Ordering::Release);

        // Pick the old domain's successor before self-enqueueing, so the
        // successor cannot be the caller itself. The protect pair must be
        // armed before the enqueue publishes the caller to its own inbox.
        let nexti = schedq_next(schedi);
        if !nexti.is_null() {
            stack_protect(taski, nexti);
            let _ = sched_ood_enqueue(taski, taski);
            debug_assert!((*nexti).wakeup_deferred.load(Ordering::Relaxed).is_null());
            (*nexti).wakeup_deferred.store(taski, Ordering::Release);
            swap_ctx(taski, nexti);
        } else {
            stack_protect(taski, schedi);
            let _ = sched_ood_enqueue(taski, taski);
            debug_assert!((*schedi).wakeup_deferred.load(Ordering::Relaxed).is_null());
            (*schedi).wakeup_deferred.store(taski, Ordering::Release);
            decouple_ctx(taski, schedi);
        }
    }
    Ok(())
}

/// Rejoin scheduler `sched` (or the one stashed by `couple`). The caller
/// must currently be self-scheduling.
pub fn decouple(sched: *mut Task) -> TaskResult {
    let taski = current_or_perm()?;
    unsafe {
        if (*taski).sched_ptr() != taski {
            return Err(TaskError::PermissionDenied);
        }
        let coupled = (*taski).coupled_sched.load(Ordering::Acquire);
        let schedi = if sched.is_null() { coupled } else { sched };
        if schedi.is_null() {
            return Err(TaskError::PermissionDenied);
        }
        if schedi == taski {
            return Err(TaskError::PermissionDenied);
        }
        if (*schedi).flag_exit.load(Ordering::Acquire) {
            return Err(TaskError::Busy);
        }

        (*taski).coupled_sched.store(ptr::null_mut(), Ordering::Release);
        // The caller's own loop entry releases the protect pair; the target
        // scheduler spins on it before re-entering the saved context.
        stack_protect(taski, taski);
        if sched_ood_enqueue(schedi, taski) {
            debug_assert!((*taski).wakeup_deferred.load(Ordering::Relaxed).is_null());
            (*taski).wakeup_deferred.store(schedi, Ordering::Release);
        }
        decouple_ctx(taski, taski);
    }
    Ok(())
}

// =============================================================================
// Exit / terminate
// =============================================================================

/// The exit protocol. Runs on the exiting task's current flow; terminal.
pub(crate) unsafe fn do_exit(taski: *mut Task) -> ! {
    unsafe {
        (*taski).flag_exit.store(true, Ordering::Release);
        if (*taski).state() == TaskState::Running {
            (*taski).set_state(TaskState::Exiting);
        }
        rlog!(Debug, "task {} exiting", (*taski).pipid);

        loop {
            let schedi = (*taski).sched_ptr();
            if takein_ood(schedi) {
                let next = (*schedi).schedq.dequeue();
                debug_assert!(!next.is_null());
                if taski != schedi {
                    // The successor drives taski's final termination once
                    // it has left this stack.
                    debug_assert!((*next).wakeup_deferred.load(Ordering::Relaxed).is_null());
                    (*next).wakeup_deferred.store(taski, Ordering::Release);
                } else {
                    // A scheduler with work keeps scheduling: rotate self
                    // to the tail and keep draining the queue.
                    (*schedi).schedq.enqueue(taski);
                }
                swap_ctx(taski, next);
            } else if taski == schedi {
                if able_to_terminate_now(taski) {
                    terminate_task(taski);
                }
                decouple_ctx(taski, schedi);
            } else {
                debug_assert!((*schedi).wakeup_deferred.load(Ordering::Relaxed).is_null());
                (*schedi).wakeup_deferred.store(taski, Ordering::Release);
                decouple_ctx(taski, schedi);
            }
        }
    }
}

/// Final teardown: flush, finalize the export table, record completion,
/// and leave the hosting thread. Never returns.
pub(crate) fn terminate_task(taski: *mut Task) -> ! {
    unsafe {
        debug_assert!((*taski).schedq.is_empty());
        // Scheduling responsibility has been handed back to the task's own
        // loop by the exit protocol; make `sched` agree so that resumes
        // issued from the finalizer (canceled importers) route via OOD
        // instead of touching the old domain's queue.
        (*taski).sched.store(taski, Ordering::Release);
        let status = (*taski).exit_status.load(Ordering::Acquire);
        rlog!(Debug, "task {} terminating (status {})", (*taski).pipid, status);

        let _ = std::io::stdout().flush();
        namexp::named_export_fin(taski);

        (*taski).set_state(TaskState::Terminated);
        (*taski).exit_sem.post();

        let host = host_context();
        if host.is_null() {
            // The root has no host context to fall back to; process-mode
            // exit carries its status out.
            let _ = std::io::stderr().flush();
            std::process::exit(status);
        }
        switch_registers(ptr::null_mut(), host);
    }
    unreachable!("terminated task resumed");
}

/// Landing point for task bodies that return from their entry function.
pub fn exit_from_entry() -> ! {
    let taski = task_current();
    if taski.is_null() {
        rlog!(Error, "exit from a flow with no current task");
        std::process::exit(9);
    }
    unsafe { do_exit(taski) }
}

// =============================================================================
// Sync options
// =============================================================================

/// Select the caller's parking discipline. Exactly one of BUSYWAIT, YIELD,
/// BLOCKING, AUTO (empty selects AUTO).
pub fn set_syncflag(flags: SyncFlags) -> TaskResult {
    let taski = current_or_perm()?;
    let checked = flags.checked().ok_or(TaskError::InvalidArgument)?;
    unsafe {
        (*taski).opts.store(checked.bits(), Ordering::Release);
    }
    Ok(())
}

pub fn get_syncflag() -> TaskResult<SyncFlags> {
    let taski = current_or_perm()?;
    unsafe {
        Ok(SyncFlags::from_bits_truncate(
            (*taski).opts.load(Ordering::Acquire),
        ))
    }
}

// =============================================================================
// Introspection / accessors
// =============================================================================

/// The calling task, or null when the thread is not hosting one.
pub fn task_self() -> *mut Task {
    task_current()
}

pub fn get_task_pipid(task: *mut Task) -> TaskResult<i32> {
    current_or_perm()?;
    if task.is_null() {
        return Err(TaskError::InvalidArgument);
    }
    unsafe { Ok((*task).pipid) }
}

pub fn get_task_by_pipid(pipid: i32) -> TaskResult<*mut Task> {
    check_pipid(pipid)
}

/// The caller's current scheduling domain.
pub fn get_sched_domain() -> TaskResult<*mut Task> {
    let taski = current_or_perm()?;
    unsafe { Ok((*taski).sched_ptr()) }
}

/// Number of runnable tasks on the caller's own queue (the caller acting
/// as a scheduler).
pub fn count_runnable() -> TaskResult<u32> {
    let taski = current_or_perm()?;
    unsafe { Ok((*taski).schedq.len()) }
}

pub fn set_aux(task: *mut Task, aux: *mut c_void) -> TaskResult {
    let taski = current_or_perm()?;
    let target = if task.is_null() { taski } else { task };
    unsafe {
        (*target).aux.store(aux, Ordering::Release);
    }
    Ok(())
}

pub fn get_aux(task: *mut Task) -> TaskResult<*mut c_void> {
    let taski = current_or_perm()?;
    let target = if task.is_null() { taski } else { task };
    unsafe { Ok((*target).aux.load(Ordering::Acquire)) }
}

/// Point-in-time probe of a task's scheduler-visible counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskStat {
    pub state: TaskState,
    pub schedq_len: u32,
    pub oodq_len: u32,
    pub refcount: i32,
}

pub fn task_stat(pipid: i32) -> TaskResult<TaskStat> {
    let taski = check_pipid(pipid)?;
    unsafe {
        Ok(TaskStat {
            state: (*taski).state(),
            schedq_len: (*taski).schedq.len(),
            oodq_len: (*taski).oodq.len(),
            refcount: (*taski).refcount.load(Ordering::Acquire),
        })
    }
}

/// Threads currently parked in `do_sleep`, process-wide.
pub fn parked_count() -> u32 {
    let rt = runtime();
    if rt.is_null() {
        return 0;
    }
    unsafe { (*rt).deadlock_count.load(Ordering::Acquire) }
}
