//! Runtime-internal task structures.
//!
//! Contains the `Task` record, the stack storage it owns, the process-wide
//! `Runtime` arena, and the thread-local "current task" / host-context
//! registers. The ABI-stable enums and constants remain in `weft_abi::task`.

use core::cell::{Cell, UnsafeCell};
use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicU32, Ordering};
use std::alloc::{Layout, alloc, dealloc};
use std::thread::JoinHandle;

use weft_abi::{SyncFlags, TASK_NAME_MAX_LEN, TaskState};
use weft_lib::{RawSpinLock, Semaphore};

use super::switch_asm::SwitchContext;
use super::taskq::{ListNode, TaskQueue};

pub use weft_abi::task::{
    MAX_TASKS, SLEEP_STACK_SIZE, TASK_ALL, TASK_ANY, TASK_MYSELF, TASK_ROOT, TASK_STACK_SIZE,
};

pub type TaskEntry = extern "C" fn(*mut c_void);

// =============================================================================
// Stack storage
// =============================================================================

/// Heap-backed stack region, 16-byte aligned. The runtime never relocates a
/// stack once a context lives on it.
pub struct StackStorage {
    base: *mut u8,
    size: usize,
}

impl StackStorage {
    pub const fn none() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
        }
    }

    pub fn alloc(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, 16).ok()?;
        // SAFETY: layout has non-zero size and valid alignment.
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return None;
        }
        Some(Self { base, size })
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.base.is_null()
    }

    /// Upper end of the region, 16-byte aligned.
    #[inline]
    pub fn top(&self) -> u64 {
        (self.base as u64 + self.size as u64) & !0xF
    }

    pub fn release(&mut self) {
        if self.base.is_null() {
            return;
        }
        // SAFETY: base/size came from `alloc` with the same layout.
        unsafe {
            dealloc(self.base, Layout::from_size_align_unchecked(self.size, 16));
        }
        self.base = ptr::null_mut();
        self.size = 0;
    }
}

impl Drop for StackStorage {
    fn drop(&mut self) {
        self.release();
    }
}

// SAFETY: the region is exclusively owned by one task record.
unsafe impl Send for StackStorage {}
unsafe impl Sync for StackStorage {}

// =============================================================================
// Task — the runtime task record
// =============================================================================

#[repr(C)]
pub struct Task {
    /// Intrusive queue link; a task sits in at most one queue at a time.
    pub node: ListNode,
    pub pipid: i32,
    pub name: [u8; TASK_NAME_MAX_LEN],
    state_atomic: AtomicU8,

    /// The task currently responsible for scheduling this task.
    pub sched: AtomicPtr<Task>,
    /// Scheduler stashed by `couple()`, restored by `decouple()`.
    pub coupled_sched: AtomicPtr<Task>,

    /// Runnable queue owned by this task when it acts as a scheduler.
    /// Mutated only by the domain's hosting flow; no lock.
    pub schedq: TaskQueue,
    /// Out-of-domain inbox, mutated only under `oodq_lock`.
    pub oodq: TaskQueue,
    pub oodq_lock: RawSpinLock,

    /// Suspended tasks whose `sched` points here; gates termination.
    pub refcount: AtomicI32,

    pub flag_wakeup: AtomicBool,
    pub flag_exit: AtomicBool,
    pub sleep_sem: Semaphore,
    /// Configured sync discipline.
    pub opts: AtomicU32,
    /// Discipline latched on sleep entry; read by wakers.
    pub opts_sync: AtomicU32,

    /// "When you next reach your own stack, wake this task."
    pub wakeup_deferred: AtomicPtr<Task>,

    // Stack-protect pair: `flag_stackp` is set while this task's stack may
    // still carry an unfinished switch; `stk_owner` names the predecessor
    // this flow must release once it reaches its own stack.
    pub flag_stackp: AtomicBool,
    pub stk_owner: AtomicPtr<Task>,

    /// Context saved at the last suspension point; valid iff SUSPENDED
    /// (or parked mid-exit).
    pub ctx_suspend: UnsafeCell<SwitchContext>,

    /// Body stack for scheduled (BLT) spawns; empty for active spawns and
    /// the root, whose bodies run on their thread's native stack.
    pub body_stack: StackStorage,
    /// Stack hosting this task's own sleep/dispatch loop.
    pub sleep_stack: StackStorage,

    pub entry: Option<TaskEntry>,
    pub entry_arg: *mut c_void,

    /// Opaque user pointer.
    pub aux: AtomicPtr<c_void>,

    /// Named export/import table (`namexp::NamedExptab`), owned.
    pub namexp: AtomicPtr<c_void>,

    pub exit_status: AtomicI32,
    /// Posted once by `terminate_task`; consumed by `task_wait`.
    pub exit_sem: Semaphore,

    /// Backing thread, joined at `runtime_fin`.
    pub join: spin::Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: shared fields are atomics or externally synchronized per the
// concurrency model (schedq by the owning domain, oodq by its lock).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn empty(pipid: i32) -> Self {
        Self {
            node: ListNode::unlinked(),
            pipid,
            name: [0; TASK_NAME_MAX_LEN],
            state_atomic: AtomicU8::new(TaskState::Invalid.as_u8()),
            sched: AtomicPtr::new(ptr::null_mut()),
            coupled_sched: AtomicPtr::new(ptr::null_mut()),
            schedq: TaskQueue::new(),
            oodq: TaskQueue::new(),
            oodq_lock: RawSpinLock::new(),
            refcount: AtomicI32::new(0),
            flag_wakeup: AtomicBool::new(false),
            flag_exit: AtomicBool::new(false),
            sleep_sem: Semaphore::new(),
            opts: AtomicU32::new(SyncFlags::AUTO.bits()),
            opts_sync: AtomicU32::new(SyncFlags::AUTO.bits()),
            wakeup_deferred: AtomicPtr::new(ptr::null_mut()),
            flag_stackp: AtomicBool::new(false),
            stk_owner: AtomicPtr::new(ptr::null_mut()),
            ctx_suspend: UnsafeCell::new(SwitchContext::zero()),
            body_stack: StackStorage::none(),
            sleep_stack: StackStorage::none(),
            entry: None,
            entry_arg: ptr::null_mut(),
            aux: AtomicPtr::new(ptr::null_mut()),
            namexp: AtomicPtr::new(ptr::null_mut()),
            exit_status: AtomicI32::new(0),
            exit_sem: Semaphore::new(),
            join: spin::Mutex::new(None),
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state_atomic.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TaskState) {
        debug_assert!(
            self.state().can_transition_to(state) || self.state() == state,
            "bad state transition {:?} -> {:?} (task {})",
            self.state(),
            state,
            self.pipid
        );
        self.state_atomic.store(state.as_u8(), Ordering::Release);
    }

    /// Unchecked store, for slot setup/teardown only.
    #[inline]
    pub(crate) fn force_state(&self, state: TaskState) {
        self.state_atomic.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state() == TaskState::Suspended
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    #[inline]
    pub fn sched_ptr(&self) -> *mut Task {
        self.sched.load(Ordering::Acquire)
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; TASK_NAME_MAX_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(TASK_NAME_MAX_LEN - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }
}

// =============================================================================
// Runtime — process-wide state behind one handle
// =============================================================================

pub struct Runtime {
    /// Spawned-task arena; pipid == index. Stable addresses for the whole
    /// runtime lifetime.
    pub tasks: Box<[Task]>,
    pub root: Box<Task>,
    /// Threads currently parked in `do_sleep`.
    pub deadlock_count: AtomicU32,
    /// Relax-read burst length for the YIELD/AUTO sleep patterns.
    pub yield_iters: u32,
    /// Default sync discipline for new tasks (from `WEFT_SYNC`).
    pub opts_default: AtomicU32,
    arena_lock: spin::Mutex<()>,
}

impl Runtime {
    pub(crate) fn new(yield_iters: u32, opts_default: SyncFlags) -> Self {
        let tasks: Vec<Task> = (0..MAX_TASKS).map(|i| Task::empty(i as i32)).collect();
        Self {
            tasks: tasks.into_boxed_slice(),
            root: Box::new(Task::empty(TASK_ROOT)),
            deadlock_count: AtomicU32::new(0),
            yield_iters,
            opts_default: AtomicU32::new(opts_default.bits()),
            arena_lock: spin::Mutex::new(()),
        }
    }

    pub fn root_ptr(&self) -> *mut Task {
        &*self.root as *const Task as *mut Task
    }

    pub fn task_ptr(&self, index: usize) -> *mut Task {
        &self.tasks[index] as *const Task as *mut Task
    }

    /// Reserve a free arena slot, leaving it in the Suspended-placeholder
    /// state so no other spawner can claim it. Returns the slot index.
    pub(crate) fn reserve_slot(&self) -> Option<usize> {
        let _guard = self.arena_lock.lock();
        for (i, slot) in self.tasks.iter().enumerate() {
            if slot.state() == TaskState::Invalid {
                slot.force_state(TaskState::Suspended);
                return Some(i);
            }
        }
        None
    }

    pub fn live_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_alive()).count()
    }
}

static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn install_runtime(rt: Box<Runtime>) -> bool {
    let ptr = Box::into_raw(rt);
    if RUNTIME
        .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // SAFETY: ptr was just created by Box::into_raw and never shared.
        drop(unsafe { Box::from_raw(ptr) });
        return false;
    }
    true
}

pub(crate) fn uninstall_runtime() -> Option<Box<Runtime>> {
    let ptr = RUNTIME.swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: the pointer came from `install_runtime`.
        Some(unsafe { Box::from_raw(ptr) })
    }
}

/// The process-wide runtime, or null before `runtime_init`.
#[inline]
pub fn runtime() -> *mut Runtime {
    RUNTIME.load(Ordering::Acquire)
}

// =============================================================================
// Per-thread registers
// =============================================================================

thread_local! {
    static CURRENT_TASK: Cell<*mut Task> = const { Cell::new(ptr::null_mut()) };
    static HOST_CONTEXT: Cell<*mut SwitchContext> = const { Cell::new(ptr::null_mut()) };
}

/// The task executing on this thread, or null for foreign threads.
#[inline]
pub fn task_current() -> *mut Task {
    CURRENT_TASK.with(|c| c.get())
}

#[inline]
pub(crate) fn set_task_current(task: *mut Task) {
    CURRENT_TASK.with(|c| c.set(task));
}

#[inline]
pub(crate) fn host_context() -> *mut SwitchContext {
    HOST_CONTEXT.with(|c| c.get())
}

#[inline]
pub(crate) fn set_host_context(ctx: *mut SwitchContext) {
    HOST_CONTEXT.with(|c| c.set(ctx));
}
