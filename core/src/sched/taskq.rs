//! Intrusive FIFO task queue.
//!
//! A doubly-linked circular list threaded through the `node` field of the
//! task record: no allocation at enqueue time, O(1) enqueue/dequeue/remove.
//! The length is an atomic carried by the queue so other domains can make
//! fast emptiness checks without taking the lock.
//!
//! The queue owns an optional raw ticket lock. `enqueue_with` runs a
//! callback after the task is linked but before returning; the
//! `UnlockQueue` sentinel releases the queue's own lock, which lets a
//! sleeper hand itself to a waiter and drop the waiter's lock atomically
//! with respect to the waiter's dequeue.

use core::ffi::c_void;
use core::mem::offset_of;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use weft_lib::RawSpinLock;

use super::task_struct::Task;

/// Embedded list link. A free-standing (unqueued) node links to itself.
#[repr(C)]
pub struct ListNode {
    pub next: *mut ListNode,
    pub prev: *mut ListNode,
}

impl ListNode {
    pub const fn unlinked() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn init(&mut self) {
        let me = self as *mut ListNode;
        self.next = me;
        self.prev = me;
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        let me = self as *const ListNode as *mut ListNode;
        self.next == me || self.next.is_null()
    }

    /// Unlink from whatever list holds this node and re-self-link.
    ///
    /// # Safety
    /// The node must be linked into a consistent list, and the caller must
    /// hold whatever lock protects that list.
    #[inline]
    pub unsafe fn unlink(&mut self) {
        unsafe {
            (*self.prev).next = self.next;
            (*self.next).prev = self.prev;
        }
        self.init();
    }
}

/// Recover the owning task from its embedded node.
///
/// # Safety
/// `node` must point at the `node` field of a live `Task`.
#[inline]
pub unsafe fn task_of(node: *mut ListNode) -> *mut Task {
    unsafe { node.byte_sub(offset_of!(Task, node)).cast() }
}

/// Callback flavours for `enqueue_with`.
pub enum EnqueueCallback {
    None,
    /// Release this queue's own lock after linking.
    UnlockQueue,
    /// Invoke `f(arg)` after linking.
    Call(fn(*mut c_void), *mut c_void),
}

pub struct TaskQueue {
    root: ListNode,
    count: AtomicU32,
    lock: RawSpinLock,
}

// SAFETY: the queue stores raw task pointers managed by the runtime arena;
// mutation is serialized by the owning scheduler or by `lock`.
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub const fn new() -> Self {
        Self {
            root: ListNode::unlinked(),
            count: AtomicU32::new(0),
            lock: RawSpinLock::new(),
        }
    }

    /// Self-link the sentinel. Must run once the queue has its final
    /// address, before any enqueue.
    pub fn init(&mut self) {
        self.root.init();
        self.count.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn lock(&self) {
        self.lock.lock();
    }

    #[inline]
    pub fn unlock(&self) {
        self.lock.unlock();
    }

    /// Append `task` at the tail.
    ///
    /// # Safety
    /// `task` must be live, not linked into any queue, and the caller must
    /// own the right to mutate this queue.
    pub unsafe fn enqueue(&mut self, task: *mut Task) {
        debug_assert!(!task.is_null());
        let node = unsafe { &mut (*task).node };
        debug_assert!(node.is_free(), "task is already queued");
        let root = &mut self.root as *mut ListNode;
        unsafe {
            node.next = root;
            node.prev = (*root).prev;
            (*(*root).prev).next = node as *mut ListNode;
            (*root).prev = node as *mut ListNode;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Append with post-link callback semantics (see module docs).
    ///
    /// # Safety
    /// As `enqueue`; for `UnlockQueue` the caller must hold this queue's
    /// lock.
    pub unsafe fn enqueue_with(&mut self, task: *mut Task, callback: EnqueueCallback) {
        unsafe { self.enqueue(task) };
        match callback {
            EnqueueCallback::None => {}
            EnqueueCallback::UnlockQueue => self.unlock(),
            EnqueueCallback::Call(f, arg) => f(arg),
        }
    }

    /// Pop the head, or null when empty.
    ///
    /// # Safety
    /// The caller must own the right to mutate this queue.
    pub unsafe fn dequeue(&mut self) -> *mut Task {
        if self.is_empty() {
            return ptr::null_mut();
        }
        let node = self.root.next;
        unsafe { (*node).unlink() };
        self.count.fetch_sub(1, Ordering::Relaxed);
        unsafe { task_of(node) }
    }

    /// Peek at the head without removing it.
    pub fn head(&self) -> *mut Task {
        if self.is_empty() {
            return ptr::null_mut();
        }
        unsafe { task_of(self.root.next) }
    }

    /// Remove a specific task. Returns false when the task is not linked
    /// into this queue.
    ///
    /// # Safety
    /// As `dequeue`; the task, if linked, must be linked into *this* queue.
    pub unsafe fn remove(&mut self, task: *mut Task) -> bool {
        if task.is_null() {
            return false;
        }
        let mut cursor = self.root.next;
        let root = &mut self.root as *mut ListNode;
        while cursor != root {
            if unsafe { task_of(cursor) } == task {
                unsafe { (*cursor).unlink() };
                self.count.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            cursor = unsafe { (*cursor).next };
        }
        false
    }

    /// Splice all of `other` onto this queue's tail, leaving `other` empty.
    ///
    /// # Safety
    /// The caller must own the right to mutate both queues.
    pub unsafe fn append(&mut self, other: &mut TaskQueue) {
        if other.is_empty() {
            return;
        }
        let moved = other.count.swap(0, Ordering::Relaxed);
        let root = &mut self.root as *mut ListNode;
        let oroot = &mut other.root as *mut ListNode;
        unsafe {
            let first = (*oroot).next;
            let last = (*oroot).prev;
            (*first).prev = (*root).prev;
            (*(*root).prev).next = first;
            (*last).next = root;
            (*root).prev = last;
        }
        other.root.init();
        self.count.fetch_add(moved, Ordering::Relaxed);
    }

    /// Visit every queued task in FIFO order.
    ///
    /// # Safety
    /// The caller must hold off concurrent mutation for the duration.
    pub unsafe fn for_each(&self, mut f: impl FnMut(*mut Task)) {
        let root = &self.root as *const ListNode as *mut ListNode;
        let mut cursor = self.root.next;
        while !cursor.is_null() && cursor != root {
            let next = unsafe { (*cursor).next };
            f(unsafe { task_of(cursor) });
            cursor = next;
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
