//! Named export/import rendezvous.
//!
//! Each task owns a fixed-size hash table of buckets; a bucket holds a
//! collision list of entries. An entry is either **published** (name →
//! address) or **queried** (installed by the first blocking importer that
//! missed, carrying the wait queues). Publishing is one-shot: it flips the
//! name from queried to published and wakes every waiter.
//!
//! Locking: one raw spin lock per bucket, released *by the enqueue
//! callback* while a blocking importer parks; the publisher then finds the
//! waiter already queued. Wait slots for secondary importers live on the
//! importer's own stack and are filled by the first importer before their
//! owners are resumed, which is sound because a suspended waiter's stack
//! stays live.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use weft_abi::{TASK_ALL, TaskError, TaskResult};
use weft_lib::RawSpinLock;
use weft_lib::rlog;

use super::scheduler::{
    check_pipid, dequeue_and_resume_n_nolock, dequeue_and_resume_nolock,
    suspend_and_enqueue_nolock,
};
use super::task_struct::{Task, task_current};
use super::taskq::{EnqueueCallback, TaskQueue};

/// Buckets per table; must be a power of two.
const HASHTAB_SZ: usize = 1024;

/// Left-shift-xor over the name bytes, plus the length.
fn name_hash(name: &str) -> u64 {
    let mut hash: u64 = 0;
    for &b in name.as_bytes() {
        hash <<= 1;
        hash ^= b as u64;
    }
    hash.wrapping_add(name.len() as u64)
}

/// Stack-allocated wait slot for a secondary importer. Filled by the first
/// importer before the waiter is resumed.
struct NamexpWait {
    next: *mut NamexpWait,
    address: *mut c_void,
    err: Option<TaskError>,
}

struct NamexpEntry {
    next: *mut NamexpEntry,
    hashval: u64,
    name: String,
    address: *mut c_void,
    flag_exported: bool,
    flag_canceled: AtomicBool,
    /// Wait slots of secondary importers (stack storage, see above).
    wait_head: *mut NamexpWait,
    /// The first importer parks here; the publisher wakes it.
    queue_owner: TaskQueue,
    /// Secondary importers park here; the first importer drains them.
    queue_others: TaskQueue,
}

struct NamexpBucket {
    lock: RawSpinLock,
    head: *mut NamexpEntry,
}

pub struct NamedExptab {
    flag_closed: AtomicBool,
    buckets: Box<[NamexpBucket]>,
}

// SAFETY: entries are only touched under their bucket lock (or after being
// unlinked, when they are private to one task).
unsafe impl Send for NamedExptab {}
unsafe impl Sync for NamedExptab {}

fn new_entry(name: String, hashval: u64) -> *mut NamexpEntry {
    let mut entry = Box::new(NamexpEntry {
        next: ptr::null_mut(),
        hashval,
        name,
        address: ptr::null_mut(),
        flag_exported: false,
        flag_canceled: AtomicBool::new(false),
        wait_head: ptr::null_mut(),
        queue_owner: TaskQueue::new(),
        queue_others: TaskQueue::new(),
    });
    entry.queue_owner.init();
    entry.queue_others.init();
    Box::into_raw(entry)
}

unsafe fn free_entry(entry: *mut NamexpEntry) {
    // SAFETY: caller guarantees the entry is unlinked and unreferenced.
    drop(unsafe { Box::from_raw(entry) });
}

unsafe fn bucket_for(tab: *mut NamedExptab, hash: u64) -> *mut NamexpBucket {
    unsafe {
        let idx = (hash as usize) & ((&(*tab).buckets).len() - 1);
        &(*tab).buckets[idx] as *const NamexpBucket as *mut NamexpBucket
    }
}

unsafe fn find_entry(bucket: *mut NamexpBucket, hash: u64, name: &str) -> *mut NamexpEntry {
    unsafe {
        let mut cursor = (*bucket).head;
        while !cursor.is_null() {
            if (*cursor).hashval == hash && (*cursor).name == name {
                return cursor;
            }
            cursor = (*cursor).next;
        }
        ptr::null_mut()
    }
}

unsafe fn link_entry(bucket: *mut NamexpBucket, entry: *mut NamexpEntry) {
    unsafe {
        (*entry).next = (*bucket).head;
        (*bucket).head = entry;
    }
}

unsafe fn unlink_entry(bucket: *mut NamexpBucket, entry: *mut NamexpEntry) {
    unsafe {
        let mut cursor = &mut (*bucket).head as *mut *mut NamexpEntry;
        while !(*cursor).is_null() {
            if *cursor == entry {
                *cursor = (*entry).next;
                (*entry).next = ptr::null_mut();
                return;
            }
            cursor = &mut (**cursor).next as *mut *mut NamexpEntry;
        }
        debug_assert!(false, "entry not in bucket");
    }
}

/// Enqueue-callback thunk: release the bucket lock once the importer is
/// safely parked.
fn unlock_bucket_cb(arg: *mut c_void) {
    let lock: *const RawSpinLock = arg.cast();
    unsafe { (*lock).unlock() };
}

// =============================================================================
// Table lifecycle
// =============================================================================

pub(crate) fn named_export_init(taski: *mut Task) {
    let buckets: Vec<NamexpBucket> = (0..HASHTAB_SZ)
        .map(|_| NamexpBucket {
            lock: RawSpinLock::new(),
            head: ptr::null_mut(),
        })
        .collect();
    let tab = Box::new(NamedExptab {
        flag_closed: AtomicBool::new(false),
        buckets: buckets.into_boxed_slice(),
    });
    unsafe {
        let old = (*taski)
            .namexp
            .swap(Box::into_raw(tab).cast(), Ordering::AcqRel);
        debug_assert!(old.is_null());
    }
}

/// Close the table and cancel every queried entry: published entries are
/// freed, parked first importers are resumed to observe `Canceled` (and to
/// drain their secondary waiters), and their entries stay theirs to free.
pub(crate) fn named_export_fin(taski: *mut Task) {
    unsafe {
        let tab: *mut NamedExptab = (*taski).namexp.load(Ordering::Acquire).cast();
        if tab.is_null() {
            return;
        }
        (*tab).flag_closed.store(true, Ordering::Release);
        for bucket in (*tab).buckets.iter() {
            let bucket = bucket as *const NamexpBucket as *mut NamexpBucket;
            (*bucket).lock.lock();
            let mut cursor = (*bucket).head;
            (*bucket).head = ptr::null_mut();
            while !cursor.is_null() {
                let next = (*cursor).next;
                (*cursor).next = ptr::null_mut();
                if (*cursor).flag_exported {
                    free_entry(cursor);
                } else {
                    (*cursor).flag_canceled.store(true, Ordering::Release);
                    let queue = &mut (*cursor).queue_owner as *mut TaskQueue;
                    if let Err(err) = dequeue_and_resume_nolock(queue, ptr::null_mut()) {
                        rlog!(
                            Error,
                            "namexp fin: resume of '{}' owner failed: {}",
                            (*cursor).name,
                            err
                        );
                    }
                    // The first importer frees this entry when it wakes.
                }
                cursor = next;
            }
            (*bucket).lock.unlock();
        }
    }
}

/// Free the table itself. All waiters must be long gone.
pub(crate) fn named_export_destroy(taski: *mut Task) {
    unsafe {
        let tab: *mut NamedExptab =
            (*taski).namexp.swap(ptr::null_mut(), Ordering::AcqRel).cast();
        if tab.is_null() {
            return;
        }
        for bucket in (*tab).buckets.iter() {
            let mut cursor = bucket.head;
            while !cursor.is_null() {
                let next = (*cursor).next;
                free_entry(cursor);
                cursor = next;
            }
        }
        drop(Box::from_raw(tab));
    }
}

// =============================================================================
// Publish
// =============================================================================

/// Publish `value` under `name` in the caller's table. One-shot: a second
/// export of the same name fails with `Busy`.
pub fn named_export(value: *mut c_void, name: &str) -> TaskResult {
    let taski = task_current();
    if taski.is_null() {
        return Err(TaskError::PermissionDenied);
    }
    unsafe {
        let tab: *mut NamedExptab = (*taski).namexp.load(Ordering::Acquire).cast();
        if tab.is_null() {
            return Err(TaskError::NotAlive);
        }
        if (*tab).flag_closed.load(Ordering::Acquire) {
            return Err(TaskError::Canceled);
        }

        let hash = name_hash(name);
        let bucket = bucket_for(tab, hash);
        (*bucket).lock.lock();

        let entry = find_entry(bucket, hash, name);
        let result = if entry.is_null() {
            let fresh = new_entry(name.to_owned(), hash);
            (*fresh).address = value;
            (*fresh).flag_exported = true;
            link_entry(bucket, fresh);
            rlog!(Trace, "export '{}' by task {}", name, (*taski).pipid);
            Ok(())
        } else if (*entry).flag_exported {
            Err(TaskError::Busy)
        } else {
            // A queried entry: install a fresh published entry in its place
            // and wake the first importer. The queried entry cannot be freed
            // here; its installer owns it and reads `address` on wakeup.
            let fresh = new_entry(name.to_owned(), hash);
            (*fresh).address = value;
            (*fresh).flag_exported = true;
            unlink_entry(bucket, entry);
            (*entry).address = value;
            link_entry(bucket, fresh);
            rlog!(
                Trace,
                "export '{}' by task {} wakes querier",
                name,
                (*taski).pipid
            );
            let queue = &mut (*entry).queue_owner as *mut TaskQueue;
            if let Err(err) = dequeue_and_resume_nolock(queue, ptr::null_mut()) {
                rlog!(Error, "export '{}': owner resume failed: {}", name, err);
            }
            Ok(())
        };

        (*bucket).lock.unlock();
        result
    }
}

// =============================================================================
// Import
// =============================================================================

unsafe fn do_named_import(pipid: i32, name: &str, blocking: bool) -> TaskResult<*mut c_void> {
    unsafe {
        let taski = task_current();
        if taski.is_null() {
            return Err(TaskError::PermissionDenied);
        }
        let target = check_pipid(pipid)?;
        let tab: *mut NamedExptab = (*target).namexp.load(Ordering::Acquire).cast();
        if tab.is_null() {
            return Err(TaskError::NotAlive);
        }
        if (*tab).flag_closed.load(Ordering::Acquire) {
            return Err(TaskError::Canceled);
        }

        let hash = name_hash(name);
        let bucket = bucket_for(tab, hash);
        let lock_arg = &(*bucket).lock as *const RawSpinLock as *mut c_void;
        (*bucket).lock.lock();

        // Re-checked under the lock: a finalizer that swept this bucket
        // concurrently must not gain a waiter it will never cancel.
        if (*tab).flag_closed.load(Ordering::Acquire) {
            (*bucket).lock.unlock();
            return Err(TaskError::Canceled);
        }

        let entry = find_entry(bucket, hash, name);
        if !entry.is_null() {
            if (*entry).flag_exported {
                let address = (*entry).address;
                (*bucket).lock.unlock();
                return Ok(address);
            }
            // Queried but not yet published.
            if !blocking {
                (*bucket).lock.unlock();
                return Err(TaskError::WouldBlock);
            }
            // Park on the others queue with a stack wait slot; the first
            // importer fills it before resuming us.
            let mut wait = NamexpWait {
                next: (*entry).wait_head,
                address: ptr::null_mut(),
                err: None,
            };
            (*entry).wait_head = &mut wait;
            let queue = &mut (*entry).queue_others as *mut TaskQueue;
            if let Err(err) = suspend_and_enqueue_nolock(
                queue,
                EnqueueCallback::Call(unlock_bucket_cb, lock_arg),
            ) {
                (*entry).wait_head = wait.next;
                (*bucket).lock.unlock();
                return Err(err);
            }
            // Resumed; the bucket lock is NOT held and the entry may be
            // gone; everything we need is in the wait slot.
            return match wait.err {
                Some(err) => Err(err),
                None => Ok(wait.address),
            };
        }

        // No entry at all.
        if target == taski {
            (*bucket).lock.unlock();
            return Err(TaskError::Deadlock);
        }
        if !blocking {
            (*bucket).lock.unlock();
            return Err(TaskError::WouldBlock);
        }

        // Install a queried entry and park on its owner queue until the
        // export (or the finalizer's cancel) wakes us.
        let entry = new_entry(name.to_owned(), hash);
        link_entry(bucket, entry);
        let queue = &mut (*entry).queue_owner as *mut TaskQueue;
        if let Err(err) =
            suspend_and_enqueue_nolock(queue, EnqueueCallback::Call(unlock_bucket_cb, lock_arg))
        {
            unlink_entry(bucket, entry);
            free_entry(entry);
            (*bucket).lock.unlock();
            return Err(err);
        }

        // Resumed: the publisher (or finalizer) unlinked the entry, which
        // is now ours. Cancellation is carried by the entry flag.
        let (address, err) = if (*entry).flag_canceled.load(Ordering::Acquire) {
            (ptr::null_mut(), Some(TaskError::Canceled))
        } else {
            ((*entry).address, None)
        };

        // Fill every secondary wait slot before waking its owner.
        let mut slot = (*entry).wait_head;
        (*entry).wait_head = ptr::null_mut();
        while !slot.is_null() {
            let next = (*slot).next;
            (*slot).address = address;
            (*slot).err = err;
            slot = next;
        }
        let others = &mut (*entry).queue_others as *mut TaskQueue;
        if let Err(e) = dequeue_and_resume_n_nolock(others, ptr::null_mut(), TASK_ALL) {
            rlog!(Error, "import '{}': draining secondary waiters failed: {}", name, e);
        }

        free_entry(entry);
        match err {
            Some(err) => Err(err),
            None => Ok(address),
        }
    }
}

/// Blocking import: waits until the owner publishes `name`.
pub fn named_import(pipid: i32, name: &str) -> TaskResult<*mut c_void> {
    unsafe { do_named_import(pipid, name, true) }
}

/// Non-blocking import: `WouldBlock` when the name is not yet published.
pub fn named_tryimport(pipid: i32, name: &str) -> TaskResult<*mut c_void> {
    unsafe { do_named_import(pipid, name, false) }
}
