//! End-to-end scheduling scenarios driven through the public surface:
//! ping/pong yields, bulk resume, cross-domain migration, the
//! publish/subscribe race, adaptive sleep, termination ordering, and the
//! couple/decouple round trip.

#![cfg(target_arch = "x86_64")]

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use weft_abi::{SyncFlags, TASK_ALL, TASK_ROOT, TaskError, TaskState, YieldFlags};
use weft_core::sched::task_struct::Task;
use weft_core::{
    EnqueueCallback, TaskQueue, couple, decouple, dequeue_and_resume, dequeue_and_resume_n,
    get_sched_domain, get_task_by_pipid, get_task_pipid, named_export, named_import,
    named_tryimport, runtime_fin, runtime_init, set_syncflag, suspend_and_enqueue, task_spawn,
    task_spawn_under, task_stat, task_wait, yield_to, yield_with,
};
use weft_lib::system_yield;

// =============================================================================
// Fixture: the runtime is process-wide, so scenarios serialize.
// =============================================================================

static TEST_LOCK: Mutex<()> = Mutex::new(());

struct Fixture {
    _guard: MutexGuard<'static, ()>,
}

impl Fixture {
    fn new() -> Self {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        runtime_init().expect("runtime_init failed");
        Self { _guard: guard }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        for _ in 0..200 {
            if runtime_fin().is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        eprintln!("scenario teardown: live tasks remained, leaking runtime");
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(20)
}

/// Drive the root's scheduling domain until `cond` holds.
fn pump_until(mut cond: impl FnMut() -> bool) {
    let end = deadline();
    while !cond() {
        assert!(Instant::now() < end, "timed out pumping the root domain");
        let _ = yield_with(YieldFlags::empty());
    }
}

fn state_of(pipid: i32) -> TaskState {
    task_stat(pipid).expect("task_stat").state
}

// =============================================================================
// S1 — ping/pong yield_to
// =============================================================================

struct YieldCtl {
    peer: AtomicI32,
    log: *const Mutex<Vec<char>>,
    tag: char,
}

extern "C" fn pingpong_body(arg: *mut c_void) {
    let ctl: *const YieldCtl = arg.cast();
    unsafe {
        let peer_id = loop {
            let id = (*ctl).peer.load(Ordering::Acquire);
            if id >= 0 {
                break id;
            }
            system_yield();
        };
        let peer = get_task_by_pipid(peer_id).expect("peer task");
        for _ in 0..10 {
            (*(*ctl).log).lock().unwrap().push((*ctl).tag);
            let _ = yield_to(peer);
        }
    }
}

#[test]
fn s1_ping_pong_alternates_exactly() {
    let _fixture = Fixture::new();
    let log = Box::new(Mutex::new(Vec::new()));
    let mut a_ctl = Box::new(YieldCtl {
        peer: AtomicI32::new(-1),
        log: &*log,
        tag: 'a',
    });
    let mut b_ctl = Box::new(YieldCtl {
        peer: AtomicI32::new(-1),
        log: &*log,
        tag: 'b',
    });

    let a = task_spawn_under(
        "ping",
        pingpong_body,
        &mut *a_ctl as *mut YieldCtl as *mut c_void,
        TASK_ROOT,
    )
    .unwrap();
    let b = task_spawn_under(
        "pong",
        pingpong_body,
        &mut *b_ctl as *mut YieldCtl as *mut c_void,
        TASK_ROOT,
    )
    .unwrap();
    a_ctl.peer.store(b, Ordering::Release);
    b_ctl.peer.store(a, Ordering::Release);

    pump_until(|| state_of(a) == TaskState::Terminated && state_of(b) == TaskState::Terminated);
    assert_eq!(task_wait(a).unwrap(), 0);
    assert_eq!(task_wait(b).unwrap(), 0);

    let seen = log.lock().unwrap().clone();
    let expected: Vec<char> = (0..10).flat_map(|_| ['a', 'b']).collect();
    assert_eq!(seen, expected, "tasks must alternate exactly");

    let stat = task_stat(TASK_ROOT).unwrap();
    assert_eq!(stat.schedq_len, 0);
    assert_eq!(stat.refcount, 0);
}

// =============================================================================
// S2 — bulk resume in FIFO order
// =============================================================================

struct BulkCtl {
    queue: TaskQueue,
    log: Mutex<Vec<i32>>,
}

extern "C" fn bulk_body(arg: *mut c_void) {
    let ctl: *mut BulkCtl = arg.cast();
    unsafe {
        suspend_and_enqueue(&mut (*ctl).queue, EnqueueCallback::None).expect("suspend");
        let me = get_task_pipid(weft_core::task_self()).expect("own pipid");
        (*ctl).log.lock().unwrap().push(me);
    }
}

#[test]
fn s2_bulk_resume_splits_fifo() {
    let _fixture = Fixture::new();
    let mut ctl = Box::new(BulkCtl {
        queue: TaskQueue::new(),
        log: Mutex::new(Vec::new()),
    });
    ctl.queue.init();
    let arg = &mut *ctl as *mut BulkCtl as *mut c_void;

    let pipids: Vec<i32> = (0..8)
        .map(|i| task_spawn_under(&format!("bulk{i}"), bulk_body, arg, TASK_ROOT).unwrap())
        .collect();

    pump_until(|| ctl.queue.len() == 8);
    assert_eq!(task_stat(TASK_ROOT).unwrap().refcount, 8);
    for &p in &pipids {
        assert_eq!(state_of(p), TaskState::Suspended);
    }

    let resumed =
        dequeue_and_resume_n(&mut ctl.queue, core::ptr::null_mut(), 5).expect("bulk resume");
    assert_eq!(resumed, 5);
    assert_eq!(ctl.queue.len(), 3, "the queue keeps the other three");
    let stat = task_stat(TASK_ROOT).unwrap();
    assert_eq!(stat.refcount, 3);
    assert_eq!(stat.schedq_len, 5);

    pump_until(|| pipids[..5].iter().all(|&p| state_of(p) == TaskState::Terminated));
    assert_eq!(ctl.log.lock().unwrap().clone(), pipids[..5].to_vec());

    let rest =
        dequeue_and_resume_n(&mut ctl.queue, core::ptr::null_mut(), TASK_ALL).expect("resume all");
    assert_eq!(rest, 3);
    pump_until(|| pipids.iter().all(|&p| state_of(p) == TaskState::Terminated));
    for &p in &pipids {
        assert_eq!(task_wait(p).unwrap(), 0);
    }
    assert_eq!(ctl.log.lock().unwrap().clone(), pipids.to_vec());
    assert_eq!(task_stat(TASK_ROOT).unwrap().refcount, 0);
}

// =============================================================================
// S3 — cross-domain resume migrates through the OOD inbox
// =============================================================================

struct MigrateCtl {
    queue: TaskQueue,
    domains: Mutex<Vec<i32>>,
}

extern "C" fn migrating_body(arg: *mut c_void) {
    let ctl: *mut MigrateCtl = arg.cast();
    unsafe {
        let before = get_task_pipid(get_sched_domain().unwrap()).unwrap();
        (*ctl).domains.lock().unwrap().push(before);
        suspend_and_enqueue(&mut (*ctl).queue, EnqueueCallback::None).expect("suspend");
        let after = get_task_pipid(get_sched_domain().unwrap()).unwrap();
        (*ctl).domains.lock().unwrap().push(after);
    }
}

struct IdleCtl {
    done: AtomicBool,
}

extern "C" fn yielding_host_body(arg: *mut c_void) {
    let ctl: *const IdleCtl = arg.cast();
    while !unsafe { (*ctl).done.load(Ordering::Acquire) } {
        let _ = yield_with(YieldFlags::empty());
    }
}

struct ParkCtl {
    queue: TaskQueue,
}

extern "C" fn parking_host_body(arg: *mut c_void) {
    let ctl: *mut ParkCtl = arg.cast();
    unsafe {
        suspend_and_enqueue(&mut (*ctl).queue, EnqueueCallback::None).expect("park");
    }
}

#[test]
fn s3_cross_domain_resume_wakes_target_scheduler() {
    let _fixture = Fixture::new();
    let mut x_ctl = Box::new(MigrateCtl {
        queue: TaskQueue::new(),
        domains: Mutex::new(Vec::new()),
    });
    x_ctl.queue.init();
    let host_ctl = Box::new(IdleCtl {
        done: AtomicBool::new(false),
    });
    let mut park_ctl = Box::new(ParkCtl {
        queue: TaskQueue::new(),
    });
    park_ctl.queue.init();

    let s1 = task_spawn(
        "dom1",
        yielding_host_body,
        &*host_ctl as *const IdleCtl as *mut c_void,
    )
    .unwrap();
    let s2 = task_spawn(
        "dom2",
        parking_host_body,
        &mut *park_ctl as *mut ParkCtl as *mut c_void,
    )
    .unwrap();
    let x = task_spawn_under(
        "migrant",
        migrating_body,
        &mut *x_ctl as *mut MigrateCtl as *mut c_void,
        s1,
    )
    .unwrap();

    // X runs under S1, records its domain, and suspends onto the queue.
    let end = deadline();
    while x_ctl.queue.len() != 1 {
        assert!(Instant::now() < end, "X never suspended");
        system_yield();
    }
    assert_eq!(state_of(x), TaskState::Suspended);
    assert_eq!(task_stat(s1).unwrap().refcount, 1);

    // Wait for S2's domain loop to go idle, then migrate X into it.
    while park_ctl.queue.len() != 1 {
        assert!(Instant::now() < end, "S2 never parked");
        system_yield();
    }
    let s2_task: *mut Task = get_task_by_pipid(s2).unwrap();
    dequeue_and_resume(&mut x_ctl.queue, s2_task).expect("cross-domain resume");

    assert_eq!(task_wait(x).unwrap(), 0);
    assert_eq!(x_ctl.domains.lock().unwrap().clone(), vec![s1, s2]);
    assert_eq!(task_stat(s1).unwrap().refcount, 0, "S1 released its obligation");

    host_ctl.done.store(true, Ordering::Release);
    assert_eq!(task_wait(s1).unwrap(), 0);
    dequeue_and_resume(&mut park_ctl.queue, core::ptr::null_mut()).expect("unpark S2");
    assert_eq!(task_wait(s2).unwrap(), 0);
}

// =============================================================================
// S4 — publish/subscribe race: both importers see the value exactly once
// =============================================================================

static PUBLISHED: u32 = 4242;

struct PubSubCtl {
    owner: AtomicI32,
    hits: AtomicI32,
    release_owner: AtomicBool,
}

extern "C" fn subscriber_body(arg: *mut c_void) {
    let ctl: *const PubSubCtl = arg.cast();
    unsafe {
        let owner = loop {
            let id = (*ctl).owner.load(Ordering::Acquire);
            if id >= 0 {
                break id;
            }
            system_yield();
        };
        if named_import(owner, "race-key") == Ok(&PUBLISHED as *const u32 as *mut c_void) {
            (*ctl).hits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

extern "C" fn publisher_body(arg: *mut c_void) {
    let ctl: *const PubSubCtl = arg.cast();
    // Give the subscribers a window to park first; a late subscriber that
    // finds the value already published is equally correct.
    std::thread::sleep(Duration::from_millis(50));
    named_export(&PUBLISHED as *const u32 as *mut c_void, "race-key").expect("export");
    unsafe {
        while !(*ctl).release_owner.load(Ordering::Acquire) {
            system_yield();
        }
    }
}

#[test]
fn s4_publish_wakes_every_blocked_importer_once() {
    let _fixture = Fixture::new();
    let ctl = Box::new(PubSubCtl {
        owner: AtomicI32::new(-1),
        hits: AtomicI32::new(0),
        release_owner: AtomicBool::new(false),
    });
    let arg = &*ctl as *const PubSubCtl as *mut c_void;

    let sub_a = task_spawn("sub-a", subscriber_body, arg).unwrap();
    let sub_c = task_spawn("sub-c", subscriber_body, arg).unwrap();
    let owner = task_spawn("owner", publisher_body, arg).unwrap();
    ctl.owner.store(owner, Ordering::Release);

    assert_eq!(task_wait(sub_a).unwrap(), 0);
    assert_eq!(task_wait(sub_c).unwrap(), 0);
    assert_eq!(ctl.hits.load(Ordering::SeqCst), 2);

    // The bucket holds a single published entry now.
    assert_eq!(
        named_tryimport(owner, "race-key").unwrap(),
        &PUBLISHED as *const u32 as *mut c_void
    );
    ctl.release_owner.store(true, Ordering::Release);
    assert_eq!(task_wait(owner).unwrap(), 0);
}

// =============================================================================
// S5 — adaptive sleep falls through to blocking and still wakes
// =============================================================================

struct SleepCtl {
    queue: TaskQueue,
    mode: SyncFlags,
    woke: AtomicBool,
}

extern "C" fn sleepy_body(arg: *mut c_void) {
    let ctl: *mut SleepCtl = arg.cast();
    unsafe {
        set_syncflag((*ctl).mode).expect("syncflag");
        suspend_and_enqueue(&mut (*ctl).queue, EnqueueCallback::None).expect("suspend");
        (*ctl).woke.store(true, Ordering::Release);
    }
}

fn run_sleep_mode(mode: SyncFlags, park_for: Duration) {
    let mut ctl = Box::new(SleepCtl {
        queue: TaskQueue::new(),
        mode,
        woke: AtomicBool::new(false),
    });
    ctl.queue.init();
    let pipid = task_spawn(
        "sleeper",
        sleepy_body,
        &mut *ctl as *mut SleepCtl as *mut c_void,
    )
    .unwrap();

    let end = deadline();
    while ctl.queue.len() != 1 {
        assert!(Instant::now() < end, "sleeper never suspended");
        system_yield();
    }
    // Let the idle scheduler run its yield rounds dry and reach the
    // blocking wait before the wakeup arrives.
    std::thread::sleep(park_for);
    dequeue_and_resume(&mut ctl.queue, core::ptr::null_mut()).expect("resume sleeper");
    assert_eq!(task_wait(pipid).unwrap(), 0);
    assert!(ctl.woke.load(Ordering::Acquire));
}

#[test]
fn s5_auto_sleep_blocks_then_wakes() {
    let _fixture = Fixture::new();
    run_sleep_mode(SyncFlags::AUTO, Duration::from_millis(300));
}

#[test]
fn s5_blocking_sleep_wakes_from_semaphore() {
    let _fixture = Fixture::new();
    run_sleep_mode(SyncFlags::BLOCKING, Duration::from_millis(50));
}

// =============================================================================
// S6 — termination ordering with a shared scheduler
// =============================================================================

struct OrderCtl {
    log: Mutex<Vec<&'static str>>,
}

extern "C" fn first_body(arg: *mut c_void) {
    let ctl: *const OrderCtl = arg.cast();
    unsafe { (*ctl).log.lock().unwrap().push("t1") };
}

extern "C" fn second_body(arg: *mut c_void) {
    let ctl: *const OrderCtl = arg.cast();
    unsafe { (*ctl).log.lock().unwrap().push("t2") };
}

#[test]
fn s6_exit_with_peers_still_runnable() {
    let _fixture = Fixture::new();
    let ctl = Box::new(OrderCtl {
        log: Mutex::new(Vec::new()),
    });
    let arg = &*ctl as *const OrderCtl as *mut c_void;

    // T1 exits while T2 is still sitting on the shared scheduler's queue;
    // the exit path must hand the CPU to T2 and defer its own teardown.
    let t1 = task_spawn_under("first", first_body, arg, TASK_ROOT).unwrap();
    let t2 = task_spawn_under("second", second_body, arg, TASK_ROOT).unwrap();

    pump_until(|| state_of(t1) == TaskState::Terminated && state_of(t2) == TaskState::Terminated);
    assert_eq!(task_wait(t1).unwrap(), 0);
    assert_eq!(task_wait(t2).unwrap(), 0);
    assert_eq!(ctl.log.lock().unwrap().clone(), vec!["t1", "t2"]);

    let stat = task_stat(TASK_ROOT).unwrap();
    assert_eq!(stat.schedq_len, 0);
    assert_eq!(stat.oodq_len, 0);
    assert_eq!(stat.refcount, 0);
}

// =============================================================================
// Couple / decouple round trip
// =============================================================================

struct CoupleCtl {
    domains: Mutex<Vec<i32>>,
}

extern "C" fn coupling_body(arg: *mut c_void) {
    let ctl: *const CoupleCtl = arg.cast();
    unsafe {
        let record = || get_task_pipid(get_sched_domain().unwrap()).unwrap();
        (*ctl).domains.lock().unwrap().push(record());
        couple().expect("couple");
        (*ctl).domains.lock().unwrap().push(record());
        decouple(core::ptr::null_mut()).expect("decouple");
        (*ctl).domains.lock().unwrap().push(record());
    }
}

#[test]
fn couple_detaches_and_decouple_rejoins() {
    let _fixture = Fixture::new();
    let ctl = Box::new(CoupleCtl {
        domains: Mutex::new(Vec::new()),
    });
    let m = task_spawn_under(
        "coupler",
        coupling_body,
        &*ctl as *const CoupleCtl as *mut c_void,
        TASK_ROOT,
    )
    .unwrap();

    pump_until(|| state_of(m) == TaskState::Terminated);
    assert_eq!(task_wait(m).unwrap(), 0);

    let root_id = get_task_pipid(get_task_by_pipid(TASK_ROOT).unwrap()).unwrap();
    assert_eq!(ctl.domains.lock().unwrap().clone(), vec![root_id, m, root_id]);
}

#[test]
fn couple_from_own_domain_is_busy() {
    let _fixture = Fixture::new();
    // The root is already its own scheduler.
    assert_eq!(couple().unwrap_err(), TaskError::Busy);
}

#[test]
fn decouple_without_coupled_scheduler_is_denied() {
    let _fixture = Fixture::new();
    assert_eq!(
        decouple(core::ptr::null_mut()).unwrap_err(),
        TaskError::PermissionDenied
    );
}
