//! Weft runtime core: cooperative tasks, scheduling domains, and the named
//! export/import rendezvous.
//!
//! x86_64 only; the context-switch primitive is architecture-specific.

#![cfg(target_arch = "x86_64")]

pub mod sched;

pub use sched::namexp::{named_export, named_import, named_tryimport};
pub use sched::scheduler::{
    TaskStat, count_runnable, couple, decouple, dequeue_and_resume, dequeue_and_resume_n,
    dequeue_and_resume_n_nolock, dequeue_and_resume_nolock, enqueue_runnable_n, get_aux,
    get_sched_domain, get_syncflag, get_task_by_pipid, get_task_pipid, parked_count, resume,
    set_aux, set_syncflag, suspend_and_enqueue, suspend_and_enqueue_nolock, task_self, task_stat,
    yield_to, yield_with,
};
pub use sched::spawn::{
    TaskEntry, runtime_fin, runtime_init, task_exit, task_spawn, task_spawn_under, task_wait,
};
pub use sched::taskq::{EnqueueCallback, TaskQueue};
