//! Low-level context switching using naked functions with compile-time
//! offsets.
//!
//! `offset_of!` is used for every struct field access from assembly, so a
//! layout change in `SwitchContext` is caught at compile time instead of
//! corrupting registers at run time.

use core::arch::naked_asm;
use core::mem::offset_of;

/// Callee-saved register set for a software context switch.
///
/// `rip` is informational (the resume point is carried by the saved stack);
/// it is kept for debugging and for fresh-context bookkeeping.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchContext {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl SwitchContext {
    pub const fn zero() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: 0x202,
            rip: 0,
        }
    }
}

const _: () = assert!(core::mem::size_of::<SwitchContext>() == 72);

/// Low-level register switch between two contexts.
///
/// Saves callee-saved registers to `prev` and loads them from `next`.
/// A null `prev` means "do not save", used when the current flow is being
/// abandoned (fresh sleep-loop entry, terminal switches).
///
/// # Safety
///
/// - `next` must point to a properly initialized context whose stack is not
///   in use by any other flow.
/// - `prev`, if non-null, must stay valid until the context is resumed.
/// - Must not be called recursively on the same flow.
#[unsafe(naked)]
pub extern "sysv64" fn switch_registers(prev: *mut SwitchContext, next: *const SwitchContext) {
    naked_asm!(
        // rdi = prev context pointer
        // rsi = next context pointer

        // Skip the save when prev is null (abandoned flow).
        "test rdi, rdi",
        "jz 2f",

        // Save callee-saved registers to prev context
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",

        // Save RFLAGS via stack
        "pushfq",
        "pop QWORD PTR [rdi + {off_rflags}]",

        // Save return address as RIP (for debugging)
        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",

        // Load callee-saved registers from next context
        "2:",
        "mov rbx, [rsi + {off_rbx}]",
        "mov r12, [rsi + {off_r12}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r15, [rsi + {off_r15}]",
        "mov rbp, [rsi + {off_rbp}]",

        // Load RFLAGS
        "push QWORD PTR [rsi + {off_rflags}]",
        "popfq",

        // Switch stack (this is the actual context switch point)
        "mov rsp, [rsi + {off_rsp}]",

        // Return (pops the resume address from the new stack)
        "ret",

        off_rbx = const offset_of!(SwitchContext, rbx),
        off_r12 = const offset_of!(SwitchContext, r12),
        off_r13 = const offset_of!(SwitchContext, r13),
        off_r14 = const offset_of!(SwitchContext, r14),
        off_r15 = const offset_of!(SwitchContext, r15),
        off_rbp = const offset_of!(SwitchContext, rbp),
        off_rsp = const offset_of!(SwitchContext, rsp),
        off_rflags = const offset_of!(SwitchContext, rflags),
        off_rip = const offset_of!(SwitchContext, rip),
    );
}

/// Entry trampoline for fresh contexts.
///
/// A fresh stack is seeded with this function's address at the top, so the
/// first switch onto it "returns" here. The entry function pointer is in
/// r12, its argument in r13 (see `make_entry_context`). If the entry
/// returns, the flow falls into the exit path.
#[unsafe(naked)]
pub extern "sysv64" fn task_entry_trampoline() {
    naked_asm!(
        // r12 = entry function pointer, r13 = argument

        // Move argument to the first parameter register
        "mov rdi, r13",

        // Call the entry function
        "call r12",

        // The entry returned: run the exit protocol for the current task
        "call {task_exit}",

        // Unreachable
        "ud2",

        task_exit = sym crate::sched::scheduler::exit_from_entry,
    );
}

/// Capture the current callee-saved state so this point can be resumed
/// later (e.g. to give a backing thread its unwind point back after its
/// task terminates). Returns twice, like `setjmp`; the caller discriminates
/// through thread-local state.
#[unsafe(naked)]
pub extern "sysv64" fn init_current_context(ctx: *mut SwitchContext) {
    naked_asm!(
        // rdi = context pointer

        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",

        "pushfq",
        "pop QWORD PTR [rdi + {off_rflags}]",

        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",

        "ret",

        off_rbx = const offset_of!(SwitchContext, rbx),
        off_r12 = const offset_of!(SwitchContext, r12),
        off_r13 = const offset_of!(SwitchContext, r13),
        off_r14 = const offset_of!(SwitchContext, r14),
        off_r15 = const offset_of!(SwitchContext, r15),
        off_rbp = const offset_of!(SwitchContext, rbp),
        off_rsp = const offset_of!(SwitchContext, rsp),
        off_rflags = const offset_of!(SwitchContext, rflags),
        off_rip = const offset_of!(SwitchContext, rip),
    );
}

/// Seed `stack_top` with the trampoline and build a context that enters
/// `entry(arg)` on that stack at the first switch.
///
/// # Safety
///
/// `stack_top` must be the upper end of a live, exclusively-owned stack with
/// at least one free slot below it.
pub unsafe fn make_entry_context(
    entry: extern "C" fn(*mut core::ffi::c_void),
    arg: *mut core::ffi::c_void,
    stack_top: u64,
) -> SwitchContext {
    let top = stack_top & !0xF;
    let slot = (top - 8) as *mut u64;
    unsafe { slot.write(task_entry_trampoline as *const () as usize as u64) };

    let mut ctx = SwitchContext::zero();
    ctx.rsp = top - 8;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
    ctx.rip = task_entry_trampoline as *const () as usize as u64;
    ctx
}
