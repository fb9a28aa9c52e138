//! Machine context switch primitive.
//!
//! `switch_context(from, to, word)` saves the callee-saved register state on
//! the current stack, stores the stack pointer through `from`, resumes the
//! stack saved in `to`, and hands `word` to the resumed side as its return
//! value. The runtime threads the current-context pointer through `word` so
//! a resumed fiber can re-establish its thread-local surroundings.
//!
//! Fresh stacks are primed by [`prepare_stack`] so that the first switch
//! lands in a trampoline which calls `entry(word, data)` with a
//! call-boundary-aligned stack. The entry function must never return.
//!
//! Only the callee-saved set is preserved (x86_64 SysV: rbp, rbx, r12-r15;
//! aarch64 AAPCS64: x19-x28, fp, lr, d8-d15): the switch is a plain `extern
//! "C"` call boundary, so caller-saved registers are already dead.

use core::arch::naked_asm;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft fibers support x86_64 and aarch64 only");

/// Entry signature for a fresh fiber: the transfer word and the opaque data
/// pointer it was primed with.
pub(crate) type FiberEntry = extern "C" fn(usize, *mut u8) -> !;

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(
    _from: *mut usize,
    _to: *const usize,
    _word: usize,
) -> usize {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "mov rax, rdx",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// First-switch landing pad: forwards the transfer word (rax) and the primed
/// data pointer (r12) to the entry function (rbx).
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() -> ! {
    naked_asm!(
        "mov rdi, rax",
        "mov rsi, r12",
        "call rbx",
        "ud2",
    )
}

/// Prime a fresh stack so the first switch into it calls `entry(word, data)`.
/// Returns the stack-pointer word to store as the fiber's saved context.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn prepare_stack(top: *mut u8, entry: FiberEntry, data: *mut u8) -> usize {
    // 16-align, then lay the pop frame out so the trampoline starts with
    // rsp % 16 == 0 (the `call rbx` leaves the callee correctly aligned).
    let top = ((top as usize) & !15) as *mut usize;
    *top.sub(1) = fiber_trampoline as usize; // ret target
    *top.sub(2) = 0; //                         rbp
    *top.sub(3) = entry as usize; //            rbx
    *top.sub(4) = data as usize; //             r12
    *top.sub(5) = 0; //                         r13
    *top.sub(6) = 0; //                         r14
    *top.sub(7) = 0; //                         r15
    top.sub(7) as usize
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(
    _from: *mut usize,
    _to: *const usize,
    _word: usize,
) -> usize {
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x9, sp",
        "str x9, [x0]",
        "ldr x9, [x1]",
        "mov sp, x9",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "mov x0, x2",
        "ret",
    )
}

/// First-switch landing pad: forwards the transfer word (x0) and the primed
/// data pointer (x20) to the entry function (x19).
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() -> ! {
    naked_asm!(
        "mov x1, x20",
        "blr x19",
        "brk #0",
    )
}

#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn prepare_stack(top: *mut u8, entry: FiberEntry, data: *mut u8) -> usize {
    let top = (top as usize) & !15;
    let sp = (top - 160) as *mut usize;
    core::ptr::write_bytes(sp as *mut u8, 0, 160);
    *sp.add(0) = entry as usize; //              x19
    *sp.add(1) = data as usize; //               x20
    *sp.add(11) = fiber_trampoline as usize; //  x30 (lr)
    sp as usize
}
