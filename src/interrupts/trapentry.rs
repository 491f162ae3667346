//! Trap entry stubs and the return path.
//!
//! Each stub pushes a zero error code when the processor supplies none, then
//! the vector number, and jumps to `__alltraps`. `__alltraps` completes a
//! [`Trapframe`] on the stack and hands its address to [`trap_entry`].
//! `__env_pop_tf` is the inverse: it unwinds a trapframe and `iretq`s.

use core::arch::global_asm;

use x86_64::registers::control::Cr2;

use super::pic::Irq;
use crate::kernel::{try_with_kernel, Unavailable, KERNEL};
use crate::platform::PcPlatform;
use crate::trap::frame::*;
use crate::trap::Dispatch;

global_asm!(
    r#"
.macro TRAPHANDLER name, num
.global \name
\name:
    push \num
    jmp __alltraps
.endm

.macro TRAPHANDLER_NOEC name, num
.global \name
\name:
    push 0
    push \num
    jmp __alltraps
.endm

.section .text

TRAPHANDLER_NOEC trap_divide, 0
TRAPHANDLER_NOEC trap_debug, 1
TRAPHANDLER_NOEC trap_nmi, 2
TRAPHANDLER_NOEC trap_brkpt, 3
TRAPHANDLER_NOEC trap_oflow, 4
TRAPHANDLER_NOEC trap_bound, 5
TRAPHANDLER_NOEC trap_illop, 6
TRAPHANDLER_NOEC trap_device, 7
TRAPHANDLER trap_dblflt, 8
TRAPHANDLER trap_tss, 10
TRAPHANDLER trap_segnp, 11
TRAPHANDLER trap_stack, 12
TRAPHANDLER trap_gpflt, 13
TRAPHANDLER trap_pgflt, 14
TRAPHANDLER_NOEC trap_fperr, 16
TRAPHANDLER trap_align, 17
TRAPHANDLER_NOEC trap_mchk, 18
TRAPHANDLER_NOEC trap_simderr, 19
TRAPHANDLER_NOEC trap_syscall, 48

TRAPHANDLER_NOEC irq_kbd, 33
TRAPHANDLER_NOEC irq_serial, 36
TRAPHANDLER_NOEC irq_spurious, 39
TRAPHANDLER_NOEC irq_clock, 40

__alltraps:
    sub rsp, 16
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov ax, es
    movzx eax, ax
    mov [rsp + 120], rax
    mov ax, ds
    movzx eax, ax
    mov [rsp + 128], rax
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov rdi, rsp
    cld
    call trap_entry
    ud2

.global __env_pop_tf
__env_pop_tf:
    mov rsp, rdi
    mov rax, [rsp + 120]
    mov es, ax
    mov rax, [rsp + 128]
    mov ds, ax
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 32
    iretq
"#
);

extern "C" {
    fn trap_divide();
    fn trap_debug();
    fn trap_nmi();
    fn trap_brkpt();
    fn trap_oflow();
    fn trap_bound();
    fn trap_illop();
    fn trap_device();
    fn trap_dblflt();
    fn trap_tss();
    fn trap_segnp();
    fn trap_stack();
    fn trap_gpflt();
    fn trap_pgflt();
    fn trap_fperr();
    fn trap_align();
    fn trap_mchk();
    fn trap_simderr();
    fn trap_syscall();
    fn irq_kbd();
    fn irq_serial();
    fn irq_spurious();
    fn irq_clock();

    fn __env_pop_tf(tf: *const Trapframe) -> !;
}

const V_KBD: u64 = Irq::Keyboard.vector() as u64;
const V_SERIAL: u64 = Irq::Serial.vector() as u64;
const V_SPURIOUS: u64 = Irq::Spurious.vector() as u64;
const V_CLOCK: u64 = Irq::Clock.vector() as u64;

/// Address of the entry stub for `vector`, if the kernel handles it.
pub fn stub_address(vector: u8) -> Option<u64> {
    let stub: unsafe extern "C" fn() = match u64::from(vector) {
        T_DIVIDE => trap_divide,
        T_DEBUG => trap_debug,
        T_NMI => trap_nmi,
        T_BRKPT => trap_brkpt,
        T_OFLOW => trap_oflow,
        T_BOUND => trap_bound,
        T_ILLOP => trap_illop,
        T_DEVICE => trap_device,
        T_DBLFLT => trap_dblflt,
        T_TSS => trap_tss,
        T_SEGNP => trap_segnp,
        T_STACK => trap_stack,
        T_GPFLT => trap_gpflt,
        T_PGFLT => trap_pgflt,
        T_FPERR => trap_fperr,
        T_ALIGN => trap_align,
        T_MCHK => trap_mchk,
        T_SIMDERR => trap_simderr,
        T_SYSCALL => trap_syscall,
        V_KBD => irq_kbd,
        V_SERIAL => irq_serial,
        V_SPURIOUS => irq_spurious,
        V_CLOCK => irq_clock,
        _ => return None,
    };
    Some(stub as usize as u64)
}

/// Restore `tf` and return to the code it describes.
fn env_pop_tf(tf: &Trapframe) -> ! {
    unsafe { __env_pop_tf(tf) }
}

fn halt_forever() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Wait for interrupts with nothing to run. Each interrupt re-enters
/// `trap_entry` from kernel privilege.
fn idle() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// A trap taken while this core already holds the kernel: a fault inside
/// `Kernel::trap` itself. Report what we can and stop.
fn nested_kernel_trap(frame: &Trapframe) -> ! {
    let va = Cr2::read_raw();
    crate::println!(
        "kernel panic: {} ({}) inside the trap handler, ip {:08x}, va {:08x}",
        frame.trapno,
        trapname(frame.trapno),
        frame.rip,
        va
    );
    halt_forever()
}

#[no_mangle]
extern "C" fn trap_entry(frame: *mut Trapframe) -> ! {
    // SAFETY: `__alltraps` passes the frame it just built on this stack.
    let frame = unsafe { *frame };
    let mut platform = PcPlatform;

    // Only the boot processor takes traps; APs are never started.
    let cpu = 0;

    let dispatch = match try_with_kernel(&KERNEL, |k| k.trap(cpu, &frame, &mut platform)) {
        Ok(dispatch) => dispatch,
        Err(Unavailable::Reentered) => nested_kernel_trap(&frame),
        Err(Unavailable::NotInstalled) => {
            crate::println!(
                "trap {} ({}) before the kernel was installed",
                frame.trapno,
                trapname(frame.trapno)
            );
            halt_forever();
        }
    };

    match dispatch {
        Dispatch::Resume(id) => {
            let tf = match try_with_kernel(&KERNEL, |k| k.env(id).map(|env| env.tf)) {
                Ok(tf) => tf,
                Err(_) => nested_kernel_trap(&frame),
            };
            match tf {
                Some(tf) => env_pop_tf(&tf),
                None => halt_forever(),
            }
        }
        Dispatch::Idle if !frame.from_user() => env_pop_tf(&frame),
        Dispatch::Idle => idle(),
        Dispatch::Halt(_) => halt_forever(),
    }
}
