//! Upcall entry: the code an environment runs when the kernel redirects it
//! after a page fault.
//!
//! On entry the stack pointer addresses a `UTrapframe`. The entry calls the
//! registered handler, then resumes the faulting code with its trap-time
//! registers. The trap-time `rip` is stored in the word just below the
//! trap-time stack pointer, which is what a `ret` off that stack would pop.

use x86_64::VirtAddr;

use super::pgfault::PgfaultError;
use super::UserSpace;
use crate::env::EnvId;
use crate::memlayout::UTEXT;
use crate::trap::frame::UTrapframe;

/// User address registered as the fault upcall.
pub const PGFAULT_UPCALL: u64 = UTEXT + 0x20;

pub fn pgfault_upcall(env: &mut dyn UserSpace) -> Result<(), PgfaultError> {
    let frame_va = VirtAddr::new_truncate(env.registers().rsp);
    let mut raw = [0u8; UTrapframe::SIZE as usize];
    env.read(frame_va, &mut raw).map_err(PgfaultError::Access)?;
    let utf = UTrapframe::from_bytes(&raw);

    let Some(handler) = env.runtime().pgfault_handler else {
        abort(env, PgfaultError::NoHandler, &utf);
        return Err(PgfaultError::NoHandler);
    };
    if let Err(e) = handler(env, &utf) {
        abort(env, e, &utf);
        return Err(e);
    }

    let ret_slot = VirtAddr::new_truncate(utf.rsp.wrapping_sub(8));
    env.write(ret_slot, &utf.rip.to_le_bytes()).map_err(PgfaultError::Access)?;

    let mut tf = env.registers();
    tf.regs = utf.regs;
    tf.rflags = utf.rflags;
    tf.rsp = utf.rsp;
    tf.rip = utf.rip;
    env.set_registers(tf);
    Ok(())
}

fn abort(env: &mut dyn UserSpace, err: PgfaultError, utf: &UTrapframe) {
    log::error!("unrecoverable fault at {:#x} ip {:#x}: {}", utf.fault_va, utf.rip, err);
    if let Err(e) = env.env_destroy(EnvId::SELF) {
        log::error!("env_destroy after fault: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::{UXSTACK_BOTTOM, UXSTACK_TOP};
    use crate::memory::Perm;
    use crate::trap::frame::{PushRegs, Trapframe};
    use crate::ulib::mock::MockSpace;
    use crate::ulib::pgfault::pgfault;
    use crate::ulib::UserMemory;

    const STACK: u64 = 0x7000_0000;
    const DATA: u64 = 0x90_0000;

    fn faulted(perm: Perm) -> (MockSpace, UTrapframe) {
        let mut env = MockSpace::new();
        env.map(UXSTACK_BOTTOM, Perm::USER_RW, 0);
        env.map(STACK, Perm::USER_RW, 0);
        env.map(DATA, perm, 0x5a);

        let utf = UTrapframe {
            fault_va: DATA + 8,
            err: 0x7,
            regs: PushRegs { rax: 11, rbx: 22, ..PushRegs::default() },
            rip: 0x80_1234,
            rflags: 0x246,
            rsp: STACK + 0x800,
        };
        let frame = UXSTACK_TOP - UTrapframe::SIZE;
        env.write(VirtAddr::new(frame), &utf.to_bytes()).unwrap();
        env.regs = Trapframe { rsp: frame, rip: PGFAULT_UPCALL, cs: 0x23, ..Trapframe::default() };
        env.runtime.pgfault_handler = Some(pgfault);
        (env, utf)
    }

    #[test]
    fn resumes_at_trap_time_state() {
        let (mut env, utf) = faulted(Perm::USER_COW);

        pgfault_upcall(&mut env).unwrap();

        assert_eq!(env.regs.rip, utf.rip);
        assert_eq!(env.regs.rsp, utf.rsp);
        assert_eq!(env.regs.rflags, 0x246);
        assert_eq!(env.regs.regs, utf.regs);
        assert_eq!(env.regs.cs, 0x23);
        let mut slot = [0u8; 8];
        env.read(VirtAddr::new(utf.rsp - 8), &mut slot).unwrap();
        assert_eq!(u64::from_le_bytes(slot), utf.rip);
        assert_eq!(env.perm(DATA), Some(Perm::USER_RW));
    }

    #[test]
    fn handler_failure_destroys_environment() {
        let (mut env, _) = faulted(Perm::USER_RO);

        let err = pgfault_upcall(&mut env).unwrap_err();
        assert_eq!(err, PgfaultError::NotCopyOnWrite(VirtAddr::new(DATA + 8)));
        assert_eq!(env.destroyed, [EnvId::SELF]);
        assert_ne!(env.regs.rip, 0x80_1234);
    }

    #[test]
    fn missing_handler_destroys_environment() {
        let (mut env, _) = faulted(Perm::USER_COW);
        env.runtime.pgfault_handler = None;

        assert_eq!(pgfault_upcall(&mut env), Err(PgfaultError::NoHandler));
        assert_eq!(env.destroyed.len(), 1);
    }
}
