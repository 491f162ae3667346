//! # Trap dispatch
//!
//! Every interrupt, exception and system call enters the kernel through
//! [`Kernel::trap`] with interrupts disabled.
//!
//! | Vector            | Handling                                         |
//! |-------------------|--------------------------------------------------|
//! | IRQ 7 (spurious)  | Note it on the console, keep running             |
//! | 14 page fault     | Fatal from the kernel, else user fault upcall    |
//! | 48 system call    | Run it, result in `rax`, same environment        |
//! | 3 breakpoint      | Kernel monitor, then continue                    |
//! | IRQ 8 clock       | Acknowledge, EOI, yield                          |
//! | IRQ 1, IRQ 4      | Keyboard / serial, keep running                  |
//! | anything else     | Fatal from the kernel, else destroy the env      |
//!
//! The clock interrupt is the only point where a running environment is
//! preempted.

pub mod frame;
pub mod pgfault;

use alloc::format;
use core::fmt;

use crate::env::{EnvId, EnvStatus};
use crate::interrupts::pic::{Irq, IRQ_CLOCK, IRQ_KBD, IRQ_SERIAL};
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::syscalls::dispatcher::SyscallContext;
use frame::{trapname, Trapframe, T_BRKPT, T_PGFLT, T_SYSCALL};

/// What the core does once the kernel is done with a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Restore this environment's saved trapframe.
    Resume(EnvId),
    /// Nothing is runnable: wait for the next interrupt.
    Idle,
    /// A fatal condition was recorded; stop the core.
    Halt(Fatal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    KernelPageFault { va: u64, rip: u64 },
    UnhandledTrap { trapno: u64, rip: u64 },
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Fatal::KernelPageFault { va, rip } => {
                write!(f, "page fault in kernel mode: va {:08x} ip {:08x}", va, rip)
            }
            Fatal::UnhandledTrap { trapno, rip } => {
                write!(
                    f,
                    "unhandled trap {} ({}) in kernel at ip {:08x}",
                    trapno,
                    trapname(trapno),
                    rip
                )
            }
        }
    }
}

impl Kernel {
    /// Handle one trap taken on `cpu`. `frame` is the hand-off copy built by
    /// the entry trampoline; it is only read here and never trusted after
    /// being copied into the current environment.
    pub fn trap(&mut self, cpu: usize, frame: &Trapframe, platform: &mut dyn Platform) -> Dispatch {
        if let Some(cause) = self.fatal {
            return Dispatch::Halt(cause);
        }
        assert!(
            !platform.interrupts_enabled(),
            "trap {} entered with interrupts enabled",
            frame.trapno
        );

        #[cfg(feature = "debug_trap")]
        log::debug!(
            "cpu{} trap {} ({}) from {:?}",
            cpu,
            frame.trapno,
            trapname(frame.trapno),
            frame.privilege()
        );

        let Some(id) = self.current(cpu) else {
            return self.trap_idle(cpu, frame, platform);
        };

        let Some(env) = self.envs.get_mut(id) else {
            return self.sched_yield(cpu);
        };
        if env.status == EnvStatus::Dying {
            self.env_free(id);
            return self.sched_yield(cpu);
        }
        env.tf = *frame;

        if let Err(cause) = self.trap_dispatch(cpu, id, platform) {
            return self.halt(cause, platform);
        }

        match self.envs.get(id).map(|env| env.status) {
            Some(EnvStatus::Running) => Dispatch::Resume(id),
            Some(EnvStatus::Dying) => {
                self.env_free(id);
                self.sched_yield(cpu)
            }
            _ => self.sched_yield(cpu),
        }
    }

    fn trap_dispatch(
        &mut self,
        cpu: usize,
        id: EnvId,
        platform: &mut dyn Platform,
    ) -> Result<(), Fatal> {
        let tf = match self.envs.get(id) {
            Some(env) => env.tf,
            None => return Ok(()),
        };

        match tf.trapno {
            T_PGFLT => return self.page_fault_handler(id, platform),
            T_SYSCALL => {
                let ctx = SyscallContext::from_trapframe(&tf);
                let ret = match self.dispatch_syscall(cpu, ctx, platform) {
                    Ok(value) => value as u64,
                    Err(e) => e.as_errno() as u64,
                };
                if let Some(env) = self.envs.get_mut(id) {
                    env.tf.regs.rax = ret;
                }
                return Ok(());
            }
            T_BRKPT => {
                if let Some(env) = self.envs.get_mut(id) {
                    platform.monitor(&mut env.tf);
                }
                return Ok(());
            }
            _ => {}
        }

        if let Some(irq) = Irq::from_vector(tf.trapno) {
            self.device_interrupt(cpu, irq, platform);
            return Ok(());
        }

        log::debug!("unexpected trap\n{}", tf);
        if !tf.from_user() {
            return Err(Fatal::UnhandledTrap { trapno: tf.trapno, rip: tf.rip });
        }
        platform.cputs(&format!(
            "[{}] unhandled trap {} ({}) ip {:08x}\n",
            id,
            tf.trapno,
            trapname(tf.trapno),
            tf.rip
        ));
        log::warn!("[{}] destroyed by unhandled {}", id, trapname(tf.trapno));
        self.env_destroy(id);
        Ok(())
    }

    fn device_interrupt(&mut self, cpu: usize, irq: Irq, platform: &mut dyn Platform) {
        match irq.line() {
            IRQ_CLOCK => {
                platform.rtc_check_status();
                platform.end_of_interrupt(IRQ_CLOCK);
                self.yield_current(cpu);
            }
            IRQ_KBD => {
                platform.keyboard_interrupt();
                platform.end_of_interrupt(IRQ_KBD);
            }
            IRQ_SERIAL => {
                platform.serial_interrupt();
                platform.end_of_interrupt(IRQ_SERIAL);
            }
            // Spurious: no EOI, the PIC never set the in-service bit.
            line => {
                platform.cputs(&format!("Spurious interrupt on irq {}\n", line));
                log::debug!("spurious interrupt on irq {}", line);
            }
        }
    }

    /// Demote the running environment so the dispatcher reschedules.
    pub(crate) fn yield_current(&mut self, cpu: usize) {
        if let Some(env) = self.current(cpu).and_then(|id| self.envs.get_mut(id)) {
            if env.status == EnvStatus::Running {
                env.status = EnvStatus::Runnable;
            }
        }
    }

    /// A trap with no environment on this core: the idle loop was
    /// interrupted. Only device interrupts are expected here.
    fn trap_idle(
        &mut self,
        cpu: usize,
        frame: &Trapframe,
        platform: &mut dyn Platform,
    ) -> Dispatch {
        if let Some(irq) = Irq::from_vector(frame.trapno) {
            self.device_interrupt(cpu, irq, platform);
            return self.sched_yield(cpu);
        }
        let cause = if frame.trapno == T_PGFLT {
            Fatal::KernelPageFault { va: platform.fault_address(), rip: frame.rip }
        } else {
            Fatal::UnhandledTrap { trapno: frame.trapno, rip: frame.rip }
        };
        log::debug!("trap with no environment\n{}", frame);
        self.halt(cause, platform)
    }

    fn halt(&mut self, cause: Fatal, platform: &mut dyn Platform) -> Dispatch {
        log::error!("kernel panic: {}", cause);
        platform.cputs(&format!("kernel panic: {}\n", cause));
        self.fatal = Some(cause);
        Dispatch::Halt(cause)
    }
}
