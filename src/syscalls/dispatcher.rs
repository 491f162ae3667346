use core::fmt;

use x86_64::VirtAddr;

use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::syscalls::numbers::SyscallNumber;
use crate::trap::frame::Trapframe;

/// System call result type
pub type SyscallResult = Result<usize, SyscallError>;

/// Kernel errors, as returned to user space in `rax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Environment does not exist or the caller may not touch it.
    BadEnvironment,
    InvalidArgument,
    NoMemory,
    NoFreeEnvironment,
    /// Bad user memory.
    Fault,
    InvalidSyscall,
}

impl SyscallError {
    pub fn as_errno(self) -> isize {
        match self {
            Self::BadEnvironment => -2,
            Self::InvalidArgument => -3,
            Self::NoMemory => -4,
            Self::NoFreeEnvironment => -5,
            Self::Fault => -6,
            Self::InvalidSyscall => -7,
        }
    }

    pub fn from_errno(errno: isize) -> Option<Self> {
        match errno {
            -2 => Some(Self::BadEnvironment),
            -3 => Some(Self::InvalidArgument),
            -4 => Some(Self::NoMemory),
            -5 => Some(Self::NoFreeEnvironment),
            -6 => Some(Self::Fault),
            -7 => Some(Self::InvalidSyscall),
            _ => None,
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadEnvironment => "bad environment",
            Self::InvalidArgument => "invalid parameter",
            Self::NoMemory => "out of memory",
            Self::NoFreeEnvironment => "out of environments",
            Self::Fault => "segmentation fault",
            Self::InvalidSyscall => "invalid system call",
        })
    }
}

/// System call context - contains all registers from the syscall
#[derive(Debug, Clone, Copy)]
pub struct SyscallContext {
    pub syscall_num: usize,
    pub arg0: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    pub arg4: usize,
    pub arg5: usize,
}

impl SyscallContext {
    /// Decode the saved registers of a `int 0x30` trap.
    ///
    ///   rax = syscall number
    ///   rdi = arg0
    ///   rsi = arg1
    ///   rdx = arg2
    ///   r10 = arg3
    ///   r8  = arg4
    ///   r9  = arg5
    pub fn from_trapframe(tf: &Trapframe) -> Self {
        let r = &tf.regs;
        Self {
            syscall_num: r.rax as usize,
            arg0: r.rdi as usize,
            arg1: r.rsi as usize,
            arg2: r.rdx as usize,
            arg3: r.r10 as usize,
            arg4: r.r8 as usize,
            arg5: r.r9 as usize,
        }
    }

    /// Registers to load for issuing `num` with `args`.
    pub fn encode(num: SyscallNumber, args: [usize; 5], tf: &mut Trapframe) {
        let r = &mut tf.regs;
        r.rax = num.as_usize() as u64;
        r.rdi = args[0] as u64;
        r.rsi = args[1] as u64;
        r.rdx = args[2] as u64;
        r.r10 = args[3] as u64;
        r.r8 = args[4] as u64;
    }
}

pub(crate) fn user_va(raw: usize) -> Result<VirtAddr, SyscallError> {
    VirtAddr::try_new(raw as u64).map_err(|_| SyscallError::InvalidArgument)
}

pub(crate) fn env_arg(raw: usize) -> EnvId {
    EnvId::from_raw(raw as u32)
}

impl Kernel {
    /// Run the syscall in `ctx` on behalf of the environment current on `cpu`.
    pub fn dispatch_syscall(
        &mut self,
        cpu: usize,
        ctx: SyscallContext,
        platform: &mut dyn Platform,
    ) -> SyscallResult {
        let caller = self.current(cpu).ok_or(SyscallError::BadEnvironment)?;
        let syscall = SyscallNumber::from(ctx.syscall_num);

        #[cfg(feature = "trace_syscall")]
        log::debug!(
            "[{}] SYSCALL: {:?}({:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
            caller, syscall, ctx.arg0, ctx.arg1, ctx.arg2, ctx.arg3, ctx.arg4
        );

        match syscall {
            SyscallNumber::Cputs => self.sys_cputs(caller, ctx.arg0, ctx.arg1, platform),
            SyscallNumber::Cgetc => Ok(self.sys_cgetc(platform)),

            SyscallNumber::GetEnvId => Ok(caller.raw() as usize),
            SyscallNumber::EnvDestroy => self.sys_env_destroy(caller, env_arg(ctx.arg0)),
            SyscallNumber::Yield => {
                self.yield_current(cpu);
                Ok(0)
            }
            SyscallNumber::Exofork => self.sys_exofork(caller),
            SyscallNumber::EnvSetStatus => self.sys_env_set_status(
                caller,
                env_arg(ctx.arg0),
                EnvStatus::from_raw(ctx.arg1 as u64),
            ),
            SyscallNumber::EnvSetPgfaultUpcall => {
                self.sys_env_set_pgfault_upcall(caller, env_arg(ctx.arg0), user_va(ctx.arg1)?)
            }

            SyscallNumber::PageAlloc => {
                self.sys_page_alloc(caller, env_arg(ctx.arg0), user_va(ctx.arg1)?, ctx.arg2 as u64)
            }
            SyscallNumber::PageMap => self.sys_page_map(
                caller,
                env_arg(ctx.arg0),
                user_va(ctx.arg1)?,
                env_arg(ctx.arg2),
                user_va(ctx.arg3)?,
                ctx.arg4 as u64,
            ),
            SyscallNumber::PageUnmap => {
                self.sys_page_unmap(caller, env_arg(ctx.arg0), user_va(ctx.arg1)?)
            }

            SyscallNumber::Unknown => Err(SyscallError::InvalidSyscall),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_round_trip() {
        for e in [
            SyscallError::BadEnvironment,
            SyscallError::InvalidArgument,
            SyscallError::NoMemory,
            SyscallError::NoFreeEnvironment,
            SyscallError::Fault,
            SyscallError::InvalidSyscall,
        ] {
            assert!(e.as_errno() < 0);
            assert_eq!(SyscallError::from_errno(e.as_errno()), Some(e));
        }
        assert_eq!(SyscallError::from_errno(0), None);
    }

    #[test]
    fn context_reads_the_syscall_registers() {
        let mut tf = Trapframe::default();
        SyscallContext::encode(SyscallNumber::PageMap, [1, 2, 3, 4, 5], &mut tf);
        let ctx = SyscallContext::from_trapframe(&tf);
        assert_eq!(SyscallNumber::from(ctx.syscall_num), SyscallNumber::PageMap);
        assert_eq!([ctx.arg0, ctx.arg1, ctx.arg2, ctx.arg3, ctx.arg4], [1, 2, 3, 4, 5]);
    }
}
