use x86_64::VirtAddr;

use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::syscalls::dispatcher::{SyscallError, SyscallResult};

impl Kernel {
    /// Destroy the caller or one of its children.
    pub(crate) fn sys_env_destroy(&mut self, caller: EnvId, target: EnvId) -> SyscallResult {
        let target = self.envs.resolve(target, caller, true)?;
        if target == caller {
            log::info!("[{}] exiting gracefully", caller);
        } else {
            log::info!("[{}] destroying {}", caller, target);
        }
        self.env_destroy(target);
        Ok(0)
    }

    /// Create a child that is a register-level copy of the caller with an
    /// empty address space. The child sees 0 as the result of this call and
    /// stays `NotRunnable` until its parent marks it runnable.
    pub(crate) fn sys_exofork(&mut self, caller: EnvId) -> SyscallResult {
        let tf = self.envs.get(caller).ok_or(SyscallError::BadEnvironment)?.tf;
        let child = self.envs.alloc(caller)?;
        if let Some(env) = self.envs.get_mut(child) {
            env.tf = tf;
            env.tf.regs.rax = 0;
        }
        log::info!("[{}] exofork -> {}", caller, child);
        Ok(child.raw() as usize)
    }

    pub(crate) fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        target: EnvId,
        status: Option<EnvStatus>,
    ) -> SyscallResult {
        let status = match status {
            Some(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
            _ => return Err(SyscallError::InvalidArgument),
        };
        let target = self.envs.resolve(target, caller, true)?;
        let env = self.envs.get_mut(target).ok_or(SyscallError::BadEnvironment)?;
        env.status = status;
        Ok(0)
    }

    pub(crate) fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        target: EnvId,
        upcall: VirtAddr,
    ) -> SyscallResult {
        let target = self.envs.resolve(target, caller, true)?;
        let env = self.envs.get_mut(target).ok_or(SyscallError::BadEnvironment)?;
        env.pgfault_upcall = Some(upcall);
        Ok(0)
    }
}
