use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use super::Machine;
use crate::env::{EnvId, EnvStatus};
use crate::memlayout::PAGE_SIZE;
use crate::memory::{Perm, TableLevel};
use crate::syscalls::dispatcher::{SyscallContext, SyscallError};
use crate::syscalls::SyscallNumber;
use crate::trap::frame::{Trapframe, T_PGFLT, T_SYSCALL};
use crate::ulib::pfentry::{pgfault_upcall, PGFAULT_UPCALL};
use crate::ulib::{AccessError, Exofork, Syscalls, UserMemory, UserRuntime};

/// Faults tolerated on one page before an access gives up.
const MAX_FAULTS: usize = 4;

/// One environment's code running on one core of a [`Machine`].
pub struct HostedEnv<'m> {
    machine: &'m mut Machine,
    cpu: usize,
    id: EnvId,
}

impl<'m> HostedEnv<'m> {
    pub(super) fn new(machine: &'m mut Machine, cpu: usize, id: EnvId) -> Self {
        Self { machine, cpu, id }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn machine(&mut self) -> &mut Machine {
        self.machine
    }

    /// Make this environment the one running on its core.
    fn enter(&mut self) -> bool {
        let kernel = &mut self.machine.kernel;
        match kernel.env(self.id).map(|env| env.status) {
            Some(EnvStatus::Running) if kernel.current(self.cpu) == Some(self.id) => true,
            Some(EnvStatus::Runnable) => {
                kernel.env_run(self.cpu, self.id);
                true
            }
            _ => false,
        }
    }

    /// Issue `int 0x30` with `num` and `args` from the current registers.
    fn syscall(&mut self, num: SyscallNumber, args: [usize; 5]) -> Result<usize, SyscallError> {
        if !self.enter() {
            return Err(SyscallError::BadEnvironment);
        }
        let mut tf = self.registers();
        SyscallContext::encode(num, args, &mut tf);
        tf.trapno = T_SYSCALL;
        tf.err = 0;

        let machine = &mut *self.machine;
        machine.kernel.trap(self.cpu, &tf, &mut machine.platform);
        machine.reap();

        let rax = machine
            .kernel
            .env(self.id)
            .map(|env| env.tf.regs.rax as isize)
            .ok_or(SyscallError::BadEnvironment)?;
        if rax < 0 {
            return Err(SyscallError::from_errno(rax).unwrap_or(SyscallError::InvalidSyscall));
        }
        Ok(rax as usize)
    }

    /// Wait until the page holding `va` allows the access, taking page
    /// faults the way the processor would.
    fn touch(&mut self, va: VirtAddr, write: bool) -> Result<(), AccessError> {
        for _ in 0..MAX_FAULTS {
            if !self.enter() {
                return Err(AccessError::Destroyed);
            }
            let perm = self.pte(va);
            let allowed = perm.map_or(false, |perm| {
                perm.is_present() && perm.is_user() && (!write || perm.is_writable())
            });
            if allowed {
                return Ok(());
            }
            self.page_fault(va, write, perm.is_some())?;
        }
        log::warn!("[{}] fault at {:#x} keeps recurring", self.id, va.as_u64());
        Err(AccessError::Unresolved(va))
    }

    fn page_fault(&mut self, va: VirtAddr, write: bool, present: bool) -> Result<(), AccessError> {
        let mut err = PageFaultErrorCode::USER_MODE;
        if write {
            err |= PageFaultErrorCode::CAUSED_BY_WRITE;
        }
        if present {
            err |= PageFaultErrorCode::PROTECTION_VIOLATION;
        }
        let mut tf = self.registers();
        tf.trapno = T_PGFLT;
        tf.err = err.bits();

        let machine = &mut *self.machine;
        machine.platform.set_fault_address(va.as_u64());
        machine.kernel.trap(self.cpu, &tf, &mut machine.platform);
        machine.reap();

        if !self.machine.alive(self.id) {
            return Err(AccessError::Destroyed);
        }
        if self.registers().rip == PGFAULT_UPCALL && self.enter() {
            if pgfault_upcall(self).is_err() && !self.machine.alive(self.id) {
                return Err(AccessError::Destroyed);
            }
        }
        Ok(())
    }

    fn access(&mut self, va: VirtAddr, len: usize, write: bool) -> Result<(), AccessError> {
        if len == 0 {
            return Ok(());
        }
        let first = va.align_down(PAGE_SIZE).as_u64();
        let end = va.as_u64().saturating_add(len as u64 - 1);
        let last = VirtAddr::new_truncate(end).align_down(PAGE_SIZE).as_u64();
        for page in (first..=last).step_by(PAGE_SIZE as usize) {
            let addr = if page < va.as_u64() { va } else { VirtAddr::new(page) };
            self.touch(addr, write)?;
        }
        Ok(())
    }
}

impl Syscalls for HostedEnv<'_> {
    fn cputs(&mut self, va: VirtAddr, len: usize) -> Result<(), SyscallError> {
        self.syscall(SyscallNumber::Cputs, [va.as_u64() as usize, len, 0, 0, 0])
            .map(drop)
    }

    fn cgetc(&mut self) -> Option<u8> {
        match self.syscall(SyscallNumber::Cgetc, [0; 5]) {
            Ok(0) | Err(_) => None,
            Ok(c) => Some(c as u8),
        }
    }

    fn yield_cpu(&mut self) {
        if let Err(e) = self.syscall(SyscallNumber::Yield, [0; 5]) {
            log::warn!("[{}] sys_yield: {}", self.id, e);
        }
    }

    fn getenvid(&mut self) -> EnvId {
        self.syscall(SyscallNumber::GetEnvId, [0; 5])
            .map_or(EnvId::SELF, |raw| EnvId::from_raw(raw as u32))
    }

    fn env_destroy(&mut self, env: EnvId) -> Result<(), SyscallError> {
        match self.syscall(SyscallNumber::EnvDestroy, [env.raw() as usize, 0, 0, 0, 0]) {
            Err(SyscallError::BadEnvironment) if !self.machine.alive(self.id) => Ok(()),
            result => result.map(drop),
        }
    }

    /// A child that has not yet returned from its `exofork` sees
    /// `Exofork::Child` here, without entering the kernel.
    fn exofork(&mut self) -> Result<Exofork, SyscallError> {
        if self.machine.take_exofork_return(self.id) {
            return Ok(Exofork::Child);
        }
        let child = EnvId::from_raw(self.syscall(SyscallNumber::Exofork, [0; 5])? as u32);
        self.machine.record_exofork(self.id, child);
        Ok(Exofork::Parent(child))
    }

    fn env_set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), SyscallError> {
        self.syscall(SyscallNumber::EnvSetStatus, [env.raw() as usize, status as usize, 0, 0, 0])
            .map(drop)
    }

    fn env_set_pgfault_upcall(&mut self, env: EnvId, upcall: VirtAddr) -> Result<(), SyscallError> {
        self.syscall(
            SyscallNumber::EnvSetPgfaultUpcall,
            [env.raw() as usize, upcall.as_u64() as usize, 0, 0, 0],
        )
        .map(drop)
    }

    fn page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: Perm) -> Result<(), SyscallError> {
        self.syscall(
            SyscallNumber::PageAlloc,
            [env.raw() as usize, va.as_u64() as usize, perm.bits() as usize, 0, 0],
        )
        .map(drop)
    }

    fn page_map(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: Perm,
    ) -> Result<(), SyscallError> {
        self.syscall(
            SyscallNumber::PageMap,
            [
                src.raw() as usize,
                srcva.as_u64() as usize,
                dst.raw() as usize,
                dstva.as_u64() as usize,
                perm.bits() as usize,
            ],
        )
        .map(drop)
    }

    fn page_unmap(&mut self, env: EnvId, va: VirtAddr) -> Result<(), SyscallError> {
        self.syscall(SyscallNumber::PageUnmap, [env.raw() as usize, va.as_u64() as usize, 0, 0, 0])
            .map(drop)
    }
}

impl UserMemory for HostedEnv<'_> {
    fn table_present(&self, level: TableLevel, va: VirtAddr) -> bool {
        self.machine
            .kernel
            .env(self.id)
            .map_or(false, |env| env.space.table_present(level, va))
    }

    fn pte(&self, va: VirtAddr) -> Option<Perm> {
        let env = self.machine.kernel.env(self.id)?;
        env.space.lookup(va).map(|pte| pte.perm)
    }

    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError> {
        self.access(va, buf.len(), false)?;
        let kernel = &self.machine.kernel;
        let env = kernel.env(self.id).ok_or(AccessError::Destroyed)?;
        env.space.read(kernel.frames(), va, buf).map_err(AccessError::Unresolved)
    }

    fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), AccessError> {
        self.access(va, data.len(), true)?;
        let kernel = &mut self.machine.kernel;
        let env = kernel.envs.get(self.id).ok_or(AccessError::Destroyed)?;
        env.space.write(&mut kernel.frames, va, data).map_err(AccessError::Unresolved)
    }

    fn registers(&self) -> Trapframe {
        self.machine.kernel.env(self.id).map(|env| env.tf).unwrap_or_default()
    }

    fn set_registers(&mut self, tf: Trapframe) {
        if let Some(env) = self.machine.kernel.env_mut(self.id) {
            env.tf = tf;
        }
    }

    fn runtime(&mut self) -> &mut UserRuntime {
        self.machine.runtime_mut(self.id)
    }
}
