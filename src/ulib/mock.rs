//! A single-environment stand-in for unit tests of the user library. Pages
//! live in a map; mappings into other environments are only recorded.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use x86_64::VirtAddr;

use super::{AccessError, Exofork, Syscalls, UserMemory, UserRuntime};
use crate::env::{EnvId, EnvStatus};
use crate::memlayout::PAGE_SIZE;
use crate::memory::{Perm, TableLevel};
use crate::syscalls::dispatcher::SyscallError;
use crate::trap::frame::Trapframe;

pub const ME: EnvId = EnvId::from_raw(0x1000);
pub const CHILD: EnvId = EnvId::from_raw(0x1001);

pub struct Page {
    pub perm: Perm,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MockSpace {
    pub pages: BTreeMap<u64, Page>,
    pub child_pages: BTreeMap<u64, Perm>,
    pub exofork: Option<Exofork>,
    pub upcalls: Vec<(EnvId, VirtAddr)>,
    pub statuses: Vec<(EnvId, EnvStatus)>,
    pub destroyed: Vec<EnvId>,
    /// Remaining page allocations before `NoMemory`.
    pub allocs_left: Option<usize>,
    pub regs: Trapframe,
    pub runtime: UserRuntime,
    pub console: String,
}

impl MockSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, va: u64, perm: Perm, fill: u8) {
        self.pages.insert(va, Page { perm, data: vec![fill; PAGE_SIZE as usize] });
    }

    pub fn perm(&self, va: u64) -> Option<Perm> {
        self.pages.get(&va).map(|p| p.perm)
    }

    pub fn byte(&self, va: u64) -> Option<u8> {
        self.pages.get(&(va & !(PAGE_SIZE - 1))).map(|p| p.data[(va % PAGE_SIZE) as usize])
    }
}

impl Syscalls for MockSpace {
    fn cputs(&mut self, va: VirtAddr, len: usize) -> Result<(), SyscallError> {
        let mut buf = vec![0u8; len];
        self.read(va, &mut buf).map_err(|_| SyscallError::Fault)?;
        self.console.push_str(&String::from_utf8_lossy(&buf));
        Ok(())
    }

    fn cgetc(&mut self) -> Option<u8> {
        None
    }

    fn yield_cpu(&mut self) {}

    fn getenvid(&mut self) -> EnvId {
        match self.exofork {
            Some(Exofork::Child) => CHILD,
            _ => ME,
        }
    }

    fn env_destroy(&mut self, env: EnvId) -> Result<(), SyscallError> {
        self.destroyed.push(env);
        Ok(())
    }

    fn exofork(&mut self) -> Result<Exofork, SyscallError> {
        self.exofork.ok_or(SyscallError::NoFreeEnvironment)
    }

    fn env_set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), SyscallError> {
        self.statuses.push((env, status));
        Ok(())
    }

    fn env_set_pgfault_upcall(&mut self, env: EnvId, upcall: VirtAddr) -> Result<(), SyscallError> {
        self.upcalls.push((env, upcall));
        Ok(())
    }

    fn page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: Perm) -> Result<(), SyscallError> {
        if let Some(left) = self.allocs_left.as_mut() {
            if *left == 0 {
                return Err(SyscallError::NoMemory);
            }
            *left -= 1;
        }
        if env.is_self() {
            self.map(va.as_u64(), perm, 0);
        } else {
            self.child_pages.insert(va.as_u64(), perm);
        }
        Ok(())
    }

    fn page_map(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: Perm,
    ) -> Result<(), SyscallError> {
        assert!(src.is_self());
        let data = self
            .pages
            .get(&srcva.as_u64())
            .map(|p| p.data.clone())
            .ok_or(SyscallError::InvalidArgument)?;
        if dst.is_self() {
            self.pages.insert(dstva.as_u64(), Page { perm, data });
        } else {
            self.child_pages.insert(dstva.as_u64(), perm);
        }
        Ok(())
    }

    fn page_unmap(&mut self, env: EnvId, va: VirtAddr) -> Result<(), SyscallError> {
        assert!(env.is_self());
        self.pages.remove(&va.as_u64());
        Ok(())
    }
}

impl UserMemory for MockSpace {
    fn table_present(&self, level: TableLevel, va: VirtAddr) -> bool {
        let start = va.align_down(level.span()).as_u64();
        self.pages.range(start..start + level.span()).next().is_some()
    }

    fn pte(&self, va: VirtAddr) -> Option<Perm> {
        self.perm(va.as_u64())
    }

    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError> {
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self.byte(va.as_u64() + i as u64).ok_or(AccessError::Unresolved(va))?;
        }
        Ok(())
    }

    fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), AccessError> {
        for (i, byte) in data.iter().enumerate() {
            let addr = va.as_u64() + i as u64;
            let page = self
                .pages
                .get_mut(&(addr & !(PAGE_SIZE - 1)))
                .ok_or(AccessError::Unresolved(va))?;
            page.data[(addr % PAGE_SIZE) as usize] = *byte;
        }
        Ok(())
    }

    fn registers(&self) -> Trapframe {
        self.regs
    }

    fn set_registers(&mut self, tf: Trapframe) {
        self.regs = tf;
    }

    fn runtime(&mut self) -> &mut UserRuntime {
        &mut self.runtime
    }
}
