//! # User library
//!
//! Code that runs inside an environment: the copy-on-write page-fault
//! handler, the upcall entry that returns from it, and `fork`.
//!
//! User code reaches the kernel only through [`Syscalls`] and sees its own
//! memory and page tables only through [`UserMemory`]. The hosted machine
//! provides both; so could a real `int 0x30` binding.

pub mod fork;
pub mod pfentry;
pub mod pgfault;

#[cfg(test)]
pub(crate) mod mock;

use core::fmt;

use x86_64::VirtAddr;

use crate::env::{EnvId, EnvStatus};
use crate::memory::{Perm, TableLevel};
use crate::syscalls::dispatcher::SyscallError;
use crate::trap::frame::{Trapframe, UTrapframe};

pub use fork::{fork, Fork, ForkError};
pub use pgfault::{set_pgfault_handler, CowOutcome, PgfaultError};

/// Result of `exofork` as seen by each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exofork {
    Parent(EnvId),
    Child,
}

pub type PgfaultHandler = fn(&mut dyn UserSpace, &UTrapframe) -> Result<(), PgfaultError>;

/// Library globals of one environment. A fork child starts with a copy of
/// its parent's, exactly as it starts with a copy of its data pages.
#[derive(Clone, Copy, Default)]
pub struct UserRuntime {
    pub this_env: EnvId,
    pub pgfault_handler: Option<PgfaultHandler>,
}

impl fmt::Debug for UserRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRuntime")
            .field("this_env", &self.this_env)
            .field("pgfault_handler", &self.pgfault_handler.is_some())
            .finish()
    }
}

pub trait Syscalls {
    /// Print `len` bytes of this environment's memory at `va`.
    fn cputs(&mut self, va: VirtAddr, len: usize) -> Result<(), SyscallError>;
    /// Next console byte, if one is waiting.
    fn cgetc(&mut self) -> Option<u8>;
    fn yield_cpu(&mut self);
    fn getenvid(&mut self) -> EnvId;
    fn env_destroy(&mut self, env: EnvId) -> Result<(), SyscallError>;
    fn exofork(&mut self) -> Result<Exofork, SyscallError>;
    fn env_set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), SyscallError>;
    fn env_set_pgfault_upcall(&mut self, env: EnvId, upcall: VirtAddr) -> Result<(), SyscallError>;
    fn page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: Perm) -> Result<(), SyscallError>;
    fn page_map(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: Perm,
    ) -> Result<(), SyscallError>;
    fn page_unmap(&mut self, env: EnvId, va: VirtAddr) -> Result<(), SyscallError>;
}

/// An access the environment could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The fault killed the environment.
    Destroyed,
    /// The fault handler kept returning without fixing the mapping.
    Unresolved(VirtAddr),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Destroyed => write!(f, "environment destroyed"),
            AccessError::Unresolved(va) => write!(f, "fault at {:#x} not resolved", va.as_u64()),
        }
    }
}

pub trait UserMemory {
    /// Read-only view of the environment's own paging structures.
    fn table_present(&self, level: TableLevel, va: VirtAddr) -> bool;
    fn pte(&self, va: VirtAddr) -> Option<Perm>;

    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError>;
    fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), AccessError>;

    /// The environment's registers as they are right now.
    fn registers(&self) -> Trapframe;
    fn set_registers(&mut self, tf: Trapframe);

    fn runtime(&mut self) -> &mut UserRuntime;
}

/// Everything user code can touch.
pub trait UserSpace: Syscalls + UserMemory {}

impl<T: Syscalls + UserMemory + ?Sized> UserSpace for T {}
