//! User-level page-fault handling and the copy-on-write resolver.

use alloc::vec;
use core::fmt;

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use super::pfentry::PGFAULT_UPCALL;
use super::{AccessError, PgfaultHandler, UserSpace};
use crate::env::EnvId;
use crate::memlayout::{PAGE_SIZE, PFTEMP, UXSTACK_BOTTOM};
use crate::memory::Perm;
use crate::syscalls::dispatcher::SyscallError;
use crate::trap::frame::UTrapframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOutcome {
    /// The page now has a private writable copy.
    Privatized,
    /// The page was already writable; nothing to do.
    AlreadyPrivate,
    /// No memory for the copy. The mapping is untouched and the access
    /// will fault again.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgfaultError {
    /// A read or execute fault reached the copy-on-write handler.
    NotAWrite(VirtAddr),
    /// A write fault on a page that is not copy-on-write.
    NotCopyOnWrite(VirtAddr),
    /// The upcall ran with no handler registered.
    NoHandler,
    Access(AccessError),
}

impl fmt::Display for PgfaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgfaultError::NotAWrite(va) => {
                write!(f, "faulting access at {:#x} is not a write", va.as_u64())
            }
            PgfaultError::NotCopyOnWrite(va) => {
                write!(f, "page at {:#x} is not copy-on-write", va.as_u64())
            }
            PgfaultError::NoHandler => write!(f, "no page fault handler registered"),
            PgfaultError::Access(e) => write!(f, "{}", e),
        }
    }
}

/// Install `handler` as this environment's page-fault handler. The first
/// call also gives the environment its exception stack. The kernel-side
/// upcall is (re)registered every time.
pub fn set_pgfault_handler(
    env: &mut dyn UserSpace,
    handler: PgfaultHandler,
) -> Result<(), SyscallError> {
    let xstack = VirtAddr::new(UXSTACK_BOTTOM);
    if env.pte(xstack).is_none() {
        env.page_alloc(EnvId::SELF, xstack, Perm::USER_RW)?;
    }
    env.env_set_pgfault_upcall(EnvId::SELF, VirtAddr::new(PGFAULT_UPCALL))?;
    env.runtime().pgfault_handler = Some(handler);
    Ok(())
}

/// The handler `fork` registers.
pub fn pgfault(env: &mut dyn UserSpace, utf: &UTrapframe) -> Result<(), PgfaultError> {
    let outcome = resolve_cow(env, utf)?;
    log::trace!("cow fault at {:#x}: {:?}", utf.fault_va, outcome);
    Ok(())
}

/// Give the faulting page a private writable copy.
pub fn resolve_cow(env: &mut dyn UserSpace, utf: &UTrapframe) -> Result<CowOutcome, PgfaultError> {
    let va = VirtAddr::new_truncate(utf.fault_va);
    let page = va.align_down(PAGE_SIZE);

    if !utf.fault_code().contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
        return Err(PgfaultError::NotAWrite(va));
    }
    match env.pte(page) {
        Some(perm) if perm.is_cow() => {}
        Some(perm) if perm.is_writable() => return Ok(CowOutcome::AlreadyPrivate),
        _ => return Err(PgfaultError::NotCopyOnWrite(va)),
    }

    let mut scratch = match ScratchPage::map(env) {
        Ok(scratch) => scratch,
        Err(e) => {
            log::warn!("cow fault at {:#x} deferred: {}", va.as_u64(), e);
            return Ok(CowOutcome::Deferred);
        }
    };

    let scratch_va = scratch.va();
    let mut bytes = vec![0u8; PAGE_SIZE as usize];
    scratch.env.read(page, &mut bytes).map_err(PgfaultError::Access)?;
    scratch.env.write(scratch_va, &bytes).map_err(PgfaultError::Access)?;

    let remapped = scratch.env.page_map(EnvId::SELF, scratch_va, EnvId::SELF, page, Perm::USER_RW);
    if let Err(e) = remapped {
        log::warn!("cow fault at {:#x} deferred: {}", va.as_u64(), e);
        return Ok(CowOutcome::Deferred);
    }
    Ok(CowOutcome::Privatized)
}

/// The page at `PFTEMP`, mapped for as long as this value lives.
struct ScratchPage<'a, E: UserSpace + ?Sized> {
    env: &'a mut E,
}

impl<'a, E: UserSpace + ?Sized> ScratchPage<'a, E> {
    fn map(env: &'a mut E) -> Result<Self, SyscallError> {
        env.page_alloc(EnvId::SELF, VirtAddr::new(PFTEMP), Perm::USER_RW)?;
        Ok(Self { env })
    }

    fn va(&self) -> VirtAddr {
        VirtAddr::new(PFTEMP)
    }
}

impl<E: UserSpace + ?Sized> Drop for ScratchPage<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.env.page_unmap(EnvId::SELF, VirtAddr::new(PFTEMP)) {
            log::warn!("unmapping scratch page: {}", e);
        }
    }
}
