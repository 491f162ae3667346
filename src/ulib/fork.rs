//! Copy-on-write `fork`.
//!
//! The parent installs the COW handler, creates an empty child, and walks its
//! own page tables below `USER_TOP`. Writable and copy-on-write pages are
//! mapped copy-on-write into the child first and then remapped
//! copy-on-write in the parent. Read-only pages are shared as they are. The
//! exception stack is never shared: the child gets a fresh one.

use core::fmt;

use x86_64::VirtAddr;

use super::pfentry::PGFAULT_UPCALL;
use super::pgfault::{pgfault, set_pgfault_handler};
use super::{Exofork, UserSpace};
use crate::env::{EnvId, EnvStatus};
use crate::memlayout::{PAGE_SIZE, USER_TOP, UXSTACK_BOTTOM};
use crate::memory::{Perm, TableLevel};
use crate::syscalls::dispatcher::SyscallError;

/// What `fork` returns on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(EnvId),
    Child,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Installing the page-fault handler failed.
    Setup(SyscallError),
    Exofork(SyscallError),
    /// Sharing the page at `va` with the child failed.
    Duppage { va: VirtAddr, err: SyscallError },
    /// Giving the child its upcall, exception stack or run status failed.
    Child(SyscallError),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkError::Setup(e) => write!(f, "set_pgfault_handler: {}", e),
            ForkError::Exofork(e) => write!(f, "sys_exofork: {}", e),
            ForkError::Duppage { va, err } => write!(f, "duppage {:#x}: {}", va.as_u64(), err),
            ForkError::Child(e) => write!(f, "child setup: {}", e),
        }
    }
}

pub fn fork(env: &mut dyn UserSpace) -> Result<Fork, ForkError> {
    set_pgfault_handler(env, pgfault).map_err(ForkError::Setup)?;

    let child = match env.exofork().map_err(ForkError::Exofork)? {
        Exofork::Child => {
            let me = env.getenvid();
            env.runtime().this_env = me;
            return Ok(Fork::Child);
        }
        Exofork::Parent(child) => child,
    };

    duplicate_pages(env, child)?;

    env.env_set_pgfault_upcall(child, VirtAddr::new(PGFAULT_UPCALL))
        .map_err(ForkError::Child)?;
    env.page_alloc(child, VirtAddr::new(UXSTACK_BOTTOM), Perm::USER_RW)
        .map_err(ForkError::Child)?;
    env.env_set_status(child, EnvStatus::Runnable).map_err(ForkError::Child)?;

    log::debug!("fork: child {} runnable", child);
    Ok(Fork::Parent(child))
}

/// Share every present user page except the exception stack with `child`.
/// Regions whose upper-level table is absent are skipped whole.
fn duplicate_pages(env: &mut dyn UserSpace, child: EnvId) -> Result<(), ForkError> {
    let mut va = 0;
    'walk: while va < USER_TOP {
        let addr = VirtAddr::new(va);
        for level in TableLevel::WALK {
            if !env.table_present(level, addr) {
                va = addr.align_down(level.span()).as_u64() + level.span();
                continue 'walk;
            }
        }

        if va != UXSTACK_BOTTOM {
            if let Some(perm) = env.pte(addr).filter(|perm| perm.is_present()) {
                duppage(env, child, addr, perm)?;
            }
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

fn duppage(
    env: &mut dyn UserSpace,
    child: EnvId,
    va: VirtAddr,
    perm: Perm,
) -> Result<(), ForkError> {
    let failed = |err: SyscallError| ForkError::Duppage { va, err };

    if !perm.is_writable() && !perm.is_cow() {
        return env
            .page_map(EnvId::SELF, va, child, va, perm.syscall_subset())
            .map_err(failed);
    }

    // Child first: the parent may still write the page until its own
    // mapping loses write access.
    let cow = perm.syscall_subset().copy_on_write();
    env.page_map(EnvId::SELF, va, child, va, cow).map_err(failed)?;
    env.page_map(EnvId::SELF, va, EnvId::SELF, va, cow).map_err(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::UTEXT;
    use crate::ulib::mock::{MockSpace, CHILD};
    use x86_64::structures::paging::PageTableFlags;

    const TEXT: u64 = UTEXT;
    const DATA: u64 = UTEXT + 0x1000;
    const SHARED: u64 = UTEXT + 0x2000;
    const FAR: u64 = 0x40_0000_0000;

    fn parent() -> MockSpace {
        let mut env = MockSpace::new();
        env.exofork = Some(Exofork::Parent(CHILD));
        env.map(TEXT, Perm::USER_RO, 0x90);
        env.map(DATA, Perm::USER_RW, 0xAA);
        env.map(SHARED, Perm::USER_COW, 0x11);
        env.map(FAR, Perm::USER_RW, 0x22);
        env
    }

    #[test]
    fn parent_shares_pages_copy_on_write() {
        let mut env = parent();

        assert_eq!(fork(&mut env), Ok(Fork::Parent(CHILD)));

        assert_eq!(env.child_pages.get(&TEXT), Some(&Perm::USER_RO));
        assert_eq!(env.child_pages.get(&DATA), Some(&Perm::USER_COW));
        assert_eq!(env.child_pages.get(&SHARED), Some(&Perm::USER_COW));
        assert_eq!(env.child_pages.get(&FAR), Some(&Perm::USER_COW));

        assert_eq!(env.perm(TEXT), Some(Perm::USER_RO));
        assert_eq!(env.perm(DATA), Some(Perm::USER_COW));
        assert_eq!(env.byte(DATA), Some(0xAA));
    }

    #[test]
    fn child_gets_its_own_exception_stack_and_is_made_runnable() {
        let mut env = parent();

        fork(&mut env).unwrap();

        assert_eq!(env.perm(UXSTACK_BOTTOM), Some(Perm::USER_RW));
        assert_eq!(env.child_pages.get(&UXSTACK_BOTTOM), Some(&Perm::USER_RW));
        assert!(env.upcalls.contains(&(CHILD, VirtAddr::new(PGFAULT_UPCALL))));
        assert_eq!(env.statuses, [(CHILD, EnvStatus::Runnable)]);
    }

    #[test]
    fn software_bits_survive_duplication() {
        let mut env = parent();
        let tagged = Perm::new(Perm::USER_RW.flags() | PageTableFlags::BIT_10).unwrap();
        env.map(DATA, tagged, 0);

        fork(&mut env).unwrap();

        let child = env.child_pages[&DATA];
        assert!(child.is_cow() && !child.is_writable());
        assert!(child.flags().contains(PageTableFlags::BIT_10));
    }

    #[test]
    fn child_side_records_its_own_id() {
        let mut env = parent();
        env.exofork = Some(Exofork::Child);

        assert_eq!(fork(&mut env), Ok(Fork::Child));
        assert_eq!(env.runtime.this_env, CHILD);
        assert!(env.child_pages.is_empty());
        assert!(env.statuses.is_empty());
    }

    #[test]
    fn exofork_failure_is_reported() {
        let mut env = parent();
        env.exofork = None;

        assert_eq!(fork(&mut env), Err(ForkError::Exofork(SyscallError::NoFreeEnvironment)));
    }
}
