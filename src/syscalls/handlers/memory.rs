use x86_64::VirtAddr;

use crate::env::EnvId;
use crate::kernel::Kernel;
use crate::memlayout::{page_aligned, USER_TOP};
use crate::memory::Perm;
use crate::syscalls::dispatcher::{SyscallError, SyscallResult};

fn user_page(va: VirtAddr) -> Result<VirtAddr, SyscallError> {
    if va.as_u64() >= USER_TOP || !page_aligned(va.as_u64()) {
        return Err(SyscallError::InvalidArgument);
    }
    Ok(va)
}

impl Kernel {
    /// Map a fresh zeroed page at `va`, replacing any existing mapping.
    pub(crate) fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        target: EnvId,
        va: VirtAddr,
        perm: u64,
    ) -> SyscallResult {
        let target = self.envs.resolve(target, caller, true)?;
        let va = user_page(va)?;
        let perm = Perm::from_user(perm)?;
        self.page_alloc(target, va, perm)?;
        Ok(0)
    }

    /// Map the page at `srcva` in `src` at `dstva` in `dst`. Write access
    /// cannot be granted on a page the source holds read-only.
    pub(crate) fn sys_page_map(
        &mut self,
        caller: EnvId,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: u64,
    ) -> SyscallResult {
        let src = self.envs.resolve(src, caller, true)?;
        let dst = self.envs.resolve(dst, caller, true)?;
        let srcva = user_page(srcva)?;
        let dstva = user_page(dstva)?;
        let perm = Perm::from_user(perm)?;

        let pte = self
            .envs
            .get(src)
            .and_then(|env| env.space.lookup(srcva))
            .ok_or(SyscallError::InvalidArgument)?;
        if perm.is_writable() && !pte.perm.is_writable() {
            return Err(SyscallError::InvalidArgument);
        }

        let env = self.envs.get_mut(dst).ok_or(SyscallError::BadEnvironment)?;
        env.space.insert(&mut self.frames, dstva, pte.frame, perm)?;
        Ok(0)
    }

    pub(crate) fn sys_page_unmap(
        &mut self,
        caller: EnvId,
        target: EnvId,
        va: VirtAddr,
    ) -> SyscallResult {
        let target = self.envs.resolve(target, caller, true)?;
        let va = user_page(va)?;
        let env = self.envs.get_mut(target).ok_or(SyscallError::BadEnvironment)?;
        env.space.remove(&mut self.frames, va);
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memlayout::{PAGE_SIZE, UTEXT};

    const RW: u64 = 0x7;
    const RO: u64 = 0x5;

    fn kernel() -> (Kernel, EnvId) {
        let mut kernel = Kernel::new(KernelConfig::with_frames(16));
        let id = kernel.env_create().unwrap();
        (kernel, id)
    }

    #[test]
    fn page_alloc_checks_address_and_permissions() {
        let (mut k, id) = kernel();
        let va = VirtAddr::new(UTEXT);
        assert_eq!(
            k.sys_page_alloc(id, EnvId::SELF, va + 1u64, RW),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            k.sys_page_alloc(id, EnvId::SELF, VirtAddr::new(USER_TOP), RW),
            Err(SyscallError::InvalidArgument)
        );
        // not user accessible
        assert_eq!(k.sys_page_alloc(id, EnvId::SELF, va, 0x3), Err(SyscallError::InvalidArgument));
        // global bit is outside the syscall set
        assert_eq!(
            k.sys_page_alloc(id, EnvId::SELF, va, RW | 0x100),
            Err(SyscallError::InvalidArgument)
        );
        // writable and copy-on-write together
        assert_eq!(
            k.sys_page_alloc(id, EnvId::SELF, va, RW | 0x800),
            Err(SyscallError::InvalidArgument)
        );

        assert_eq!(k.sys_page_alloc(id, EnvId::SELF, va, RW), Ok(0));
        assert_eq!(k.env(id).unwrap().space.lookup(va).unwrap().perm, Perm::USER_RW);
    }

    #[test]
    fn page_alloc_reports_exhaustion() {
        let mut k = Kernel::new(KernelConfig::with_frames(3));
        let id = k.env_create().unwrap();
        assert_eq!(
            k.sys_page_alloc(id, EnvId::SELF, VirtAddr::new(UTEXT), RW),
            Err(SyscallError::NoMemory)
        );
        assert_eq!(k.frames().free_count(), 1);
    }

    #[test]
    fn page_map_refuses_write_on_a_read_only_source() {
        let (mut k, id) = kernel();
        let src = VirtAddr::new(UTEXT);
        let dst = VirtAddr::new(UTEXT + PAGE_SIZE);
        k.sys_page_alloc(id, EnvId::SELF, src, RO).unwrap();

        assert_eq!(
            k.sys_page_map(id, EnvId::SELF, src, EnvId::SELF, dst, RW),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            k.sys_page_map(id, EnvId::SELF, dst, EnvId::SELF, src, RO),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(k.sys_page_map(id, EnvId::SELF, src, EnvId::SELF, dst, RO), Ok(0));

        let space = &k.env(id).unwrap().space;
        let frame = space.lookup(src).unwrap().frame;
        assert_eq!(space.lookup(dst).unwrap().frame, frame);
        assert_eq!(k.frames().refcount(frame), 2);
    }

    #[test]
    fn unmap_releases_the_last_reference() {
        let (mut k, id) = kernel();
        let va = VirtAddr::new(UTEXT);
        let before = k.frames().free_count();
        k.sys_page_alloc(id, EnvId::SELF, va, RW).unwrap();
        k.sys_page_unmap(id, EnvId::SELF, va).unwrap();
        // the page table frame stays with the address space
        assert_eq!(k.frames().free_count(), before - 1);
        assert!(k.env(id).unwrap().space.lookup(va).is_none());
        // unmapping nothing is fine
        assert_eq!(k.sys_page_unmap(id, EnvId::SELF, va), Ok(0));
    }

    #[test]
    fn strangers_cannot_touch_each_others_pages() {
        let (mut k, a) = kernel();
        let b = k.env_create().unwrap();
        assert_eq!(
            k.sys_page_alloc(a, b, VirtAddr::new(UTEXT), RW),
            Err(SyscallError::BadEnvironment)
        );
    }
}
