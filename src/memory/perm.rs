//! Page permission sets.
//!
//! A `Perm` is a hardware `PageTableFlags` value restricted to what a user
//! mapping may carry. Copy-on-write is software-available bit 11. A `Perm`
//! is never writable and copy-on-write at the same time.

use core::fmt;

use x86_64::structures::paging::PageTableFlags;

use crate::syscalls::dispatcher::SyscallError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Perm(PageTableFlags);

impl Perm {
    pub const COW: PageTableFlags = PageTableFlags::BIT_11;

    /// Bits the hardware ignores and software may use.
    pub const AVAIL: PageTableFlags = PageTableFlags::BIT_9
        .union(PageTableFlags::BIT_10)
        .union(PageTableFlags::BIT_11);

    /// Bits a user environment may request through a syscall.
    pub const SYSCALL: PageTableFlags = Self::AVAIL
        .union(PageTableFlags::PRESENT)
        .union(PageTableFlags::WRITABLE)
        .union(PageTableFlags::USER_ACCESSIBLE);

    pub const USER_RO: Perm = Perm(PageTableFlags::PRESENT.union(PageTableFlags::USER_ACCESSIBLE));
    pub const USER_RW: Perm = Perm(Self::USER_RO.0.union(PageTableFlags::WRITABLE));
    pub const USER_COW: Perm = Perm(Self::USER_RO.0.union(Self::COW));

    /// Wrap `flags`, refusing writable copy-on-write combinations.
    pub fn new(flags: PageTableFlags) -> Result<Self, SyscallError> {
        if flags.contains(PageTableFlags::WRITABLE | Self::COW) {
            return Err(SyscallError::InvalidArgument);
        }
        Ok(Perm(flags))
    }

    /// Decode a permission word passed in a syscall register: it must name a
    /// present user page and stay inside [`Perm::SYSCALL`].
    pub fn from_user(bits: u64) -> Result<Self, SyscallError> {
        let flags = PageTableFlags::from_bits(bits).ok_or(SyscallError::InvalidArgument)?;
        if !Self::SYSCALL.contains(flags) || !flags.contains(Self::USER_RO.0) {
            return Err(SyscallError::InvalidArgument);
        }
        Self::new(flags)
    }

    pub fn flags(self) -> PageTableFlags {
        self.0
    }

    pub fn bits(self) -> u64 {
        self.0.bits()
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn is_cow(self) -> bool {
        self.0.contains(Self::COW)
    }

    /// Same permission with write access traded for copy-on-write.
    pub fn copy_on_write(self) -> Perm {
        Perm((self.0 - PageTableFlags::WRITABLE) | Self::COW)
    }

    pub fn syscall_subset(self) -> Perm {
        Perm(self.0 & Self::SYSCALL)
    }

    /// True when every bit of `required` is present in `self`.
    pub fn allows(self, required: Perm) -> bool {
        self.0.contains(required.0)
    }
}

impl fmt::Debug for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Perm(")?;
        for (set, name) in [
            (self.is_present(), "P"),
            (self.is_writable(), "W"),
            (self.is_user(), "U"),
            (self.is_cow(), "COW"),
        ] {
            if set {
                write!(f, "{name}")?;
            } else {
                f.write_str("-")?;
            }
        }
        write!(f, " {:#x})", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_bit_is_bit_eleven() {
        assert_eq!(Perm::COW.bits(), 0x800);
        assert_eq!(Perm::SYSCALL.bits(), 0xe07);
    }

    #[test]
    fn writable_cow_is_rejected() {
        let bad = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | Perm::COW;
        assert_eq!(Perm::new(bad), Err(SyscallError::InvalidArgument));
        assert_eq!(Perm::from_user(bad.bits()), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn from_user_requires_present_user_and_syscall_bits() {
        assert!(Perm::from_user(0x7).is_ok());
        assert!(Perm::from_user(0x805).is_ok());
        // missing U
        assert!(Perm::from_user(0x3).is_err());
        // missing P
        assert!(Perm::from_user(0x6).is_err());
        // global bit is outside the syscall subset
        assert!(Perm::from_user(0x107).is_err());
    }

    #[test]
    fn copy_on_write_drops_write_keeps_the_rest() {
        let rw = Perm::from_user(0x407).unwrap();
        let cow = rw.copy_on_write();
        assert!(!cow.is_writable());
        assert!(cow.is_cow() && cow.is_present() && cow.is_user());
        assert!(cow.flags().contains(PageTableFlags::BIT_10));
        assert_eq!(cow.copy_on_write(), cow);
    }

    #[test]
    fn syscall_subset_masks_hardware_bits() {
        let raw = PageTableFlags::PRESENT
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::ACCESSED
            | PageTableFlags::DIRTY;
        let perm = Perm::new(raw).unwrap().syscall_subset();
        assert_eq!(perm, Perm::USER_RO);
    }
}
