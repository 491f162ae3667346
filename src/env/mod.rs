//! # Environments
//!
//! An environment is an isolated user execution unit: one saved trapframe,
//! one address space, an optional page-fault upcall.
//!
//! ```text
//!            env_alloc                exofork
//!   Free ───────────────▶ NotRunnable ◀──────── (parent)
//!                              │ env_set_status
//!                              ▼
//!                          Runnable ◀────────┐
//!                              │ env_run     │ yield / clock
//!                              ▼             │
//!                           Running ─────────┘
//!                              │ env_destroy while running
//!                              ▼
//!                            Dying ──▶ Free   (next trap on its core)
//! ```

pub mod sched;

use alloc::vec::Vec;
use core::fmt;

use x86_64::VirtAddr;

use crate::memlayout::{LOG2NENV, NENV};
use crate::memory::{AddressSpace, FramePool};
use crate::syscalls::dispatcher::SyscallError;
use crate::trap::frame::Trapframe;

const ENVGENSHIFT: u32 = 12;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(u32);

impl EnvId {
    /// Stands for the calling environment in syscall arguments.
    pub const SELF: EnvId = EnvId(0);

    pub const fn from_raw(raw: u32) -> Self {
        EnvId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl EnvStatus {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

pub struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub tf: Trapframe,
    pub pgfault_upcall: Option<VirtAddr>,
    pub space: AddressSpace,
}

impl Env {
    fn vacant(index: usize) -> Self {
        Self {
            id: EnvId(index as u32),
            parent: EnvId::SELF,
            status: EnvStatus::Free,
            tf: Trapframe::default(),
            pgfault_upcall: None,
            space: AddressSpace::new(),
        }
    }

    pub fn is_dying(&self) -> bool {
        self.status == EnvStatus::Dying
    }
}

pub struct EnvTable {
    envs: Vec<Env>,
    free: Vec<usize>,
}

impl EnvTable {
    pub fn new(slots: usize) -> Self {
        let slots = slots.clamp(1, NENV);
        Self {
            envs: (0..slots).map(Env::vacant).collect(),
            free: (0..slots).rev().collect(),
        }
    }

    /// Claim a slot with a fresh generation. The new environment is
    /// `NotRunnable` with an empty address space and a zeroed trapframe.
    pub fn alloc(&mut self, parent: EnvId) -> Result<EnvId, SyscallError> {
        let index = self.free.pop().ok_or(SyscallError::NoFreeEnvironment)?;
        let env = &mut self.envs[index];

        let mut generation = env.id.0.wrapping_add(1 << ENVGENSHIFT) & !((1 << LOG2NENV) - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        env.id = EnvId(generation | index as u32);
        env.parent = parent;
        env.status = EnvStatus::NotRunnable;
        env.tf = Trapframe::default();
        env.pgfault_upcall = None;
        Ok(env.id)
    }

    /// Return the slot to the free list, dropping its address space.
    pub fn free(&mut self, id: EnvId, frames: &mut FramePool) {
        let Some(env) = self.get_mut(id) else {
            return;
        };
        env.space.clear(frames);
        env.status = EnvStatus::Free;
        env.pgfault_upcall = None;
        self.free.push(id.index());
    }

    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.envs
            .get(id.index())
            .filter(|env| env.id == id && env.status != EnvStatus::Free)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs
            .get_mut(id.index())
            .filter(|env| env.id == id && env.status != EnvStatus::Free)
    }

    /// Resolve a syscall target. `EnvId::SELF` names `caller`; with
    /// `checkperm` the target must be the caller or one of its children.
    pub fn resolve(
        &self,
        id: EnvId,
        caller: EnvId,
        checkperm: bool,
    ) -> Result<EnvId, SyscallError> {
        if id.is_self() {
            return Ok(caller);
        }
        let env = self.get(id).ok_or(SyscallError::BadEnvironment)?;
        if checkperm && env.id != caller && env.parent != caller {
            return Err(SyscallError::BadEnvironment);
        }
        Ok(env.id)
    }

    pub fn slots(&self) -> usize {
        self.envs.len()
    }

    /// Live environment in slot `index`, if any.
    pub fn at(&self, index: usize) -> Option<&Env> {
        self.envs.get(index).filter(|env| env.status != EnvStatus::Free)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter().filter(|env| env.status != EnvStatus::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_generation_and_index() {
        let mut envs = EnvTable::new(4);
        let first = envs.alloc(EnvId::SELF).unwrap();
        assert_eq!(first.raw(), 0x1000);
        assert_eq!(first.index(), 0);

        let mut frames = FramePool::with_capacity(1);
        envs.free(first, &mut frames);
        let again = envs.alloc(EnvId::SELF).unwrap();
        assert_eq!(again.index(), 0);
        assert_ne!(again, first);
        assert!(envs.get(first).is_none());
    }

    #[test]
    fn table_exhaustion_is_no_free_environment() {
        let mut envs = EnvTable::new(1);
        envs.alloc(EnvId::SELF).unwrap();
        assert_eq!(envs.alloc(EnvId::SELF), Err(SyscallError::NoFreeEnvironment));
    }

    #[test]
    fn resolve_allows_self_and_children_only() {
        let mut envs = EnvTable::new(4);
        let parent = envs.alloc(EnvId::SELF).unwrap();
        let child = envs.alloc(parent).unwrap();
        let stranger = envs.alloc(EnvId::SELF).unwrap();

        assert_eq!(envs.resolve(EnvId::SELF, child, true), Ok(child));
        assert_eq!(envs.resolve(child, parent, true), Ok(child));
        assert_eq!(envs.resolve(parent, child, true), Err(SyscallError::BadEnvironment));
        assert_eq!(envs.resolve(parent, stranger, false), Ok(parent));
        assert_eq!(
            envs.resolve(EnvId::from_raw(0x7777), parent, false),
            Err(SyscallError::BadEnvironment)
        );
    }
}
