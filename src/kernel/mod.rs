//! Kernel state and environment lifecycle.
//!
//! `Kernel` owns every environment, the frame pool and the per-core
//! bookkeeping. There is exactly one instance per machine; the trap path
//! receives it explicitly together with the core it runs on.

pub mod init;
pub mod status;

pub use init::init_kernel;
pub use status::{BootPhases, PhaseState};

use spin::Mutex;
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::config::KernelConfig;
use crate::env::{sched, Env, EnvId, EnvStatus, EnvTable};
use crate::memlayout::{GD_UD, GD_UT, NCPU, PAGE_SIZE, USTACK_TOP, UTEXT};
use crate::memory::{FramePool, Perm};
use crate::syscalls::dispatcher::SyscallError;
use crate::trap::{Dispatch, Fatal};

/// The machine's kernel, installed once boot has finished.
pub static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Why the trap path could not reach the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// The lock is held: a trap taken inside the kernel on this core.
    Reentered,
    NotInstalled,
}

/// Run `f` on the kernel in `slot` without waiting for the lock. A core that
/// faults while holding it would otherwise spin forever.
pub fn try_with_kernel<R>(
    slot: &Mutex<Option<Kernel>>,
    f: impl FnOnce(&mut Kernel) -> R,
) -> Result<R, Unavailable> {
    let mut guard = slot.try_lock().ok_or(Unavailable::Reentered)?;
    let kernel = guard.as_mut().ok_or(Unavailable::NotInstalled)?;
    Ok(f(kernel))
}

#[derive(Debug, Clone, Copy, Default)]
struct Cpu {
    current: Option<EnvId>,
}

pub struct Kernel {
    pub(crate) envs: EnvTable,
    pub(crate) frames: FramePool,
    cpus: [Cpu; NCPU],
    ncpu: usize,
    pub(crate) fatal: Option<Fatal>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let config = config.normalized();
        log::info!(
            "kernel: {} env slots, {} frames, {} cpu(s)",
            config.envs,
            config.frames,
            config.cpus
        );
        Self {
            envs: EnvTable::new(config.envs),
            frames: FramePool::with_capacity(config.frames),
            cpus: [Cpu::default(); NCPU],
            ncpu: config.cpus,
            fatal: None,
        }
    }

    pub fn cpus(&self) -> usize {
        self.ncpu
    }

    pub fn current(&self, cpu: usize) -> Option<EnvId> {
        self.cpus.get(cpu).and_then(|c| c.current)
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id)
    }

    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(id)
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn fatal(&self) -> Option<Fatal> {
        self.fatal
    }

    /// Create a runnable user environment with one stack page, entering at
    /// `UTEXT` with interrupts enabled.
    pub fn env_create(&mut self) -> Result<EnvId, SyscallError> {
        let id = self.envs.alloc(EnvId::SELF)?;
        let stack = VirtAddr::new(USTACK_TOP - PAGE_SIZE);
        if let Err(e) = self.page_alloc(id, stack, Perm::USER_RW) {
            self.envs.free(id, &mut self.frames);
            return Err(e);
        }

        let env = self.envs.get_mut(id).ok_or(SyscallError::BadEnvironment)?;
        env.tf.ds = u64::from(GD_UD | 3);
        env.tf.es = u64::from(GD_UD | 3);
        env.tf.ss = u64::from(GD_UD | 3);
        env.tf.cs = u64::from(GD_UT | 3);
        env.tf.rsp = USTACK_TOP;
        env.tf.rip = UTEXT;
        // bit 1 of RFLAGS is reserved and always set
        env.tf.rflags = RFlags::INTERRUPT_FLAG.bits() | 0x2;
        env.status = EnvStatus::Runnable;
        log::info!("[{}] new env", id);
        Ok(id)
    }

    /// Allocate a zeroed frame and map it at `va` in `id`'s space.
    pub(crate) fn page_alloc(
        &mut self,
        id: EnvId,
        va: VirtAddr,
        perm: Perm,
    ) -> Result<(), SyscallError> {
        let frame = self.frames.alloc_zeroed()?;
        let env = self.envs.get_mut(id).ok_or(SyscallError::BadEnvironment)?;
        if let Err(e) = env.space.insert(&mut self.frames, va, frame, perm) {
            self.frames.release_unmapped(frame);
            return Err(e);
        }
        Ok(())
    }

    /// Make `id` the environment running on `cpu`.
    pub fn env_run(&mut self, cpu: usize, id: EnvId) -> Dispatch {
        if self.envs.get(id).is_none() {
            return self.sched_yield(cpu);
        }
        if let Some(prev) = self.cpus[cpu].current.filter(|prev| *prev != id) {
            if let Some(env) = self.envs.get_mut(prev).filter(|e| e.status == EnvStatus::Running) {
                env.status = EnvStatus::Runnable;
            }
        }
        if let Some(env) = self.envs.get_mut(id) {
            env.status = EnvStatus::Running;
        }
        self.cpus[cpu].current = Some(id);
        Dispatch::Resume(id)
    }

    /// Destroy `id`. An environment running on any core is only marked
    /// `Dying`; it is freed by the next trap on that core.
    pub fn env_destroy(&mut self, id: EnvId) {
        let Some(env) = self.envs.get_mut(id) else {
            return;
        };
        if env.status == EnvStatus::Running {
            env.status = EnvStatus::Dying;
            log::info!("[{}] dying", id);
        } else {
            self.env_free(id);
        }
    }

    pub(crate) fn env_free(&mut self, id: EnvId) {
        log::info!("[{}] free env", id);
        self.envs.free(id, &mut self.frames);
        for cpu in self.cpus.iter_mut().filter(|c| c.current == Some(id)) {
            cpu.current = None;
        }
    }

    /// Give up `cpu`: pick the next runnable environment round-robin, or
    /// go idle when there is none.
    pub fn sched_yield(&mut self, cpu: usize) -> Dispatch {
        let current = self.cpus[cpu].current;
        if let Some(env) = current.and_then(|id| self.envs.get_mut(id)) {
            if env.status == EnvStatus::Running {
                env.status = EnvStatus::Runnable;
            }
        }
        match sched::next_runnable(&self.envs, current) {
            Some(next) => self.env_run(cpu, next),
            None => {
                self.cpus[cpu].current = None;
                Dispatch::Idle
            }
        }
    }
}
