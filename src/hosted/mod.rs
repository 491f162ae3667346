//! # Hosted machine
//!
//! Runs the kernel without hardware. Environments are driven from Rust: a
//! `HostedEnv` stands for "the code of one environment, running on a core",
//! and turns every system call into a real syscall trap and every access
//! the page tables forbid into a real page-fault trap. When the kernel
//! redirects the environment to its fault upcall, the upcall entry runs
//! right there, just as it would on the exception stack.
//!
//! ```ignore
//! let mut machine = Machine::new(KernelConfig::default());
//! let parent = machine.spawn()?;
//! let mut env = machine.user(parent);
//! env.page_alloc(EnvId::SELF, va, Perm::USER_RW)?;
//! match fork(&mut env)? { ... }
//! ```

pub mod user;

use alloc::collections::{BTreeMap, BTreeSet};

pub use user::HostedEnv;

use crate::config::KernelConfig;
use crate::env::EnvId;
use crate::kernel::Kernel;
use crate::memlayout::GD_KT;
use crate::platform::HostedPlatform;
use crate::syscalls::dispatcher::SyscallError;
use crate::trap::frame::{Trapframe, T_PGFLT};
use crate::trap::Dispatch;
use crate::ulib::UserRuntime;

pub struct Machine {
    pub kernel: Kernel,
    pub platform: HostedPlatform,
    runtimes: BTreeMap<EnvId, UserRuntime>,
    /// Children that have not yet returned from their `exofork`.
    unforked: BTreeSet<EnvId>,
}

impl Machine {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            kernel: Kernel::new(config),
            platform: HostedPlatform::new(),
            runtimes: BTreeMap::new(),
            unforked: BTreeSet::new(),
        }
    }

    /// Create a runnable environment with fresh library state.
    pub fn spawn(&mut self) -> Result<EnvId, SyscallError> {
        let id = self.kernel.env_create()?;
        self.runtimes.insert(id, UserRuntime { this_env: id, pgfault_handler: None });
        Ok(id)
    }

    /// The environment `id`, running on core 0.
    pub fn user(&mut self, id: EnvId) -> HostedEnv<'_> {
        self.user_on(0, id)
    }

    pub fn user_on(&mut self, cpu: usize, id: EnvId) -> HostedEnv<'_> {
        HostedEnv::new(self, cpu, id)
    }

    /// Library state of `id`, if it was ever given any.
    pub fn runtime(&self, id: EnvId) -> Option<&UserRuntime> {
        self.runtimes.get(&id)
    }

    /// True while `id` exists and is not on its way out.
    pub fn alive(&self, id: EnvId) -> bool {
        self.kernel.env(id).map_or(false, |env| !env.is_dying())
    }

    /// Deliver trap `trapno` on `cpu` as if it interrupted whatever runs
    /// there: the current environment, or the idle loop.
    pub fn raise(&mut self, cpu: usize, trapno: u64) -> Dispatch {
        let mut tf = match self.kernel.current(cpu).and_then(|id| self.kernel.env(id)) {
            Some(env) => env.tf,
            None => Trapframe { cs: u64::from(GD_KT), ..Trapframe::default() },
        };
        tf.trapno = trapno;
        if trapno != T_PGFLT {
            tf.err = 0;
        }
        let dispatch = self.kernel.trap(cpu, &tf, &mut self.platform);
        self.reap();
        dispatch
    }

    /// Drop the library state of environments the kernel has freed.
    pub(crate) fn reap(&mut self) {
        let kernel = &self.kernel;
        self.runtimes.retain(|id, _| kernel.env(*id).is_some());
        self.unforked.retain(|id| kernel.env(*id).is_some());
    }

    pub(crate) fn runtime_mut(&mut self, id: EnvId) -> &mut UserRuntime {
        self.runtimes.entry(id).or_default()
    }

    /// A new child starts with a copy of its parent's library state and
    /// resumes inside `exofork`.
    pub(crate) fn record_exofork(&mut self, parent: EnvId, child: EnvId) {
        let runtime = self.runtimes.get(&parent).copied().unwrap_or_default();
        self.runtimes.insert(child, runtime);
        self.unforked.insert(child);
    }

    pub(crate) fn take_exofork_return(&mut self, id: EnvId) -> bool {
        self.unforked.remove(&id)
    }
}
