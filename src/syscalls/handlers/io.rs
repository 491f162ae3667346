use alloc::format;
use alloc::string::String;
use alloc::vec;

use crate::env::EnvId;
use crate::kernel::Kernel;
use crate::memory::Perm;
use crate::platform::Platform;
use crate::syscalls::dispatcher::{user_va, SyscallError, SyscallResult};

impl Kernel {
    /// Print `len` bytes at `ptr` from the caller's memory. A buffer the
    /// caller cannot read destroys the caller.
    pub(crate) fn sys_cputs(
        &mut self,
        caller: EnvId,
        ptr: usize,
        len: usize,
        platform: &mut dyn Platform,
    ) -> SyscallResult {
        let env = self.envs.get(caller).ok_or(SyscallError::BadEnvironment)?;
        let checked = user_va(ptr).map_err(|_| ptr as u64).and_then(|va| {
            env.space
                .user_mem_check(va, len as u64, Perm::USER_RO)
                .map(|()| va)
                .map_err(|bad| bad.as_u64())
        });
        let va = match checked {
            Ok(va) => va,
            Err(bad) => {
                platform.cputs(&format!(
                    "[{}] user_mem_check assertion failure for va {:08x}\n",
                    caller, bad
                ));
                self.env_destroy(caller);
                return Err(SyscallError::Fault);
            }
        };

        let mut buf = vec![0u8; len];
        env.space.read(&self.frames, va, &mut buf).map_err(|_| SyscallError::Fault)?;
        platform.cputs(&String::from_utf8_lossy(&buf));
        Ok(0)
    }

    pub(crate) fn sys_cgetc(&mut self, platform: &mut dyn Platform) -> usize {
        platform.cgetc().map_or(0, usize::from)
    }
}
