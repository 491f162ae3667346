//! Reflecting user page faults to the environment's own handler.
//!
//! ```text
//!   UXSTACK_TOP ─▶ ┌──────────────┐
//!                  │ UTrapframe 1 │ ◀─ first fault
//!                  ├──────────────┤
//!                  │  handler     │
//!                  │  stack use   │
//!   trap-time rsp ▶├──────────────┤
//!                  │ 1 word gap   │ ◀─ return address slot
//!                  ├──────────────┤
//!                  │ UTrapframe 2 │ ◀─ fault inside the handler
//!                  └──────────────┘
//! ```

use alloc::format;

use x86_64::VirtAddr;

use super::frame::UTrapframe;
use super::Fatal;
use crate::env::EnvId;
use crate::kernel::Kernel;
use crate::memlayout::{UXSTACK_BOTTOM, UXSTACK_TOP};
use crate::memory::Perm;
use crate::platform::Platform;

/// Reserved between a recursive fault frame and the trap-time stack.
const RECURSIVE_GAP: u64 = 8;

/// Where the fault frame goes for a fault taken with stack pointer `rsp`.
/// `None` when the exception stack has no room left.
pub fn fault_frame_address(rsp: u64) -> Option<u64> {
    let top = if (UXSTACK_BOTTOM..UXSTACK_TOP).contains(&rsp) {
        rsp - RECURSIVE_GAP
    } else {
        UXSTACK_TOP
    };
    top.checked_sub(UTrapframe::SIZE)
        .filter(|addr| *addr >= UXSTACK_BOTTOM)
}

impl Kernel {
    pub(super) fn page_fault_handler(
        &mut self,
        id: EnvId,
        platform: &mut dyn Platform,
    ) -> Result<(), Fatal> {
        let fault_va = platform.fault_address();
        let Some(env) = self.envs.get(id) else {
            return Ok(());
        };
        let tf = env.tf;

        if !tf.from_user() {
            return Err(Fatal::KernelPageFault { va: fault_va, rip: tf.rip });
        }

        let Some(upcall) = env.pgfault_upcall else {
            platform.cputs(&format!("[{}] user fault va {:08x} ip {:08x}\n", id, fault_va, tf.rip));
            log::warn!("[{}] page fault at {:#x} with no upcall", id, fault_va);
            self.env_destroy(id);
            return Ok(());
        };

        let checked = fault_frame_address(tf.rsp).ok_or(tf.rsp).and_then(|addr| {
            env.space
                .user_mem_check(VirtAddr::new(addr), UTrapframe::SIZE, Perm::USER_RW)
                .map(|()| addr)
                .map_err(|bad| bad.as_u64())
        });
        let utf_addr = match checked {
            Ok(addr) => addr,
            Err(bad) => {
                platform.cputs(&format!(
                    "[{}] user_mem_check assertion failure for va {:08x}\n",
                    id, bad
                ));
                log::warn!("[{}] unusable exception stack, rsp {:#x}", id, tf.rsp);
                self.env_destroy(id);
                return Ok(());
            }
        };

        let utf = UTrapframe::capture(&tf, fault_va);
        if env.space.write(&mut self.frames, VirtAddr::new(utf_addr), &utf.to_bytes()).is_err() {
            self.env_destroy(id);
            return Ok(());
        }

        if let Some(env) = self.envs.get_mut(id) {
            env.tf.rsp = utf_addr;
            env.tf.rip = upcall.as_u64();
        }
        log::debug!("[{}] fault {:#x} reflected to upcall, frame at {:#x}", id, fault_va, utf_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::PAGE_SIZE;

    #[test]
    fn first_fault_goes_at_the_top() {
        assert_eq!(fault_frame_address(0x7000), Some(UXSTACK_TOP - UTrapframe::SIZE));
        assert_eq!(fault_frame_address(UXSTACK_TOP), Some(UXSTACK_TOP - UTrapframe::SIZE));
    }

    #[test]
    fn recursive_fault_leaves_one_word() {
        let rsp = UXSTACK_TOP - UTrapframe::SIZE - 64;
        let addr = fault_frame_address(rsp).unwrap();
        assert_eq!(addr + UTrapframe::SIZE + 8, rsp);
    }

    #[test]
    fn exhausted_exception_stack_has_no_slot() {
        assert_eq!(fault_frame_address(UXSTACK_BOTTOM + 100), None);
        assert!(fault_frame_address(UXSTACK_BOTTOM + UTrapframe::SIZE + 8).is_some());
        assert_eq!(UXSTACK_TOP - UXSTACK_BOTTOM, PAGE_SIZE);
    }
}
