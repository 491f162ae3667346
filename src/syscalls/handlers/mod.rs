//! # System Call Handlers
//!
//! Implementations for every system call, as methods on `Kernel`.
//!
//! ## Modules
//!
//! - `io`: console output and input (cputs, cgetc)
//! - `process`: environment control (env_destroy, exofork, env_set_status,
//!   env_set_pgfault_upcall)
//! - `memory`: page mappings (page_alloc, page_map, page_unmap)
//!
//! ## Handler Signature
//!
//! Each handler takes the caller plus decoded arguments and returns a result:
//! ```ignore
//! fn sys_page_unmap(&mut self, caller: EnvId, target: EnvId, va: VirtAddr) -> SyscallResult
//! ```
//!
//! A target of `EnvId::SELF` names the caller. Other targets must be the
//! caller or one of its direct children.

pub mod io;
pub mod memory;
pub mod process;
