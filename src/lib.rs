//! # envkern
//!
//! Trap dispatch and copy-on-write fork for a small x86_64 kernel that runs
//! isolated user environments.
//!
//! ## Layout
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `interrupts`  | Gate table, GDT/TSS per core, PIC, trap trampolines    |
//! | `trap`        | Trapframes, the dispatcher, the page-fault upcall      |
//! | `syscalls`    | Syscall numbers, decoding and handlers                 |
//! | `env`         | Environment table and round-robin yield               |
//! | `memory`      | Permissions, frame pool, per-environment mappings      |
//! | `platform`    | Devices, console and monitor seen by the dispatcher    |
//! | `ulib`        | User-side fork and copy-on-write fault handling        |
//! | `hosted`      | Software machine that runs the kernel and user library |
//!
//! The library builds without `std` so the same code links into the boot
//! image; unit tests run on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use spin::Mutex;
use uart_16550::SerialPort;

pub mod config;
pub mod env;
pub mod hosted;
pub mod interrupts;
pub mod kernel;
pub mod logger;
pub mod memlayout;
pub mod memory;
pub mod platform;
pub mod selftest;
pub mod syscalls;
pub mod trap;
pub mod ulib;

pub use config::KernelConfig;
pub use env::{EnvId, EnvStatus};
pub use kernel::Kernel;
pub use trap::{Dispatch, Fatal};

pub static SERIAL: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x3F8) });

#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let mut serial = $crate::SERIAL.lock();
        let _ = writeln!(serial, $($arg)*);
    }};
}
