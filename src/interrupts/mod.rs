//! # Interrupt plumbing
//!
//! - `gdt`: segments and the per-core task state (kernel stack for traps
//!   from user mode, double-fault stack)
//! - `gates`: the 256-entry gate table
//! - `pic`: the 8259 pair and the IRQ lines the kernel routes
//! - `trapentry`: assembly entry stubs and the return path (bare metal only)

pub mod gates;
pub mod gdt;
pub mod pic;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod trapentry;

use spin::Once;

use gates::GateTable;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use trapentry::stub_address;

/// Without the entry stubs every gate stays absent.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn stub_address(_vector: u8) -> Option<u64> {
    None
}

static GATES: Once<GateTable> = Once::new();

/// The gate table, built on first use.
pub fn trap_init() -> &'static GateTable {
    GATES.call_once(|| GateTable::build(stub_address))
}

/// Per-core trap setup: segments, task state, then the gate table.
pub fn init_percpu(cpu: usize) {
    gdt::init_percpu(cpu);
    trap_init().load();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_built_once() {
        let first: *const GateTable = trap_init();
        assert!(core::ptr::eq(first, trap_init()));
    }
}
