//! # Gate table
//!
//! The 256-entry IDT. It is built once; each core loads it with `lidt`.
//!
//! | Vector         | Source                 | DPL |
//! |----------------|------------------------|-----|
//! | 0-8, 10-14     | CPU exceptions         | 0   |
//! | 3              | Breakpoint (`int3`)    | 3   |
//! | 16-19          | CPU exceptions         | 0   |
//! | 33, 36, 39, 40 | PIC lines (see `pic`)  | 0   |
//! | 48             | System call            | 3   |
//!
//! Every other vector holds a non-present gate, so delivering it raises a
//! general protection fault instead of jumping anywhere.
//!
//! Handlers are the assembly stubs in `trapentry`, installed by address.
//! `set_handler_addr` takes the code selector from the live `CS`, so the
//! table must be built after the GDT is loaded.

use x86_64::structures::idt::{EntryOptions, InterruptDescriptorTable};
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt::DOUBLE_FAULT_IST_INDEX;
use super::pic::Irq;
use crate::trap::frame::*;

/// Vectors the kernel installs and the privilege allowed to raise each with
/// a software interrupt.
pub const TRAP_GATES: [(u64, PrivilegeLevel); 23] = {
    use PrivilegeLevel::{Ring0, Ring3};
    [
        (T_DIVIDE, Ring0),
        (T_DEBUG, Ring0),
        (T_NMI, Ring0),
        (T_BRKPT, Ring3),
        (T_OFLOW, Ring0),
        (T_BOUND, Ring0),
        (T_ILLOP, Ring0),
        (T_DEVICE, Ring0),
        (T_DBLFLT, Ring0),
        (T_TSS, Ring0),
        (T_SEGNP, Ring0),
        (T_STACK, Ring0),
        (T_GPFLT, Ring0),
        (T_PGFLT, Ring0),
        (T_FPERR, Ring0),
        (T_ALIGN, Ring0),
        (T_MCHK, Ring0),
        (T_SIMDERR, Ring0),
        (T_SYSCALL, Ring3),
        (Irq::Keyboard.vector() as u64, Ring0),
        (Irq::Serial.vector() as u64, Ring0),
        (Irq::Spurious.vector() as u64, Ring0),
        (Irq::Clock.vector() as u64, Ring0),
    ]
};

pub struct GateTable {
    idt: InterruptDescriptorTable,
    missing: Option<u8>,
}

/// Point the gate for `vector` at `handler`.
///
/// Exceptions that push an error code, and machine check, have their own
/// entry types in the IDT and cannot be reached through indexing.
///
/// # Safety
/// `handler` must be a trap entry stub for `vector`.
unsafe fn install(
    idt: &mut InterruptDescriptorTable,
    vector: u8,
    handler: VirtAddr,
) -> &mut EntryOptions {
    unsafe {
        match u64::from(vector) {
            T_DBLFLT => idt.double_fault.set_handler_addr(handler),
            T_TSS => idt.invalid_tss.set_handler_addr(handler),
            T_SEGNP => idt.segment_not_present.set_handler_addr(handler),
            T_STACK => idt.stack_segment_fault.set_handler_addr(handler),
            T_GPFLT => idt.general_protection_fault.set_handler_addr(handler),
            T_PGFLT => idt.page_fault.set_handler_addr(handler),
            T_ALIGN => idt.alignment_check.set_handler_addr(handler),
            T_MCHK => idt.machine_check.set_handler_addr(handler),
            _ => idt[vector].set_handler_addr(handler),
        }
    }
}

impl GateTable {
    /// Fill every recognized vector with the stub `handler_for` reports.
    /// Vectors without a stub keep their missing gate.
    pub fn build(handler_for: impl Fn(u8) -> Option<u64>) -> Self {
        let mut idt = InterruptDescriptorTable::new();
        let mut missing = None;
        for (vector, dpl) in TRAP_GATES {
            let vector = vector as u8;
            let handler = handler_for(vector).and_then(|addr| VirtAddr::try_new(addr).ok());
            let Some(handler) = handler else {
                missing = missing.or(Some(vector));
                continue;
            };
            // SAFETY: `handler_for` names the entry stub of each vector.
            let options = unsafe { install(&mut idt, vector, handler) };
            options.set_privilege_level(dpl);
            if u64::from(vector) == T_DBLFLT {
                // SAFETY: every core's TSS carries a double-fault stack.
                unsafe { options.set_stack_index(DOUBLE_FAULT_IST_INDEX) };
            }
        }
        Self { idt, missing }
    }

    /// First recognized vector that was left without a handler.
    pub fn first_missing(&self) -> Option<u8> {
        self.missing
    }

    pub fn idt(&self) -> &InterruptDescriptorTable {
        &self.idt
    }

    /// Point this core's IDTR at the table.
    pub fn load(&'static self) {
        self.idt.load();
    }
}
