//! # Platform
//!
//! Everything the trap dispatcher needs from the machine besides memory and
//! environments: interrupt sources to acknowledge, the faulting address of
//! the last page fault, the console and the kernel monitor.
//!
//! | Implementation   | Used by                                   |
//! |------------------|-------------------------------------------|
//! | `PcPlatform`     | Bare metal: 8259 PICs, CMOS RTC, COM1, CR2 |
//! | `HostedPlatform` | The hosted machine; records every call    |

pub mod hosted;
pub mod pc;

pub use hosted::HostedPlatform;
pub use pc::PcPlatform;

use crate::trap::frame::Trapframe;

pub trait Platform {
    /// Current state of the interrupt flag.
    fn interrupts_enabled(&self) -> bool;

    /// Linear address that caused the most recent page fault.
    fn fault_address(&self) -> u64;

    /// Read the clock's status register so it raises its next interrupt.
    fn rtc_check_status(&mut self) -> u8;

    fn end_of_interrupt(&mut self, irq: u8);

    fn keyboard_interrupt(&mut self);

    fn serial_interrupt(&mut self);

    /// Run the kernel monitor on a breakpoint; returns when the monitor exits.
    fn monitor(&mut self, tf: &mut Trapframe);

    fn cputs(&mut self, s: &str);

    /// Next buffered console byte, if any.
    fn cgetc(&mut self) -> Option<u8>;
}
