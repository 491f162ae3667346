use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use super::Platform;
use crate::trap::frame::Trapframe;

/// Software platform for the hosted machine. Interrupt sources are counters,
/// the console is a line buffer.
#[derive(Debug, Default)]
pub struct HostedPlatform {
    pub console: String,
    pub eois: Vec<u8>,
    pub rtc_reads: usize,
    pub keyboard_irqs: usize,
    pub serial_irqs: usize,
    pub monitor_entries: usize,
    pub interrupts_enabled: bool,
    fault_address: u64,
    input: VecDeque<u8>,
}

impl HostedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the address the next page-fault trap reports, as CR2 would.
    pub fn set_fault_address(&mut self, va: u64) {
        self.fault_address = va;
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    pub fn console_lines(&self) -> impl Iterator<Item = &str> {
        self.console.lines()
    }
}

impl Platform for HostedPlatform {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    fn fault_address(&self) -> u64 {
        self.fault_address
    }

    fn rtc_check_status(&mut self) -> u8 {
        self.rtc_reads += 1;
        0
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        self.eois.push(irq);
    }

    fn keyboard_interrupt(&mut self) {
        self.keyboard_irqs += 1;
    }

    fn serial_interrupt(&mut self) {
        self.serial_irqs += 1;
    }

    fn monitor(&mut self, _tf: &mut Trapframe) {
        self.monitor_entries += 1;
    }

    fn cputs(&mut self, s: &str) {
        self.console.push_str(s);
    }

    fn cgetc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}
