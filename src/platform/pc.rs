//! PC devices behind the dispatcher: the 8259 pair, the CMOS real-time
//! clock on IRQ 8, COM1 on IRQ 4 and the PS/2 controller on IRQ 1.

use alloc::collections::VecDeque;
use core::fmt::Write;

use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::registers::control::Cr2;

use super::Platform;
use crate::interrupts::pic::{IRQ_OFFSET, PICS};
use crate::trap::frame::Trapframe;
use crate::SERIAL;

const CMOS_INDEX: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;
const RTC_REG_A: u8 = 0x0a;
const RTC_REG_B: u8 = 0x0b;
const RTC_REG_C: u8 = 0x0c;
/// Selecting a register with bit 7 set keeps NMIs masked while we talk.
const NMI_DISABLE: u8 = 0x80;
const RTC_PIE: u8 = 0x40;
/// Rate 15: 2 Hz periodic interrupt.
const RTC_RATE: u8 = 0x0f;

const KBD_DATA: u16 = 0x60;
const COM1: u16 = 0x3f8;
const COM_LSR: u16 = COM1 + 5;
const COM_LSR_DATA: u8 = 0x01;

static INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());

/// Stateless handle; the devices themselves are global.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcPlatform;

impl PcPlatform {
    /// Start the RTC's periodic interrupt, the kernel's clock source.
    pub fn rtc_enable_periodic() {
        unsafe {
            cmos_write(RTC_REG_A, (cmos_read(RTC_REG_A) & 0xf0) | RTC_RATE);
            cmos_write(RTC_REG_B, cmos_read(RTC_REG_B) | RTC_PIE);
        }
    }
}

unsafe fn cmos_read(reg: u8) -> u8 {
    let mut index = Port::<u8>::new(CMOS_INDEX);
    let mut data = Port::<u8>::new(CMOS_DATA);
    unsafe {
        index.write(NMI_DISABLE | reg);
        data.read()
    }
}

unsafe fn cmos_write(reg: u8, value: u8) {
    let mut index = Port::<u8>::new(CMOS_INDEX);
    let mut data = Port::<u8>::new(CMOS_DATA);
    unsafe {
        index.write(NMI_DISABLE | reg);
        data.write(value);
    }
}

impl Platform for PcPlatform {
    fn interrupts_enabled(&self) -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    fn fault_address(&self) -> u64 {
        Cr2::read_raw()
    }

    fn rtc_check_status(&mut self) -> u8 {
        unsafe { cmos_read(RTC_REG_C) }
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        unsafe { PICS.lock().notify_end_of_interrupt(IRQ_OFFSET + irq) };
    }

    fn keyboard_interrupt(&mut self) {
        let scancode: u8 = unsafe { Port::new(KBD_DATA).read() };
        log::trace!("keyboard scancode {:#04x}", scancode);
    }

    fn serial_interrupt(&mut self) {
        let mut lsr = Port::<u8>::new(COM_LSR);
        let mut data = Port::<u8>::new(COM1);
        let mut input = INPUT.lock();
        while unsafe { lsr.read() } & COM_LSR_DATA != 0 {
            input.push_back(unsafe { data.read() });
        }
    }

    fn monitor(&mut self, tf: &mut Trapframe) {
        let _ = write!(SERIAL.lock(), "{}", tf);
    }

    fn cputs(&mut self, s: &str) {
        let _ = SERIAL.lock().write_str(s);
    }

    fn cgetc(&mut self) -> Option<u8> {
        INPUT.lock().pop_front()
    }
}
