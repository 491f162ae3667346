//! # Programmable Interrupt Controller (8259 PIC)
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐
//! │   PIC 1     │     │   PIC 2     │
//! │  (Master)   │────▶│  (Slave)    │
//! │ IRQ 0-7     │     │ IRQ 8-15    │
//! └─────────────┘     └─────────────┘
//!       │
//!       ▼
//!     CPU
//! ```
//!
//! IRQs are remapped above the CPU exceptions:
//!
//! | IRQ | Vector | Device            |
//! |-----|--------|-------------------|
//! | 1   | 33     | Keyboard          |
//! | 4   | 36     | Serial (COM1)     |
//! | 7   | 39     | Spurious          |
//! | 8   | 40     | Clock (CMOS RTC)  |

use pic8259::ChainedPics;
use spin::Mutex;

pub const IRQ_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = IRQ_OFFSET + 8;

pub const IRQ_KBD: u8 = 1;
pub const IRQ_SERIAL: u8 = 4;
pub const IRQ_SPURIOUS: u8 = 7;
pub const IRQ_CLOCK: u8 = 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(IRQ_OFFSET, PIC_2_OFFSET) });

/// Hardware interrupt lines the kernel routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Irq {
    Keyboard = IRQ_KBD,
    Serial = IRQ_SERIAL,
    Spurious = IRQ_SPURIOUS,
    Clock = IRQ_CLOCK,
}

impl Irq {
    pub const ALL: [Irq; 4] = [Irq::Keyboard, Irq::Serial, Irq::Spurious, Irq::Clock];

    pub const fn line(self) -> u8 {
        self as u8
    }

    pub const fn vector(self) -> u8 {
        IRQ_OFFSET + self.line()
    }

    pub fn from_vector(vector: u64) -> Option<Irq> {
        Self::ALL.into_iter().find(|irq| u64::from(irq.vector()) == vector)
    }
}

/// Remap both chips and unmask the routed lines plus the cascade.
pub fn init() {
    let mut pics = PICS.lock();
    unsafe {
        pics.initialize();
        let mut mask: u16 = 0xffff & !(1 << 2);
        for irq in [Irq::Keyboard, Irq::Serial, Irq::Clock] {
            mask &= !(1 << irq.line());
        }
        pics.write_masks(mask as u8, (mask >> 8) as u8);
    }
}
