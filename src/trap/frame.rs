//! Saved register state.
//!
//! `Trapframe` is laid out exactly as the entry trampoline pushes it, lowest
//! address first. `UTrapframe` is the record the kernel writes onto a user
//! exception stack before redirecting the environment to its fault upcall.

use core::fmt;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::PrivilegeLevel;

use crate::interrupts::pic::IRQ_OFFSET;

pub const T_DIVIDE: u64 = 0;
pub const T_DEBUG: u64 = 1;
pub const T_NMI: u64 = 2;
pub const T_BRKPT: u64 = 3;
pub const T_OFLOW: u64 = 4;
pub const T_BOUND: u64 = 5;
pub const T_ILLOP: u64 = 6;
pub const T_DEVICE: u64 = 7;
pub const T_DBLFLT: u64 = 8;
pub const T_TSS: u64 = 10;
pub const T_SEGNP: u64 = 11;
pub const T_STACK: u64 = 12;
pub const T_GPFLT: u64 = 13;
pub const T_PGFLT: u64 = 14;
pub const T_FPERR: u64 = 16;
pub const T_ALIGN: u64 = 17;
pub const T_MCHK: u64 = 18;
pub const T_SIMDERR: u64 = 19;

pub const T_SYSCALL: u64 = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

pub const PUSHREGS_WORDS: usize = 15;

impl PushRegs {
    fn to_words(self) -> [u64; PUSHREGS_WORDS] {
        [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rbp, self.rdi, self.rsi, self.rdx, self.rcx, self.rbx, self.rax,
        ]
    }

    fn from_words(w: &[u64]) -> Self {
        Self {
            r15: w[0],
            r14: w[1],
            r13: w[2],
            r12: w[3],
            r11: w[4],
            r10: w[5],
            r9: w[6],
            r8: w[7],
            rbp: w[8],
            rdi: w[9],
            rsi: w[10],
            rdx: w[11],
            rcx: w[12],
            rbx: w[13],
            rax: w[14],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u64,
    pub ds: u64,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<Trapframe>() == 192);

impl Trapframe {
    /// Privilege the interrupted code ran at.
    pub fn privilege(&self) -> PrivilegeLevel {
        SegmentSelector(self.cs as u16).rpl()
    }

    pub fn from_user(&self) -> bool {
        self.privilege() == PrivilegeLevel::Ring3
    }
}

pub fn trapname(trapno: u64) -> &'static str {
    const EXCNAMES: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];

    match trapno {
        n if (n as usize) < EXCNAMES.len() => EXCNAMES[n as usize],
        T_SYSCALL => "System call",
        n if (u64::from(IRQ_OFFSET)..u64::from(IRQ_OFFSET) + 16).contains(&n) => {
            "Hardware Interrupt"
        }
        _ => "(unknown trap)",
    }
}

impl fmt::Display for PushRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let named = [
            ("r15", self.r15),
            ("r14", self.r14),
            ("r13", self.r13),
            ("r12", self.r12),
            ("r11", self.r11),
            ("r10", self.r10),
            ("r9 ", self.r9),
            ("r8 ", self.r8),
            ("rbp", self.rbp),
            ("rdi", self.rdi),
            ("rsi", self.rsi),
            ("rdx", self.rdx),
            ("rcx", self.rcx),
            ("rbx", self.rbx),
            ("rax", self.rax),
        ];
        for (name, value) in named {
            writeln!(f, "  {name}  0x{value:016x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Trapframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TRAP frame")?;
        write!(f, "{}", self.regs)?;
        writeln!(f, "  es   0x----{:04x}", self.es)?;
        writeln!(f, "  ds   0x----{:04x}", self.ds)?;
        writeln!(f, "  trap 0x{:08x} {}", self.trapno, trapname(self.trapno))?;
        write!(f, "  err  0x{:08x}", self.err)?;
        if self.trapno == T_PGFLT {
            let code = PageFaultErrorCode::from_bits_truncate(self.err);
            write!(
                f,
                " [{}, {}, {}]",
                if code.contains(PageFaultErrorCode::USER_MODE) { "user" } else { "kernel" },
                if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) { "write" } else { "read" },
                if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
                    "protection"
                } else {
                    "not-present"
                },
            )?;
        }
        writeln!(f)?;
        writeln!(f, "  rip  0x{:016x}", self.rip)?;
        writeln!(f, "  cs   0x----{:04x}", self.cs)?;
        writeln!(f, "  flag 0x{:016x}", self.rflags)?;
        if self.from_user() {
            writeln!(f, "  rsp  0x{:016x}", self.rsp)?;
            writeln!(f, "  ss   0x----{:04x}", self.ss)?;
        }
        Ok(())
    }
}

/// Fault record handed to a user fault upcall.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u64,
    pub err: u64,
    pub regs: PushRegs,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

const UTF_WORDS: usize = 2 + PUSHREGS_WORDS + 3;

impl UTrapframe {
    pub const SIZE: u64 = (UTF_WORDS * 8) as u64;

    /// Capture the trap-time state of `tf` for a fault at `fault_va`.
    pub fn capture(tf: &Trapframe, fault_va: u64) -> Self {
        Self {
            fault_va,
            err: tf.err,
            regs: tf.regs,
            rip: tf.rip,
            rflags: tf.rflags,
            rsp: tf.rsp,
        }
    }

    pub fn to_bytes(&self) -> [u8; UTF_WORDS * 8] {
        let mut words = [0u64; UTF_WORDS];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..2 + PUSHREGS_WORDS].copy_from_slice(&self.regs.to_words());
        words[UTF_WORDS - 3] = self.rip;
        words[UTF_WORDS - 2] = self.rflags;
        words[UTF_WORDS - 1] = self.rsp;

        let mut out = [0u8; UTF_WORDS * 8];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; UTF_WORDS * 8]) -> Self {
        let mut words = [0u64; UTF_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(&words[2..2 + PUSHREGS_WORDS]),
            rip: words[UTF_WORDS - 3],
            rflags: words[UTF_WORDS - 2],
            rsp: words[UTF_WORDS - 1],
        }
    }

    pub fn fault_code(&self) -> PageFaultErrorCode {
        PageFaultErrorCode::from_bits_truncate(self.err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn names_cover_exceptions_syscall_and_irqs() {
        assert_eq!(trapname(T_PGFLT), "Page Fault");
        assert_eq!(trapname(15), "(unknown trap)");
        assert_eq!(trapname(T_SYSCALL), "System call");
        assert_eq!(trapname(40), "Hardware Interrupt");
        assert_eq!(trapname(200), "(unknown trap)");
    }

    #[test]
    fn privilege_comes_from_cs_low_bits() {
        let mut tf = Trapframe { cs: 0x08, ..Trapframe::default() };
        assert!(!tf.from_user());
        tf.cs = 0x23;
        assert_eq!(tf.privilege(), PrivilegeLevel::Ring3);
    }

    #[test]
    fn page_fault_error_code_is_decoded() {
        let tf = Trapframe { trapno: T_PGFLT, err: 0x6, cs: 0x23, ..Trapframe::default() };
        let text = tf.to_string();
        assert!(text.contains("[user, write, not-present]"), "{text}");
        assert!(text.contains("rsp"));
    }

    #[test]
    fn user_frame_layout_puts_rsp_last() {
        let utf = UTrapframe { fault_va: 0xdead_b000, rsp: 0x1122, ..UTrapframe::default() };
        let bytes = utf.to_bytes();
        assert_eq!(UTrapframe::SIZE, 160);
        assert_eq!(&bytes[..8], &0xdead_b000u64.to_le_bytes());
        assert_eq!(&bytes[152..], &0x1122u64.to_le_bytes());
        assert_eq!(UTrapframe::from_bytes(&bytes), utf);
    }
}
