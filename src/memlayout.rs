//! # Memory layout
//!
//! ```text
//!  USER_TOP, UXSTACK_TOP ─▶ ┌──────────────────────────┐
//!                           │  exception stack (1 pg)  │
//!                           ├──────────────────────────┤
//!                           │  guard page              │
//!  USTACK_TOP ────────────▶ ├──────────────────────────┤
//!                           │  normal user stack       │
//!                           ~                          ~
//!  UTEXT ─────────────────▶ ├──────────────────────────┤
//!  PFTEMP ────────────────▶ │  COW scratch page        │
//!  UTEMP ─────────────────▶ ├──────────────────────────┤
//!                           ~                          ~
//!  0 ─────────────────────▶ └──────────────────────────┘
//! ```
//!
//! Everything at or above `USER_TOP` belongs to the kernel. `USER_TOP` is the
//! first address covered by level-4 entry 255.

pub const PAGE_SIZE: u64 = 4096;

/// Span of one level-2 entry: the region covered by a single page table.
pub const PT_SPAN: u64 = 1 << 21;

pub const USER_TOP: u64 = 0x0000_7f80_0000_0000;

pub const UXSTACK_TOP: u64 = USER_TOP;
pub const UXSTACK_BOTTOM: u64 = UXSTACK_TOP - PAGE_SIZE;

pub const USTACK_TOP: u64 = UXSTACK_TOP - 2 * PAGE_SIZE;

pub const UTEXT: u64 = 0x0080_0000;
pub const UTEMP: u64 = 0x0040_0000;
pub const PFTEMP: u64 = UTEMP + PT_SPAN - PAGE_SIZE;

pub const NENV: usize = 1 << LOG2NENV;
pub const LOG2NENV: u32 = 10;

pub const NCPU: usize = 4;

pub const KSTACK_SIZE: usize = 8 * PAGE_SIZE as usize;

pub const GD_KT: u16 = 0x08;
pub const GD_KD: u16 = 0x10;
pub const GD_UD: u16 = 0x18;
pub const GD_UT: u16 = 0x20;

pub const fn page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE == 0
}
