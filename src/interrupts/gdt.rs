use core::ptr::addr_of;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::memlayout::{GD_KD, GD_KT, GD_UD, GD_UT, KSTACK_SIZE, NCPU};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Null, kernel code/data, user data/code, then one two-slot TSS
/// descriptor per core.
const GDT_ENTRIES: usize = 5 + 2 * NCPU;

#[repr(C, align(16))]
struct KernelStack([u8; KSTACK_SIZE]);

static mut KERNEL_STACKS: [KernelStack; NCPU] = [const { KernelStack([0; KSTACK_SIZE]) }; NCPU];
static mut DOUBLE_FAULT_STACKS: [[u8; 4096]; NCPU] = [[0; 4096]; NCPU];

static TSS: Once<[TaskStateSegment; NCPU]> = Once::new();
static GDT: Once<(GlobalDescriptorTable<GDT_ENTRIES>, Selectors)> = Once::new();

static TSS_LOADED: [AtomicBool; NCPU] = [const { AtomicBool::new(false) }; NCPU];

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: [SegmentSelector; NCPU],
}

/// Top of the stack a core switches to when a trap arrives from user mode.
pub fn kernel_stack_top(cpu: usize) -> VirtAddr {
    let base = unsafe { addr_of!(KERNEL_STACKS[cpu]) };
    VirtAddr::from_ptr(base) + KSTACK_SIZE as u64
}

fn double_fault_stack_top(cpu: usize) -> VirtAddr {
    let base = unsafe { addr_of!(DOUBLE_FAULT_STACKS[cpu]) };
    VirtAddr::from_ptr(base) + 4096u64
}

fn tss_table() -> &'static [TaskStateSegment; NCPU] {
    TSS.call_once(|| {
        core::array::from_fn(|cpu| {
            let mut tss = TaskStateSegment::new();
            tss.privilege_stack_table[0] = kernel_stack_top(cpu);
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                double_fault_stack_top(cpu);
            tss
        })
    })
}

fn gdt() -> &'static (GlobalDescriptorTable<GDT_ENTRIES>, Selectors) {
    GDT.call_once(|| {
        let tss = tss_table();
        let mut gdt = GlobalDescriptorTable::<GDT_ENTRIES>::empty();

        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = core::array::from_fn(|cpu| gdt.append(Descriptor::tss_segment(&tss[cpu])));

        debug_assert_eq!(kernel_code.0, GD_KT);
        debug_assert_eq!(kernel_data.0, GD_KD);
        debug_assert_eq!(user_data.0, GD_UD | 3);
        debug_assert_eq!(user_code.0, GD_UT | 3);

        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
            },
        )
    })
}

/// Load the GDT, segment registers and this core's TSS.
///
/// Safe to call again on the same core: the task register is only loaded
/// the first time, since `ltr` faults on a TSS descriptor already marked busy.
pub fn init_percpu(cpu: usize) {
    let (ref gdt, ref selectors) = *gdt();
    gdt.load();

    unsafe {
        use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};

        CS::set_reg(selectors.kernel_code);
        DS::set_reg(selectors.kernel_data);
        ES::set_reg(selectors.kernel_data);
        SS::set_reg(selectors.kernel_data);

        if !TSS_LOADED[cpu].swap(true, Ordering::AcqRel) {
            x86_64::instructions::tables::load_tss(selectors.tss[cpu]);
        }
    }
}
