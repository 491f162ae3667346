//! # Boot self test
//!
//! Runs the trap and fork paths end to end on a hosted [`Machine`], so the
//! same checks work from the boot image (feature `boot_selftest`) and from
//! the host binary.
//!
//! Each test returns a `String` summary with one `✓`/`✗` line per check.
//! [`test_all`] concatenates them and ends with a pass/fail tally.

use alloc::format;
use alloc::string::String;

use x86_64::VirtAddr;

use crate::config::KernelConfig;
use crate::env::EnvId;
use crate::hosted::Machine;
use crate::memlayout::{GD_KT, UTEXT};
use crate::memory::Perm;
use crate::trap::frame::{Trapframe, T_PGFLT};
use crate::trap::{Dispatch, Fatal};
use crate::ulib::{fork, AccessError, Fork, Syscalls, UserMemory};

const DATA: u64 = UTEXT + 0x10_0000;

fn check(result: &mut String, ok: bool, what: &str) {
    result.push_str(if ok { "✓ " } else { "✗ " });
    result.push_str(what);
    result.push('\n');
}

fn machine() -> Machine {
    Machine::new(KernelConfig::with_frames(64))
}

pub fn test_syscall_return() -> String {
    let mut result = String::from("Testing system call round trip...\n");
    let mut m = machine();
    let Ok(id) = m.spawn() else {
        check(&mut result, false, "spawned an environment");
        return result;
    };

    let mut env = m.user(id);
    check(&mut result, env.getenvid() == id, "sys_getenvid returned the caller's id");
    let text = b"hello from user space\n";
    let printed = env
        .page_alloc(EnvId::SELF, VirtAddr::new(DATA), Perm::USER_RW)
        .is_ok()
        && env.write(VirtAddr::new(DATA), text).is_ok()
        && env.cputs(VirtAddr::new(DATA), text.len()).is_ok();
    check(&mut result, printed, "sys_cputs printed a user buffer");
    check(
        &mut result,
        m.platform.console.contains("hello from user space"),
        "console holds the text",
    );
    check(&mut result, m.kernel.current(0) == Some(id), "caller still runs after the call");
    result
}

pub fn test_cow_fork() -> String {
    let mut result = String::from("Testing copy-on-write fork...\n");
    let mut m = machine();
    let Ok(parent) = m.spawn() else {
        check(&mut result, false, "spawned an environment");
        return result;
    };

    let va = VirtAddr::new(DATA);
    let mut env = m.user(parent);
    let ready =
        env.page_alloc(EnvId::SELF, va, Perm::USER_RW).is_ok() && env.write(va, &[0xAA]).is_ok();
    check(&mut result, ready, "parent wrote 0xAA");

    let child = match fork(&mut env) {
        Ok(Fork::Parent(child)) => child,
        other => {
            check(&mut result, false, &format!("fork returned {:?}", other));
            return result;
        }
    };
    check(&mut result, env.pte(va).map_or(false, Perm::is_cow), "parent page is copy-on-write");

    let mut kid = m.user(child);
    let child_side = matches!(fork(&mut kid), Ok(Fork::Child));
    check(&mut result, child_side, "child resumed from fork");
    check(&mut result, kid.write(va, &[0xBB]).is_ok(), "child wrote 0xBB");

    let mut mine = [0u8];
    let mut theirs = [0u8];
    let parent_read = m.user(parent).read(va, &mut mine);
    let child_read = m.user(child).read(va, &mut theirs);
    let read = parent_read.is_ok() && child_read.is_ok();
    check(&mut result, read && mine == [0xAA], "parent still reads 0xAA");
    check(&mut result, read && theirs == [0xBB], "child reads 0xBB");
    result
}

pub fn test_fault_without_upcall() -> String {
    let mut result = String::from("Testing user fault without an upcall...\n");
    let mut m = machine();
    let Ok(id) = m.spawn() else {
        check(&mut result, false, "spawned an environment");
        return result;
    };

    let outcome = m.user(id).write(VirtAddr::new(DATA), &[1]);
    check(&mut result, outcome == Err(AccessError::Destroyed), "faulting environment destroyed");
    let reported = m.platform.console.contains("user fault va");
    check(&mut result, reported, "fault reported on the console");
    check(&mut result, m.kernel.fatal().is_none(), "kernel kept running");
    result
}

pub fn test_kernel_fault() -> String {
    let mut result = String::from("Testing page fault in kernel mode...\n");
    let mut m = machine();
    m.platform.set_fault_address(0xdead_0000);
    let tf = Trapframe { trapno: T_PGFLT, cs: u64::from(GD_KT), ..Trapframe::default() };
    let halted = m.kernel.trap(0, &tf, &mut m.platform);
    let is_fatal = matches!(halted, Dispatch::Halt(Fatal::KernelPageFault { va: 0xdead_0000, .. }));
    check(&mut result, is_fatal, "kernel page fault is fatal");
    check(&mut result, m.raise(0, 40) == halted, "later traps stay halted");
    result
}

pub fn test_all() -> String {
    let mut result = String::new();
    result.push_str("=== RUNNING ALL TESTS ===\n");
    for test in [test_syscall_return, test_cow_fork, test_fault_without_upcall, test_kernel_fault] {
        result.push_str(&test());
        result.push('\n');
    }
    let passed = result.matches('✓').count();
    let failed = result.matches('✗').count();
    result.push_str(&format!("=== {} passed, {} failed ===\n", passed, failed));
    result
}
