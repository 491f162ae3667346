use envkern::hosted::Machine;
use envkern::memlayout::{PFTEMP, USTACK_TOP, UTEXT, UXSTACK_BOTTOM};
use envkern::memory::Perm;
use envkern::ulib::{fork, AccessError, Fork, Syscalls, UserMemory};
use envkern::{EnvId, EnvStatus, KernelConfig};
use x86_64::VirtAddr;

const DATA: u64 = UTEXT + 0x10_0000;

fn va(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

/// A machine with one environment that has a writable page at `DATA`
/// holding 0xAA.
fn parent_with_data() -> (Machine, EnvId) {
    let mut m = Machine::new(KernelConfig::with_frames(128));
    let parent = m.spawn().unwrap();
    let mut env = m.user(parent);
    env.page_alloc(EnvId::SELF, va(DATA), Perm::USER_RW).unwrap();
    env.write(va(DATA), &[0xAA]).unwrap();
    (m, parent)
}

fn fork_child(m: &mut Machine, parent: EnvId) -> EnvId {
    let child = match fork(&mut m.user(parent)).unwrap() {
        Fork::Parent(child) => child,
        Fork::Child => panic!("parent saw the child side"),
    };
    assert_eq!(fork(&mut m.user(child)).unwrap(), Fork::Child);
    child
}

fn read_byte(m: &mut Machine, id: EnvId, addr: u64) -> u8 {
    let mut byte = [0u8];
    m.user(id).read(va(addr), &mut byte).unwrap();
    byte[0]
}

fn frame_of(m: &Machine, id: EnvId, addr: u64) -> x86_64::structures::paging::PhysFrame {
    m.kernel.env(id).unwrap().space.lookup(va(addr)).unwrap().frame
}

#[test]
fn child_write_does_not_reach_parent() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);

    m.user(child).write(va(DATA), &[0xBB]).unwrap();

    assert_eq!(read_byte(&mut m, parent, DATA), 0xAA);
    assert_eq!(read_byte(&mut m, child, DATA), 0xBB);
}

#[test]
fn parent_write_does_not_reach_child() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);

    m.user(parent).write(va(DATA), &[0xCC]).unwrap();

    assert_eq!(read_byte(&mut m, child, DATA), 0xAA);
    assert_eq!(read_byte(&mut m, parent, DATA), 0xCC);
}

#[test]
fn pages_are_shared_until_written() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);

    assert_eq!(frame_of(&m, parent, DATA), frame_of(&m, child, DATA));
    assert!(m.user(parent).pte(va(DATA)).unwrap().is_cow());
    assert!(m.user(child).pte(va(DATA)).unwrap().is_cow());

    m.user(child).write(va(DATA + 8), &[1]).unwrap();
    assert_ne!(frame_of(&m, parent, DATA), frame_of(&m, child, DATA));
    assert_eq!(m.user(child).pte(va(DATA)), Some(Perm::USER_RW));
    // The parent's mapping stays copy-on-write until it writes itself.
    assert!(m.user(parent).pte(va(DATA)).unwrap().is_cow());
}

#[test]
fn read_only_pages_are_shared_as_is() {
    let (mut m, parent) = parent_with_data();
    let text = UTEXT;
    m.user(parent).page_alloc(EnvId::SELF, va(text), Perm::USER_RO).unwrap();

    let child = fork_child(&mut m, parent);

    assert_eq!(m.user(child).pte(va(text)), Some(Perm::USER_RO));
    assert_eq!(m.user(parent).pte(va(text)), Some(Perm::USER_RO));
    assert_eq!(frame_of(&m, parent, text), frame_of(&m, child, text));
}

#[test]
fn exception_stack_is_never_shared() {
    let (mut m, parent) = parent_with_data();
    let pattern: Vec<u8> = (0..=255).collect();
    let mut env = m.user(parent);
    env.page_alloc(EnvId::SELF, va(UXSTACK_BOTTOM), Perm::USER_RW).unwrap();
    env.write(va(UXSTACK_BOTTOM), &pattern).unwrap();

    let child = fork_child(&mut m, parent);

    let mut after = vec![0u8; pattern.len()];
    m.user(parent).read(va(UXSTACK_BOTTOM), &mut after).unwrap();
    assert_eq!(after, pattern);
    m.user(child).read(va(UXSTACK_BOTTOM), &mut after).unwrap();
    assert!(after.iter().all(|b| *b == 0));

    assert_ne!(frame_of(&m, parent, UXSTACK_BOTTOM), frame_of(&m, child, UXSTACK_BOTTOM));
    assert_eq!(m.user(child).pte(va(UXSTACK_BOTTOM)), Some(Perm::USER_RW));
    assert_eq!(m.user(parent).pte(va(UXSTACK_BOTTOM)), Some(Perm::USER_RW));
}

#[test]
fn child_is_runnable_with_the_upcall_and_its_own_id() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);

    let env = m.kernel.env(child).unwrap();
    assert_eq!(env.parent, parent);
    assert!(env.pgfault_upcall.is_some());
    assert_ne!(env.status, EnvStatus::NotRunnable);
    assert_eq!(m.runtime(child).unwrap().this_env, child);
    assert_eq!(m.runtime(parent).unwrap().this_env, parent);
}

#[test]
fn user_stack_faults_are_resolved_on_both_sides() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);
    let top = USTACK_TOP - 16;

    m.user(child).write(va(top), &7u64.to_le_bytes()).unwrap();
    m.user(parent).write(va(top), &9u64.to_le_bytes()).unwrap();

    let mut word = [0u8; 8];
    m.user(child).read(va(top), &mut word).unwrap();
    assert_eq!(u64::from_le_bytes(word), 7);
    m.user(parent).read(va(top), &mut word).unwrap();
    assert_eq!(u64::from_le_bytes(word), 9);
}

#[test]
fn grandchild_sees_its_parents_private_copy() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);
    m.user(child).write(va(DATA), &[0xBB]).unwrap();

    let grandchild = fork_child(&mut m, child);
    m.user(grandchild).write(va(DATA + 1), &[0xDD]).unwrap();

    assert_eq!(read_byte(&mut m, grandchild, DATA), 0xBB);
    assert_eq!(read_byte(&mut m, child, DATA + 1), 0);
    assert_eq!(read_byte(&mut m, parent, DATA), 0xAA);
}

#[test]
fn destroying_every_environment_returns_every_frame() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);
    m.user(child).write(va(DATA), &[0xBB]).unwrap();
    m.user(parent).write(va(DATA), &[0xCC]).unwrap();

    m.user(child).env_destroy(EnvId::SELF).unwrap();
    assert!(!m.alive(child));
    m.user(parent).env_destroy(EnvId::SELF).unwrap();
    assert!(!m.alive(parent));

    assert!(m.runtime(child).is_none() && m.runtime(parent).is_none());
    let frames = m.kernel.frames();
    assert_eq!(frames.free_count(), frames.capacity());
}

#[test]
fn scratch_mapping_does_not_outlive_the_fault() {
    let (mut m, parent) = parent_with_data();
    let child = fork_child(&mut m, parent);

    m.user(child).write(va(DATA), &[0xBB]).unwrap();
    m.user(parent).write(va(DATA), &[0xCC]).unwrap();

    assert_eq!(m.user(child).pte(va(PFTEMP)), None);
    assert_eq!(m.user(parent).pte(va(PFTEMP)), None);
}

#[test]
fn write_to_plain_read_only_page_kills_the_writer() {
    let (mut m, parent) = parent_with_data();
    m.user(parent).page_alloc(EnvId::SELF, va(UTEXT), Perm::USER_RO).unwrap();
    let child = fork_child(&mut m, parent);

    assert_eq!(m.user(child).write(va(UTEXT), &[1]), Err(AccessError::Destroyed));
    assert!(!m.alive(child));
    assert!(m.alive(parent));
    assert!(m.kernel.fatal().is_none());
}
