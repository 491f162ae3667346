//! Reference-counted physical frame pool.
//!
//! Frames are handed out zero-filled. A frame returns to the free list when
//! its last mapping goes away, the same lifetime rule the hardware page
//! allocator follows.

use alloc::boxed::Box;
use alloc::vec::Vec;

use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::memlayout::PAGE_SIZE;
use crate::syscalls::dispatcher::SyscallError;

/// Physical address of frame 0. Frame 0 of the machine is never handed out.
const POOL_BASE: u64 = 0x0010_0000;

pub type PageBytes = [u8; PAGE_SIZE as usize];

struct Slot {
    refs: u32,
    data: Option<Box<PageBytes>>,
}

pub struct FramePool {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl FramePool {
    pub fn with_capacity(frames: usize) -> Self {
        let slots = (0..frames).map(|_| Slot { refs: 0, data: None }).collect();
        // Lowest frame first.
        let free = (0..frames).rev().collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Take a zeroed frame. Its reference count starts at zero; mapping it
    /// is what keeps it alive.
    pub fn alloc_zeroed(&mut self) -> Result<PhysFrame, SyscallError> {
        let index = self.free.pop().ok_or(SyscallError::NoMemory)?;
        let slot = &mut self.slots[index];
        match slot.data.as_mut() {
            Some(bytes) => bytes.fill(0),
            None => slot.data = Some(Box::new([0; PAGE_SIZE as usize])),
        }
        slot.refs = 0;
        Ok(Self::frame_at(index))
    }

    pub fn incref(&mut self, frame: PhysFrame) {
        if let Some(slot) = self.slot_mut(frame) {
            slot.refs += 1;
        }
    }

    /// Drop one reference, returning the frame to the pool at zero.
    pub fn decref(&mut self, frame: PhysFrame) {
        let Some(index) = self.index_of(frame) else {
            return;
        };
        let slot = &mut self.slots[index];
        debug_assert!(slot.refs > 0, "decref of unreferenced frame {:?}", frame);
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.free.push(index);
        }
    }

    /// Release a frame that was allocated but never mapped.
    pub fn release_unmapped(&mut self, frame: PhysFrame) {
        if let Some(index) = self.index_of(frame) {
            if self.slots[index].refs == 0 && !self.free.contains(&index) {
                self.free.push(index);
            }
        }
    }

    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.index_of(frame).map_or(0, |i| self.slots[i].refs)
    }

    pub fn bytes(&self, frame: PhysFrame) -> Option<&PageBytes> {
        self.index_of(frame)
            .and_then(|i| self.slots[i].data.as_deref())
    }

    pub fn bytes_mut(&mut self, frame: PhysFrame) -> Option<&mut PageBytes> {
        self.slot_mut(frame).and_then(|slot| slot.data.as_deref_mut())
    }

    fn slot_mut(&mut self, frame: PhysFrame) -> Option<&mut Slot> {
        let index = self.index_of(frame)?;
        self.slots.get_mut(index)
    }

    fn index_of(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address().as_u64().checked_sub(POOL_BASE)?;
        let index = (addr / PAGE_SIZE) as usize;
        (index < self.slots.len()).then_some(index)
    }

    fn frame_at(index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(POOL_BASE + index as u64 * PAGE_SIZE))
    }
}
