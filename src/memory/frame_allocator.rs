use alloc::vec::Vec;
use x86_64::PhysAddr;

use super::PAGE_SIZE;

/// Bump allocator over one contiguous physical region, with a free list so
/// process teardown can return frames for reuse.
pub struct BumpFrameAllocator {
    next_free: u64,
    limit: u64,
    free_list: Vec<u64>,
}

impl BumpFrameAllocator {
    /// Create an empty allocator; unusable until `init` runs.
    pub fn new() -> Self {
        BumpFrameAllocator {
            next_free: 0,
            limit: 0,
            free_list: Vec::new(),
        }
    }

    /// Hand the allocator its physical region.
    ///
    /// # Safety
    /// The region must be RAM that nothing else uses.
    pub unsafe fn init(&mut self, start: PhysAddr, end: PhysAddr) {
        self.next_free = start.align_up(PAGE_SIZE as u64).as_u64();
        self.limit = end.align_down(PAGE_SIZE as u64).as_u64();
    }

    /// Allocate one frame, preferring previously freed ones.
    pub fn allocate(&mut self) -> Option<PhysAddr> {
        if let Some(addr) = self.free_list.pop() {
            return Some(PhysAddr::new(addr));
        }
        if self.next_free + PAGE_SIZE as u64 <= self.limit {
            let frame = self.next_free;
            self.next_free += PAGE_SIZE as u64;
            Some(PhysAddr::new(frame))
        } else {
            None
        }
    }

    /// Return a frame to the pool.
    pub fn free(&mut self, frame: PhysAddr) {
        self.free_list.push(frame.as_u64());
    }
}
