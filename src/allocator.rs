//! Kernel heap, backing the `alloc` collections used by the scheduler and
//! boot code. The heap lives in a static region inside the kernel image, so
//! it needs no paging support to come up.

use linked_list_allocator::LockedHeap;

pub const HEAP_SIZE: usize = 512 * 1024;

static mut HEAP_REGION: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// One-time heap bring-up. Called from `memory::init` before anything
/// allocates.
pub fn init_heap() {
    unsafe {
        let start = &raw mut HEAP_REGION as *mut u8;
        ALLOCATOR.lock().init(start, HEAP_SIZE);
    }
}
