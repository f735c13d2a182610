//! Concrete `MemoryManager` backend: a two-level directory/table hierarchy
//! kept in physical frames, reached through the boot code's identity mapping
//! of physical memory.
//!
//! This backend realizes the ownership model only. Long mode translates
//! through four table levels, so these two-level roots are never loaded
//! into CR3 and the CPU stays on the boot-time tables across hand-offs.
//! Hardware-enforced isolation needs a 4-level backend behind the same
//! trait plus a kernel link address above `KERNEL_BASE`, so the kernel
//! image can live in the shared upper range of every root.

use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use super::{
    directory_slot, table_slot, AspaceRoot, MapError, MapFlags, MemoryManager, TableRef,
    ENTRIES_PER_TABLE, FRAME_ALLOCATOR, PAGE_SIZE, TABLE_SPAN, USER_TABLE_COUNT,
};

/// Identity mapping: physical address == virtual address for kernel accesses.
const PHYS_OFFSET: u64 = 0;

fn to_pt_flags(flags: MapFlags) -> PageTableFlags {
    let mut pt = PageTableFlags::PRESENT;
    if flags.contains(MapFlags::WRITABLE) {
        pt |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        pt |= PageTableFlags::USER_ACCESSIBLE;
    }
    pt
}

fn from_pt_flags(pt: PageTableFlags) -> MapFlags {
    let mut flags = MapFlags::empty();
    if pt.contains(PageTableFlags::WRITABLE) {
        flags |= MapFlags::WRITABLE;
    }
    if pt.contains(PageTableFlags::USER_ACCESSIBLE) {
        flags |= MapFlags::USER;
    }
    flags
}

/// # Safety
/// `frame` must hold a page table reachable through the identity mapping.
unsafe fn table_at(frame: PhysAddr) -> &'static mut PageTable {
    &mut *((frame.as_u64() + PHYS_OFFSET) as *mut PageTable)
}

fn frame_ptr(frame: PhysAddr) -> *mut u8 {
    (frame.as_u64() + PHYS_OFFSET) as *mut u8
}

pub struct KernelMemory {
    /// Directory holding the kernel's own upper-range tables, shared by
    /// reference into every process root. Zero until `bootstrap_kernel_space`.
    kernel_root: PhysAddr,
}

impl KernelMemory {
    pub fn new() -> Self {
        KernelMemory {
            kernel_root: PhysAddr::new(0),
        }
    }

    /// Build the shared kernel tables: identity-map the upper directory
    /// slots once, so every future address space can reference them.
    pub fn bootstrap_kernel_space(&mut self) -> Result<(), MapError> {
        let root = self.allocate_table().ok_or(MapError::OutOfFrames)?;
        let dir = unsafe { table_at(root.address()) };

        for slot in USER_TABLE_COUNT..ENTRIES_PER_TABLE {
            let table = self.allocate_table().ok_or(MapError::OutOfFrames)?;
            let entries = unsafe { table_at(table.address()) };
            let base = slot as u64 * TABLE_SPAN;
            for (i, entry) in entries.iter_mut().enumerate() {
                entry.set_addr(
                    PhysAddr::new(base + (i * PAGE_SIZE) as u64),
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
                );
            }
            dir[slot].set_addr(
                table.address(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }

        self.kernel_root = root.address();
        Ok(())
    }
}

impl MemoryManager for KernelMemory {
    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        FRAME_ALLOCATOR.lock().allocate()
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        FRAME_ALLOCATOR.lock().free(frame);
    }

    fn zero_frame(&mut self, frame: PhysAddr) {
        unsafe { core::ptr::write_bytes(frame_ptr(frame), 0, PAGE_SIZE) };
    }

    fn write_frame(&mut self, frame: PhysAddr, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                frame_ptr(frame).add(offset),
                bytes.len(),
            );
        }
    }

    fn read_frame(&self, frame: PhysAddr, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(
                frame_ptr(frame).add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr) {
        unsafe { core::ptr::copy_nonoverlapping(frame_ptr(src), frame_ptr(dst), PAGE_SIZE) };
    }

    fn allocate_address_space(&mut self) -> Option<AspaceRoot> {
        let frame = self.allocate_frame()?;
        self.zero_frame(frame);
        Some(AspaceRoot::new(frame))
    }

    fn free_address_space(&mut self, root: AspaceRoot) {
        self.free_frame(root.address());
    }

    fn allocate_table(&mut self) -> Option<TableRef> {
        let frame = self.allocate_frame()?;
        self.zero_frame(frame);
        Some(TableRef::new(frame))
    }

    fn free_table(&mut self, table: TableRef) {
        self.free_frame(table.address());
    }

    fn install_table(&mut self, root: &AspaceRoot, slot: usize, table: TableRef, flags: MapFlags) {
        let dir = unsafe { table_at(root.address()) };
        dir[slot].set_addr(table.address(), to_pt_flags(flags));
    }

    fn install_page(&mut self, table: TableRef, slot: usize, frame: PhysAddr, flags: MapFlags) {
        let entries = unsafe { table_at(table.address()) };
        entries[slot].set_addr(frame, to_pt_flags(flags));
    }

    fn map(
        &mut self,
        root: &AspaceRoot,
        vaddr: VirtAddr,
        frame: PhysAddr,
        flags: MapFlags,
    ) -> Result<usize, MapError> {
        let dir = unsafe { table_at(root.address()) };
        let dslot = directory_slot(vaddr);

        let mut extra_tables = 0;
        if dir[dslot].is_unused() {
            let table = self.allocate_table().ok_or(MapError::OutOfFrames)?;
            // Permissive at the directory level; the leaf entry decides.
            dir[dslot].set_addr(
                table.address(),
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE,
            );
            extra_tables += 1;
        }

        let entries = unsafe { table_at(dir[dslot].addr()) };
        let tslot = table_slot(vaddr);
        if !entries[tslot].is_unused() {
            return Err(MapError::AlreadyMapped);
        }
        entries[tslot].set_addr(frame, to_pt_flags(flags));
        Ok(extra_tables)
    }

    fn table(&self, root: &AspaceRoot, slot: usize) -> Option<(TableRef, MapFlags)> {
        let dir = unsafe { table_at(root.address()) };
        if dir[slot].is_unused() {
            return None;
        }
        Some((TableRef::new(dir[slot].addr()), from_pt_flags(dir[slot].flags())))
    }

    fn page(&self, table: TableRef, slot: usize) -> Option<(PhysAddr, MapFlags)> {
        let entries = unsafe { table_at(table.address()) };
        if entries[slot].is_unused() {
            return None;
        }
        Some((entries[slot].addr(), from_pt_flags(entries[slot].flags())))
    }

    fn unmap_table(&mut self, root: &AspaceRoot, slot: usize) -> Option<TableRef> {
        let dir = unsafe { table_at(root.address()) };
        if dir[slot].is_unused() {
            return None;
        }
        let table = TableRef::new(dir[slot].addr());
        dir[slot].set_unused();
        Some(table)
    }

    fn unmap_page(&mut self, table: TableRef, slot: usize) -> Option<PhysAddr> {
        let entries = unsafe { table_at(table.address()) };
        if entries[slot].is_unused() {
            return None;
        }
        let frame = entries[slot].addr();
        entries[slot].set_unused();
        Some(frame)
    }

    fn copy_kernel_range_into(&mut self, root: &AspaceRoot) {
        let src = unsafe { table_at(self.kernel_root) };
        let dst = unsafe { table_at(root.address()) };
        for slot in USER_TABLE_COUNT..ENTRIES_PER_TABLE {
            if src[slot].is_unused() {
                dst[slot].set_unused();
            } else {
                dst[slot].set_addr(src[slot].addr(), src[slot].flags());
            }
        }
    }
}
