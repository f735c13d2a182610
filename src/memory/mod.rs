pub mod frame_allocator;
pub mod paging;

use frame_allocator::BumpFrameAllocator;
use lazy_static::lazy_static;
use paging::KernelMemory;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

/// One physical frame / one mapped page.
pub const PAGE_SIZE: usize = 4096;

/// Slots in a second-level page table, and in the top-level directory.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Virtual span covered by one second-level table.
pub const TABLE_SPAN: u64 = (ENTRIES_PER_TABLE * PAGE_SIZE) as u64;

/// Kernel/user split. Everything at or above this address is the kernel's
/// shared mapping, installed by reference into every address space and never
/// owned by any process.
pub const KERNEL_BASE: u64 = 0x2000_0000;

/// Directory slots belonging to the user region (below `KERNEL_BASE`).
pub const USER_TABLE_COUNT: usize = (KERNEL_BASE / TABLE_SPAN) as usize;

/// Top-level directory slot covering `vaddr`.
pub fn directory_slot(vaddr: VirtAddr) -> usize {
    (vaddr.as_u64() / TABLE_SPAN) as usize
}

/// Second-level table slot covering `vaddr`.
pub fn table_slot(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() / PAGE_SIZE as u64) % ENTRIES_PER_TABLE as u64) as usize
}

/// Exclusively owned handle to one address space's top-level directory.
///
/// Deliberately not `Copy`: the process core moves it from the PCB into the
/// reaper exactly once, and only `MemoryManager` implementations look inside.
#[derive(Debug, PartialEq, Eq)]
pub struct AspaceRoot(PhysAddr);

impl AspaceRoot {
    pub(crate) fn new(addr: PhysAddr) -> Self {
        AspaceRoot(addr)
    }

    pub fn address(&self) -> PhysAddr {
        self.0
    }
}

/// Reference to one second-level table. Ownership of the table is tracked by
/// the per-process ledger, not by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef(PhysAddr);

impl TableRef {
    pub(crate) fn new(addr: PhysAddr) -> Self {
        TableRef(addr)
    }

    pub fn address(&self) -> PhysAddr {
        self.0
    }
}

bitflags::bitflags! {
    /// Protection bits carried by a mapping. Present is implicit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const WRITABLE = 1 << 0;
        const USER     = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame left for a second-level table.
    OutOfFrames,
    /// The target page slot is already occupied.
    AlreadyMapped,
}

/// The memory collaborator of the process core: physical frames, address
/// spaces, second-level tables, and the shared kernel range. One seam rather
/// than three because `map` allocates tables from the same frame pool it
/// hands out pages from.
///
/// The process core never sees raw memory outside this trait, which is what
/// lets the lifecycle tests run against a fabricated implementation.
pub trait MemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysAddr>;
    fn free_frame(&mut self, frame: PhysAddr);

    fn zero_frame(&mut self, frame: PhysAddr);
    fn write_frame(&mut self, frame: PhysAddr, offset: usize, bytes: &[u8]);
    fn read_frame(&self, frame: PhysAddr, offset: usize, buf: &mut [u8]);
    /// Byte-for-byte copy of one full frame.
    fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr);

    fn allocate_address_space(&mut self) -> Option<AspaceRoot>;
    fn free_address_space(&mut self, root: AspaceRoot);

    /// Fresh, empty second-level table.
    fn allocate_table(&mut self) -> Option<TableRef>;
    /// The table must have no remaining page mappings.
    fn free_table(&mut self, table: TableRef);

    fn install_table(&mut self, root: &AspaceRoot, slot: usize, table: TableRef, flags: MapFlags);
    fn install_page(&mut self, table: TableRef, slot: usize, frame: PhysAddr, flags: MapFlags);

    /// Map one frame at `vaddr`, allocating intermediate tables as needed.
    /// Returns how many fresh tables that took.
    fn map(
        &mut self,
        root: &AspaceRoot,
        vaddr: VirtAddr,
        frame: PhysAddr,
        flags: MapFlags,
    ) -> Result<usize, MapError>;

    fn table(&self, root: &AspaceRoot, slot: usize) -> Option<(TableRef, MapFlags)>;
    fn page(&self, table: TableRef, slot: usize) -> Option<(PhysAddr, MapFlags)>;

    fn unmap_table(&mut self, root: &AspaceRoot, slot: usize) -> Option<TableRef>;
    fn unmap_page(&mut self, table: TableRef, slot: usize) -> Option<PhysAddr>;

    /// Install the kernel's upper-range mappings into `root` by reference.
    /// Shared, never owned: teardown must not walk this range.
    fn copy_kernel_range_into(&mut self, root: &AspaceRoot);
}

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> =
        Mutex::new(BumpFrameAllocator::new());
    pub static ref KERNEL_MEMORY: Mutex<KernelMemory> = Mutex::new(KernelMemory::new());
}

/// Pick the frame allocator's region from the available areas: the largest
/// one, clamped so it starts above everything the boot path already
/// occupies. Available areas routinely contain the kernel image and the
/// boot information, so a plain "largest area" hands out live frames.
fn select_frame_region(
    reserved_end: u64,
    areas: impl Iterator<Item = (u64, u64)>,
) -> Option<(u64, u64)> {
    let mut best: Option<(u64, u64)> = None;
    for (start, end) in areas {
        let start = start.max(reserved_end);
        if end <= start {
            continue;
        }
        if best.map_or(true, |(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
    }
    best
}

/// Boot-time memory bring-up: heap, physical frame allocator from the
/// Multiboot2 memory map, then the shared kernel page tables.
#[cfg(not(test))]
pub fn init(multiboot_info_addr: usize) {
    use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

    crate::allocator::init_heap();

    let boot_info = unsafe {
        BootInformation::load(multiboot_info_addr as *const BootInformationHeader)
            .expect("Failed to load Multiboot2 info")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    // Everything below the end of the kernel image and the Multiboot2 info
    // structure is spoken for, plus the legacy low-memory megabyte.
    let mut reserved_end = 0x10_0000u64;
    if let Some(sections) = boot_info.elf_sections() {
        for section in sections {
            reserved_end = reserved_end.max(section.end_address());
        }
    }
    reserved_end = reserved_end.max(boot_info.end_address() as u64);

    let mut areas = alloc::vec::Vec::new();
    for area in memory_map_tag.memory_areas() {
        if MemoryAreaType::from(area.typ()) == MemoryAreaType::Available {
            areas.push((area.start_address(), area.end_address()));
        }
    }
    let (start, end) = select_frame_region(reserved_end, areas.into_iter())
        .expect("No usable physical memory region");

    {
        let mut allocator = FRAME_ALLOCATOR.lock();
        unsafe { allocator.init(PhysAddr::new(start), PhysAddr::new(end)) };
    }
    crate::log_info!(
        "Physical frame allocator initialized: {:#x}..{:#x}",
        start,
        end
    );

    KERNEL_MEMORY
        .lock()
        .bootstrap_kernel_space()
        .expect("Failed to build shared kernel page tables");
    crate::log_info!("Shared kernel address range constructed.");
}
