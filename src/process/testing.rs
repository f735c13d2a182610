//! Fabricated collaborators for the process lifecycle tests. `FakeMemory`
//! keeps a strict model of frame ownership and panics on any misuse a real
//! backend would silently corrupt memory over: double frees, freeing tables
//! that still hold mappings, touching frames that were never allocated.

use std::collections::BTreeMap;

use x86_64::{PhysAddr, VirtAddr};

use crate::loader::ProgramLoader;
use crate::memory::{
    directory_slot, table_slot, AspaceRoot, MapError, MapFlags, MemoryManager, PAGE_SIZE,
    USER_TABLE_COUNT,
};
use crate::process::pool::ProcHandle;
use crate::process::{Process, ProcessError};
use crate::scheduler::SchedulerPort;

#[derive(Default)]
struct FakeDir {
    /// slot -> (table address, flags)
    user: BTreeMap<usize, (u64, MapFlags)>,
}

pub struct FakeMemory {
    next_addr: u64,
    frames: BTreeMap<u64, Vec<u8>>,
    /// table address -> slot -> (frame address, flags)
    tables: BTreeMap<u64, BTreeMap<usize, (u64, MapFlags)>>,
    dirs: BTreeMap<u64, FakeDir>,
    /// Remaining allocations before the next one fails, if set.
    pub fail_after: Option<usize>,
    /// Roots the kernel range was installed into, in order.
    pub kernel_copies: Vec<u64>,
}

impl FakeMemory {
    pub fn new() -> Self {
        FakeMemory {
            next_addr: 0x100_0000,
            frames: BTreeMap::new(),
            tables: BTreeMap::new(),
            dirs: BTreeMap::new(),
            fail_after: None,
            kernel_copies: Vec::new(),
        }
    }

    /// Every 4 KiB unit currently allocated: data frames, tables and roots.
    pub fn outstanding(&self) -> usize {
        self.frames.len() + self.tables.len() + self.dirs.len()
    }

    fn take_addr(&mut self) -> Option<u64> {
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        let addr = self.next_addr;
        self.next_addr += PAGE_SIZE as u64;
        Some(addr)
    }

    fn frame_data(&mut self, frame: PhysAddr) -> &mut Vec<u8> {
        self.frames
            .get_mut(&frame.as_u64())
            .unwrap_or_else(|| panic!("access to unallocated frame {:#x}", frame.as_u64()))
    }
}

impl MemoryManager for FakeMemory {
    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        let addr = self.take_addr()?;
        // Garbage fill, so anything relying on implicit zeroing trips tests.
        self.frames.insert(addr, vec![0xCD; PAGE_SIZE]);
        Some(PhysAddr::new(addr))
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        assert!(
            self.frames.remove(&frame.as_u64()).is_some(),
            "freed unknown or already-freed frame {:#x}",
            frame.as_u64()
        );
    }

    fn zero_frame(&mut self, frame: PhysAddr) {
        self.frame_data(frame).fill(0);
    }

    fn write_frame(&mut self, frame: PhysAddr, offset: usize, bytes: &[u8]) {
        let data = self.frame_data(frame);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn read_frame(&self, frame: PhysAddr, offset: usize, buf: &mut [u8]) {
        let data = self
            .frames
            .get(&frame.as_u64())
            .unwrap_or_else(|| panic!("read of unallocated frame {:#x}", frame.as_u64()));
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr) {
        let data = self
            .frames
            .get(&src.as_u64())
            .unwrap_or_else(|| panic!("copy from unallocated frame {:#x}", src.as_u64()))
            .clone();
        *self.frame_data(dst) = data;
    }

    fn allocate_address_space(&mut self) -> Option<AspaceRoot> {
        let addr = self.take_addr()?;
        self.dirs.insert(addr, FakeDir::default());
        Some(AspaceRoot::new(PhysAddr::new(addr)))
    }

    fn free_address_space(&mut self, root: AspaceRoot) {
        let dir = self
            .dirs
            .remove(&root.address().as_u64())
            .unwrap_or_else(|| panic!("freed unknown address space {:#x}", root.address().as_u64()));
        assert!(
            dir.user.is_empty(),
            "address space {:#x} freed with {} user tables still installed",
            root.address().as_u64(),
            dir.user.len()
        );
    }

    fn allocate_table(&mut self) -> Option<crate::memory::TableRef> {
        let addr = self.take_addr()?;
        self.tables.insert(addr, BTreeMap::new());
        Some(crate::memory::TableRef::new(PhysAddr::new(addr)))
    }

    fn free_table(&mut self, table: crate::memory::TableRef) {
        let slots = self
            .tables
            .remove(&table.address().as_u64())
            .unwrap_or_else(|| panic!("freed unknown table {:#x}", table.address().as_u64()));
        assert!(
            slots.is_empty(),
            "table {:#x} freed with {} pages still mapped",
            table.address().as_u64(),
            slots.len()
        );
    }

    fn install_table(
        &mut self,
        root: &AspaceRoot,
        slot: usize,
        table: crate::memory::TableRef,
        flags: MapFlags,
    ) {
        assert!(slot < USER_TABLE_COUNT, "install_table outside user region");
        let dir = self
            .dirs
            .get_mut(&root.address().as_u64())
            .expect("install into unknown address space");
        let prev = dir.user.insert(slot, (table.address().as_u64(), flags));
        assert!(prev.is_none(), "directory slot {} installed twice", slot);
    }

    fn install_page(
        &mut self,
        table: crate::memory::TableRef,
        slot: usize,
        frame: PhysAddr,
        flags: MapFlags,
    ) {
        let slots = self
            .tables
            .get_mut(&table.address().as_u64())
            .expect("install into unknown table");
        let prev = slots.insert(slot, (frame.as_u64(), flags));
        assert!(prev.is_none(), "table slot {} installed twice", slot);
    }

    fn map(
        &mut self,
        root: &AspaceRoot,
        vaddr: VirtAddr,
        frame: PhysAddr,
        flags: MapFlags,
    ) -> Result<usize, MapError> {
        let dslot = directory_slot(vaddr);
        assert!(dslot < USER_TABLE_COUNT, "map outside the user region");

        let existing = self
            .dirs
            .get(&root.address().as_u64())
            .expect("map into unknown address space")
            .user
            .get(&dslot)
            .map(|&(addr, _)| addr);

        let mut extra_tables = 0;
        let table_addr = match existing {
            Some(addr) => addr,
            None => {
                let addr = self.take_addr().ok_or(MapError::OutOfFrames)?;
                self.tables.insert(addr, BTreeMap::new());
                self.dirs
                    .get_mut(&root.address().as_u64())
                    .expect("map into unknown address space")
                    .user
                    .insert(dslot, (addr, MapFlags::WRITABLE | MapFlags::USER));
                extra_tables += 1;
                addr
            }
        };

        let slots = self
            .tables
            .get_mut(&table_addr)
            .expect("directory points at unknown table");
        let tslot = table_slot(vaddr);
        if slots.contains_key(&tslot) {
            return Err(MapError::AlreadyMapped);
        }
        slots.insert(tslot, (frame.as_u64(), flags));
        Ok(extra_tables)
    }

    fn table(&self, root: &AspaceRoot, slot: usize) -> Option<(crate::memory::TableRef, MapFlags)> {
        let dir = self.dirs.get(&root.address().as_u64())?;
        let &(addr, flags) = dir.user.get(&slot)?;
        Some((crate::memory::TableRef::new(PhysAddr::new(addr)), flags))
    }

    fn page(&self, table: crate::memory::TableRef, slot: usize) -> Option<(PhysAddr, MapFlags)> {
        let slots = self.tables.get(&table.address().as_u64())?;
        let &(addr, flags) = slots.get(&slot)?;
        Some((PhysAddr::new(addr), flags))
    }

    fn unmap_table(&mut self, root: &AspaceRoot, slot: usize) -> Option<crate::memory::TableRef> {
        let dir = self.dirs.get_mut(&root.address().as_u64())?;
        let (addr, _) = dir.user.remove(&slot)?;
        Some(crate::memory::TableRef::new(PhysAddr::new(addr)))
    }

    fn unmap_page(&mut self, table: crate::memory::TableRef, slot: usize) -> Option<PhysAddr> {
        let slots = self.tables.get_mut(&table.address().as_u64())?;
        let (addr, _) = slots.remove(&slot)?;
        Some(PhysAddr::new(addr))
    }

    fn copy_kernel_range_into(&mut self, root: &AspaceRoot) {
        self.kernel_copies.push(root.address().as_u64());
    }
}

/// Loader stand-in: maps a scripted set of pages, each filled with one byte
/// value, and optionally fails after a given number of them.
pub struct FakeLoader {
    /// (page-aligned vaddr, fill byte)
    pub pages: Vec<(u64, u8)>,
    pub entry: u64,
    /// Fail with `BadImage` after mapping this many pages.
    pub fail_after_pages: Option<usize>,
}

impl FakeLoader {
    pub fn new(pages: Vec<(u64, u8)>, entry: u64) -> Self {
        FakeLoader {
            pages,
            entry,
            fail_after_pages: None,
        }
    }
}

impl ProgramLoader for FakeLoader {
    fn load<M: MemoryManager>(
        &self,
        mm: &mut M,
        proc: &mut Process,
        _image: &[u8],
    ) -> Result<(), ProcessError> {
        let Process { root, owned, .. } = proc;
        let root = root.as_ref().expect("loader needs a built address space");

        for (i, &(vaddr, fill)) in self.pages.iter().enumerate() {
            if self.fail_after_pages == Some(i) {
                return Err(ProcessError::BadImage);
            }
            let frame = mm.allocate_frame().ok_or(ProcessError::OutOfFrames)?;
            mm.zero_frame(frame);
            mm.write_frame(frame, 0, &[fill; 32]);
            let extra = mm.map(
                root,
                VirtAddr::new(vaddr),
                frame,
                MapFlags::WRITABLE | MapFlags::USER,
            )?;
            owned.credit(extra + 1);
        }

        proc.entry = VirtAddr::new(self.entry);
        Ok(())
    }
}

/// Records scheduler hand-offs.
#[derive(Default)]
pub struct FakeScheduler {
    pub added: Vec<ProcHandle>,
}

impl SchedulerPort for FakeScheduler {
    fn add(&mut self, handle: ProcHandle) {
        self.added.push(handle);
    }
}
