//! Address-space ownership: building, cloning and tearing down the per
//! process page hierarchy, with a checked ledger of every frame the process
//! is responsible for returning.

use x86_64::VirtAddr;

use super::{Process, ProcessError, PROC_KERNEL_STACK, PROC_USER_STACK};
use crate::memory::{
    AspaceRoot, MapFlags, MemoryManager, ENTRIES_PER_TABLE, PAGE_SIZE, USER_TABLE_COUNT,
};

/// Count of 4 KiB units (frames and second-level tables, plus the root
/// directory) a process owns. Credited as memory is acquired, debited one by
/// one during teardown. An underflow means the hierarchy walk found memory
/// the ledger never recorded, which is an accounting bug, not an error the
/// caller can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedUnits(u32);

impl OwnedUnits {
    pub const fn zero() -> Self {
        OwnedUnits(0)
    }

    pub fn credit(&mut self, units: usize) {
        self.0 += units as u32;
    }

    pub fn debit_one(&mut self) {
        match self.0.checked_sub(1) {
            Some(left) => self.0 = left,
            None => panic!("ownership ledger underflow: freed a unit the ledger never recorded"),
        }
    }

    pub fn units(&self) -> u32 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Build a fresh address space for `proc`: root directory, one kernel-stack
/// page, one user-stack page, then the shared kernel range by reference.
///
/// On failure the partially built hierarchy stays attached to `proc`, ledger
/// intact, so the caller can reclaim it with `tear_down`.
pub fn build_for<M: MemoryManager>(mm: &mut M, proc: &mut Process) -> Result<(), ProcessError> {
    let root = mm
        .allocate_address_space()
        .ok_or(ProcessError::OutOfFrames)?;
    proc.owned.credit(1);

    let built = map_stacks(mm, &root, &mut proc.owned);
    if built.is_ok() {
        proc.kernel_stack_top = VirtAddr::new(PROC_KERNEL_STACK);
        proc.user_stack_top = VirtAddr::new(PROC_USER_STACK);
        mm.copy_kernel_range_into(&root);
    }

    // Attach the root either way; a half-built space is torn down whole.
    proc.root = Some(root);
    built
}

fn map_stacks<M: MemoryManager>(
    mm: &mut M,
    root: &AspaceRoot,
    ledger: &mut OwnedUnits,
) -> Result<(), ProcessError> {
    map_stack_page(mm, root, ledger, PROC_KERNEL_STACK, MapFlags::WRITABLE)?;
    map_stack_page(
        mm,
        root,
        ledger,
        PROC_USER_STACK,
        MapFlags::WRITABLE | MapFlags::USER,
    )
}

/// Map the page just below `stack_top`. Stacks grow down, so the top address
/// itself stays unmapped.
fn map_stack_page<M: MemoryManager>(
    mm: &mut M,
    root: &AspaceRoot,
    ledger: &mut OwnedUnits,
    stack_top: u64,
    flags: MapFlags,
) -> Result<(), ProcessError> {
    let frame = mm.allocate_frame().ok_or(ProcessError::OutOfFrames)?;
    mm.zero_frame(frame);

    let vaddr = VirtAddr::new(stack_top - PAGE_SIZE as u64);
    match mm.map(root, vaddr, frame, flags) {
        Ok(extra_tables) => {
            ledger.credit(extra_tables + 1);
            Ok(())
        }
        Err(err) => {
            mm.free_frame(frame);
            Err(err.into())
        }
    }
}

/// Deep-copy `source`'s user region into a fresh address space for `clone`.
/// Every table and frame of the copy is newly allocated and credited to the
/// clone's own ledger; only the kernel range is shared.
///
/// Like `build_for`, a failed copy leaves the partial hierarchy attached to
/// `clone` for the caller to tear down.
pub fn clone_into<M: MemoryManager>(
    mm: &mut M,
    clone: &mut Process,
    source: &Process,
) -> Result<(), ProcessError> {
    let src_root = match source.root.as_ref() {
        Some(root) => root,
        None => panic!("clone source pid {:?} has no address space", source.pid),
    };

    let root = mm
        .allocate_address_space()
        .ok_or(ProcessError::OutOfFrames)?;
    clone.owned.credit(1);

    let copied = copy_user_region(mm, &root, &mut clone.owned, src_root);
    if copied.is_ok() {
        mm.copy_kernel_range_into(&root);
    }
    clone.root = Some(root);
    copied
}

fn copy_user_region<M: MemoryManager>(
    mm: &mut M,
    dst_root: &AspaceRoot,
    ledger: &mut OwnedUnits,
    src_root: &AspaceRoot,
) -> Result<(), ProcessError> {
    for slot in 0..USER_TABLE_COUNT {
        let (src_table, table_flags) = match mm.table(src_root, slot) {
            Some(entry) => entry,
            None => continue,
        };

        let new_table = mm.allocate_table().ok_or(ProcessError::OutOfFrames)?;
        mm.install_table(dst_root, slot, new_table, table_flags);
        ledger.credit(1);

        for page_slot in 0..ENTRIES_PER_TABLE {
            let (src_frame, page_flags) = match mm.page(src_table, page_slot) {
                Some(entry) => entry,
                None => continue,
            };

            let frame = mm.allocate_frame().ok_or(ProcessError::OutOfFrames)?;
            mm.copy_frame(frame, src_frame);
            mm.install_page(new_table, page_slot, frame, page_flags);
            ledger.credit(1);
        }
    }
    Ok(())
}

/// Release everything `proc` owns: every user page, every user table, then
/// the root directory, debiting the ledger per unit. The shared kernel range
/// above `USER_TABLE_COUNT` is deliberately not walked.
///
/// Safe on a PCB without an address space (nothing to do), and on a
/// partially built one (only present entries are visited).
pub fn tear_down<M: MemoryManager>(mm: &mut M, proc: &mut Process) {
    let root = match proc.root.take() {
        Some(root) => root,
        None => return,
    };

    for slot in 0..USER_TABLE_COUNT {
        if let Some(table) = mm.unmap_table(&root, slot) {
            for page_slot in 0..ENTRIES_PER_TABLE {
                if let Some(frame) = mm.unmap_page(table, page_slot) {
                    mm.free_frame(frame);
                    proc.owned.debit_one();
                }
            }
            mm.free_table(table);
            proc.owned.debit_one();
        }
    }

    mm.free_address_space(root);
    proc.owned.debit_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::directory_slot;
    use crate::process::testing::FakeMemory;

    fn build(mm: &mut FakeMemory) -> Process {
        let mut proc = Process::unborn();
        build_for(mm, &mut proc).expect("build should succeed");
        proc
    }

    #[test]
    fn build_credits_root_stacks_and_their_tables() {
        let mut mm = FakeMemory::new();
        let proc = build(&mut mm);

        // Root + two stack frames + one fresh table per stack.
        assert_eq!(proc.owned.units(), 5);
        assert_eq!(mm.outstanding(), 5);
        assert_eq!(proc.kernel_stack_top, VirtAddr::new(PROC_KERNEL_STACK));
        assert_eq!(proc.user_stack_top, VirtAddr::new(PROC_USER_STACK));
    }

    #[test]
    fn stacks_live_in_separate_tables() {
        // The guard spacing between the two stacks must keep their pages in
        // different directory slots, so each build allocates two tables.
        let kstack_page = VirtAddr::new(PROC_KERNEL_STACK - PAGE_SIZE as u64);
        let ustack_page = VirtAddr::new(PROC_USER_STACK - PAGE_SIZE as u64);
        assert_ne!(directory_slot(kstack_page), directory_slot(ustack_page));
    }

    #[test]
    fn build_installs_shared_kernel_range() {
        let mut mm = FakeMemory::new();
        let proc = build(&mut mm);
        let root = proc.root.as_ref().unwrap();
        assert_eq!(mm.kernel_copies, &[root.address().as_u64()]);
    }

    #[test]
    fn teardown_returns_every_unit() {
        let mut mm = FakeMemory::new();
        let mut proc = build(&mut mm);

        tear_down(&mut mm, &mut proc);
        assert!(proc.owned.is_zero());
        assert!(proc.root.is_none());
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn teardown_covers_loader_mapped_pages() {
        let mut mm = FakeMemory::new();
        let mut proc = build(&mut mm);

        // Pages a program loader would add, spread over several tables.
        let root = proc.root.as_ref().unwrap();
        for i in 0..8u64 {
            let frame = mm.allocate_frame().unwrap();
            let vaddr = VirtAddr::new(0x40_0000 + i * crate::memory::TABLE_SPAN / 2);
            let extra = mm
                .map(root, vaddr, frame, MapFlags::WRITABLE | MapFlags::USER)
                .unwrap();
            proc.owned.credit(extra + 1);
        }

        tear_down(&mut mm, &mut proc);
        assert!(proc.owned.is_zero());
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn teardown_of_empty_pcb_is_a_no_op() {
        let mut mm = FakeMemory::new();
        let mut proc = Process::unborn();
        tear_down(&mut mm, &mut proc);
        assert!(proc.owned.is_zero());
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn build_failure_leaves_reclaimable_partial_space() {
        // Enough for the root, the kernel-stack frame and its table; the
        // user-stack frame allocation fails.
        let mut mm = FakeMemory::new();
        mm.fail_after = Some(3);

        let mut proc = Process::unborn();
        let err = build_for(&mut mm, &mut proc).unwrap_err();
        assert_eq!(err, ProcessError::OutOfFrames);
        assert!(proc.root.is_some());

        tear_down(&mut mm, &mut proc);
        assert!(proc.owned.is_zero());
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn clone_owns_exactly_as_much_as_its_source() {
        let mut mm = FakeMemory::new();
        let mut source = build(&mut mm);

        // Give the source some program pages.
        {
            let root = source.root.as_ref().unwrap();
            for i in 0..3u64 {
                let frame = mm.allocate_frame().unwrap();
                mm.write_frame(frame, 0, &[i as u8 + 1; 16]);
                let extra = mm
                    .map(
                        root,
                        VirtAddr::new(0x40_0000 + i * PAGE_SIZE as u64),
                        frame,
                        MapFlags::WRITABLE | MapFlags::USER,
                    )
                    .unwrap();
                source.owned.credit(extra + 1);
            }
        }

        let mut clone = Process::unborn();
        clone_into(&mut mm, &mut clone, &source).expect("clone should succeed");
        assert_eq!(clone.owned, source.owned);
    }

    #[test]
    fn clone_copies_contents_and_flags_into_fresh_frames() {
        let mut mm = FakeMemory::new();
        let mut source = build(&mut mm);
        let vaddr = VirtAddr::new(0x10_0000);
        {
            let root = source.root.as_ref().unwrap();
            let frame = mm.allocate_frame().unwrap();
            mm.zero_frame(frame);
            mm.write_frame(frame, 8, b"payload");
            let extra = mm.map(root, vaddr, frame, MapFlags::USER).unwrap();
            source.owned.credit(extra + 1);
        }

        let mut clone = Process::unborn();
        clone_into(&mut mm, &mut clone, &source).unwrap();

        let src_root = source.root.as_ref().unwrap();
        let clone_root = clone.root.as_ref().unwrap();
        let slot = directory_slot(vaddr);
        let (src_table, _) = mm.table(src_root, slot).unwrap();
        let (clone_table, _) = mm.table(clone_root, slot).unwrap();
        assert_ne!(src_table, clone_table);

        let tslot = crate::memory::table_slot(vaddr);
        let (src_frame, src_flags) = mm.page(src_table, tslot).unwrap();
        let (clone_frame, clone_flags) = mm.page(clone_table, tslot).unwrap();
        assert_ne!(src_frame, clone_frame);
        assert_eq!(src_flags, clone_flags);

        let mut src_bytes = [0u8; 7];
        let mut clone_bytes = [0u8; 7];
        mm.read_frame(src_frame, 8, &mut src_bytes);
        mm.read_frame(clone_frame, 8, &mut clone_bytes);
        assert_eq!(src_bytes, clone_bytes);

        // Writes to the source after the clone must not show through.
        mm.write_frame(src_frame, 8, b"changed");
        mm.read_frame(clone_frame, 8, &mut clone_bytes);
        assert_eq!(&clone_bytes, b"payload");
    }

    #[test]
    fn clone_shares_the_kernel_range_by_reference() {
        let mut mm = FakeMemory::new();
        let source = build(&mut mm);

        let mut clone = Process::unborn();
        clone_into(&mut mm, &mut clone, &source).unwrap();
        let clone_root = clone.root.as_ref().unwrap();
        assert!(mm.kernel_copies.contains(&clone_root.address().as_u64()));
    }

    #[test]
    fn failed_clone_tears_down_to_nothing() {
        let mut mm = FakeMemory::new();
        let source = build(&mut mm);
        let before = mm.outstanding();

        // Fail partway through the user-region copy.
        mm.fail_after = Some(2);
        let mut clone = Process::unborn();
        let err = clone_into(&mut mm, &mut clone, &source).unwrap_err();
        assert_eq!(err, ProcessError::OutOfFrames);

        mm.fail_after = None;
        tear_down(&mut mm, &mut clone);
        assert!(clone.owned.is_zero());
        assert_eq!(mm.outstanding(), before);
    }

    #[test]
    #[should_panic(expected = "ownership ledger underflow")]
    fn ledger_underflow_is_fatal() {
        let mut ledger = OwnedUnits::zero();
        ledger.debit_one();
    }
}
