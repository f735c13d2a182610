pub mod elf;

use crate::memory::MemoryManager;
use crate::process::{Process, ProcessError};

/// Populates a freshly built address space from a program image: maps the
/// program's pages into `proc`'s user region, credits them to its ownership
/// ledger and sets the entry point. Must not touch the kernel range or the
/// stacks the builder already mapped.
pub trait ProgramLoader {
    fn load<M: MemoryManager>(
        &self,
        mm: &mut M,
        proc: &mut Process,
        image: &[u8],
    ) -> Result<(), ProcessError>;
}
