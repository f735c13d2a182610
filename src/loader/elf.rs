//! ELF64 program loader: parses a static executable image and maps its
//! PT_LOAD segments into a process's user region, page by page.

use core::fmt;

use x86_64::VirtAddr;

use super::ProgramLoader;
use crate::memory::{MapError, MapFlags, MemoryManager, KERNEL_BASE, PAGE_SIZE};
use crate::process::{Process, ProcessError};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 64 {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 {
            return Err(ExecError::UnsupportedArch);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }

        Ok(Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 56 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

// ══════════════════════════════════════════════════════════════
//  ExecError
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
            ExecError::ReadError => write!(f, "Image read error"),
        }
    }
}

impl From<ExecError> for ProcessError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::MemoryError => ProcessError::OutOfFrames,
            _ => ProcessError::BadImage,
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF Loader
// ══════════════════════════════════════════════════════════════

pub struct ElfLoader;

impl ProgramLoader for ElfLoader {
    fn load<M: MemoryManager>(
        &self,
        mm: &mut M,
        proc: &mut Process,
        image: &[u8],
    ) -> Result<(), ProcessError> {
        load_elf(mm, proc, image).map_err(ProcessError::from)
    }
}

/// Map every PT_LOAD segment below `KERNEL_BASE` into the process's address
/// space. Each page is freshly allocated, zeroed, filled from the file
/// bytes that cover it, and credited to the process ledger. File bytes
/// short of `p_memsz` leave the remainder zeroed (bss).
fn load_elf<M: MemoryManager>(
    mm: &mut M,
    proc: &mut Process,
    image: &[u8],
) -> Result<(), ExecError> {
    let ehdr = Elf64Ehdr::parse(image)?;
    if ehdr.e_entry >= KERNEL_BASE {
        return Err(ExecError::InvalidFormat);
    }

    let Process { root, owned, .. } = proc;
    let root = match root.as_ref() {
        Some(root) => root,
        None => return Err(ExecError::MemoryError),
    };

    for i in 0..ehdr.e_phnum {
        let off = ehdr.e_phoff as usize + i as usize * ehdr.e_phentsize as usize;
        let bytes = image.get(off..off + 56).ok_or(ExecError::ReadError)?;
        let phdr = Elf64Phdr::parse(bytes)?;
        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(ExecError::InvalidFormat);
        }
        let seg_end = phdr
            .p_vaddr
            .checked_add(phdr.p_memsz)
            .ok_or(ExecError::InvalidFormat)?;
        if seg_end > KERNEL_BASE {
            return Err(ExecError::InvalidFormat);
        }
        let file_end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .ok_or(ExecError::ReadError)?;
        if file_end > image.len() as u64 {
            return Err(ExecError::ReadError);
        }

        let mut page_va = phdr.p_vaddr & !(PAGE_SIZE as u64 - 1);
        while page_va < seg_end {
            let frame = mm.allocate_frame().ok_or(ExecError::MemoryError)?;
            mm.zero_frame(frame);

            // Portion of the file data that lands on this page.
            let copy_start = page_va.max(phdr.p_vaddr);
            let copy_end = (page_va + PAGE_SIZE as u64).min(phdr.p_vaddr + phdr.p_filesz);
            if copy_start < copy_end {
                let src_off = (phdr.p_offset + (copy_start - phdr.p_vaddr)) as usize;
                let src = &image[src_off..src_off + (copy_end - copy_start) as usize];
                mm.write_frame(frame, (copy_start - page_va) as usize, src);
            }

            match mm.map(
                root,
                VirtAddr::new(page_va),
                frame,
                MapFlags::WRITABLE | MapFlags::USER,
            ) {
                Ok(extra_tables) => owned.credit(extra_tables + 1),
                Err(MapError::OutOfFrames) => {
                    mm.free_frame(frame);
                    return Err(ExecError::MemoryError);
                }
                // Overlapping segments, or a collision with a stack page.
                Err(MapError::AlreadyMapped) => {
                    mm.free_frame(frame);
                    return Err(ExecError::InvalidFormat);
                }
            }
            page_va += PAGE_SIZE as u64;
        }
    }

    proc.entry = VirtAddr::new(ehdr.e_entry);
    Ok(())
}
