//! ELF executables.
//!
//! Only the subset the loader accepts: 64-bit, little-endian, version 1,
//! executable, x86-64, with standard 56-byte program headers. Anything
//! else is rejected before a single segment is touched.

use goblin::elf::header::{ELFDATA2LSB, EM_X86_64, ET_EXEC, EV_CURRENT};
use goblin::elf64::{header, program_header};

pub use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElfError {
    InvalidElf,
    InvalidClass,
    InvalidEndianness,
    InvalidVersion,
    InvalidObjectType,
    InvalidMachineType,
    InvalidProgramHeaderSize,
}

/// An ELF executable.
pub struct Elf<'a> {
    pub data: &'a [u8],
    header: &'a header::Header,
}

impl<'a> Elf<'a> {
    /// Validate `data` as an executable this kernel can load.
    pub fn from(data: &'a [u8]) -> Result<Elf<'a>, ElfError> {
        if data.len() < header::SIZEOF_EHDR
            || &data[..header::SELFMAG] != header::ELFMAG
        {
            return Err(ElfError::InvalidElf);
        }

        let header = unsafe { &*(data.as_ptr() as *const header::Header) };

        if header.e_ident[header::EI_CLASS] != header::ELFCLASS {
            return Err(ElfError::InvalidClass);
        }
        if header.e_ident[header::EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::InvalidEndianness);
        }
        if header.e_ident[header::EI_VERSION] != EV_CURRENT {
            return Err(ElfError::InvalidVersion);
        }
        if header.e_type != ET_EXEC {
            return Err(ElfError::InvalidObjectType);
        }
        if header.e_machine != EM_X86_64 {
            return Err(ElfError::InvalidMachineType);
        }
        if header.e_phentsize as usize != program_header::SIZEOF_PHDR {
            return Err(ElfError::InvalidProgramHeaderSize);
        }

        Ok(Elf { data, header })
    }

    /// Get the entry field of the header
    pub fn entry(&self) -> usize {
        self.header.e_entry as usize
    }

    pub fn segments(&'a self) -> ElfSegments<'a> {
        ElfSegments {
            data: self.data,
            header: self.header,
            i: 0,
        }
    }
}

pub struct ElfSegments<'a> {
    data: &'a [u8],
    header: &'a header::Header,
    i: usize,
}

impl<'a> Iterator for ElfSegments<'a> {
    type Item = &'a program_header::ProgramHeader;
    fn next(&mut self) -> Option<Self::Item> {
        if self.i < self.header.e_phnum as usize {
            let item = unsafe {
                &*((self.data.as_ptr() as usize
                    + self.header.e_phoff as usize
                    + self.i * self.header.e_phentsize as usize)
                    as *const program_header::ProgramHeader)
            };
            self.i += 1;
            Some(item)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::elf::header::{EI_DATA, EI_VERSION};
    use goblin::elf64::header::{EI_CLASS, ELFCLASS, SIZEOF_EHDR};
    use goblin::elf64::program_header::SIZEOF_PHDR;

    fn minimal_executable() -> Vec<u8> {
        let mut data = vec![0u8; SIZEOF_EHDR + SIZEOF_PHDR];
        data[..header::SELFMAG].copy_from_slice(header::ELFMAG);
        data[EI_CLASS] = ELFCLASS;
        data[EI_DATA] = ELFDATA2LSB;
        data[EI_VERSION] = EV_CURRENT;
        data[0x10..0x12].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[0x12..0x14].copy_from_slice(&EM_X86_64.to_le_bytes());
        // e_entry
        data[0x18..0x20].copy_from_slice(&0x40_0000u64.to_le_bytes());
        // e_phoff
        data[0x20..0x28].copy_from_slice(&(SIZEOF_EHDR as u64).to_le_bytes());
        // e_phentsize, e_phnum
        data[0x36..0x38].copy_from_slice(&(SIZEOF_PHDR as u16).to_le_bytes());
        data[0x38..0x3A].copy_from_slice(&1u16.to_le_bytes());

        // One PT_LOAD segment
        let ph = SIZEOF_EHDR;
        data[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        data[ph + 4..ph + 8].copy_from_slice(&(PF_X | goblin::elf::program_header::PF_R).to_le_bytes());
        data[ph + 16..ph + 24].copy_from_slice(&0x40_0000u64.to_le_bytes());
        data[ph + 32..ph + 40].copy_from_slice(&0x100u64.to_le_bytes());
        data[ph + 40..ph + 48].copy_from_slice(&0x200u64.to_le_bytes());
        data
    }

    #[test]
    fn accepts_the_supported_subset() {
        let data = minimal_executable();
        let elf = Elf::from(&data).unwrap();
        assert_eq!(elf.entry(), 0x40_0000);

        let segments: Vec<_> = elf.segments().collect();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].p_type, PT_LOAD);
        assert_eq!(segments[0].p_vaddr, 0x40_0000);
        assert_eq!(segments[0].p_filesz, 0x100);
        assert_eq!(segments[0].p_memsz, 0x200);
    }

    #[test]
    fn rejects_every_header_mismatch() {
        let data = minimal_executable();

        let mut bad = data.clone();
        bad[0] = 0;
        assert_eq!(Elf::from(&bad).map(|_| ()), Err(ElfError::InvalidElf));

        let mut bad = data.clone();
        bad[EI_CLASS] = 1;
        assert_eq!(Elf::from(&bad).map(|_| ()), Err(ElfError::InvalidClass));

        let mut bad = data.clone();
        bad[EI_DATA] = 2;
        assert_eq!(Elf::from(&bad).map(|_| ()), Err(ElfError::InvalidEndianness));

        let mut bad = data.clone();
        bad[EI_VERSION] = 0;
        assert_eq!(Elf::from(&bad).map(|_| ()), Err(ElfError::InvalidVersion));

        let mut bad = data.clone();
        bad[0x10] = 3; // ET_DYN
        assert_eq!(Elf::from(&bad).map(|_| ()), Err(ElfError::InvalidObjectType));

        let mut bad = data.clone();
        bad[0x12] = 0x28; // EM_AARCH64
        assert_eq!(Elf::from(&bad).map(|_| ()), Err(ElfError::InvalidMachineType));

        let mut bad = data.clone();
        bad[0x36] = 40;
        assert_eq!(
            Elf::from(&bad).map(|_| ()),
            Err(ElfError::InvalidProgramHeaderSize)
        );

        assert_eq!(Elf::from(&data[..8]).map(|_| ()), Err(ElfError::InvalidElf));
    }
}
