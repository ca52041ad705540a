use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use goblin::elf::header::{ET_DYN, EV_CURRENT};
use std::io;

use super::{ELFCLASS64, ELFDATA2LSB, ELF_MAGIC};

/// The ELF header of a 64-bit object file (`Elf64_Ehdr`).
///
/// Only the fields the packer reads or writes are interpreted; the rest are
/// carried through unchanged.
///
/// Reference: [Tool Interface Standard ELF v1.2](https://refspecs.linuxfoundation.org/elf/elf.pdf)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Ehdr {
    /// ELF identification bytes (magic number, class, data encoding, version).
    pub e_ident: [u8; 16],

    /// Object file type.
    ///
    /// The packer emits `ET_EXEC` (2) for static artifacts and `ET_DYN` (3)
    /// for position-independent ones.
    pub e_type: u16,

    /// Target architecture, e.g. `EM_X86_64` (62) or `EM_AARCH64` (183).
    pub e_machine: u16,

    pub e_version: u32,

    /// Virtual address of the program entry point.
    pub e_entry: u64,

    /// File offset of the program header table.
    pub e_phoff: u64,

    /// File offset of the section header table, 0 when there is none.
    pub e_shoff: u64,

    pub e_flags: u32,

    /// Size of this header, 64 for ELF64.
    pub e_ehsize: u16,

    /// Size of one program header entry, 56 for ELF64.
    pub e_phentsize: u16,

    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf64Ehdr {
    pub const SIZE: usize = 64;

    /// Header for a section-less image with `phnum` program headers placed
    /// right after it.
    pub fn new(e_type: u16, e_machine: u16, e_entry: u64, phnum: u16) -> Self {
        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELF_MAGIC);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = EV_CURRENT;

        Elf64Ehdr {
            e_ident,
            e_type,
            e_machine,
            e_version: EV_CURRENT as u32,
            e_entry,
            e_phoff: Self::SIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: Self::SIZE as u16,
            e_phentsize: Elf64Phdr::SIZE as u16,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    pub fn is_position_independent(&self) -> bool {
        self.e_type == ET_DYN
    }

    pub fn from_reader<R: io::Read>(cur: &mut R) -> io::Result<Elf64Ehdr> {
        let mut e_ident = [0u8; 16];
        cur.read_exact(&mut e_ident)?;

        Ok(Elf64Ehdr {
            e_ident,
            e_type: cur.read_u16::<LE>()?,
            e_machine: cur.read_u16::<LE>()?,
            e_version: cur.read_u32::<LE>()?,
            e_entry: cur.read_u64::<LE>()?,
            e_phoff: cur.read_u64::<LE>()?,
            e_shoff: cur.read_u64::<LE>()?,
            e_flags: cur.read_u32::<LE>()?,
            e_ehsize: cur.read_u16::<LE>()?,
            e_phentsize: cur.read_u16::<LE>()?,
            e_phnum: cur.read_u16::<LE>()?,
            e_shentsize: cur.read_u16::<LE>()?,
            e_shnum: cur.read_u16::<LE>()?,
            e_shstrndx: cur.read_u16::<LE>()?,
        })
    }

    pub fn write_to<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.e_ident)?;
        out.write_u16::<LE>(self.e_type)?;
        out.write_u16::<LE>(self.e_machine)?;
        out.write_u32::<LE>(self.e_version)?;
        out.write_u64::<LE>(self.e_entry)?;
        out.write_u64::<LE>(self.e_phoff)?;
        out.write_u64::<LE>(self.e_shoff)?;
        out.write_u32::<LE>(self.e_flags)?;
        out.write_u16::<LE>(self.e_ehsize)?;
        out.write_u16::<LE>(self.e_phentsize)?;
        out.write_u16::<LE>(self.e_phnum)?;
        out.write_u16::<LE>(self.e_shentsize)?;
        out.write_u16::<LE>(self.e_shnum)?;
        out.write_u16::<LE>(self.e_shstrndx)
    }
}

/// One ELF64 program header entry (`Elf64_Phdr`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Elf64Phdr {
    pub p_type: u32,
    /// `PF_X` (1), `PF_W` (2), `PF_R` (4).
    pub p_flags: u32,
    /// File offset of the segment's first byte.
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    /// Bytes backed by the file.
    pub p_filesz: u64,
    /// Bytes in memory; anything past `p_filesz` is zero-filled.
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64Phdr {
    pub const SIZE: usize = 56;

    pub fn from_reader<R: io::Read>(cur: &mut R) -> io::Result<Elf64Phdr> {
        Ok(Elf64Phdr {
            p_type: cur.read_u32::<LE>()?,
            p_flags: cur.read_u32::<LE>()?,
            p_offset: cur.read_u64::<LE>()?,
            p_vaddr: cur.read_u64::<LE>()?,
            p_paddr: cur.read_u64::<LE>()?,
            p_filesz: cur.read_u64::<LE>()?,
            p_memsz: cur.read_u64::<LE>()?,
            p_align: cur.read_u64::<LE>()?,
        })
    }

    pub fn write_to<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LE>(self.p_type)?;
        out.write_u32::<LE>(self.p_flags)?;
        out.write_u64::<LE>(self.p_offset)?;
        out.write_u64::<LE>(self.p_vaddr)?;
        out.write_u64::<LE>(self.p_paddr)?;
        out.write_u64::<LE>(self.p_filesz)?;
        out.write_u64::<LE>(self.p_memsz)?;
        out.write_u64::<LE>(self.p_align)
    }
}
