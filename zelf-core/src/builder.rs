//! Output image layout.
//!
//! ```text
//! [Elf64Ehdr][3 x Elf64Phdr][stub][ParamsBlock] | [container]
//!  \_____________ PT_LOAD R+X ________________/    PT_LOAD R
//! ```
//!
//! Both loadable segments keep file offsets packed back to back; the
//! container's segment starts on a fresh page in memory.

use crate::error::{Error, Result};
use crate::filter::Arch;
use crate::header::{Elf64Ehdr, Elf64Phdr};
use crate::params::{ParamsBlock, PACKED_DATA_VADDR_OFFSET};
use crate::resolver::AddressResolver;
use crate::segments::{SegmentFlags, SegmentInfo};
use goblin::elf::header::{ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_GNU_STACK, PT_LOAD};
use std::fmt;

pub const STATIC_BASE: u64 = 0x40_0000;
pub const PAGE_SIZE: u64 = 0x1000;

const PHNUM: u16 = 3;

/// `exit(127)` on x86-64.
const STUB_X86_64: [u8; 12] = [
    0xB8, 0x3C, 0x00, 0x00, 0x00, // mov eax, 60
    0xBF, 0x7F, 0x00, 0x00, 0x00, // mov edi, 127
    0x0F, 0x05, // syscall
];

/// `exit(127)` on AArch64.
const STUB_AARCH64: [u8; 12] = [
    0xA8, 0x0B, 0x80, 0xD2, // mov x8, #93
    0xE0, 0x0F, 0x80, 0xD2, // mov x0, #127
    0x01, 0x00, 0x00, 0xD4, // svc #0
];

/// Stand-in loader used when no real stub is supplied.
pub fn placeholder_stub(arch: Arch) -> &'static [u8] {
    match arch {
        Arch::X86 => &STUB_X86_64,
        Arch::Arm64 => &STUB_AARCH64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// `ET_EXEC` at [`STATIC_BASE`]; the ParamsBlock gets the container's address.
    Static,
    /// `ET_DYN` at 0; the container address stays unpatched.
    PositionIndependent,
}

impl AddressMode {
    pub fn base(self) -> u64 {
        match self {
            AddressMode::Static => STATIC_BASE,
            AddressMode::PositionIndependent => 0,
        }
    }

    pub fn e_type(self) -> u16 {
        match self {
            AddressMode::Static => ET_EXEC,
            AddressMode::PositionIndependent => ET_DYN,
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressMode::Static => f.write_str("static"),
            AddressMode::PositionIndependent => f.write_str("pie"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub params_offset: usize,
    pub container_offset: usize,
    pub packed_data_vaddr: u64,
}

fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

/// Lays out and writes the packed image, then patches `packed_data_vaddr`
/// into the embedded ParamsBlock for static output.
pub fn build(
    e_machine: u16,
    mode: AddressMode,
    stub: &[u8],
    params: ParamsBlock,
    container: &[u8],
) -> Result<BuiltImage> {
    let base = mode.base();
    let headers_len = (Elf64Ehdr::SIZE + usize::from(PHNUM) * Elf64Phdr::SIZE) as u64;
    let stub_off = align_up(headers_len, 16);
    let params_off = align_up(stub_off + stub.len() as u64, 8);

    let mut params = params;
    params.virtual_start = base;
    params.packed_data_vaddr = 0;
    let params_bytes = params.encode();

    let text_end = params_off + params_bytes.len() as u64;
    let container_off = align_up(text_end, 16);
    let packed_vaddr = align_up(base + text_end, PAGE_SIZE) + container_off % PAGE_SIZE;

    let segments = [
        SegmentInfo {
            offset: 0,
            vaddr: base,
            filesz: text_end,
            memsz: text_end,
            align: PAGE_SIZE,
            flags: SegmentFlags::from_bits(PF_R | PF_X),
        },
        SegmentInfo {
            offset: container_off,
            vaddr: packed_vaddr,
            filesz: container.len() as u64,
            memsz: container.len() as u64,
            align: PAGE_SIZE,
            flags: SegmentFlags::from_bits(PF_R),
        },
    ];

    let ehdr = Elf64Ehdr::new(mode.e_type(), e_machine, base + stub_off, PHNUM);
    let mut out = Vec::with_capacity(container_off as usize + container.len());
    ehdr.write_to(&mut out)?;
    for seg in &segments {
        Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: seg.flags.bits(),
            p_offset: seg.offset,
            p_vaddr: seg.vaddr,
            p_paddr: seg.vaddr,
            p_filesz: seg.filesz,
            p_memsz: seg.memsz,
            p_align: seg.align,
        }
        .write_to(&mut out)?;
    }
    Elf64Phdr {
        p_type: PT_GNU_STACK,
        p_flags: PF_R | PF_W,
        p_align: 16,
        ..Elf64Phdr::default()
    }
    .write_to(&mut out)?;

    out.resize(stub_off as usize, 0);
    out.extend_from_slice(stub);
    out.resize(params_off as usize, 0);
    out.extend_from_slice(&params_bytes);
    out.resize(container_off as usize, 0);
    out.extend_from_slice(container);

    let container_offset = container_off as usize;
    let params_offset = params_off as usize;
    let packed_data_vaddr = match mode {
        AddressMode::PositionIndependent => 0,
        AddressMode::Static => {
            let resolver = AddressResolver::new(&segments);
            let vaddr = resolver
                .vaddr_of(container_off)
                .ok_or(crate::error::ResolutionError { vaddr: packed_vaddr })?;
            if resolver.resolve(vaddr)? != container_off {
                return Err(Error::Resolution(crate::error::ResolutionError { vaddr }));
            }
            let at = params_offset + PACKED_DATA_VADDR_OFFSET;
            out[at..at + 8].copy_from_slice(&vaddr.to_le_bytes());
            vaddr
        }
    };

    log::debug!(
        "built {mode} image: {} bytes, stub {} bytes, container at {container_offset:#x} (vaddr {packed_data_vaddr:#x})",
        out.len(),
        stub.len()
    );

    Ok(BuiltImage {
        bytes: out,
        params_offset,
        container_offset,
        packed_data_vaddr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamsBlock;
    use goblin::elf::header::EM_X86_64;

    #[test]
    fn static_image_parses_and_points_at_the_container() {
        let container = b"zELFl4 pretend container bytes".to_vec();
        let built = build(
            EM_X86_64,
            AddressMode::Static,
            placeholder_stub(Arch::X86),
            ParamsBlock::new(false, false, None),
            &container,
        )
        .unwrap();

        let elf = goblin::elf::Elf::parse(&built.bytes).unwrap();
        assert_eq!(elf.header.e_type, ET_EXEC);
        assert_eq!(elf.entry, STATIC_BASE + 240);
        assert_eq!(elf.program_headers.len(), 3);

        let segs = SegmentInfo::from_goblin_ph(&elf);
        let resolved = AddressResolver::new(&segs)
            .resolve(built.packed_data_vaddr)
            .unwrap();
        assert_eq!(resolved as usize, built.container_offset);
        assert_eq!(&built.bytes[built.container_offset..], &container[..]);

        let params = ParamsBlock::parse(&built.bytes, built.params_offset).unwrap();
        assert_eq!(params.packed_data_vaddr, built.packed_data_vaddr);
        assert_eq!(params.virtual_start, STATIC_BASE);
        assert_eq!(built.packed_data_vaddr % PAGE_SIZE, built.container_offset as u64 % PAGE_SIZE);
    }

    #[test]
    fn pie_image_leaves_address_unpatched() {
        let built = build(
            183,
            AddressMode::PositionIndependent,
            placeholder_stub(Arch::Arm64),
            ParamsBlock::new(true, false, None),
            b"zELFbz....",
        )
        .unwrap();
        let elf = goblin::elf::Elf::parse(&built.bytes).unwrap();
        assert_eq!(elf.header.e_type, ET_DYN);
        assert_eq!(built.packed_data_vaddr, 0);
        let params = ParamsBlock::parse(&built.bytes, built.params_offset).unwrap();
        assert_eq!(params.packed_data_vaddr, 0);
        assert!(params.bcj());
    }

    #[test]
    fn stubs_are_twelve_bytes() {
        assert_eq!(placeholder_stub(Arch::X86)[..2], [0xB8, 0x3C]);
        assert_eq!(placeholder_stub(Arch::Arm64).len(), 12);
    }
}
