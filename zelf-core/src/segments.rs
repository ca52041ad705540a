use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags {
    pub x: bool,
    pub r: bool,
    pub w: bool,
}

impl SegmentFlags {
    pub fn from_bits(p_flags: u32) -> Self {
        SegmentFlags {
            x: p_flags & PF_X != 0,
            r: p_flags & PF_R != 0,
            w: p_flags & PF_W != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.x {
            bits |= PF_X;
        }
        if self.w {
            bits |= PF_W;
        }
        if self.r {
            bits |= PF_R;
        }
        bits
    }

    /// Executable, read-only or writable, as used when grouping segment bytes.
    pub fn class(&self) -> SegmentClass {
        if self.x {
            SegmentClass::Text
        } else if self.r && !self.w {
            SegmentClass::ReadOnly
        } else if self.w {
            SegmentClass::Data
        } else {
            SegmentClass::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    Text,
    ReadOnly,
    Data,
    Other,
}

/// Read-only projection of one `PT_LOAD` program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
    pub flags: SegmentFlags,
}

impl SegmentInfo {
    pub fn from_goblin_ph(elf: &Elf) -> Vec<Self> {
        elf.program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| SegmentInfo {
                offset: ph.p_offset,
                vaddr: ph.p_vaddr,
                filesz: ph.p_filesz,
                memsz: ph.p_memsz,
                align: ph.p_align,
                flags: SegmentFlags::from_bits(ph.p_flags),
            })
            .collect()
    }

    /// End of the file-backed range, saturating on hostile headers.
    pub fn file_end(&self) -> u64 {
        self.offset.saturating_add(self.filesz)
    }

    pub fn contains_vaddr(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr - self.vaddr < self.filesz
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset - self.offset < self.filesz
    }

    /// The segment's file bytes, or `None` when the header points outside `image`.
    pub fn bytes<'a>(&self, image: &'a [u8]) -> Option<&'a [u8]> {
        let start = usize::try_from(self.offset).ok()?;
        let len = usize::try_from(self.filesz).ok()?;
        image.get(start..start.checked_add(len)?)
    }
}
