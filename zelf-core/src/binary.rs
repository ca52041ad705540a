use crate::error::{Error, FormatError, Result};
use crate::header::Elf64Ehdr;
use crate::segments::SegmentInfo;
use goblin::elf::program_header::{PF_X, PT_INTERP, PT_LOAD};
use goblin::elf::section_header::{SHF_EXECINSTR, SHT_PROGBITS};
use goblin::elf::Elf;
use goblin::Object;
use std::io::Cursor;
use std::ops::Range;
use std::path::Path;

/// Sections smaller than this are not worth treating as code.
const MIN_CODE_SECTION: u64 = 16;

/// An ELF64 little-endian image held in memory together with the parts of its
/// headers the packer cares about.
#[derive(Debug, Clone)]
pub struct ElfImage {
    pub path: Option<String>,
    pub bytes: Vec<u8>,
    pub header: Elf64Ehdr,
    pub segments: Vec<SegmentInfo>,
    pub has_interp: bool,
    /// File range holding machine code, if one could be identified.
    pub code_range: Option<Range<usize>>,
}

impl ElfImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(&path).map_err(|e| Error::file(path.as_ref(), e))?;
        let mut image = Self::parse(bytes)?;
        image.path = Some(path.as_ref().display().to_string());
        Ok(image)
    }

    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let elf = match Object::parse(&bytes) {
            Ok(Object::Elf(elf)) => elf,
            Ok(_) => return Err(FormatError::NotElf("not an ELF object".into()).into()),
            Err(e) => return Err(FormatError::NotElf(e.to_string()).into()),
        };
        if !elf.is_64 || !elf.little_endian {
            return Err(FormatError::NotElf("only ELF64 little-endian is supported".into()).into());
        }

        let header = Elf64Ehdr::from_reader(&mut Cursor::new(&bytes))?;
        let segments = SegmentInfo::from_goblin_ph(&elf);
        let has_interp = elf.program_headers.iter().any(|ph| ph.p_type == PT_INTERP);
        let code_range = code_range(&elf, bytes.len());

        match &code_range {
            Some(r) => log::debug!("code range {:#x}..{:#x}", r.start, r.end),
            None => log::debug!("no code range identified"),
        }

        Ok(ElfImage {
            path: None,
            bytes,
            header,
            segments,
            has_interp,
            code_range,
        })
    }

    pub fn machine(&self) -> u16 {
        self.header.e_machine
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// `.text` first, then every executable PROGBITS section, then every `PF_X`
/// `PT_LOAD` segment.
fn code_range(elf: &Elf, len: usize) -> Option<Range<usize>> {
    let clamp = |start: u64, end: u64| -> Option<Range<usize>> {
        let start = usize::try_from(start).ok()?.min(len);
        let end = usize::try_from(end).ok()?.min(len);
        (end > start).then_some(start..end)
    };

    let progbits = || {
        elf.section_headers
            .iter()
            .filter(|sh| sh.sh_type == SHT_PROGBITS && sh.sh_size >= MIN_CODE_SECTION)
    };

    if let Some(text) = progbits().find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(".text")) {
        return clamp(text.sh_offset, text.sh_offset.saturating_add(text.sh_size));
    }

    let union = |ranges: &mut dyn Iterator<Item = (u64, u64)>| {
        ranges.fold(None, |acc: Option<(u64, u64)>, (s, e)| match acc {
            None => Some((s, e)),
            Some((lo, hi)) => Some((lo.min(s), hi.max(e))),
        })
    };

    let exec_sections = union(
        &mut progbits()
            .filter(|sh| sh.sh_flags & SHF_EXECINSTR as u64 != 0)
            .map(|sh| (sh.sh_offset, sh.sh_offset.saturating_add(sh.sh_size))),
    );
    if let Some((s, e)) = exec_sections {
        return clamp(s, e);
    }

    let exec_segments = union(
        &mut elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
            .map(|ph| (ph.p_offset, ph.p_offset.saturating_add(ph.p_filesz))),
    );
    exec_segments.and_then(|(s, e)| clamp(s, e))
}
