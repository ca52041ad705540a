//! Super-strip: drop every byte no program header refers to.
//!
//! The file is cut after the last byte covered by the ELF header, the
//! program header table or any non-null segment. Trailing zeros are then
//! trimmed, since the loader zero-fills past `p_filesz` anyway. Section
//! headers past the cut are forgotten and segment file ranges are clamped.

use crate::binary::ElfImage;
use crate::error::{FormatError, Result};
use crate::header::{Elf64Ehdr, Elf64Phdr};
use goblin::elf::program_header::PT_NULL;
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripStats {
    pub before: usize,
    pub after: usize,
}

impl StripStats {
    pub fn saved(&self) -> usize {
        self.before - self.after
    }
}

fn read_phdrs(bytes: &[u8], ehdr: &Elf64Ehdr) -> Result<Vec<Elf64Phdr>> {
    if ehdr.e_phnum > 0 && usize::from(ehdr.e_phentsize) != Elf64Phdr::SIZE {
        return Err(FormatError::InvalidField {
            field: "e_phentsize",
            value: ehdr.e_phentsize.into(),
        }
        .into());
    }
    let start = usize::try_from(ehdr.e_phoff).unwrap_or(usize::MAX);
    let table = usize::from(ehdr.e_phnum) * Elf64Phdr::SIZE;
    let raw = start
        .checked_add(table)
        .and_then(|end| bytes.get(start..end))
        .ok_or(FormatError::Truncated {
            what: "program header table",
            offset: start,
            needed: table,
            available: bytes.len().saturating_sub(start),
        })?;

    let mut cur = Cursor::new(raw);
    (0..ehdr.e_phnum)
        .map(|_| Ok(Elf64Phdr::from_reader(&mut cur)?))
        .collect()
}

/// Returns a slimmed copy of `image` together with the size change.
pub fn super_strip(image: &ElfImage) -> Result<(ElfImage, StripStats)> {
    let bytes = &image.bytes;
    let mut ehdr = image.header;
    let mut phdrs = read_phdrs(bytes, &ehdr)?;

    let ph_end = ehdr.e_phoff as usize + phdrs.len() * Elf64Phdr::SIZE;
    let header_end = usize::from(ehdr.e_ehsize).max(ph_end).max(Elf64Ehdr::SIZE);

    let mut keep = header_end;
    for ph in phdrs.iter().filter(|ph| ph.p_type != PT_NULL) {
        let end = ph.p_offset.saturating_add(ph.p_filesz);
        keep = keep.max(usize::try_from(end).unwrap_or(usize::MAX));
    }
    keep = keep.min(bytes.len());

    let trimmed = bytes[..keep]
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    let new_len = trimmed.max(header_end).min(keep);

    if ehdr.e_shoff as usize >= new_len {
        ehdr.e_shoff = 0;
        ehdr.e_shnum = 0;
        ehdr.e_shstrndx = 0;
    }
    let limit = new_len as u64;
    for ph in &mut phdrs {
        if ph.p_offset >= limit {
            ph.p_offset = limit;
            ph.p_filesz = 0;
        } else if ph.p_offset.saturating_add(ph.p_filesz) > limit {
            ph.p_filesz = limit - ph.p_offset;
        }
    }

    let mut slim = bytes[..new_len].to_vec();
    let mut headers = Vec::with_capacity(Elf64Ehdr::SIZE);
    ehdr.write_to(&mut headers)?;
    slim[..Elf64Ehdr::SIZE].copy_from_slice(&headers);

    let mut table = Vec::with_capacity(phdrs.len() * Elf64Phdr::SIZE);
    for ph in &phdrs {
        ph.write_to(&mut table)?;
    }
    let phoff = ehdr.e_phoff as usize;
    slim[phoff..phoff + table.len()].copy_from_slice(&table);

    let stats = StripStats {
        before: bytes.len(),
        after: slim.len(),
    };
    log::info!(
        "super-strip: {} -> {} bytes (saved {})",
        stats.before,
        stats.after,
        stats.saved()
    );

    let mut stripped = ElfImage::parse(slim)?;
    stripped.path = image.path.clone();
    Ok((stripped, stats))
}
