//! Descriptor block the packer embeds next to the loader stub.
//!
//! `"+zELF-PR"`, then `version`, `virtual_start` and `packed_data_vaddr` as
//! LE u64. Format version 2 and later append `salt` and `pwd_obfhash`.

use crate::error::FormatError;
use crate::resolver::AddressResolver;
use byteorder::{ByteOrder, LE};

pub const PARAMS_MAGIC: [u8; 8] = *b"+zELF-PR";

pub const FLAG_BCJ: u64 = 1 << 8;
pub const FLAG_KANZI: u64 = 1 << 9;

const VERSION_MASK: u64 = 0xFF;
pub const BASE_LEN: usize = 8 + 3 * 8;
pub const SEALED_LEN: usize = BASE_LEN + 2 * 8;

/// Offset of `packed_data_vaddr` inside an encoded block.
pub const PACKED_DATA_VADDR_OFFSET: usize = 8 + 2 * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordSeal {
    pub salt: u64,
    pub obfhash: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamsBlock {
    pub version: u64,
    pub virtual_start: u64,
    /// 0 when the packer could not patch it (position-independent output).
    pub packed_data_vaddr: u64,
    pub seal: Option<PasswordSeal>,
}

impl ParamsBlock {
    pub fn new(bcj: bool, kanzi: bool, seal: Option<PasswordSeal>) -> Self {
        let mut version = if seal.is_some() { 2 } else { 1 };
        if bcj {
            version |= FLAG_BCJ;
        }
        if kanzi {
            version |= FLAG_KANZI;
        }
        ParamsBlock {
            version,
            virtual_start: 0,
            packed_data_vaddr: 0,
            seal,
        }
    }

    pub fn format_version(&self) -> u64 {
        self.version & VERSION_MASK
    }

    pub fn bcj(&self) -> bool {
        self.version & FLAG_BCJ != 0
    }

    pub fn kanzi(&self) -> bool {
        self.version & FLAG_KANZI != 0
    }

    pub fn encoded_len(&self) -> usize {
        if self.format_version() >= 2 {
            SEALED_LEN
        } else {
            BASE_LEN
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&PARAMS_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.virtual_start.to_le_bytes());
        out.extend_from_slice(&self.packed_data_vaddr.to_le_bytes());
        if self.format_version() >= 2 {
            let seal = self.seal.unwrap_or(PasswordSeal { salt: 0, obfhash: 0 });
            out.extend_from_slice(&seal.salt.to_le_bytes());
            out.extend_from_slice(&seal.obfhash.to_le_bytes());
        }
        out
    }

    /// Parses a block whose magic starts at `offset`.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, FormatError> {
        let truncated = |needed| FormatError::Truncated {
            what: "ParamsBlock",
            offset,
            needed,
            available: bytes.len().saturating_sub(offset),
        };

        let b = bytes
            .get(offset..)
            .filter(|b| b.len() >= BASE_LEN)
            .ok_or_else(|| truncated(BASE_LEN))?;
        if b[..8] != PARAMS_MAGIC {
            return Err(FormatError::InvalidField {
                field: "ParamsBlock magic",
                value: LE::read_u64(&b[..8]) as i64,
            });
        }

        let version = LE::read_u64(&b[8..16]);
        let seal = if version & VERSION_MASK >= 2 {
            if b.len() < SEALED_LEN {
                return Err(truncated(SEALED_LEN));
            }
            Some(PasswordSeal {
                salt: LE::read_u64(&b[32..40]),
                obfhash: LE::read_u64(&b[40..48]),
            })
        } else {
            None
        };

        Ok(ParamsBlock {
            version,
            virtual_start: LE::read_u64(&b[16..24]),
            packed_data_vaddr: LE::read_u64(&b[24..32]),
            seal,
        })
    }
}

/// A ParamsBlock found in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundParams {
    pub offset: usize,
    pub block: ParamsBlock,
}

fn scan_from(bytes: &[u8], start: usize) -> Option<FoundParams> {
    let mut from = start;
    while let Some(rel) = bytes
        .get(from..)?
        .windows(PARAMS_MAGIC.len())
        .position(|w| w == PARAMS_MAGIC)
    {
        let offset = from + rel;
        match ParamsBlock::parse(bytes, offset) {
            Ok(block) => return Some(FoundParams { offset, block }),
            Err(e) => log::debug!("ignoring ParamsBlock candidate at {offset:#x}: {e}"),
        }
        from = offset + 1;
    }
    None
}

/// Looks for a ParamsBlock past the end of the loaded segments first, then
/// anywhere in the file.
pub fn find(bytes: &[u8], resolver: &AddressResolver<'_>) -> Option<FoundParams> {
    let tail_start = usize::try_from(resolver.loaded_file_end()).unwrap_or(usize::MAX);
    if tail_start > 0 && tail_start < bytes.len() {
        if let Some(found) = scan_from(bytes, tail_start) {
            return Some(found);
        }
    }
    scan_from(bytes, 0)
}
