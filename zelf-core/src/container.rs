//! Packed container: `"zELF"` + codec suffix, sizes, payload.
//!
//! All integers are little-endian.
//!
//! ```text
//! 0   marker[6]      "zELF" + suffix
//! 6   orig_size      u64
//! 14  entry_offset   u64
//! 22  comp_size      i32
//! 26  filtered_size  i32   Modern layout only
//! 26|30 payload[comp_size]
//! ```

use crate::codec::CodecKind;
use crate::error::FormatError;
use byteorder::{ByteOrder, WriteBytesExt, LE};
use std::fmt;
use std::io::{self, Write};
use std::ops::Range;

pub const MARKER_PREFIX: [u8; 4] = *b"zELF";
pub const MARKER_LEN: usize = 6;
pub const LEGACY_HEADER_LEN: usize = 26;
pub const MODERN_HEADER_LEN: usize = 30;

/// Largest `filtered_size` the layout heuristic accepts as genuine.
pub const FILTERED_SIZE_CAP: i32 = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// No `filtered_size`; used with BCJ and always for Zstd.
    Legacy,
    Modern,
}

impl LayoutKind {
    pub fn header_len(self) -> usize {
        match self {
            LayoutKind::Legacy => LEGACY_HEADER_LEN,
            LayoutKind::Modern => MODERN_HEADER_LEN,
        }
    }

    /// Layout a packer writes for `codec` after applying (or not) BCJ.
    pub fn for_pack(codec: CodecKind, bcj: bool) -> Self {
        if bcj || codec.forces_legacy_layout() {
            LayoutKind::Legacy
        } else {
            LayoutKind::Modern
        }
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutKind::Legacy => f.write_str("Legacy"),
            LayoutKind::Modern => f.write_str("Modern"),
        }
    }
}

/// Which rule settled the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutSource {
    /// The ParamsBlock's BCJ flag.
    ParamsFlag,
    /// The codec always uses one layout.
    CodecRule,
    /// The bytes after `comp_size` were judged without a ParamsBlock.
    Heuristic,
}

impl fmt::Display for LayoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutSource::ParamsFlag => f.write_str("ParamsBlock flag"),
            LayoutSource::CodecRule => f.write_str("codec rule"),
            LayoutSource::Heuristic => f.write_str("heuristic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDecision {
    pub layout: LayoutKind,
    pub bcj: bool,
    pub source: LayoutSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub codec: CodecKind,
    pub orig_size: u64,
    pub entry_offset: u64,
    pub comp_size: i32,
    pub filtered_size: Option<i32>,
}

impl ContainerHeader {
    /// Header for `payload_len` compressed bytes. `filtered_size` selects the
    /// Modern layout.
    pub fn new(
        codec: CodecKind,
        orig_size: u64,
        entry_offset: u64,
        payload_len: usize,
        filtered_size: Option<usize>,
    ) -> Result<Self, FormatError> {
        let comp_size = i32::try_from(payload_len).map_err(|_| FormatError::InvalidField {
            field: "comp_size",
            value: payload_len as i64,
        })?;
        let filtered_size = filtered_size
            .map(|fs| {
                i32::try_from(fs).map_err(|_| FormatError::InvalidField {
                    field: "filtered_size",
                    value: fs as i64,
                })
            })
            .transpose()?;

        Ok(ContainerHeader {
            codec,
            orig_size,
            entry_offset,
            comp_size,
            filtered_size,
        })
    }

    pub fn marker(&self) -> [u8; MARKER_LEN] {
        let suffix = self.codec.suffix();
        let mut m = [0u8; MARKER_LEN];
        m[..4].copy_from_slice(&MARKER_PREFIX);
        m[4..].copy_from_slice(&suffix);
        m
    }

    pub fn layout(&self) -> LayoutKind {
        if self.filtered_size.is_some() {
            LayoutKind::Modern
        } else {
            LayoutKind::Legacy
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.marker())?;
        out.write_u64::<LE>(self.orig_size)?;
        out.write_u64::<LE>(self.entry_offset)?;
        out.write_i32::<LE>(self.comp_size)?;
        if let Some(fs) = self.filtered_size {
            out.write_i32::<LE>(fs)?;
        }
        Ok(())
    }

    /// Header followed by `payload`.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout().header_len() + payload.len());
        out.extend_from_slice(&self.marker());
        out.extend_from_slice(&self.orig_size.to_le_bytes());
        out.extend_from_slice(&self.entry_offset.to_le_bytes());
        out.extend_from_slice(&self.comp_size.to_le_bytes());
        if let Some(fs) = self.filtered_size {
            out.extend_from_slice(&fs.to_le_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    /// Reads the fields shared by both layouts; `filtered_size` stays `None`.
    pub fn read_fixed(bytes: &[u8], offset: usize) -> Result<Self, FormatError> {
        let h = bytes
            .get(offset..)
            .and_then(|rest| rest.get(..LEGACY_HEADER_LEN))
            .ok_or(FormatError::Truncated {
                what: "container header",
                offset,
                needed: LEGACY_HEADER_LEN,
                available: bytes.len().saturating_sub(offset),
            })?;

        if h[..4] != MARKER_PREFIX {
            let mut m = [0u8; MARKER_LEN];
            m.copy_from_slice(&h[..MARKER_LEN]);
            return Err(FormatError::BadMarker(m, offset));
        }
        let codec = CodecKind::from_suffix(&h[4..6])
            .ok_or_else(|| FormatError::UnknownCodec(String::from_utf8_lossy(&h[4..6]).into()))?;

        Ok(ContainerHeader {
            codec,
            orig_size: LE::read_u64(&h[6..14]),
            entry_offset: LE::read_u64(&h[14..22]),
            comp_size: LE::read_i32(&h[22..26]),
            filtered_size: None,
        })
    }
}

/// True when `candidate` reads like a genuine `filtered_size` for a binary of
/// `orig_size` bytes: positive, under [`FILTERED_SIZE_CAP`] and within a
/// factor of two of `orig_size`.
pub fn is_plausible_filtered_size(candidate: i32, orig_size: u64) -> bool {
    if candidate <= 0 || candidate >= FILTERED_SIZE_CAP {
        return false;
    }
    let fs = candidate as u64;
    fs >= orig_size / 2 && fs <= orig_size.saturating_mul(2)
}

/// Picks the layout of the container at `offset`.
///
/// `params_bcj` is the ParamsBlock's BCJ flag when a block was found. Without
/// one, Zstd is Legacy with no filter and any other codec goes through
/// [`is_plausible_filtered_size`] on the four bytes after `comp_size`: a
/// plausible value means Modern without BCJ, anything else means those bytes
/// are payload and the container is Legacy with BCJ. The heuristic can be
/// fooled by a payload that happens to start with a plausible size.
pub fn disambiguate_layout(
    header: &ContainerHeader,
    bytes: &[u8],
    offset: usize,
    params_bcj: Option<bool>,
) -> LayoutDecision {
    let codec = header.codec;
    let decision = match params_bcj {
        Some(_) if codec.forces_legacy_layout() => LayoutDecision {
            layout: LayoutKind::Legacy,
            bcj: params_bcj == Some(true),
            source: LayoutSource::CodecRule,
        },
        Some(bcj) => LayoutDecision {
            layout: LayoutKind::for_pack(codec, bcj),
            bcj,
            source: LayoutSource::ParamsFlag,
        },
        None if codec.forces_legacy_layout() => LayoutDecision {
            layout: LayoutKind::Legacy,
            bcj: false,
            source: LayoutSource::CodecRule,
        },
        None => {
            let at = offset.saturating_add(LEGACY_HEADER_LEN);
            let candidate = bytes.get(at..at.saturating_add(4)).map(LE::read_i32);
            let modern = candidate.is_some_and(|fs| is_plausible_filtered_size(fs, header.orig_size));
            LayoutDecision {
                layout: if modern {
                    LayoutKind::Modern
                } else {
                    LayoutKind::Legacy
                },
                bcj: !modern,
                source: LayoutSource::Heuristic,
            }
        }
    };

    match decision.source {
        LayoutSource::Heuristic => log::warn!(
            "no ParamsBlock: layout guessed as {} (bcj {})",
            decision.layout,
            decision.bcj
        ),
        source => log::info!("layout {} from {source} (bcj {})", decision.layout, decision.bcj),
    }
    decision
}

/// A parsed container located inside a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub offset: usize,
    pub header: ContainerHeader,
    pub payload: Range<usize>,
}

impl Container {
    pub fn parse(bytes: &[u8], offset: usize, layout: LayoutKind) -> Result<Self, FormatError> {
        let mut header = ContainerHeader::read_fixed(bytes, offset)?;

        if header.orig_size == 0 {
            return Err(FormatError::InvalidField {
                field: "orig_size",
                value: 0,
            });
        }
        if header.comp_size <= 0 {
            return Err(FormatError::InvalidField {
                field: "comp_size",
                value: header.comp_size.into(),
            });
        }

        if layout == LayoutKind::Modern {
            let at = offset + LEGACY_HEADER_LEN;
            let raw = bytes.get(at..at + 4).ok_or(FormatError::Truncated {
                what: "filtered_size",
                offset: at,
                needed: 4,
                available: bytes.len().saturating_sub(at),
            })?;
            let fs = LE::read_i32(raw);
            if fs <= 0 {
                return Err(FormatError::InvalidField {
                    field: "filtered_size",
                    value: fs.into(),
                });
            }
            header.filtered_size = Some(fs);
        }

        let start = offset + layout.header_len();
        let len = header.comp_size as usize;
        if bytes.len() < start || bytes.len() - start < len {
            return Err(FormatError::Truncated {
                what: "payload",
                offset: start,
                needed: len,
                available: bytes.len().saturating_sub(start),
            });
        }

        Ok(Container {
            offset,
            header,
            payload: start..start + len,
        })
    }

    pub fn payload<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.payload.clone()]
    }

    pub fn layout(&self) -> LayoutKind {
        self.header.layout()
    }

    pub fn end(&self) -> usize {
        self.payload.end
    }
}
