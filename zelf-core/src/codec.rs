//! Codec registry: marker suffixes, display names and backend dispatch.
//!
//! Every backend the container format knows about is a [`CodecKind`]. Only a
//! subset has a compressor linked into this build; the others still parse,
//! report and admit, and fail with [`CodecError::Unavailable`] when asked to
//! transform bytes.

pub mod brieflz;
mod lz4;
mod lzma;
mod snappy;
mod zstd;

use crate::error::CodecError;
use std::fmt;
use std::str::FromStr;

/// Attempts of the output-buffer grow-and-retry loop before giving up.
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Lz4,
    Apultra,
    Zx7b,
    Zx0,
    BriefLz,
    Exomizer,
    PowerPacker,
    Snappy,
    Doboz,
    QuickLz,
    Lzav,
    Lzma,
    Shrinkler,
    StoneCracker,
    Lzsa2,
    Zstd,
    Density,
    Lzham,
    Rnc,
    Lzfse,
    Csc,
    Nz1,
}

impl CodecKind {
    pub const ALL: [CodecKind; 22] = [
        CodecKind::Lz4,
        CodecKind::Apultra,
        CodecKind::Zx7b,
        CodecKind::Zx0,
        CodecKind::BriefLz,
        CodecKind::Exomizer,
        CodecKind::PowerPacker,
        CodecKind::Snappy,
        CodecKind::Doboz,
        CodecKind::QuickLz,
        CodecKind::Lzav,
        CodecKind::Lzma,
        CodecKind::Shrinkler,
        CodecKind::StoneCracker,
        CodecKind::Lzsa2,
        CodecKind::Zstd,
        CodecKind::Density,
        CodecKind::Lzham,
        CodecKind::Rnc,
        CodecKind::Lzfse,
        CodecKind::Csc,
        CodecKind::Nz1,
    ];

    /// Suffixes the marker scan accepts. The last six kinds are only reachable
    /// through a ParamsBlock.
    pub const SCAN_ALLOW_LIST: [CodecKind; 16] = [
        CodecKind::Lz4,
        CodecKind::Apultra,
        CodecKind::Zx7b,
        CodecKind::Zx0,
        CodecKind::BriefLz,
        CodecKind::Exomizer,
        CodecKind::PowerPacker,
        CodecKind::Snappy,
        CodecKind::Doboz,
        CodecKind::QuickLz,
        CodecKind::Lzav,
        CodecKind::Lzma,
        CodecKind::Shrinkler,
        CodecKind::StoneCracker,
        CodecKind::Lzsa2,
        CodecKind::Zstd,
    ];

    pub fn suffix(self) -> [u8; 2] {
        *match self {
            CodecKind::Lz4 => b"l4",
            CodecKind::Apultra => b"ap",
            CodecKind::Zx7b => b"zx",
            CodecKind::Zx0 => b"z0",
            CodecKind::BriefLz => b"bz",
            CodecKind::Exomizer => b"ex",
            CodecKind::PowerPacker => b"pp",
            CodecKind::Snappy => b"sn",
            CodecKind::Doboz => b"dz",
            CodecKind::QuickLz => b"qz",
            CodecKind::Lzav => b"lv",
            CodecKind::Lzma => b"la",
            CodecKind::Shrinkler => b"sh",
            CodecKind::StoneCracker => b"sc",
            CodecKind::Lzsa2 => b"ls",
            CodecKind::Zstd => b"zd",
            CodecKind::Density => b"de",
            CodecKind::Lzham => b"lz",
            CodecKind::Rnc => b"rn",
            CodecKind::Lzfse => b"se",
            CodecKind::Csc => b"cs",
            CodecKind::Nz1 => b"nz",
        }
    }

    pub fn from_suffix(suffix: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.suffix() == suffix)
    }

    pub fn is_scan_visible(self) -> bool {
        Self::SCAN_ALLOW_LIST.contains(&self)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            CodecKind::Lz4 => "LZ4",
            CodecKind::Apultra => "Apultra",
            CodecKind::Zx7b => "ZX7B",
            CodecKind::Zx0 => "ZX0",
            CodecKind::BriefLz => "BriefLZ",
            CodecKind::Exomizer => "Exomizer",
            CodecKind::PowerPacker => "PowerPacker",
            CodecKind::Snappy => "Snappy",
            CodecKind::Doboz => "Doboz",
            CodecKind::QuickLz => "QuickLZ",
            CodecKind::Lzav => "LZAV",
            CodecKind::Lzma => "LZMA",
            CodecKind::Shrinkler => "Shrinkler",
            CodecKind::StoneCracker => "StoneCracker",
            CodecKind::Lzsa2 => "LZSA2",
            CodecKind::Zstd => "Zstd",
            CodecKind::Density => "Density",
            CodecKind::Lzham => "LZHAM",
            CodecKind::Rnc => "RNC",
            CodecKind::Lzfse => "LZFSE",
            CodecKind::Csc => "CSC",
            CodecKind::Nz1 => "NZ1",
        }
    }

    /// Codecs whose containers never carry `filtered_size`.
    pub fn forces_legacy_layout(self) -> bool {
        matches!(self, CodecKind::Zstd)
    }

    /// Linked backend for this kind.
    pub fn backend(self) -> Result<&'static dyn Codec, CodecError> {
        match self {
            CodecKind::Lz4 => Ok(&lz4::Lz4),
            CodecKind::BriefLz => Ok(&brieflz::BriefLz),
            CodecKind::Snappy => Ok(&snappy::Snappy),
            CodecKind::Lzma => Ok(&lzma::Lzma),
            CodecKind::Zstd => Ok(&zstd::Zstd),
            CodecKind::Apultra
            | CodecKind::Zx7b
            | CodecKind::Zx0
            | CodecKind::Exomizer
            | CodecKind::PowerPacker
            | CodecKind::Doboz
            | CodecKind::QuickLz
            | CodecKind::Lzav
            | CodecKind::Shrinkler
            | CodecKind::StoneCracker
            | CodecKind::Lzsa2
            | CodecKind::Density
            | CodecKind::Lzham
            | CodecKind::Rnc
            | CodecKind::Lzfse
            | CodecKind::Csc
            | CodecKind::Nz1 => Err(CodecError::Unavailable(self.display_name())),
        }
    }

    pub fn is_available(self) -> bool {
        self.backend().is_ok()
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for CodecKind {
    type Err = String;

    /// Accepts the marker suffix (`l4`) or the display name (`lz4`), any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        CodecKind::ALL
            .into_iter()
            .find(|k| {
                k.suffix() == wanted.as_bytes() || k.display_name().to_ascii_lowercase() == wanted
            })
            .ok_or_else(|| format!("unknown codec {s:?}"))
    }
}

/// Uniform contract every compression backend is driven through.
pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;

    /// Worst-case compressed size for `input_len` bytes.
    fn max_output_size(&self, input_len: usize) -> usize;

    /// Compresses into `output`; returns the bytes written or
    /// [`CodecError::OutputTooSmall`].
    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError>;

    /// Decompresses into `output`, whose length is the capacity.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError>;

    /// Compresses with a bounded grow-and-retry loop on the output buffer.
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let name = self.kind().display_name();
        let mut capacity = self.max_output_size(input.len()).max(64);

        for attempt in 1..=MAX_ATTEMPTS {
            let mut out = vec![0u8; capacity];
            match self.compress_into(input, &mut out) {
                Ok(written) => {
                    out.truncate(written);
                    return Ok(out);
                }
                Err(CodecError::OutputTooSmall { .. }) => {
                    log::debug!("{name}: {capacity} byte buffer too small (attempt {attempt})");
                    capacity = capacity.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }

        Err(CodecError::RetriesExhausted {
            codec: name,
            attempts: MAX_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_bijective() {
        for kind in CodecKind::ALL {
            assert_eq!(CodecKind::from_suffix(&kind.suffix()), Some(kind));
        }
        let mut suffixes: Vec<_> = CodecKind::ALL.iter().map(|k| k.suffix()).collect();
        suffixes.sort();
        suffixes.dedup();
        assert_eq!(suffixes.len(), CodecKind::ALL.len());
    }

    #[test]
    fn scan_allow_list_excludes_structured_only_codecs() {
        assert!(CodecKind::Zstd.is_scan_visible());
        assert!(CodecKind::Lz4.is_scan_visible());
        for kind in [
            CodecKind::Density,
            CodecKind::Lzham,
            CodecKind::Rnc,
            CodecKind::Lzfse,
            CodecKind::Csc,
            CodecKind::Nz1,
        ] {
            assert!(!kind.is_scan_visible(), "{kind}");
        }
    }

    #[test]
    fn parses_suffix_and_name() {
        assert_eq!("l4".parse::<CodecKind>().unwrap(), CodecKind::Lz4);
        assert_eq!("BriefLZ".parse::<CodecKind>().unwrap(), CodecKind::BriefLz);
        assert_eq!("zd".parse::<CodecKind>().unwrap(), CodecKind::Zstd);
        assert!("gzip".parse::<CodecKind>().is_err());
    }

    #[test]
    fn linked_backends_round_trip() {
        let text = b"push rbp; mov rbp, rsp; call helper; pop rbp; ret\n".repeat(200);
        let mut mixed: Vec<u8> = (0..20_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        mixed.extend_from_slice(&text);
        let inputs: [&[u8]; 5] = [&[], b"x", &text, &mixed, &[0u8; 65536]];

        for kind in CodecKind::ALL.into_iter().filter(|k| k.is_available()) {
            let backend = kind.backend().unwrap();
            assert_eq!(backend.kind(), kind);
            for input in inputs {
                let packed = backend.compress(input).unwrap();
                let mut out = vec![0u8; input.len()];
                let n = backend.decompress(&packed, &mut out).unwrap();
                assert_eq!(&out[..n], input, "{kind} on {} bytes", input.len());
            }
        }
    }

    #[test]
    fn unavailable_backends_name_themselves() {
        match CodecKind::Shrinkler.backend() {
            Err(CodecError::Unavailable(name)) => assert_eq!(name, "Shrinkler"),
            _ => panic!("Shrinkler should not be linked"),
        }
    }

    /// A backend that always claims the buffer is too small.
    struct Greedy;

    impl Codec for Greedy {
        fn kind(&self) -> CodecKind {
            CodecKind::Apultra
        }
        fn max_output_size(&self, input_len: usize) -> usize {
            input_len
        }
        fn compress_into(&self, _: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
            Err(CodecError::OutputTooSmall {
                codec: "Apultra",
                capacity: output.len(),
            })
        }
        fn decompress(&self, _: &[u8], _: &mut [u8]) -> Result<usize, CodecError> {
            unreachable!()
        }
    }

    #[test]
    fn retry_loop_is_bounded() {
        match Greedy.compress(&[0u8; 10]) {
            Err(CodecError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, MAX_ATTEMPTS),
            other => panic!("unexpected {other:?}"),
        }
    }
}
