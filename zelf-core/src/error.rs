use std::path::PathBuf;

use thiserror::Error;

const GIB: f64 = (1u64 << 30) as f64;

fn gib(bytes: &u64) -> f64 {
    *bytes as f64 / GIB
}

fn shortfall(needed: &u64, available: &u64) -> f64 {
    gib(&needed.saturating_sub(*available))
}

/// Malformed or missing container/descriptor bytes. Never retried.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("not an ELF64 little-endian image: {0}")]
    NotElf(String),
    #[error("bad container marker {0:02x?} at offset {1:#x}")]
    BadMarker([u8; 6], usize),
    #[error("unknown codec suffix {0:?}")]
    UnknownCodec(String),
    #[error("truncated {what}: need {needed} bytes at offset {offset:#x}, file has {available}")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },
    #[error("no packed container found (no ParamsBlock and no zELF marker)")]
    NotFound,
    #[error("CRC32 mismatch: archive records {expected:#010x}, data hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// A virtual address that no `PT_LOAD` entry maps.
#[derive(Debug, Error)]
#[error("virtual address {vaddr:#x} is not mapped by any PT_LOAD segment")]
pub struct ResolutionError {
    pub vaddr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    AvailableRam,
    AddressSpace,
}

impl std::fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceLimit::AvailableRam => f.write_str("available RAM"),
            ResourceLimit::AddressSpace => f.write_str("RLIMIT_AS"),
        }
    }
}

/// Admission control refused to start a codec.
#[derive(Debug, Error)]
#[error(
    "{codec} needs ~{:.2} GiB but {limit} is {:.2} GiB (short by {:.2} GiB)",
    gib(.needed),
    gib(.available),
    shortfall(.needed, .available)
)]
pub struct ResourceError {
    pub codec: &'static str,
    pub limit: ResourceLimit,
    pub needed: u64,
    pub available: u64,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec}: output buffer too small ({capacity} bytes)")]
    OutputTooSmall { codec: &'static str, capacity: usize },
    #[error("{codec}: compression failed: {reason}")]
    Compress { codec: &'static str, reason: String },
    #[error("{codec}: decompression failed: {reason}")]
    Decompress { codec: &'static str, reason: String },
    #[error("{codec}: gave up after {attempts} output buffer attempts")]
    RetriesExhausted { codec: &'static str, attempts: usize },
    #[error("{codec}: produced {actual} bytes, container declares {expected}")]
    SizeMismatch {
        codec: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{0} backend is not available in this build")]
    Unavailable(&'static str),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("{filter}: malformed sub-header")]
    MalformedHeader { filter: &'static str },
    #[error("{filter}: stream truncated at offset {offset}")]
    Truncated { filter: &'static str, offset: usize },
    #[error("{filter}: produced {actual} bytes, expected {expected}")]
    LengthMismatch {
        filter: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("admission control: {0}")]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packing did not reduce size ({packed} >= {original} bytes)")]
    NoGain { original: usize, packed: usize },
    #[error("password does not match the artifact's seal")]
    PasswordMismatch,
}

impl Error {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
