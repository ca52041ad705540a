//! Filter registry.
//!
//! Filters rewrite machine code so it compresses better. `forward` may refuse
//! (returns `None`) and the caller then packs unfiltered; `inverse` is always
//! expected to succeed on what `forward` produced.

pub mod bcj;
pub mod kanzi;

use crate::error::FilterError;
use crate::header::sniff_machine;
use goblin::elf::header::{EM_386, EM_AARCH64, EM_X86_64};
use std::fmt;
use std::ops::Range;

/// BCJ output that stops further than this short of the end gets a warning.
const BCJ_TAIL_SLACK: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    Arm64,
}

impl Arch {
    pub fn from_machine(e_machine: u16) -> Option<Self> {
        match e_machine {
            EM_X86_64 | EM_386 => Some(Arch::X86),
            EM_AARCH64 => Some(Arch::Arm64),
            _ => None,
        }
    }

    /// Architecture of a buffer that starts with an ELF header.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        sniff_machine(bytes).and_then(Self::from_machine)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86 => f.write_str("x86"),
            Arch::Arm64 => f.write_str("arm64"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    None,
    Bcj,
    Kanzi,
}

impl FilterKind {
    pub fn backend(self) -> &'static dyn Filter {
        match self {
            FilterKind::None => &NoFilter,
            FilterKind::Bcj => &Bcj,
            FilterKind::Kanzi => &Kanzi,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Bcj => "BCJ",
            FilterKind::Kanzi => "Kanzi-EXE",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// What the pack side knows about the input when filtering it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterHint {
    pub arch: Option<Arch>,
    pub code_range: Option<Range<usize>>,
}

impl FilterHint {
    pub fn for_elf(bytes: &[u8], code_range: Option<Range<usize>>) -> Self {
        FilterHint {
            arch: Arch::sniff(bytes),
            code_range,
        }
    }
}

pub trait Filter: Send + Sync {
    fn kind(&self) -> FilterKind;

    /// Filtered copy of `input`, or `None` when the filter declines it.
    fn forward(&self, input: &[u8], hint: &FilterHint) -> Option<Vec<u8>>;

    /// Undoes `forward`. `expected_len` is the length of the unfiltered data.
    fn inverse(&self, filtered: &[u8], expected_len: usize) -> Result<Vec<u8>, FilterError>;
}

pub struct NoFilter;

impl Filter for NoFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::None
    }

    fn forward(&self, input: &[u8], _hint: &FilterHint) -> Option<Vec<u8>> {
        Some(input.to_vec())
    }

    fn inverse(&self, filtered: &[u8], _expected_len: usize) -> Result<Vec<u8>, FilterError> {
        Ok(filtered.to_vec())
    }
}

pub struct Bcj;

impl Filter for Bcj {
    fn kind(&self) -> FilterKind {
        FilterKind::Bcj
    }

    fn forward(&self, input: &[u8], hint: &FilterHint) -> Option<Vec<u8>> {
        let mut buf = input.to_vec();
        match hint.arch.unwrap_or(Arch::X86) {
            Arch::X86 => bcj::x86_encode(&mut buf, 0),
            Arch::Arm64 => bcj::arm64_encode(&mut buf, 0),
        };
        Some(buf)
    }

    fn inverse(&self, filtered: &[u8], expected_len: usize) -> Result<Vec<u8>, FilterError> {
        if filtered.len() != expected_len {
            return Err(FilterError::LengthMismatch {
                filter: "BCJ",
                expected: expected_len,
                actual: filtered.len(),
            });
        }

        let mut buf = filtered.to_vec();
        let arch = Arch::sniff(&buf).unwrap_or(Arch::X86);
        let done = match arch {
            Arch::X86 => bcj::x86_decode(&mut buf, 0),
            Arch::Arm64 => bcj::arm64_decode(&mut buf, 0),
        };
        if done + BCJ_TAIL_SLACK < buf.len() {
            log::warn!(
                "BCJ ({arch}) stopped at {done} of {} bytes; tail left as is",
                buf.len()
            );
        } else {
            log::debug!("BCJ ({arch}) inverse processed {done} of {} bytes", buf.len());
        }
        Ok(buf)
    }
}

pub struct Kanzi;

impl Filter for Kanzi {
    fn kind(&self) -> FilterKind {
        FilterKind::Kanzi
    }

    fn forward(&self, input: &[u8], hint: &FilterHint) -> Option<Vec<u8>> {
        kanzi::forward(input, hint.arch, hint.code_range.clone())
    }

    fn inverse(&self, filtered: &[u8], expected_len: usize) -> Result<Vec<u8>, FilterError> {
        kanzi::inverse(filtered, expected_len)
    }
}
