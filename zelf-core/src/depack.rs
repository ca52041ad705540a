//! Reconstruction of the original binary from a packed artifact.
//!
//! The stages run strictly in order, each feeding the next:
//! locate, parse the header, settle the layout, size the buffer, decompress,
//! undo the filter and write the result.

use crate::codec::CodecKind;
use crate::container::{
    disambiguate_layout, is_plausible_filtered_size, Container, ContainerHeader, LayoutDecision,
};
use crate::error::{CodecError, Error, FormatError, Result};
use crate::filter::{kanzi, FilterKind};
use crate::locator::{self, Discovery};
use crate::params::FoundParams;
use crate::password;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Extra room for Zstd containers in the Legacy layout, which may hold a
/// Kanzi-filtered stream slightly larger than the original.
const LEGACY_KANZI_SLACK: usize = 4096;

/// Added on top of the margin Shrinkler stores in its own header.
const SHRINKLER_SAFETY: usize = 256;

/// Refuse to allocate for claimed sizes beyond this.
const MAX_ORIG_SIZE: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Locate,
    ParseHeader,
    Disambiguate,
    AllocateBuffer,
    Decompress,
    Unfilter,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Locate => "locate",
            Stage::ParseHeader => "parse header",
            Stage::Disambiguate => "disambiguate layout",
            Stage::AllocateBuffer => "allocate buffer",
            Stage::Decompress => "decompress",
            Stage::Unfilter => "unfilter",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// What to do when the Kanzi inverse does not produce the expected length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Warn and keep the still-filtered bytes.
    #[default]
    Lenient,
    /// Fail the depack.
    Strict,
}

#[derive(Debug, Clone)]
pub struct DepackOptions {
    pub mismatch_policy: MismatchPolicy,
    /// Permission bits of the written file.
    pub mode: u32,
    /// Checked against the ParamsBlock seal when the artifact has one.
    pub password: Option<String>,
}

impl Default for DepackOptions {
    fn default() -> Self {
        DepackOptions {
            mismatch_policy: MismatchPolicy::Lenient,
            mode: 0o755,
            password: None,
        }
    }
}

/// Everything known about an artifact before decompressing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub discovery: Discovery,
    pub params: Option<FoundParams>,
    pub container: Container,
    pub decision: LayoutDecision,
}

impl Inspection {
    pub fn codec(&self) -> CodecKind {
        self.container.header.codec
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.container.header
    }
}

#[derive(Debug, Clone)]
pub struct DepackReport {
    pub inspection: Inspection,
    /// Filter that was undone.
    pub filter: FilterKind,
    pub output_len: usize,
    /// The lenient Kanzi fallback kept still-filtered bytes.
    pub recovered: bool,
    pub output: Option<PathBuf>,
}

fn stage(s: Stage) {
    log::debug!("depack: {s}");
}

/// Locates and parses the container without decompressing it.
pub fn inspect(bytes: &[u8]) -> Result<Inspection> {
    stage(Stage::Locate);
    let segments = locator::load_segments(bytes);
    let located = locator::locate(bytes, &segments)?;

    stage(Stage::ParseHeader);
    let fixed = ContainerHeader::read_fixed(bytes, located.offset)?;
    log::info!(
        "codec {}, orig_size {}, comp_size {}",
        fixed.codec,
        fixed.orig_size,
        fixed.comp_size
    );

    stage(Stage::Disambiguate);
    let params_bcj = located.params.map(|p| p.block.bcj());
    let decision = disambiguate_layout(&fixed, bytes, located.offset, params_bcj);
    let container = Container::parse(bytes, located.offset, decision.layout)?;

    Ok(Inspection {
        discovery: located.discovery,
        params: located.params,
        container,
        decision,
    })
}

/// Default output path: the input path with `.unpacked` appended.
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut s = input.as_os_str().to_owned();
    s.push(".unpacked");
    PathBuf::from(s)
}

fn size_to_usize(field: &'static str, value: u64) -> Result<usize> {
    if value > MAX_ORIG_SIZE {
        return Err(FormatError::InvalidField {
            field,
            value: value as i64,
        }
        .into());
    }
    usize::try_from(value).map_err(|_| {
        FormatError::InvalidField {
            field,
            value: value as i64,
        }
        .into()
    })
}

/// Output buffer capacity for decompressing `payload`.
pub fn buffer_capacity(inspection: &Inspection, payload: &[u8]) -> Result<usize> {
    let header = inspection.header();
    let orig = size_to_usize("orig_size", header.orig_size)?;

    let mut capacity = match header.filtered_size {
        Some(fs) if is_plausible_filtered_size(fs, header.orig_size) => fs as usize,
        Some(fs) => {
            return Err(FormatError::InvalidField {
                field: "filtered_size",
                value: fs.into(),
            }
            .into())
        }
        None => orig,
    };

    let kanzi_flag = inspection.params.is_some_and(|p| p.block.kanzi());
    if header.filtered_size.is_none() && (header.codec == CodecKind::Zstd || kanzi_flag) {
        capacity = orig + orig / 8 + LEGACY_KANZI_SLACK;
    }

    if header.codec == CodecKind::Shrinkler && payload.len() >= 20 {
        let margin = u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]);
        log::debug!("Shrinkler margin {margin}");
        capacity += margin as usize + SHRINKLER_SAFETY;
    }
    Ok(capacity)
}

pub struct Depacker {
    options: DepackOptions,
}

impl Depacker {
    pub fn new(options: DepackOptions) -> Self {
        Depacker { options }
    }

    fn check_password(&self, params: Option<&FoundParams>) -> Result<()> {
        let Some(seal) = params.and_then(|p| p.block.seal) else {
            return Ok(());
        };
        match &self.options.password {
            Some(pw) if password::verify(&seal, pw.as_bytes()) => {
                log::info!("password verified");
                Ok(())
            }
            Some(_) => Err(Error::PasswordMismatch),
            None => {
                log::warn!("artifact is password sealed; no password given, not verifying");
                Ok(())
            }
        }
    }

    /// Reconstructs the original binary held in `bytes`.
    pub fn unpack_bytes(&self, bytes: &[u8]) -> Result<(Vec<u8>, DepackReport)> {
        let inspection = inspect(bytes)?;
        self.check_password(inspection.params.as_ref())?;

        let header = *inspection.header();
        let codec_name = header.codec.display_name();
        let orig = size_to_usize("orig_size", header.orig_size)?;
        let payload = inspection.container.payload(bytes);

        stage(Stage::AllocateBuffer);
        let capacity = buffer_capacity(&inspection, payload)?;
        let mut buf = vec![0u8; capacity];

        stage(Stage::Decompress);
        let backend = header.codec.backend()?;
        let written = backend.decompress(payload, &mut buf)?;
        if written > capacity {
            return Err(CodecError::OutputTooSmall {
                codec: codec_name,
                capacity,
            }
            .into());
        }
        buf.truncate(written);
        log::info!("{codec_name}: {} -> {written} bytes", payload.len());

        match header.filtered_size {
            Some(fs) if written != fs as usize => {
                return Err(CodecError::SizeMismatch {
                    codec: codec_name,
                    expected: fs as usize,
                    actual: written,
                }
                .into());
            }
            None if written != orig && kanzi::sniff(&buf).is_none() => {
                return Err(CodecError::SizeMismatch {
                    codec: codec_name,
                    expected: orig,
                    actual: written,
                }
                .into());
            }
            _ => {}
        }

        stage(Stage::Unfilter);
        let (out, filter, recovered) = self.unfilter(buf, &inspection, orig)?;

        if !recovered && out.len() != orig {
            return Err(CodecError::SizeMismatch {
                codec: codec_name,
                expected: orig,
                actual: out.len(),
            }
            .into());
        }

        let report = DepackReport {
            inspection,
            filter,
            output_len: out.len(),
            recovered,
            output: None,
        };
        Ok((out, report))
    }

    fn unfilter(
        &self,
        buf: Vec<u8>,
        inspection: &Inspection,
        orig: usize,
    ) -> Result<(Vec<u8>, FilterKind, bool)> {
        if inspection.decision.bcj {
            let out = FilterKind::Bcj.backend().inverse(&buf, buf.len())?;
            return Ok((out, FilterKind::Bcj, false));
        }

        if kanzi::sniff(&buf).is_none() {
            if inspection.params.is_some_and(|p| p.block.kanzi()) {
                log::warn!("ParamsBlock says Kanzi but the buffer carries no Kanzi tag");
            }
            return Ok((buf, FilterKind::None, false));
        }

        match FilterKind::Kanzi.backend().inverse(&buf, orig) {
            Ok(out) => Ok((out, FilterKind::Kanzi, false)),
            Err(e) => match self.options.mismatch_policy {
                MismatchPolicy::Strict => Err(e.into()),
                MismatchPolicy::Lenient => {
                    log::warn!("{e}; keeping the raw filtered bytes");
                    Ok((buf, FilterKind::Kanzi, true))
                }
            },
        }
    }

    /// Depacks `input` into `output`, or [`default_output_path`] when `None`.
    pub fn unpack_file(&self, input: &Path, output: Option<&Path>) -> Result<DepackReport> {
        let bytes = fs::read(input).map_err(|e| Error::file(input, e))?;
        let (out, mut report) = self.unpack_bytes(&bytes)?;

        stage(Stage::Write);
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(input));
        write_executable(&path, &out, self.options.mode)?;
        log::info!("wrote {} bytes to {}", out.len(), path.display());

        report.output = Some(path);
        Ok(report)
    }
}

impl Default for Depacker {
    fn default() -> Self {
        Depacker::new(DepackOptions::default())
    }
}

/// Writes `bytes` and applies `mode`; a failed chmod only warns.
pub(crate) fn write_executable(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    fs::write(path, bytes).map_err(|e| Error::file(path, e))?;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        log::warn!("chmod {mode:o} {} failed: {e}", path.display());
    }
    Ok(())
}
